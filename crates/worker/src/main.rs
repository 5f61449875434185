use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use relay_common::config::AppConfig;
use relay_common::types::WorkerId;
use relay_common::{db, redis_pool};
use relay_engine::claim::ClaimPolicy;
use relay_engine::composer::MessageComposer;
use relay_engine::pg_store::PgDocumentStore;
use relay_engine::processor::{NotificationCoordinator, RelayContext};
use relay_engine::resolver::TokenResolver;
use relay_engine::store::DocumentStore;
use relay_notifier::auth::ServiceAccountTokenSource;
use relay_notifier::dispatch::Dispatcher;
use relay_notifier::fcm::FcmClient;
use relay_notifier::invalid::{InvalidTokenSink, LogInvalidTokenSink, RedisInvalidTokenQueue};

/// Pause before re-subscribing after the feed ends or fails to open.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay_worker=info,relay_engine=info,relay_notifier=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Push relay starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let sink: Arc<dyn InvalidTokenSink> = match &config.redis_url {
        Some(url) => {
            let redis = redis_pool::create_redis_manager(url).await?;
            tracing::info!(key = %config.invalid_token_queue_key, "Reporting invalid tokens to Redis");
            Arc::new(RedisInvalidTokenQueue::new(redis, config.invalid_token_queue_key.clone()))
        }
        None => {
            tracing::warn!("REDIS_URL not set, invalid tokens will only be logged");
            Arc::new(LogInvalidTokenSink)
        }
    };

    let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let access_tokens = Arc::new(ServiceAccountTokenSource::new(http.clone(), &config.firebase)?);
    let fcm = Arc::new(FcmClient::new(
        http,
        &config.fcm_base_url,
        &config.firebase.project_id,
        access_tokens,
        config.fcm_max_concurrency,
    ));

    let store = Arc::new(PgDocumentStore::new(pool, ClaimPolicy::new(config.claim_ttl())));
    let worker_id = WorkerId::generate();

    let coordinator = NotificationCoordinator::new(RelayContext {
        worker_id: worker_id.clone(),
        store: store.clone(),
        resolver: TokenResolver::new(store.clone()),
        dispatcher: Dispatcher::new(fcm, sink, config.dispatch_batch_size),
        composer: MessageComposer::from_config(&config),
    });

    tracing::info!(
        worker_id = %worker_id,
        project_id = %config.firebase.project_id,
        batch_size = config.dispatch_batch_size,
        "Relay configured"
    );

    // Graceful shutdown on Ctrl+C
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal, stopping gracefully..."),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    while !*shutdown_rx.borrow() {
        match store.subscribe_unnotified().await {
            Ok(feed) => {
                let stats = coordinator.run(feed, shutdown_rx.clone()).await;
                tracing::info!(
                    batches = stats.batches,
                    documents = stats.documents,
                    duplicates = stats.duplicates,
                    feed_errors = stats.feed_errors,
                    "Change feed subscription closed"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to subscribe to change feed");
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }
        let mut shutdown = shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            _ = shutdown.changed() => {}
        }
    }

    tracing::info!(worker_id = %worker_id, "Push relay stopped.");
    Ok(())
}
