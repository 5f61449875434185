//! Notification dispatch coordinator.
//!
//! Consumes the change feed and, for every added document, spawns an
//! independent task that:
//! 1. Claims the document (atomic, store-side)
//! 2. Resolves recipient device tokens
//! 3. Dispatches the push in bounded batches
//! 4. Marks the document notified, or releases the claim for a later retry
//!
//! Steps for one document run strictly in that order; documents are handled
//! concurrently with no ordering between them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::{self, JoinSet};

use relay_common::error::RelayError;
use relay_common::types::{ChangeKind, WatchedDocument, WorkerId};
use relay_notifier::dispatch::Dispatcher;

use crate::composer::MessageComposer;
use crate::resolver::TokenResolver;
use crate::store::{ChangeFeed, DocumentStore};

/// Pause after a feed error before pulling the next item.
const FEED_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Everything a document handler needs, built once at startup.
pub struct RelayContext {
    pub worker_id: WorkerId,
    pub store: Arc<dyn DocumentStore>,
    pub resolver: TokenResolver,
    pub dispatcher: Dispatcher,
    pub composer: MessageComposer,
}

/// How handling a single document ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// The observed snapshot was already notified
    AlreadyNotified,
    /// Another worker owns it, or it was notified in the meantime
    NotClaimed,
    /// Nobody to notify; claim released
    NoRecipients,
    /// Every batch call failed before reaching the push service; claim released
    Undelivered { failed_batches: usize },
    Notified {
        success_count: usize,
        failure_count: usize,
    },
}

/// Counters for one `run` over a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub batches: u64,
    pub documents: u64,
    /// Added events for a document this run was already handling
    pub duplicates: u64,
    pub feed_errors: u64,
}

#[derive(Clone)]
pub struct NotificationCoordinator {
    ctx: Arc<RelayContext>,
}

impl NotificationCoordinator {
    pub fn new(ctx: RelayContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.ctx.worker_id
    }

    /// Handle one document through claim → resolve → dispatch → finalize.
    pub async fn handle_document(&self, doc: &WatchedDocument) -> Result<DocumentOutcome, RelayError> {
        process_document(&self.ctx, doc).await
    }

    /// Pull the feed until it ends or `shutdown` flips to `true`, spawning one
    /// task per added document. In-flight handlers are awaited before returning.
    ///
    /// A re-claim by the same worker succeeds, so a document already being
    /// handled by this run is not spawned a second time.
    pub async fn run(&self, mut feed: ChangeFeed, mut shutdown: watch::Receiver<bool>) -> RunStats {
        let mut stats = RunStats::default();
        let mut tasks = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut task_documents: HashMap<task::Id, String> = HashMap::new();

        tracing::info!(worker_id = %self.ctx.worker_id, "Coordinator consuming change feed");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let item = tokio::select! {
                item = feed.next() => item,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Shutdown sender dropped
                        break;
                    }
                    continue;
                }
            };

            let Some(item) = item else {
                tracing::warn!("Change feed ended");
                break;
            };

            // Finished handlers leave the in-flight set before the next
            // event is checked against it
            reap_finished(&mut tasks, &mut task_documents, &mut in_flight);

            match item {
                Ok(batch) => {
                    stats.batches += 1;
                    for change in batch.changes {
                        if change.kind != ChangeKind::Added {
                            continue;
                        }
                        stats.documents += 1;
                        let id = change.document.id.clone();
                        if !in_flight.insert(id.clone()) {
                            stats.duplicates += 1;
                            tracing::debug!(document_id = %id, "Document already in flight, skipping");
                            continue;
                        }
                        let ctx = self.ctx.clone();
                        let handle = tasks.spawn(async move {
                            handle_and_log(&ctx, &change.document).await;
                        });
                        task_documents.insert(handle.id(), id);
                    }
                }
                Err(e) => {
                    stats.feed_errors += 1;
                    tracing::error!(error = %e, "Change feed error");
                    tokio::time::sleep(FEED_ERROR_BACKOFF).await;
                }
            }
        }

        let pending = tasks.len();
        if pending > 0 {
            tracing::info!(in_flight = pending, "Waiting for in-flight documents");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join_error(joined);
        }

        stats
    }
}

fn reap_finished(
    tasks: &mut JoinSet<()>,
    task_documents: &mut HashMap<task::Id, String>,
    in_flight: &mut HashSet<String>,
) {
    while let Some(joined) = tasks.try_join_next_with_id() {
        let task_id = match joined {
            Ok((task_id, ())) => task_id,
            Err(e) => {
                let task_id = e.id();
                log_join_error(Err(e));
                task_id
            }
        };
        if let Some(id) = task_documents.remove(&task_id) {
            in_flight.remove(&id);
        }
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Document handler task failed");
    }
}

async fn handle_and_log(ctx: &RelayContext, doc: &WatchedDocument) {
    match process_document(ctx, doc).await {
        Ok(DocumentOutcome::Notified {
            success_count,
            failure_count,
        }) => {
            tracing::info!(
                document_id = %doc.id,
                success_count,
                failure_count,
                "Document notified"
            );
        }
        Ok(DocumentOutcome::Undelivered { failed_batches }) => {
            tracing::warn!(
                document_id = %doc.id,
                failed_batches,
                "No batch reached the push service, claim released"
            );
        }
        Ok(outcome) => {
            tracing::debug!(document_id = %doc.id, outcome = ?outcome, "Document skipped");
        }
        Err(e) => {
            tracing::error!(document_id = %doc.id, error = %e, "Failed to handle document");
        }
    }
}

async fn process_document(
    ctx: &RelayContext,
    doc: &WatchedDocument,
) -> Result<DocumentOutcome, RelayError> {
    if doc.notified {
        return Ok(DocumentOutcome::AlreadyNotified);
    }

    if !ctx.store.try_claim(&doc.id, &ctx.worker_id).await? {
        return Ok(DocumentOutcome::NotClaimed);
    }

    let tokens = match ctx.resolver.resolve(doc).await {
        Ok(tokens) => tokens,
        Err(e) => {
            release_quietly(ctx, doc).await;
            return Err(e);
        }
    };

    if tokens.is_empty() {
        tracing::info!(document_id = %doc.id, "No recipients resolved, releasing claim");
        ctx.store.release_claim(&doc.id, &ctx.worker_id).await?;
        return Ok(DocumentOutcome::NoRecipients);
    }

    let message = ctx.composer.compose(doc);
    let summary = ctx.dispatcher.dispatch(&tokens, &message).await;

    if !summary.attempted() {
        ctx.store.release_claim(&doc.id, &ctx.worker_id).await?;
        return Ok(DocumentOutcome::Undelivered {
            failed_batches: summary.failed_batches,
        });
    }

    if !ctx.store.mark_notified(&doc.id, &ctx.worker_id).await? {
        // Dispatch outlived the claim TTL and another worker may have sent too
        tracing::warn!(
            document_id = %doc.id,
            worker_id = %ctx.worker_id,
            "Claim lost during dispatch"
        );
    }

    Ok(DocumentOutcome::Notified {
        success_count: summary.success_count,
        failure_count: summary.failure_count,
    })
}

/// Release after a failure; a failed release leaves the claim to expire.
async fn release_quietly(ctx: &RelayContext, doc: &WatchedDocument) {
    if let Err(e) = ctx.store.release_claim(&doc.id, &ctx.worker_id).await {
        tracing::warn!(
            document_id = %doc.id,
            error = %e,
            "Failed to release claim"
        );
    }
}
