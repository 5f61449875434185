//! PostgreSQL-backed document store.
//!
//! Claims are taken inside a `SELECT ... FOR UPDATE` transaction so concurrent
//! relays serialize on the row. The change feed combines an initial scan with
//! `LISTEN relay_messages_created`, fed by the insert trigger in `migrations/`.
//! Notifications are not queued while the listener is disconnected, so every
//! reconnect is followed by a rescan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::PgPool;
use sqlx::postgres::PgListener;

use relay_common::error::RelayError;
use relay_common::types::{ChangeBatch, ClaimState, DeviceToken, UserId, WatchedDocument, WorkerId};

use crate::claim::{ClaimPolicy, log_decision};
use crate::store::{ChangeFeed, DocumentStore, RecipientDirectory};

/// Notification channel the insert trigger publishes document ids on.
pub const FEED_CHANNEL: &str = "relay_messages_created";

pub struct PgDocumentStore {
    pool: PgPool,
    policy: ClaimPolicy,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool, policy: ClaimPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a message the way an upstream writer would. Used by tooling and tests.
    pub async fn insert(&self, doc: &WatchedDocument) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            INSERT INTO relay_messages
                (id, chat_id, sender_id, sender_name, text, recipient_tokens, recipient_ids,
                 notified, claim, claimed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.chat_id)
        .bind(&doc.sender_id)
        .bind(&doc.sender_name)
        .bind(&doc.text)
        .bind(&doc.recipient_tokens)
        .bind(&doc.recipient_ids)
        .bind(doc.notified)
        .bind(&doc.claim)
        .bind(doc.claimed_at)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

async fn scan_unnotified(pool: &PgPool) -> Result<Vec<WatchedDocument>, RelayError> {
    let docs: Vec<WatchedDocument> = sqlx::query_as(
        "SELECT * FROM relay_messages WHERE notified = false ORDER BY created_at",
    )
    .fetch_all(pool)
    .await?;

    Ok(docs)
}

async fn fetch_added(pool: &PgPool, id: &str) -> Result<ChangeBatch, RelayError> {
    let doc: Option<WatchedDocument> =
        sqlx::query_as("SELECT * FROM relay_messages WHERE id = $1 AND notified = false")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(ChangeBatch::added(doc))
}

struct FeedState {
    listener: PgListener,
    pool: PgPool,
    /// Set when notifications may have been missed: the listener reconnected
    /// or failed, or an announced row could not be loaded
    resync: bool,
}

impl FeedState {
    async fn next_batch(&mut self) -> Result<ChangeBatch, RelayError> {
        loop {
            if self.resync {
                let docs = scan_unnotified(&self.pool).await?;
                self.resync = false;
                tracing::info!(documents = docs.len(), "Change feed resynchronized");
                return Ok(ChangeBatch::added(docs));
            }

            match self.listener.try_recv().await {
                Ok(Some(notification)) => {
                    return match fetch_added(&self.pool, notification.payload()).await {
                        Ok(batch) => Ok(batch),
                        Err(e) => {
                            self.resync = true;
                            Err(e)
                        }
                    };
                }
                Ok(None) => {
                    // Connection lost and re-established (eager reconnect), so the
                    // rescan below runs after LISTEN is active again
                    tracing::warn!(channel = FEED_CHANNEL, "Change feed listener reconnecting");
                    self.resync = true;
                }
                Err(e) => {
                    self.resync = true;
                    return Err(RelayError::Feed(e.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, id: &str) -> Result<Option<WatchedDocument>, RelayError> {
        let doc: Option<WatchedDocument> = sqlx::query_as("SELECT * FROM relay_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(doc)
    }

    async fn try_claim(&self, id: &str, worker: &WorkerId) -> Result<bool, RelayError> {
        let mut tx = self.pool.begin().await?;

        // Claim age is measured on the database clock
        let row: Option<(bool, Option<String>, Option<DateTime<Utc>>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT notified, claim, claimed_at, NOW() FROM relay_messages WHERE id = $1 FOR UPDATE",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((notified, claim, claimed_at, now)) = row else {
            tx.rollback().await?;
            tracing::debug!(document_id = id, "Document vanished before claim");
            return Ok(false);
        };

        let state = ClaimState::from_fields(notified, claim.as_deref(), claimed_at);
        let decision = self.policy.decide(&state, worker, now);

        if decision.grants() {
            sqlx::query("UPDATE relay_messages SET claim = $2, claimed_at = $3 WHERE id = $1")
                .bind(id)
                .bind(worker.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }

        log_decision(id, worker, &decision);
        Ok(decision.grants())
    }

    async fn mark_notified(&self, id: &str, worker: &WorkerId) -> Result<bool, RelayError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            WITH prev AS (
                SELECT id, claim FROM relay_messages WHERE id = $1 FOR UPDATE
            )
            UPDATE relay_messages m
            SET notified = true, claim = NULL, claimed_at = NULL
            FROM prev
            WHERE m.id = prev.id
            RETURNING prev.claim
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(matches!(row, Some((Some(claim),)) if claim == worker.as_str()))
    }

    async fn release_claim(&self, id: &str, worker: &WorkerId) -> Result<bool, RelayError> {
        let result = sqlx::query(
            r#"
            UPDATE relay_messages
            SET claim = NULL, claimed_at = NULL
            WHERE id = $1 AND claim = $2 AND notified = false
            "#,
        )
        .bind(id)
        .bind(worker.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn subscribe_unnotified(&self) -> Result<ChangeFeed, RelayError> {
        // Listen before scanning so no insert falls between the two
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(FEED_CHANNEL).await?;

        let backlog = scan_unnotified(&self.pool).await?;
        tracing::info!(
            channel = FEED_CHANNEL,
            backlog = backlog.len(),
            "Subscribed to document change feed"
        );

        let state = FeedState {
            listener,
            pool: self.pool.clone(),
            resync: false,
        };
        let live = futures::stream::unfold(state, |mut state| async move {
            let next = state.next_batch().await;
            Some((next, state))
        });

        Ok(futures::stream::once(async move { Ok(ChangeBatch::added(backlog)) })
            .chain(live)
            .boxed())
    }
}

#[async_trait]
impl RecipientDirectory for PgDocumentStore {
    async fn participants(&self, chat_id: &str) -> Result<Vec<UserId>, RelayError> {
        let row: Option<(Vec<String>,)> =
            sqlx::query_as("SELECT participants FROM relay_chats WHERE id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((participants,)) => Ok(participants),
            None => {
                tracing::warn!(chat_id, "Chat not found, no participants to notify");
                Ok(Vec::new())
            }
        }
    }

    async fn device_token(&self, user_id: &str) -> Result<Option<DeviceToken>, RelayError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT fcm_token FROM relay_users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .and_then(|(token,)| token)
            .filter(|token| !token.trim().is_empty()))
    }
}
