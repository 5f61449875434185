//! In-memory document store for local runs and tests.
//!
//! Implements the same claim semantics as the Postgres store: every claim
//! decision and write happens inside one critical section.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast};

use relay_common::error::RelayError;
use relay_common::types::{ChangeBatch, DeviceToken, UserId, WatchedDocument, WorkerId};

use crate::claim::{ClaimPolicy, log_decision};
use crate::store::{ChangeFeed, DocumentStore, RecipientDirectory};

const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, WatchedDocument>,
    chats: HashMap<String, Vec<UserId>>,
    tokens: HashMap<UserId, DeviceToken>,
}

pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
    policy: ClaimPolicy,
    feed: broadcast::Sender<WatchedDocument>,
}

impl MemoryDocumentStore {
    pub fn new(policy: ClaimPolicy) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            policy,
            feed,
        }
    }

    /// Store a document and announce it on the feed when unnotified.
    pub async fn insert(&self, doc: WatchedDocument) {
        let announce = !doc.notified;
        self.state
            .lock()
            .await
            .documents
            .insert(doc.id.clone(), doc.clone());
        if announce {
            // No subscribers is fine; the next subscription scans the backlog
            let _ = self.feed.send(doc);
        }
    }

    /// Re-deliver the current version of a document, as a reconnecting feed would.
    pub async fn replay(&self, id: &str) -> bool {
        let doc = self.state.lock().await.documents.get(id).cloned();
        match doc {
            Some(doc) => self.feed.send(doc).is_ok(),
            None => false,
        }
    }

    pub async fn set_participants(&self, chat_id: &str, participants: &[&str]) {
        self.state.lock().await.chats.insert(
            chat_id.to_string(),
            participants.iter().map(|p| p.to_string()).collect(),
        );
    }

    pub async fn set_device_token(&self, user_id: &str, token: &str) {
        self.state
            .lock()
            .await
            .tokens
            .insert(user_id.to_string(), token.to_string());
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new(ClaimPolicy::default())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, id: &str) -> Result<Option<WatchedDocument>, RelayError> {
        Ok(self.state.lock().await.documents.get(id).cloned())
    }

    async fn try_claim(&self, id: &str, worker: &WorkerId) -> Result<bool, RelayError> {
        let mut state = self.state.lock().await;
        let Some(doc) = state.documents.get_mut(id) else {
            return Ok(false);
        };

        let now = Utc::now();
        let decision = self.policy.decide(&doc.claim_state(), worker, now);
        if decision.grants() {
            doc.claim = Some(worker.as_str().to_string());
            doc.claimed_at = Some(now);
        }

        log_decision(id, worker, &decision);
        Ok(decision.grants())
    }

    async fn mark_notified(&self, id: &str, worker: &WorkerId) -> Result<bool, RelayError> {
        let mut state = self.state.lock().await;
        let doc = state
            .documents
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(format!("Document {} not found", id)))?;
        let held = doc.claim.as_deref() == Some(worker.as_str());
        doc.notified = true;
        doc.claim = None;
        doc.claimed_at = None;
        Ok(held)
    }

    async fn release_claim(&self, id: &str, worker: &WorkerId) -> Result<bool, RelayError> {
        let mut state = self.state.lock().await;
        match state.documents.get_mut(id) {
            Some(doc) if !doc.notified && doc.claim.as_deref() == Some(worker.as_str()) => {
                doc.claim = None;
                doc.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn subscribe_unnotified(&self) -> Result<ChangeFeed, RelayError> {
        // Subscribe before scanning so nothing inserted in between is missed
        let receiver = self.feed.subscribe();

        let mut backlog: Vec<WatchedDocument> = self
            .state
            .lock()
            .await
            .documents
            .values()
            .filter(|d| !d.notified)
            .cloned()
            .collect();
        backlog.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let live = futures::stream::unfold(receiver, |mut receiver| async move {
            let next = match receiver.recv().await {
                Ok(doc) => Ok(ChangeBatch::added([doc])),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Err(RelayError::Feed(
                    format!("Change feed lagged, {} events dropped", skipped),
                )),
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            Some((next, receiver))
        });

        Ok(futures::stream::once(async move { Ok(ChangeBatch::added(backlog)) })
            .chain(live)
            .boxed())
    }
}

#[async_trait]
impl RecipientDirectory for MemoryDocumentStore {
    async fn participants(&self, chat_id: &str) -> Result<Vec<UserId>, RelayError> {
        Ok(self
            .state
            .lock()
            .await
            .chats
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn device_token(&self, user_id: &str) -> Result<Option<DeviceToken>, RelayError> {
        Ok(self.state.lock().await.tokens.get(user_id).cloned())
    }
}
