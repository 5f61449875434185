//! Document store seams used by the coordinator.

use async_trait::async_trait;
use futures::stream::BoxStream;

use relay_common::error::RelayError;
use relay_common::types::{ChangeBatch, DeviceToken, UserId, WatchedDocument, WorkerId};

/// Lazy, non-terminating sequence of change batches for unnotified documents.
///
/// The first batch holds every document matching the filter at subscription
/// time; later batches carry live additions. A feed is not restartable;
/// reconnecting means subscribing again.
pub type ChangeFeed = BoxStream<'static, Result<ChangeBatch, RelayError>>;

/// Watched document store with atomic claim transitions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<WatchedDocument>, RelayError>;

    /// Atomically claim delivery ownership. `false` means another worker owns
    /// the document, it is already notified, or it does not exist.
    async fn try_claim(&self, id: &str, worker: &WorkerId) -> Result<bool, RelayError>;

    /// Set `notified` and clear the claim, unconditionally. Returns whether
    /// `worker` still held the claim at that point.
    async fn mark_notified(&self, id: &str, worker: &WorkerId) -> Result<bool, RelayError>;

    /// Clear the claim if `worker` still holds it; returns whether it did.
    async fn release_claim(&self, id: &str, worker: &WorkerId) -> Result<bool, RelayError>;

    /// Subscribe to additions of documents with `notified == false`.
    async fn subscribe_unnotified(&self) -> Result<ChangeFeed, RelayError>;
}

/// Lookups from chats and users to delivery targets.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Participant user ids of a chat; empty when the chat is unknown.
    async fn participants(&self, chat_id: &str) -> Result<Vec<UserId>, RelayError>;

    /// Current device token of a user, if any.
    async fn device_token(&self, user_id: &str) -> Result<Option<DeviceToken>, RelayError>;
}
