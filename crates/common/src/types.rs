use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque push-service delivery address.
pub type DeviceToken = String;

/// Identifier of an end user in the chat store.
pub type UserId = String;

/// Identity of one running relay process.
///
/// Generated once at startup as `<start unix millis>-<random hex>` and
/// constant for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat message record watched for new-message notifications.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WatchedDocument {
    pub id: String,
    /// Conversation whose participants should be notified
    pub chat_id: Option<String>,
    /// Author of the message, never notified about their own message
    pub sender_id: Option<UserId>,
    pub sender_name: Option<String>,
    pub text: Option<String>,
    /// Tokens addressed directly by the writer
    pub recipient_tokens: Vec<DeviceToken>,
    /// Users addressed directly by the writer
    pub recipient_ids: Vec<UserId>,
    pub notified: bool,
    /// Worker currently owning delivery for this document
    pub claim: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WatchedDocument {
    /// A fresh, unclaimed message as an upstream writer would create it.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat_id: None,
            sender_id: None,
            sender_name: None,
            text: None,
            recipient_tokens: Vec::new(),
            recipient_ids: Vec::new(),
            notified: false,
            claim: None,
            claimed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn claim_state(&self) -> ClaimState {
        ClaimState::from_fields(self.notified, self.claim.as_deref(), self.claimed_at)
    }
}

/// Delivery ownership state of a watched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimState {
    Unclaimed,
    Claimed {
        by: WorkerId,
        at: Option<DateTime<Utc>>,
    },
    /// Terminal
    Notified,
}

impl ClaimState {
    /// Derive the state from stored columns; `notified` wins over a leftover claim.
    pub fn from_fields(
        notified: bool,
        claim: Option<&str>,
        claimed_at: Option<DateTime<Utc>>,
    ) -> Self {
        if notified {
            return ClaimState::Notified;
        }
        match claim {
            Some(holder) => ClaimState::Claimed {
                by: WorkerId::from(holder),
                at: claimed_at,
            },
            None => ClaimState::Unclaimed,
        }
    }
}

/// Kind of change delivered by a document change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Removed => write!(f, "removed"),
        }
    }
}

/// One document change observed on the feed.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: WatchedDocument,
}

/// Changes delivered together by one feed step.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub changes: Vec<DocumentChange>,
}

impl ChangeBatch {
    pub fn added(documents: impl IntoIterator<Item = WatchedDocument>) -> Self {
        Self {
            changes: documents
                .into_iter()
                .map(|document| DocumentChange {
                    kind: ChangeKind::Added,
                    document,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
