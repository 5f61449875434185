//! Push payloads, per-token outcomes and the client seam used by the dispatcher.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use relay_common::error::RelayError;
use relay_common::types::DeviceToken;

/// Notification content sent to every token of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub android: AndroidHints,
    pub apns: ApnsHints,
    /// Free-form key/value data delivered to the app
    pub data: BTreeMap<String, String>,
}

impl PushMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            android: AndroidHints::default(),
            apns: ApnsHints::default(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AndroidHints {
    pub priority: PushPriority,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApnsHints {
    pub sound: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPriority {
    Normal,
    #[default]
    High,
}

/// Why the push service refused a single token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The app was uninstalled or the token expired
    Unregistered,
    /// The token is malformed or belongs to another project
    InvalidToken,
    /// Rate limiting or a service outage; the token itself is fine
    Transient,
    Other,
}

impl FailureKind {
    /// Whether the token should be dropped from the token store.
    pub fn invalidates_token(self) -> bool {
        matches!(self, FailureKind::Unregistered | FailureKind::InvalidToken)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Unregistered => write!(f, "unregistered"),
            FailureKind::InvalidToken => write!(f, "invalid_token"),
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub kind: FailureKind,
    /// Service-specific error code, e.g. `UNREGISTERED`
    pub code: Option<String>,
    pub message: String,
}

/// Result of delivering to one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub token: DeviceToken,
    /// Message id assigned by the push service, or the failure
    pub result: Result<String, DeliveryFailure>,
}

impl SendOutcome {
    pub fn delivered(token: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            result: Ok(message_id.into()),
        }
    }

    pub fn failed(token: impl Into<String>, failure: DeliveryFailure) -> Self {
        Self {
            token: token.into(),
            result: Err(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-token outcomes of one batch call, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResponse {
    pub outcomes: Vec<SendOutcome>,
}

impl BatchResponse {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}

/// A push-delivery API accepting one payload for many tokens.
///
/// An `Err` means the whole batch failed (transport, auth); per-token
/// rejections are reported inside the `BatchResponse`.
#[async_trait]
pub trait PushClient: Send + Sync {
    async fn send_batch(
        &self,
        tokens: &[DeviceToken],
        message: &PushMessage,
    ) -> Result<BatchResponse, RelayError>;
}
