//! Invalid-token side channel.
//!
//! The relay never deletes tokens itself. Tokens the push service rejects as
//! unregistered or malformed are handed to a sink, from which an external
//! token-store maintenance process removes them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use relay_common::error::RelayError;
use relay_common::types::DeviceToken;

use crate::push::FailureKind;

/// A token reported for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidToken {
    pub token: DeviceToken,
    pub reason: FailureKind,
    /// Raw error message from the push service
    pub detail: String,
    pub reported_at: DateTime<Utc>,
}

#[async_trait]
pub trait InvalidTokenSink: Send + Sync {
    async fn report(&self, tokens: &[InvalidToken]) -> Result<(), RelayError>;
}

/// Emits one structured warning per invalid token.
pub struct LogInvalidTokenSink;

#[async_trait]
impl InvalidTokenSink for LogInvalidTokenSink {
    async fn report(&self, tokens: &[InvalidToken]) -> Result<(), RelayError> {
        for invalid in tokens {
            tracing::warn!(
                token = %invalid.token,
                reason = %invalid.reason,
                detail = %invalid.detail,
                "Device token rejected by push service, needs removal"
            );
        }
        Ok(())
    }
}

/// Queues invalid-token records as JSON onto a Redis list (`LPUSH`).
pub struct RedisInvalidTokenQueue {
    redis: ConnectionManager,
    key: String,
}

impl RedisInvalidTokenQueue {
    pub fn new(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialize records into list entries.
    pub fn encode(tokens: &[InvalidToken]) -> Result<Vec<String>, RelayError> {
        tokens
            .iter()
            .map(|t| {
                serde_json::to_string(t)
                    .map_err(|e| RelayError::Internal(format!("Failed to encode token record: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl InvalidTokenSink for RedisInvalidTokenQueue {
    async fn report(&self, tokens: &[InvalidToken]) -> Result<(), RelayError> {
        if tokens.is_empty() {
            return Ok(());
        }

        let entries = Self::encode(tokens)?;
        let mut conn = self.redis.clone();
        let queue_len: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(&entries)
            .query_async(&mut conn)
            .await?;

        tracing::info!(
            key = %self.key,
            queued = entries.len(),
            queue_len,
            "Queued invalid device tokens for cleanup"
        );
        Ok(())
    }
}
