//! Batched dispatch.
//!
//! Tokens are split into chunks no larger than the push API's per-call limit.
//! Every chunk is submitted even when an earlier one failed; successes are
//! summed across chunks. Tokens rejected as unregistered or invalid are
//! reported to the invalid-token sink, never retried.

use std::sync::Arc;

use chrono::Utc;

use relay_common::config::MAX_DISPATCH_BATCH_SIZE;
use relay_common::types::DeviceToken;

use crate::invalid::{InvalidToken, InvalidTokenSink};
use crate::push::{PushClient, PushMessage};

/// Aggregated result of one `dispatch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub success_count: usize,
    pub failure_count: usize,
    pub batches: usize,
    /// Batches whose call failed outright (transport, auth)
    pub failed_batches: usize,
    pub invalid_tokens: Vec<InvalidToken>,
}

impl DispatchSummary {
    /// True when at least one batch call reached the push service.
    pub fn attempted(&self) -> bool {
        self.batches > self.failed_batches
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    client: Arc<dyn PushClient>,
    sink: Arc<dyn InvalidTokenSink>,
    batch_size: usize,
}

impl Dispatcher {
    /// `batch_size` is clamped to `1..=MAX_DISPATCH_BATCH_SIZE`.
    pub fn new(
        client: Arc<dyn PushClient>,
        sink: Arc<dyn InvalidTokenSink>,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            sink,
            batch_size: batch_size.clamp(1, MAX_DISPATCH_BATCH_SIZE),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Send `message` to every token and return the summed outcome.
    pub async fn dispatch(&self, tokens: &[DeviceToken], message: &PushMessage) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        for (index, chunk) in tokens.chunks(self.batch_size).enumerate() {
            summary.batches += 1;

            let response = match self.client.send_batch(chunk, message).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        batch = index,
                        size = chunk.len(),
                        error = %e,
                        "Push batch failed, continuing with remaining batches"
                    );
                    summary.failed_batches += 1;
                    summary.failure_count += chunk.len();
                    continue;
                }
            };

            let successes = response.success_count();
            summary.success_count += successes;
            summary.failure_count += response.failure_count();

            for outcome in &response.outcomes {
                if let Err(failure) = &outcome.result {
                    if failure.kind.invalidates_token() {
                        summary.invalid_tokens.push(InvalidToken {
                            token: outcome.token.clone(),
                            reason: failure.kind,
                            detail: failure.message.clone(),
                            reported_at: Utc::now(),
                        });
                    } else {
                        tracing::debug!(
                            batch = index,
                            kind = %failure.kind,
                            code = ?failure.code,
                            error = %failure.message,
                            "Push delivery failed for token"
                        );
                    }
                }
            }

            tracing::debug!(
                batch = index,
                size = chunk.len(),
                successes,
                "Push batch sent"
            );
        }

        if !summary.invalid_tokens.is_empty()
            && let Err(e) = self.sink.report(&summary.invalid_tokens).await
        {
            tracing::error!(
                count = summary.invalid_tokens.len(),
                error = %e,
                "Failed to report invalid device tokens"
            );
        }

        summary
    }
}
