//! Claim protocol: decides whether a worker may take delivery ownership.
//!
//! ```text
//! UNCLAIMED --try_claim--> CLAIMED --mark_notified--> NOTIFIED (terminal)
//!                             |
//!                             +--release_claim--> UNCLAIMED
//! ```
//!
//! The decision is a pure function of the stored state. Stores evaluate it
//! inside their atomic read-modify-write (a `FOR UPDATE` transaction in
//! Postgres, a single mutex section in memory), so at most one worker is
//! granted a given claim.

use std::time::Duration;

use chrono::{DateTime, Utc};

use relay_common::types::{ClaimState, WorkerId};

/// Default age after which an abandoned claim may be taken over (5 minutes).
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(300);

/// Outcome of evaluating a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    /// Document was unclaimed
    Acquire,
    /// Document is already claimed by this worker
    Reacquire,
    /// Another worker's claim outlived the TTL
    TakeOver { previous: WorkerId },
    AlreadyNotified,
    HeldByOther { holder: WorkerId },
}

impl ClaimDecision {
    /// Whether the caller now owns the document.
    pub fn grants(&self) -> bool {
        matches!(
            self,
            ClaimDecision::Acquire | ClaimDecision::Reacquire | ClaimDecision::TakeOver { .. }
        )
    }
}

/// Claim staleness policy shared by all store implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// `None` disables takeover: a claim is held until released or notified.
    pub ttl: Option<Duration>,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            ttl: Some(DEFAULT_CLAIM_TTL),
        }
    }
}

impl ClaimPolicy {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self { ttl }
    }

    pub fn without_expiry() -> Self {
        Self { ttl: None }
    }

    pub fn decide(&self, state: &ClaimState, worker: &WorkerId, now: DateTime<Utc>) -> ClaimDecision {
        match state {
            ClaimState::Notified => ClaimDecision::AlreadyNotified,
            ClaimState::Unclaimed => ClaimDecision::Acquire,
            ClaimState::Claimed { by, .. } if by == worker => ClaimDecision::Reacquire,
            ClaimState::Claimed { by, at } => {
                if self.is_stale(*at, now) {
                    ClaimDecision::TakeOver {
                        previous: by.clone(),
                    }
                } else {
                    ClaimDecision::HeldByOther { holder: by.clone() }
                }
            }
        }
    }

    /// A claim without a timestamp was not written by a relay and never expires.
    fn is_stale(&self, claimed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self.ttl, claimed_at) {
            (Some(ttl), Some(at)) => (now - at).num_seconds() >= ttl.as_secs() as i64,
            _ => false,
        }
    }
}

/// Emit the log line for a claim decision.
pub fn log_decision(document_id: &str, worker: &WorkerId, decision: &ClaimDecision) {
    match decision {
        ClaimDecision::Acquire | ClaimDecision::Reacquire => {
            tracing::debug!(document_id, worker_id = %worker, "Claimed document");
        }
        ClaimDecision::TakeOver { previous } => {
            tracing::warn!(
                document_id,
                worker_id = %worker,
                previous_holder = %previous,
                "Took over stale claim"
            );
        }
        ClaimDecision::AlreadyNotified => {
            tracing::debug!(document_id, "Document already notified, skipping");
        }
        ClaimDecision::HeldByOther { holder } => {
            tracing::debug!(
                document_id,
                worker_id = %worker,
                holder = %holder,
                "Document claimed by another worker"
            );
        }
    }
}
