//! Bound on handler-requested retries.
//!
//! The engine never retries on its own. A handler asks for another attempt
//! through [`Context::retry`](crate::callback::Context::retry) and this
//! policy decides whether the item still has attempts left. Retried items go
//! straight back to the pending queue; pacing is left to the tickets.

use serde::{Deserialize, Serialize};

/// Default number of retries allowed per work item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Maximum number of retries per work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLimit {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
}

/// Outcome of a retry request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-stage the item as attempt `next_attempt`.
    Requeue {
        /// 1-based attempt number of the re-staged item
        next_attempt: u32,
    },
    /// Do not re-stage.
    GiveUp {
        /// Why the retry was refused
        reason: String,
    },
}

impl RetryLimit {
    /// Creates a limit allowing `max_retries` retries.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decides whether an item on its `attempt`-th attempt may be retried.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        let retries_used = attempt.saturating_sub(1);
        if retries_used < self.max_retries {
            RetryDecision::Requeue { next_attempt: attempt.saturating_add(1) }
        } else {
            RetryDecision::GiveUp {
                reason: format!(
                    "attempt {attempt} used all {} allowed retries",
                    self.max_retries
                ),
            }
        }
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}
