//! Bounded retry for failed job attempts.
//!
//! Transient failures are redelivered with exponential backoff until the
//! attempt budget is spent; permanent failures, and transient ones past the
//! budget, are dead-lettered.

use std::time::Duration;

use crate::error::JobError;

/// Default number of deliveries before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first redelivery.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on any single backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff after failed attempt number `attempt` (1-based).
///
/// Uses `base * 2^(attempt - 1)` capped at [`MAX_BACKOFF`].
pub fn backoff_duration(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
    let delay = base_ms.saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_millis(delay).min(MAX_BACKOFF)
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn decide(&self, attempt: u32, error: &JobError) -> RetryDecision {
        if error.is_transient() && attempt < self.max_attempts {
            RetryDecision::RetryAfter(backoff_duration(attempt, self.base_delay))
        } else {
            RetryDecision::GiveUp
        }
    }
}
