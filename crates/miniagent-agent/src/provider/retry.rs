//! Retry policy for model calls.
//!
//! Retries back off exponentially: the first retry waits
//! `initial_delay`, each subsequent one `backoff_factor` times longer, never
//! more than `max_delay`.  A rate-limit hint from the provider replaces the
//! computed delay (still capped).

use std::time::Duration;

use crate::error::ProviderError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = never retry).
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,

    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether `error` on attempt number `attempt` (1-based) warrants another try.
    pub fn should_retry(&self, attempt: u32, error: &ProviderError) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        if let Some(hint) = error.retry_after() {
            return hint.min(self.max_delay);
        }
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.max(1.0).powi(exponent);
        let nanos = (secs * 1e9).round().min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(nanos as u64)
    }
}
