use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior on lock contention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of transaction invocations (the first attempt included).
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound of the exponential part, in milliseconds.
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added on top, in milliseconds.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Exponential part of the delay after a failed `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }

    /// Full delay after a failed `attempt`: backoff plus `uniform(0, jitter_ms)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        Duration::from_millis(self.backoff_ms(attempt).saturating_add(jitter))
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub retry: RetryPolicy,
    /// Budget for one unit of work. On expiry the work is cancelled and the
    /// transaction rolled back.
    pub timeout_ms: Option<u64>,
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the default number of attempts for `run_with_retry`
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Set the per-transaction timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
