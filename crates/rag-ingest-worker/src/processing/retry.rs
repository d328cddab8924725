//! Retry budget and backoff for requeued messages

use dashmap::DashMap;
use std::time::Duration;

use crate::config::WorkerPoolConfig;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deliveries of one message before it is given up on
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkerPoolConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerPoolConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Whether a message on its `attempt`-th delivery (1-based) may be requeued
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before requeueing after the `attempt`-th delivery failed
    ///
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Bound on tracked payloads; the map is reset when exceeded
const MAX_TRACKED: usize = 10_000;

/// Counts deliveries per payload when the broker does not report them
///
/// Process-local: counts restart when the worker restarts or the message is
/// delivered to another consumer.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    attempts: DashMap<String, u32>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more delivery and return the 1-based attempt number
    pub fn record(&self, key: &str) -> u32 {
        if self.attempts.len() >= MAX_TRACKED && !self.attempts.contains_key(key) {
            tracing::warn!("Attempt tracker full, resetting {} entries", self.attempts.len());
            self.attempts.clear();
        }
        let mut entry = self.attempts.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Forget a payload once its message is settled for good
    pub fn forget(&self, key: &str) {
        self.attempts.remove(key);
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
