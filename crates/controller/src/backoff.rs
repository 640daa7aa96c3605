//! Per-key retry bookkeeping and backoff policy.

use std::collections::HashMap;
use std::time::Duration;

use convoy_core::ObjectKey;
use tokio::sync::Mutex;
use tracing::debug;

/// Consecutive bypass-backoff retries allowed per key before version
/// conflicts fall back to timed backoff.
pub const MAX_IMMEDIATE_RETRIES: u32 = 3;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base: Duration,
    /// Cap on exponential growth.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Set the base delay.
    #[must_use]
    pub const fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub const fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Delay for the nth consecutive failure (1-indexed): `base * 2^(n-1)`
    /// capped at `max`.
    fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let millis = self.base.as_millis().max(1) << exp;
        let capped = millis.min(self.max.as_millis());
        Duration::from_millis(capped as u64)
    }
}

/// What to do after a version-conflict outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue without delay.
    Immediate,
    /// Requeue after the given delay.
    Delayed(Duration),
}

#[derive(Debug, Default)]
struct KeyRetries {
    failures: u32,
    immediate: u32,
}

/// Tracks retry counts per key and computes requeue delays.
///
/// Converged keys must be forgotten so their next failure starts at the
/// base delay again.
pub struct BackoffTracker {
    config: BackoffConfig,
    retries: Mutex<HashMap<ObjectKey, KeyRetries>>,
}

impl BackoffTracker {
    /// Create a tracker with the given policy.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            retries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return the delay before the next
    /// attempt. Resets the immediate-retry budget.
    pub async fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut retries = self.retries.lock().await;
        let entry = retries.entry(key.clone()).or_default();
        entry.failures = entry.failures.saturating_add(1);
        entry.immediate = 0;
        let delay = self.config.delay_for(entry.failures);
        debug!(key = %key, failures = entry.failures, delay_ms = delay.as_millis() as u64, "backoff scheduled");
        delay
    }

    /// Record a version-conflict for `key`. Conflicts bypass backoff up
    /// to `MAX_IMMEDIATE_RETRIES` consecutive times, then fall back to
    /// timed backoff so a persistent race cannot tight-loop.
    pub async fn conflict_decision(&self, key: &ObjectKey) -> RetryDecision {
        let mut retries = self.retries.lock().await;
        let entry = retries.entry(key.clone()).or_default();
        entry.immediate = entry.immediate.saturating_add(1);
        if entry.immediate <= MAX_IMMEDIATE_RETRIES {
            RetryDecision::Immediate
        } else {
            entry.failures = entry.failures.saturating_add(1);
            let delay = self.config.delay_for(entry.failures);
            debug!(key = %key, immediate = entry.immediate, "immediate-retry budget exhausted");
            RetryDecision::Delayed(delay)
        }
    }

    /// Clear all retry bookkeeping for `key`.
    pub async fn forget(&self, key: &ObjectKey) {
        let mut retries = self.retries.lock().await;
        retries.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub async fn failures(&self, key: &ObjectKey) -> u32 {
        let retries = self.retries.lock().await;
        retries.get(key).map_or(0, |r| r.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ns", name)
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let config = BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };

        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(4), Duration::from_millis(800));
        assert_eq!(config.delay_for(5), Duration::from_secs(1));
        assert_eq!(config.delay_for(30), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_next_delay_counts_per_key() {
        let tracker = BackoffTracker::new(BackoffConfig {
            base: Duration::from_millis(10),
            max: Duration::from_secs(5),
        });

        assert_eq!(tracker.next_delay(&key("a")).await, Duration::from_millis(10));
        assert_eq!(tracker.next_delay(&key("a")).await, Duration::from_millis(20));
        // Other keys are independent.
        assert_eq!(tracker.next_delay(&key("b")).await, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_forget_resets_backoff() {
        let tracker = BackoffTracker::new(BackoffConfig::default());

        tracker.next_delay(&key("a")).await;
        tracker.next_delay(&key("a")).await;
        assert_eq!(tracker.failures(&key("a")).await, 2);

        tracker.forget(&key("a")).await;
        assert_eq!(tracker.failures(&key("a")).await, 0);
        assert_eq!(
            tracker.next_delay(&key("a")).await,
            BackoffConfig::default().base
        );
    }

    #[tokio::test]
    async fn test_conflicts_bypass_backoff_up_to_cap() {
        let tracker = BackoffTracker::new(BackoffConfig::default());

        for _ in 0..MAX_IMMEDIATE_RETRIES {
            assert_eq!(
                tracker.conflict_decision(&key("a")).await,
                RetryDecision::Immediate
            );
        }
        // The cap falls back to timed backoff.
        assert!(matches!(
            tracker.conflict_decision(&key("a")).await,
            RetryDecision::Delayed(_)
        ));
    }

    #[tokio::test]
    async fn test_timed_failure_resets_immediate_budget() {
        let tracker = BackoffTracker::new(BackoffConfig::default());

        tracker.conflict_decision(&key("a")).await;
        tracker.conflict_decision(&key("a")).await;
        tracker.next_delay(&key("a")).await;

        // Budget restored after a timed backoff.
        assert_eq!(
            tracker.conflict_decision(&key("a")).await,
            RetryDecision::Immediate
        );
    }
}
