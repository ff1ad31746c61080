//! Exponential backoff between failed flush attempts.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::AgentConfig;

/// Delay schedule for retrying a failed export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failure in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any single delay (ms)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }

    /// Delay before retry number `attempt_idx` (0-based): base * 2^n, capped.
    pub fn delay_for_attempt(&self, attempt_idx: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt_idx);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Consecutive-failure counter over a `RetryPolicy`.
#[derive(Debug, Default)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: AtomicU32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: AtomicU32::new(0),
        }
    }

    /// Count a failure and return how long to wait before the next attempt.
    pub fn record_failure(&self) -> Duration {
        let previous = self.failures.fetch_add(1, Ordering::SeqCst);
        self.policy.delay_for_attempt(previous)
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// The wait owed after the most recent failure, if the last attempt failed.
    pub fn pending_delay(&self) -> Option<Duration> {
        match self.consecutive_failures() {
            0 => None,
            n => Some(self.policy.delay_for_attempt(n - 1)),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(5000));
    }

    #[test]
    fn test_backoff_resets_on_success() {
        let backoff = Backoff::new(RetryPolicy::default());
        assert_eq!(backoff.pending_delay(), None);

        assert_eq!(backoff.record_failure(), Duration::from_secs(1));
        assert_eq!(backoff.record_failure(), Duration::from_secs(2));
        assert_eq!(backoff.consecutive_failures(), 2);
        assert_eq!(backoff.pending_delay(), Some(Duration::from_secs(2)));

        backoff.reset();
        assert_eq!(backoff.consecutive_failures(), 0);
        assert_eq!(backoff.record_failure(), Duration::from_secs(1));
    }
}
