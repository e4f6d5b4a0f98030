//! Exponential backoff policy
//!
//! Steps and actions share the same retry shape: a bounded number of
//! retries with the delay doubling per attempt. Each attempt yields a
//! typed outcome; the retry loops in the engine decide based on the
//! outcome without unwinding.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff: `base_delay * 2^retry`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Retries allowed after the initial attempt
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
        }
    }

    /// Delay before the given retry (0-based)
    ///
    /// Capped at 2^16 multiples of the base delay so a misconfigured
    /// attempt count cannot overflow.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.min(16));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    pub fn has_retries_remaining(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_retry() {
        let policy = BackoffPolicy::new(3, 10);
        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(40));
    }

    #[test]
    fn test_retries_remaining() {
        let policy = BackoffPolicy::new(2, 10);
        assert!(policy.has_retries_remaining(0));
        assert!(policy.has_retries_remaining(1));
        assert!(!policy.has_retries_remaining(2));
    }

    #[test]
    fn test_none_never_retries() {
        let policy = BackoffPolicy::none();
        assert!(!policy.has_retries_remaining(0));
    }

    #[test]
    fn test_overflow_guard() {
        let policy = BackoffPolicy::new(100, u64::MAX / 2);
        // Saturates instead of panicking
        let _ = policy.delay_for_retry(99);
    }
}
