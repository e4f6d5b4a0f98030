//! Per-workflow trigger rate limiting
//!
//! A sliding-window limiter advanced on read with the monotonic clock: at
//! most `capacity` acquisitions succeed in any window-length interval.
//! Attempts that cannot obtain a slot are dropped, never queued.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use watchflow_core::model::RateLimitConfig;

/// Sliding-window rate limiter
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1) as usize,
            window,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, Duration::from_millis(config.window_ms))
    }

    /// Try to take a slot; false drops the attempt
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut hits = self.hits.lock();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() < self.capacity {
            hits.push_back(now);
            true
        } else {
            false
        }
    }

    /// Acquisitions currently counted against the window
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        let hits = self.hits.lock();
        hits.iter()
            .filter(|h| now.duration_since(**h) < self.window)
            .count()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_within_window() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60));
        let now = Instant::now();

        let granted = (0..120).filter(|_| limiter.try_acquire_at(now)).count();
        assert_eq!(granted, 100);
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_millis(100));
        let start = Instant::now();

        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start + Duration::from_millis(50)));

        // First slot has aged out
        assert!(limiter.try_acquire_at(start + Duration::from_millis(101)));
    }

    #[test]
    fn test_sliding_property() {
        // At most C acquisitions in ANY window-length interval
        let capacity = 10;
        let window = Duration::from_millis(1_000);
        let limiter = RateLimiter::new(capacity, window);
        let start = Instant::now();

        let mut granted_at = Vec::new();
        for i in 0..200 {
            let t = start + Duration::from_millis(i * 20);
            if limiter.try_acquire_at(t) {
                granted_at.push(t);
            }
        }

        for (i, t) in granted_at.iter().enumerate() {
            let in_window = granted_at[i..]
                .iter()
                .take_while(|g| g.duration_since(*t) < window)
                .count();
            assert!(in_window <= capacity as usize);
        }
    }
}
