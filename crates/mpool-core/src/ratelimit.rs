//! Rate-limited diagnostics
//!
//! Repeated misuse (a bad handle passed in a loop, say) must not flood the
//! log. [`DiagLimiter`] owns named buckets, each admitting one diagnostic
//! per interval; callers gate their `warn!`/`error!` on [`DiagLimiter::check`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Named rate-limit buckets for diagnostic messages
#[derive(Debug)]
pub struct DiagLimiter {
    interval: Duration,
    buckets: Mutex<HashMap<&'static str, Instant>>,
}

impl DiagLimiter {
    /// Create a limiter admitting one diagnostic per bucket per interval
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether the named bucket admits a diagnostic now
    ///
    /// The first check of a bucket is always admitted; later checks are
    /// admitted once the interval has elapsed since the last admission.
    pub fn check(&self, bucket: &'static str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        match buckets.get_mut(bucket) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                buckets.insert(bucket, now);
                true
            }
        }
    }

    /// Forget all bucket state
    pub fn reset(&self) {
        self.buckets.lock().clear();
    }
}

impl Default for DiagLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_check_admits() {
        let limiter = DiagLimiter::new(Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn test_buckets_independent() {
        let limiter = DiagLimiter::new(Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
        assert!(!limiter.check("b"));
    }

    #[test]
    fn test_interval_elapses() {
        let limiter = DiagLimiter::new(Duration::from_millis(10));
        assert!(limiter.check("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.check("a"));
    }

    #[test]
    fn test_reset() {
        let limiter = DiagLimiter::new(Duration::from_secs(60));
        assert!(limiter.check("a"));
        limiter.reset();
        assert!(limiter.check("a"));
    }
}
