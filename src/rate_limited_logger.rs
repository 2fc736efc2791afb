//! Rate-limited warnings for per-message failures
//!
//! Under overload the pipeline may drop or fail thousands of messages a
//! second. Each logger emits at most one warning per interval and reports
//! how many occurrences were folded into it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default interval between warnings
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(10);

pub struct RateLimitedLogger {
    min_interval: Duration,
    last_log_time: Mutex<Option<Instant>>,
    /// Occurrences since the last emitted warning
    pending: AtomicU64,
    total: AtomicU64,
}

impl RateLimitedLogger {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_log_time: Mutex::new(None),
            pending: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Record an occurrence and warn if the interval has elapsed.
    /// Returns true if a warning was emitted.
    pub fn warn(&self, message: &str, detail: &dyn std::fmt::Display) -> bool {
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);

        if !self.should_log(Instant::now()) {
            return false;
        }

        let count = self.pending.swap(0, Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        if count > 1 {
            tracing::warn!(
                detail = %detail,
                suppressed_count = count - 1,
                total,
                "{} (rate-limited)",
                message
            );
        } else {
            tracing::warn!(detail = %detail, total, "{}", message);
        }
        true
    }

    fn should_log(&self, now: Instant) -> bool {
        let mut last = self.last_log_time.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Occurrences recorded since creation
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for RateLimitedLogger {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_logs() {
        let logger = RateLimitedLogger::new(Duration::from_secs(60));
        assert!(logger.warn("buffer full", &"dropped"));
    }

    #[test]
    fn test_suppresses_within_interval() {
        let logger = RateLimitedLogger::new(Duration::from_secs(60));
        assert!(logger.warn("buffer full", &"dropped"));
        for _ in 0..100 {
            assert!(!logger.warn("buffer full", &"dropped"));
        }
        assert_eq!(logger.total(), 101);
    }

    #[test]
    fn test_logs_again_after_interval() {
        let logger = RateLimitedLogger::new(Duration::from_millis(10));
        assert!(logger.warn("publish failed", &"timeout"));
        assert!(!logger.warn("publish failed", &"timeout"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(logger.warn("publish failed", &"timeout"));
    }
}
