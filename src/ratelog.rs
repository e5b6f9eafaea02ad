//! Rate-limited logging: emit a warning at most once per configured interval.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Gates repeated log lines so backpressure/overflow conditions don't spam
/// the log. Thread-safe: a single mutex around the last-emit timestamp.
pub struct RateLimitedLogger {
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl RateLimitedLogger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: Mutex::new(None),
        }
    }

    /// Emits `msg` as a `tracing::warn!` unless the interval hasn't elapsed
    /// since the last emission, in which case the message is dropped.
    pub fn emit(&self, msg: &str) {
        let now = Instant::now();
        let mut guard = self.last_emit.lock().unwrap();
        let should_emit = match *guard {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if should_emit {
            *guard = Some(now);
            drop(guard);
            warn!("{msg}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_emit_always_goes_through() {
        let logger = RateLimitedLogger::new(Duration::from_secs(60));
        logger.emit("first");
    }

    #[test]
    fn suppresses_within_interval() {
        let logger = RateLimitedLogger::new(Duration::from_millis(200));
        let last_before = {
            logger.emit("a");
            *logger.last_emit.lock().unwrap()
        };
        logger.emit("b");
        let last_after = *logger.last_emit.lock().unwrap();
        assert_eq!(last_before, last_after, "second emit within interval must be suppressed");
    }

    #[test]
    fn allows_after_interval_elapses() {
        let logger = RateLimitedLogger::new(Duration::from_millis(20));
        logger.emit("a");
        let first = *logger.last_emit.lock().unwrap();
        thread::sleep(Duration::from_millis(40));
        logger.emit("b");
        let second = *logger.last_emit.lock().unwrap();
        assert_ne!(first, second);
    }
}
