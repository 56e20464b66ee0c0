//! Time sources for the limiter.
//!
//! All timestamps are `f64` seconds since the Unix epoch so that state written
//! by one instance is meaningful to another. [`SystemClock`] anchors a
//! monotonic [`Instant`] to the wall clock once, at construction, so later
//! wall-clock adjustments never move time backwards within a process.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of the current time, in epoch seconds
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> f64;
}

/// Monotonic clock anchored to the Unix epoch
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
    origin_epoch: f64,
}

impl SystemClock {
    pub fn new() -> Self {
        let origin_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        Self {
            origin: Instant::now(),
            origin_epoch,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin_epoch + self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same time value.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<f64>>,
}

impl MockClock {
    pub fn new(start: f64) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by `secs`
    pub fn advance(&self, secs: f64) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += secs;
    }

    /// Set the clock to `secs`
    pub fn set(&self, secs: f64) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = secs;
    }
}

impl Clock for MockClock {
    fn now(&self) -> f64 {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2 > t1);
        assert!(t1 > 1_600_000_000.0);
    }

    #[test]
    fn test_mock_clock() {
        let clock = MockClock::new(100.0);
        assert_eq!(clock.now(), 100.0);

        clock.advance(2.5);
        assert_eq!(clock.now(), 102.5);

        let shared = clock.clone();
        shared.set(500.0);
        assert_eq!(clock.now(), 500.0);
    }
}
