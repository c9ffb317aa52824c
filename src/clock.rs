//! Injectable clock, per §6: "clock — injected for deterministic testing."
//!
//! Every layer that needs wall-clock time (write-delay eligibility, EC-protect windows,
//! retry backoff) reads it through an `Arc<dyn Clock>` instead of calling
//! [`std::time::Instant::now`] directly, so tests can advance time explicitly instead of
//! sleeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of monotonic time, measured in milliseconds since some fixed origin.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since the clock was created.
    fn now_ms(&self) -> u64;
}

/// The real clock, backed by [`std::time::Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Arc<dyn Clock> {
        Arc::new(Self {
            origin: Instant::now(),
        })
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// A millisecond duration, re-exported for call sites that build `Duration`s from
/// clock-relative values.
pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// A clock under explicit test control, advanced only by calling [`MockClock::advance`].
/// Shared across the layered stack's tests so write-delay and EC-protect windows can be
/// exercised without real sleeps.
pub struct MockClock {
    millis: parking_lot::Mutex<u64>,
}

impl MockClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            millis: parking_lot::Mutex::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.millis.lock() += by.as_millis() as u64;
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        *self.millis.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[test]
    fn mock_clock_only_moves_on_advance() {
        let clock = MockClock::new(10);
        assert_eq!(clock.now_ms(), 10);
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now_ms(), 15);
    }
}
