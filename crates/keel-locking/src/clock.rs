//! Local clocks for timestamp markers.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// A source of the current time in microseconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_micros(&self) -> i64;
}

/// The process clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        chrono::Utc::now().timestamp_micros()
    }
}

/// A clock that only moves when told to. Two reads without an
/// [`advance`](ManualClock::advance) in between fall in the same tick.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start_micros: i64) -> Self {
        Self {
            micros: AtomicI64::new(start_micros),
        }
    }

    pub fn set(&self, micros: i64) {
        self.micros.store(micros, Ordering::SeqCst);
    }

    pub fn advance(&self, micros: i64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_ticks_only_on_advance() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_micros(), 100);
        assert_eq!(clock.now_micros(), 100);
        clock.advance(5);
        assert_eq!(clock.now_micros(), 105);
        clock.set(1);
        assert_eq!(clock.now_micros(), 1);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_micros() > 1_577_836_800_000_000);
    }
}
