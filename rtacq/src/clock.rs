//! Microsecond time sources.
//!
//! Producers stamp packets with a capture time and the receiver judges their
//! age against its own clock, so both ends must share a time base. The
//! default is wall-clock time since the Unix epoch, which is what
//! PTP/NTP-disciplined acquisition hosts agree on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of "now" in microseconds.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_us(&self) -> u64;
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Used for simulation and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now_us`.
    pub fn new(now_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(now_us),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::Release);
    }

    /// Moves the clock forward by `delta_us`.
    pub fn advance(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z in µs.
        assert!(SystemClock.now_us() > 1_577_836_800_000_000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(5);
        assert_eq!(clock.now_us(), 5);
        clock.advance(10);
        assert_eq!(clock.now_us(), 15);
        clock.set(1);
        assert_eq!(clock.now_us(), 1);
    }
}
