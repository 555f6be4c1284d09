//! Time sources.
//!
//! Cultures timestamp every measurement and dilution, and growth rates are
//! derived from those timestamps. A time-accelerated simulation must therefore
//! not use the wall clock: [`SimulatedClock`] is advanced explicitly by the
//! simulation hook, by exactly the simulated interval.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by `chrono::Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock used by simulated runs and tests.
#[derive(Debug)]
pub struct SimulatedClock {
    now: Mutex<DateTime<Utc>>,
}

impl SimulatedClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    ///
    /// A step past the representable range leaves the clock unchanged.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Some(next) = now.checked_add_signed(by) {
            *now = next;
        }
    }

    /// Move the clock forward by a (possibly fractional) number of minutes.
    pub fn advance_minutes(&self, minutes: f64) {
        let micros = (minutes * 60.0 * 1_000_000.0).round() as i64;
        self.advance(Duration::microseconds(micros));
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_clock_advances() {
        let start = Utc::now();
        let clock = SimulatedClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance_minutes(90.0);
        assert_eq!(clock.now() - start, Duration::minutes(90));

        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now() - start, Duration::seconds(90 * 60 + 30));

        clock.advance_minutes(1e15);
        assert_eq!(clock.now() - start, Duration::seconds(90 * 60 + 30));
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
