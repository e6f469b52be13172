//! Time source abstraction.
//!
//! Services never call `OffsetDateTime::now_utc()` directly; they ask an
//! injected [`Clock`], so timeouts and grace periods can be tested by
//! advancing a [`ManualClock`].

use std::sync::{Arc, Mutex};

use time::{Duration, OffsetDateTime};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current UTC time.
    fn now(&self) -> OffsetDateTime;
}

/// Shareable clock handle.
pub type DynClock = Arc<dyn Clock>;

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Creates a clock frozen at the current system time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::new(OffsetDateTime::now_utc())
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    /// Jumps the clock to `to`.
    pub fn set(&self, to: OffsetDateTime) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Converts a `std` duration into a `time` duration, saturating on overflow.
#[must_use]
pub fn to_time_duration(duration: std::time::Duration) -> Duration {
    Duration::try_from(duration).unwrap_or(Duration::MAX)
}

/// Converts a `time` duration into a `std` duration; negatives become zero.
#[must_use]
pub fn to_std_duration(duration: Duration) -> std::time::Duration {
    std::time::Duration::try_from(duration).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(datetime!(2024-01-01 00:00:00 UTC));
        clock.advance(Duration::minutes(31));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:31:00 UTC));
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::new(datetime!(2024-01-01 00:00:00 UTC));
        clock.set(datetime!(2025-06-01 12:00:00 UTC));
        assert_eq!(clock.now(), datetime!(2025-06-01 12:00:00 UTC));
    }

    #[test]
    fn test_system_clock_is_close_to_now() {
        let diff = SystemClock.now() - OffsetDateTime::now_utc();
        assert!(diff.abs() < Duration::seconds(1));
    }

    #[test]
    fn test_duration_conversions() {
        assert_eq!(
            to_time_duration(std::time::Duration::from_secs(90)),
            Duration::seconds(90)
        );
        assert_eq!(
            to_std_duration(Duration::seconds(-5)),
            std::time::Duration::ZERO
        );
        assert_eq!(
            to_std_duration(Duration::milliseconds(1500)),
            std::time::Duration::from_millis(1500)
        );
    }
}
