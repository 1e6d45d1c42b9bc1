//! Monotonic time pointer.
//!
//! The engine never reads the wall clock itself (per the concurrency model):
//! every public entry point that needs "now" takes a [`TimePoint`] the host
//! computed once per event-loop tick. This keeps `housekeeping()` and friends
//! pure functions of their inputs, which is what makes the integration tests
//! in `tests/` able to simulate hours of wall-clock time instantly.

use std::ops::{Add, Sub};
use std::time::Duration;

/// Opaque monotonic instant, measured in whole seconds since an
/// engine-defined epoch (session start). Sub-second precision is not needed
/// anywhere in the protocol: every timeout in `proto.hpp` is specified in
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint(u64);

impl TimePoint {
    pub const ZERO: TimePoint = TimePoint(0);

    pub fn from_secs(secs: u64) -> Self {
        TimePoint(secs)
    }

    pub fn as_secs(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, rhs: TimePoint) -> Duration {
        Duration::from_secs(self.0.saturating_sub(rhs.0))
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;
    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0.saturating_add(rhs.as_secs()))
    }
}

impl Sub<Duration> for TimePoint {
    type Output = TimePoint;
    fn sub(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0.saturating_sub(rhs.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_saturates_instead_of_panicking() {
        let t = TimePoint::from_secs(5);
        assert_eq!((t - Duration::from_secs(10)).as_secs(), 0);
        assert_eq!((t + Duration::from_secs(u64::MAX)).as_secs(), u64::MAX);
    }

    #[test]
    fn ordering_is_by_seconds() {
        assert!(TimePoint::from_secs(1) < TimePoint::from_secs(2));
    }
}
