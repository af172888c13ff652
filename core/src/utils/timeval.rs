//! Capture timestamps.
//!
//! Capture sources deliver a wall-clock timestamp per frame with microsecond
//! precision. All flow ages and durations are derived from these timestamps,
//! never from the host clock, so offline replays behave exactly like the
//! original capture.

use std::fmt;
use std::ops::Sub;

use serde::Serialize;

/// Microseconds per second.
pub const TIMESTAMP_FACTOR: f64 = 1_000_000.0;

/// A capture timestamp or duration in seconds and microseconds.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    pub const ZERO: Timeval = Timeval { sec: 0, usec: 0 };

    pub fn new(sec: i64, usec: i64) -> Self {
        Timeval { sec, usec }
    }

    /// Seconds since the epoch as a float, microsecond resolution.
    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.usec as f64 / TIMESTAMP_FACTOR
    }

    /// Age of `other` relative to `self` in fractional seconds.
    ///
    /// Negative if `other` lies in the future, which callers treat as a
    /// timestamp jump.
    #[inline]
    pub fn elapsed_since(&self, other: &Timeval) -> f64 {
        (self.sec - other.sec) as f64 + (self.usec - other.usec) as f64 / TIMESTAMP_FACTOR
    }
}

impl Sub for Timeval {
    type Output = Timeval;

    fn sub(self, rhs: Timeval) -> Timeval {
        let mut sec = self.sec - rhs.sec;
        let mut usec = self.usec - rhs.usec;
        if usec < 0 {
            sec -= 1;
            usec += TIMESTAMP_FACTOR as i64;
        }
        Timeval { sec, usec }
    }
}

impl fmt::Display for Timeval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

impl From<libc::timeval> for Timeval {
    fn from(tv: libc::timeval) -> Self {
        Timeval {
            sec: tv.tv_sec as i64,
            usec: tv.tv_usec as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_borrows_microseconds() {
        let last = Timeval::new(10, 200);
        let first = Timeval::new(8, 900);
        let d = last - first;
        assert_eq!(d, Timeval::new(1, 999_300));
    }

    #[test]
    fn elapsed_is_fractional() {
        let now = Timeval::new(100, 500_000);
        let then = Timeval::new(98, 0);
        assert!((now.elapsed_since(&then) - 2.5).abs() < 1e-9);
    }
}
