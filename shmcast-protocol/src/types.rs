//! Core protocol types shared across all shmcast crates.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-clock timestamp with microsecond resolution.
///
/// Stored as seconds plus microseconds since the Unix epoch, the same split a
/// frame producer writes into the shared region header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeStamp {
    pub seconds: i64,
    pub microseconds: i32,
}

impl TimeStamp {
    /// Build a timestamp, normalising `microseconds` into `0..1_000_000`.
    pub fn new(seconds: i64, microseconds: i64) -> Self {
        let carry = microseconds.div_euclid(1_000_000);
        Self {
            seconds: seconds + carry,
            microseconds: microseconds.rem_euclid(1_000_000) as i32,
        }
    }

    /// Current wall-clock time.
    ///
    /// Clocks set before the epoch collapse to the epoch.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_micros(since_epoch.as_micros() as i64)
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(0, micros)
    }

    /// Total microseconds since the epoch.
    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.microseconds)
    }

    /// Signed difference `self - earlier` in microseconds.
    pub fn micros_since(&self, earlier: TimeStamp) -> i64 {
        self.to_micros() - earlier.to_micros()
    }
}

impl From<SystemTime> for TimeStamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::from_micros(d.as_micros() as i64),
            Err(e) => Self::from_micros(-(e.duration().as_micros() as i64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_normalise_into_seconds() {
        let ts = TimeStamp::new(1, 2_500_000);
        assert_eq!(ts.seconds, 3);
        assert_eq!(ts.microseconds, 500_000);

        let neg = TimeStamp::new(5, -1);
        assert_eq!(neg.seconds, 4);
        assert_eq!(neg.microseconds, 999_999);
    }

    #[test]
    fn to_micros_matches_from_micros() {
        let ts = TimeStamp::from_micros(1_700_000_000_123_456);
        assert_eq!(ts.seconds, 1_700_000_000);
        assert_eq!(ts.microseconds, 123_456);
        assert_eq!(ts.to_micros(), 1_700_000_000_123_456);
    }

    #[test]
    fn micros_since_is_signed() {
        let a = TimeStamp::new(10, 0);
        let b = TimeStamp::new(10, 250);
        assert_eq!(b.micros_since(a), 250);
        assert_eq!(a.micros_since(b), -250);
    }

    #[test]
    fn from_system_time_before_epoch() {
        let t = UNIX_EPOCH - Duration::from_micros(1_500_000);
        let ts = TimeStamp::from(t);
        assert_eq!(ts.to_micros(), -1_500_000);
        assert_eq!(ts.seconds, -2);
        assert_eq!(ts.microseconds, 500_000);
    }

    #[test]
    fn now_is_after_2020() {
        assert!(TimeStamp::now().seconds > 1_577_836_800);
    }
}
