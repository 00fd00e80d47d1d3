//! Database clock and tick conversions
//!
//! Timestamps are stored as ticks: 100 ns units since the Unix epoch.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::time::Duration;

/// Ticks per second
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Source of "now" for a database
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn utc_now(&self) -> DateTime<Utc>;

    /// Current UTC time in ticks
    fn now_ticks(&self) -> i64 {
        to_ticks(self.utc_now())
    }
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        if let Ok(by) = ChronoDuration::from_std(by) {
            let mut now = self.now.lock();
            *now = *now + by;
        }
    }

    /// Jump to `to`
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Convert a UTC time to ticks
pub fn to_ticks(time: DateTime<Utc>) -> i64 {
    let secs = time.timestamp();
    let sub = i64::from(time.timestamp_subsec_nanos()) / 100;
    secs.saturating_mul(TICKS_PER_SECOND).saturating_add(sub)
}

/// Convert ticks back to a UTC time
pub fn from_ticks(ticks: i64) -> DateTime<Utc> {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert a duration to ticks
pub fn duration_to_ticks(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ticks_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 5, 17, 12, 30, 0).unwrap();
        assert_eq!(from_ticks(to_ticks(t)), t);
        assert_eq!(to_ticks(Utc.timestamp_opt(0, 0).unwrap()), 0);
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now_ticks() - to_ticks(start), 60 * TICKS_PER_SECOND);
    }

    #[test]
    fn test_duration_to_ticks() {
        assert_eq!(duration_to_ticks(Duration::from_millis(1)), 10_000);
    }
}
