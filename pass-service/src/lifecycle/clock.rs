//! Time source for the lifecycle. Injected so tests can move time by hand.

use chrono::{DateTime, Utc};
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Time from `now` until the next multiple of `period` since the Unix epoch.
/// A `now` exactly on a boundary waits a full period.
pub fn delay_until_next_boundary(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let now_ms = now.timestamp_millis();
    let into_period = now_ms.rem_euclid(period_ms);
    Duration::from_millis((period_ms - into_period) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn aligns_to_next_wall_clock_boundary() {
        let period = Duration::from_secs(30);
        let at = |s: u32, ms: u32| {
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, s).unwrap()
                + chrono::Duration::milliseconds(ms as i64)
        };

        assert_eq!(delay_until_next_boundary(at(10, 0), period), Duration::from_secs(20));
        assert_eq!(delay_until_next_boundary(at(29, 500), period), Duration::from_millis(500));
        assert_eq!(delay_until_next_boundary(at(45, 0), period), Duration::from_secs(15));
        assert_eq!(delay_until_next_boundary(at(0, 0), period), period);
    }
}
