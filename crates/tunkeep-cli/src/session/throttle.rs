//! Rate limit for reconnect failure logs.
//!
//! Every failure is counted, but only some are logged: the first one, then at
//! most one per second. Once the outage has lasted a minute the cadence drops
//! to one per minute, and after an hour to one per hour.

use std::time::{Duration, Instant};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct ReconnectLogThrottle {
    started: Instant,
    last_logged: Option<Instant>,
    failures: u64,
}

impl ReconnectLogThrottle {
    pub const fn new(started: Instant) -> Self {
        Self {
            started,
            last_logged: None,
            failures: 0,
        }
    }

    /// Minimum gap between two logged failures at `now`.
    pub fn interval(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed > HOUR {
            HOUR
        } else if elapsed > MINUTE {
            MINUTE
        } else {
            SECOND
        }
    }

    /// Record a failure at `now` and report whether it should be logged.
    pub fn should_log(&mut self, now: Instant) -> bool {
        self.failures += 1;
        let due = self
            .last_logged
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval(now));
        if due {
            self.last_logged = Some(now);
        }
        due
    }

    pub const fn failures(&self) -> u64 {
        self.failures
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logged_at(throttle: &mut ReconnectLogThrottle, base: Instant, offsets: &[u64]) -> Vec<u64> {
        offsets
            .iter()
            .copied()
            .filter(|ms| throttle.should_log(base + Duration::from_millis(*ms)))
            .collect()
    }

    #[test]
    fn first_failure_is_logged() {
        let base = Instant::now();
        let mut t = ReconnectLogThrottle::new(base);
        assert!(t.should_log(base));
        assert_eq!(t.failures(), 1);
    }

    #[test]
    fn at_most_once_per_second_early_on() {
        let base = Instant::now();
        let mut t = ReconnectLogThrottle::new(base);
        let logged = logged_at(&mut t, base, &[0, 250, 500, 999, 1000, 1500, 2100]);
        assert_eq!(logged, vec![0, 1000, 2100]);
        assert_eq!(t.failures(), 7);
    }

    #[test]
    fn once_per_minute_after_a_minute() {
        let base = Instant::now();
        let mut t = ReconnectLogThrottle::new(base);
        let logged = logged_at(&mut t, base, &[0, 61_000, 62_000, 90_000, 121_000, 122_000]);
        assert_eq!(logged, vec![0, 61_000, 121_000]);
    }

    #[test]
    fn once_per_hour_after_an_hour() {
        let base = Instant::now();
        let mut t = ReconnectLogThrottle::new(base);
        let hour = 3_600_000;
        let logged = logged_at(
            &mut t,
            base,
            &[0, hour + 1, hour + 120_000, 2 * hour, 2 * hour + 2],
        );
        assert_eq!(logged, vec![0, hour + 1, 2 * hour + 2]);
    }

    #[test]
    fn interval_steps_up_with_elapsed_time() {
        let base = Instant::now();
        let t = ReconnectLogThrottle::new(base);
        assert_eq!(t.interval(base + Duration::from_secs(30)), SECOND);
        assert_eq!(t.interval(base + Duration::from_secs(61)), MINUTE);
        assert_eq!(t.interval(base + Duration::from_secs(3601)), HOUR);
    }
}
