//! Time source.
//!
//! Wall-clock time (local, naive) stamps records and drives the business-hour
//! cooldown; monotonic time bounds the confirmation window. Both come from a
//! [`Clock`] so the handshake and the state machine can be driven
//! deterministically.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};

pub trait Clock: Send + Sync + 'static {
    /// Local wall-clock time.
    fn now(&self) -> NaiveDateTime;

    fn monotonic(&self) -> Instant;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    wall: NaiveDateTime,
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(wall: NaiveDateTime) -> Self {
        Self {
            wall,
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::TimeDelta::MAX);
        self.wall
            .checked_add_signed(elapsed)
            .unwrap_or(NaiveDateTime::MAX)
    }

    fn monotonic(&self) -> Instant {
        self.base + self.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_manual_clock_moves_both_times() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 6)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let clock = ManualClock::new(start);
        let t0 = clock.monotonic();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.monotonic() - t0, Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }
}
