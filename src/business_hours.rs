//! Business-hour arithmetic for the retest cooldown.
//!
//! Business time runs around the clock Monday to Friday; Saturday and Sunday
//! hours do not count. A start on a weekend is moved to the following Monday
//! at midnight before counting.

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};

fn is_weekend(at: NaiveDateTime) -> bool {
    matches!(at.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Returns `start` plus `hours` business hours.
///
/// Hours are stepped one at a time and an hour counts when the instant it
/// ends on falls on a weekday.
pub fn add_business_hours(start: NaiveDateTime, hours: u32) -> NaiveDateTime {
    let mut at = start;
    while is_weekend(at) {
        at = (at.date() + Duration::days(1)).and_time(NaiveTime::MIN);
    }

    let mut remaining = hours;
    while remaining > 0 {
        at += Duration::hours(1);
        if !is_weekend(at) {
            remaining -= 1;
        }
    }
    at
}

/// Earliest instant a serial last updated at `last_update` may be tested again.
pub fn cooldown_ends(last_update: NaiveDateTime, hours: u32) -> NaiveDateTime {
    add_business_hours(last_update, hours)
}

/// `true` while `now` is still inside the cooldown that started at `last_update`.
pub fn within_cooldown(last_update: NaiveDateTime, now: NaiveDateTime, hours: u32) -> bool {
    now <= cooldown_ends(last_update, hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_within_week() {
        // 2025-01-06 is a Monday.
        assert_eq!(add_business_hours(at(2025, 1, 6, 9, 0), 48), at(2025, 1, 8, 9, 0));
    }

    #[test]
    fn test_skips_weekend() {
        // Thursday 10:00 + 48h: Thu 14h, Fri 24h, Mon 10h.
        assert_eq!(add_business_hours(at(2025, 1, 9, 10, 0), 48), at(2025, 1, 13, 10, 0));
    }

    #[test]
    fn test_weekend_start_moves_to_monday() {
        // Saturday afternoon counts from Monday 00:00.
        assert_eq!(add_business_hours(at(2025, 1, 11, 15, 30), 48), at(2025, 1, 15, 0, 0));
        assert_eq!(add_business_hours(at(2025, 1, 12, 23, 0), 0), at(2025, 1, 13, 0, 0));
    }

    #[test]
    fn test_friday_night_hour_lands_monday() {
        assert_eq!(add_business_hours(at(2025, 1, 10, 23, 30), 1), at(2025, 1, 13, 0, 30));
    }

    #[test]
    fn test_within_cooldown_boundary() {
        let last = at(2025, 1, 6, 9, 0);
        assert!(within_cooldown(last, at(2025, 1, 7, 9, 0), 48));
        assert!(within_cooldown(last, at(2025, 1, 8, 9, 0), 48));
        assert!(!within_cooldown(last, at(2025, 1, 8, 9, 1), 48));
    }

    #[test]
    fn test_zero_hours_disables_cooldown_on_weekdays() {
        let last = at(2025, 1, 6, 9, 0);
        assert!(!within_cooldown(last, at(2025, 1, 6, 9, 1), 0));
    }
}
