// Monotonic "now" and Amsterdam-local calendar helpers.
//
// All absolute timestamps elsewhere in the crate are UTC; this module is the only
// place that is allowed to reason about a local wall-clock date.

use chrono::{DateTime, Utc};
use chrono_tz::Europe::Amsterdam;

pub fn utcnow() -> DateTime<Utc> {
    Utc::now()
}

/// Ceiling-to-day with a zero floor: a deadline five minutes away is "1 day left",
/// a deadline that has passed is "0 days left". Never negative.
pub fn days_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let remaining = (deadline - now).num_seconds();
    if remaining <= 0 {
        return 0;
    }
    (remaining + 86_399) / 86_400
}

/// Local calendar date string (`YYYY-MM-DD`) for the Amsterdam zone, used as the
/// daily kick-report dedup key.
pub fn amsterdam_today(now: DateTime<Utc>) -> String {
    now.with_timezone(&Amsterdam).format("%Y-%m-%d").to_string()
}

/// True once Amsterdam local time has reached or passed 12:00 on `now`'s local date.
pub fn is_past_amsterdam_noon(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&Amsterdam);
    local.format("%H:%M").to_string() >= "12:00".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn days_until_floors_to_zero_when_past() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let past = now - chrono::Duration::seconds(5);
        assert_eq!(days_until(past, now), 0);
    }

    #[test]
    fn days_until_ceils_partial_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let target = now + chrono::Duration::hours(1);
        assert_eq!(days_until(target, now), 1);
    }

    #[test]
    fn days_until_exact_week() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let target = now + chrono::Duration::days(7);
        assert_eq!(days_until(target, now), 7);
    }

    #[test]
    fn noon_boundary_amsterdam() {
        // 11:00 UTC is 12:00 CET (winter, UTC+1).
        let before = Utc.with_ymd_and_hms(2026, 1, 15, 10, 59, 0).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 1, 15, 11, 0, 0).unwrap();
        assert!(!is_past_amsterdam_noon(before));
        assert!(is_past_amsterdam_noon(at));
    }
}
