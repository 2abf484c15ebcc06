//! Business-timezone time arithmetic: when a step is due and whether the
//! engine is inside its daily run window.

use chrono::{DateTime, Days, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::campaign::MAX_DAY_OFFSET;

/// Calendar date of `instant` in the business timezone.
pub fn business_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Resolve a local wall-clock time to a UTC instant.
///
/// Times skipped by a DST transition move forward by the gap; ambiguous times
/// take the earlier instant.
fn local_to_utc(date: NaiveDate, hour: u32, tz: Tz) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let naive = date.and_time(time);

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // Inside a spring-forward gap; gaps are at most an hour in practice.
            let shifted = naive + Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
        }
    }
}

/// Send instant of a step scheduled `day` days after `anchor`.
///
/// `day` is clamped to [`MAX_DAY_OFFSET`]; a date past the calendar's end
/// falls back to the anchor itself.
pub fn send_time(anchor: NaiveDate, day: u32, send_hour: u32, tz: Tz) -> DateTime<Utc> {
    let date = anchor
        .checked_add_days(Days::new(u64::from(day.min(MAX_DAY_OFFSET))))
        .unwrap_or(anchor);
    local_to_utc(date, send_hour, tz)
}

/// Next send instant when moving from a step on `previous_day` to one on
/// `target_day`.
///
/// The reference is the anchor date shifted to the previous step's day; it is
/// advanced by `max(0, target_day - previous_day)` days. Steps never move
/// backwards even when a campaign lists a later day before an earlier one.
pub fn next_send_time(
    anchor: NaiveDate,
    previous_day: u32,
    target_day: u32,
    send_hour: u32,
    tz: Tz,
) -> DateTime<Utc> {
    let advance = target_day.saturating_sub(previous_day);
    send_time(anchor, previous_day + advance, send_hour, tz)
}

/// Whether `now` falls inside `[start_hour, end_hour)` local time.
pub fn within_window(now: DateTime<Utc>, tz: Tz, start_hour: u32, end_hour: u32) -> bool {
    let hour = now.with_timezone(&tz).hour();
    hour >= start_hour && hour < end_hour
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_send_time_in_business_zone() {
        let anchor = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        // 09:00 EST is 14:00 UTC.
        assert_eq!(send_time(anchor, 0, 9, New_York), utc(2026, 1, 10, 14, 0));
        assert_eq!(send_time(anchor, 3, 9, New_York), utc(2026, 1, 13, 14, 0));
    }

    #[test]
    fn test_send_time_follows_dst() {
        // DST starts 2026-03-08 in New York; 09:00 EDT is 13:00 UTC.
        let anchor = NaiveDate::from_ymd_opt(2026, 3, 6).unwrap();
        assert_eq!(send_time(anchor, 0, 9, New_York), utc(2026, 3, 6, 14, 0));
        assert_eq!(send_time(anchor, 3, 9, New_York), utc(2026, 3, 9, 13, 0));
    }

    #[test]
    fn test_skipped_local_hour_moves_forward() {
        // 02:00 on 2026-03-08 does not exist in New York.
        let anchor = NaiveDate::from_ymd_opt(2026, 3, 8).unwrap();
        assert_eq!(send_time(anchor, 0, 2, New_York), utc(2026, 3, 8, 7, 0));
    }

    #[test]
    fn test_next_send_time_never_moves_back() {
        let anchor = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let forward = next_send_time(anchor, 2, 5, 9, New_York);
        assert_eq!(forward, send_time(anchor, 5, 9, New_York));

        let backwards = next_send_time(anchor, 5, 2, 9, New_York);
        assert_eq!(backwards, send_time(anchor, 5, 9, New_York));
    }

    #[test]
    fn test_huge_day_offsets_do_not_overflow() {
        let anchor = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        assert_eq!(
            send_time(anchor, u32::MAX, 9, New_York),
            send_time(anchor, MAX_DAY_OFFSET, 9, New_York)
        );
        assert_eq!(
            next_send_time(anchor, 1, 100_000_000, 9, New_York),
            send_time(anchor, MAX_DAY_OFFSET, 9, New_York)
        );

        // No room left on the calendar: stay on the anchor date.
        let end = NaiveDate::MAX - Days::new(1);
        assert_eq!(send_time(end, 10, 0, Tz::UTC).date_naive(), end);
    }

    #[test]
    fn test_business_date_crosses_midnight() {
        // 03:00 UTC is still the previous evening in New York.
        let date = business_date(utc(2026, 1, 11, 3, 0), New_York);
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 1, 10).unwrap());
    }

    #[test]
    fn test_within_window() {
        // 14:00 UTC = 09:00 EST.
        assert!(within_window(utc(2026, 1, 10, 14, 0), New_York, 8, 20));
        // 02:00 UTC = 21:00 EST previous day.
        assert!(!within_window(utc(2026, 1, 11, 2, 0), New_York, 8, 20));
        // End hour is exclusive.
        assert!(!within_window(utc(2026, 1, 11, 1, 0), New_York, 8, 20));
    }
}
