//! Calendar bucket windows
//!
//! Buckets are computed in the stream's own time zone: a Day bucket runs from
//! local midnight to the next local midnight (23 or 25 hours across DST
//! changes), a Month bucket from the first of the month to the first of the
//! next. Hour buckets follow the local UTC offset so they always span exactly
//! one hour.

use super::types::AggregationKind;
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Half-open UTC interval `[start, end)` summarized by one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BucketWindow {
    /// Window of the bucket starting at `bucket_start`
    pub fn for_bucket(bucket_start: DateTime<Utc>, kind: AggregationKind, tz: Tz) -> Self {
        let end = match kind {
            AggregationKind::Hour => bucket_start + Duration::hours(1),
            AggregationKind::Day => {
                let date = bucket_start.with_timezone(&tz).date_naive();
                let next = date.succ_opt().unwrap_or(date);
                local_midnight(next, tz)
            }
            AggregationKind::Month => {
                let date = bucket_start.with_timezone(&tz).date_naive();
                local_midnight(first_of_next_month(date), tz)
            }
        };
        Self {
            start: bucket_start,
            end,
        }
    }

    /// Window of the bucket containing `ts`
    pub fn containing(ts: DateTime<Utc>, kind: AggregationKind, tz: Tz) -> Self {
        Self::for_bucket(bucket_start(ts, kind, tz), kind, tz)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Start of the `kind` bucket containing `ts`, in the stream's zone
pub fn bucket_start(ts: DateTime<Utc>, kind: AggregationKind, tz: Tz) -> DateTime<Utc> {
    let local = ts.with_timezone(&tz);
    match kind {
        AggregationKind::Hour => {
            let offset = local.offset().fix();
            let shifted = ts.naive_utc() + Duration::seconds(offset.local_minus_utc() as i64);
            let floored = shifted
                .date()
                .and_hms_opt(shifted.hour(), 0, 0)
                .unwrap_or(shifted);
            Utc.from_utc_datetime(&(floored - Duration::seconds(offset.local_minus_utc() as i64)))
        }
        AggregationKind::Day => local_midnight(local.date_naive(), tz),
        AggregationKind::Month => {
            let date = local.date_naive();
            let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date);
            local_midnight(first, tz)
        }
    }
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    resolve_local(date.and_hms_opt(0, 0, 0).unwrap_or_default(), tz)
}

/// Map a local wall-clock time to UTC
///
/// Ambiguous times take the earlier instant; times inside a DST gap move
/// forward to the first valid instant.
fn resolve_local(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let mut candidate = naive;
            for _ in 0..8 {
                candidate += Duration::minutes(15);
                if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
                    return dt.with_timezone(&Utc);
                }
            }
            Utc.from_utc_datetime(&naive)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_hour_floor_utc() {
        let start = bucket_start(utc("2024-03-05T10:55:12Z"), AggregationKind::Hour, Tz::UTC);
        assert_eq!(start, utc("2024-03-05T10:00:00Z"));
    }

    #[test]
    fn test_hour_floor_half_hour_zone() {
        // India is UTC+05:30, so local hours start at :30 UTC
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let start = bucket_start(utc("2024-03-05T10:15:00Z"), AggregationKind::Hour, tz);
        assert_eq!(start, utc("2024-03-05T09:30:00Z"));
    }

    #[test]
    fn test_day_uses_local_midnight() {
        let tz: Tz = "Pacific/Auckland".parse().unwrap();
        // 2024-06-01T20:00Z is 2024-06-02T08:00 in Auckland (UTC+12)
        let window = BucketWindow::containing(utc("2024-06-01T20:00:00Z"), AggregationKind::Day, tz);
        assert_eq!(window.start, utc("2024-06-01T12:00:00Z"));
        assert_eq!(window.end, utc("2024-06-02T12:00:00Z"));
    }

    #[test]
    fn test_day_across_dst_start_is_23_hours() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let window = BucketWindow::containing(utc("2024-03-10T15:00:00Z"), AggregationKind::Day, tz);
        assert_eq!(window.start, utc("2024-03-10T05:00:00Z"));
        assert_eq!(window.end, utc("2024-03-11T04:00:00Z"));
        assert_eq!(window.end - window.start, Duration::hours(23));
    }

    #[test]
    fn test_month_window_wraps_year() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let window = BucketWindow::containing(utc("2024-12-15T00:00:00Z"), AggregationKind::Month, tz);
        assert_eq!(window.start, utc("2024-11-30T23:00:00Z"));
        assert_eq!(window.end, utc("2024-12-31T23:00:00Z"));
    }

    #[test]
    fn test_hour_in_repeated_fall_back_hour() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 05:30Z and 06:30Z are both 01:30 local on 2024-11-03
        let first = BucketWindow::containing(utc("2024-11-03T05:30:00Z"), AggregationKind::Hour, tz);
        let second = BucketWindow::containing(utc("2024-11-03T06:30:00Z"), AggregationKind::Hour, tz);
        assert_eq!(first.start, utc("2024-11-03T05:00:00Z"));
        assert_eq!(second.start, utc("2024-11-03T06:00:00Z"));
        assert!(second.contains(utc("2024-11-03T06:30:00Z")));
    }
}
