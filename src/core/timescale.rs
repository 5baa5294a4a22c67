//! Bucket clock for the analytics engine.
//!
//! A bucket is addressed by the canonical start instant of its period, never by a
//! rotating index, so the same `(scale, now, offset)` always produces the same key and
//! old buckets simply stop being addressed once they fall out of the retention window.
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The four aggregation granularities and their retention counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeScale {
    Minute,
    Hour,
    Day,
    Month,
}

impl TimeScale {
    pub const ALL: [TimeScale; 4] = [
        TimeScale::Minute,
        TimeScale::Hour,
        TimeScale::Day,
        TimeScale::Month,
    ];

    /// Number of buckets kept for this scale (N).
    pub const fn retention(self) -> i64 {
        match self {
            TimeScale::Minute => 60,
            TimeScale::Hour => 24,
            TimeScale::Day => 30,
            TimeScale::Month => 12,
        }
    }

    /// Start of the bucket `offset` steps away from the bucket containing `now`.
    /// `0` is the current bucket, negative offsets are in the past.
    pub fn bucket_start(self, now: DateTime<Utc>, offset: i64) -> DateTime<Utc> {
        let start = match self {
            TimeScale::Minute => fixed_step(now, 60, offset),
            TimeScale::Hour => fixed_step(now, 3_600, offset),
            TimeScale::Day => fixed_step(now, 86_400, offset),
            TimeScale::Month => month_step(now, offset),
        };
        // Only absurd offsets leave chrono's representable range.
        start.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// [`bucket_start`](Self::bucket_start) relative to the wall clock.
    pub fn bucket_time(self, offset: i64) -> DateTime<Utc> {
        self.bucket_start(Utc::now(), offset)
    }

    /// Instant a bucket created now must survive until: N steps ahead.
    pub fn expiry(self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.bucket_start(now, self.retention())
    }

    /// Map a dashboard `time-step` value to the scale that feeds it.
    /// The hour view is built from minute buckets, the year view from month buckets.
    pub fn from_time_step(step: &str) -> TimeScale {
        match step.to_ascii_lowercase().as_str() {
            "day" => TimeScale::Hour,
            "month" => TimeScale::Day,
            "year" => TimeScale::Month,
            _ => TimeScale::Minute,
        }
    }

    /// Dashboard view this scale feeds (inverse of [`from_time_step`](Self::from_time_step)).
    pub const fn time_step(self) -> &'static str {
        match self {
            TimeScale::Minute => "hour",
            TimeScale::Hour => "day",
            TimeScale::Day => "month",
            TimeScale::Month => "year",
        }
    }
}

impl fmt::Display for TimeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeScale::Minute => "minute",
            TimeScale::Hour => "hour",
            TimeScale::Day => "day",
            TimeScale::Month => "month",
        };
        f.write_str(name)
    }
}

/// Canonical string form of a bucket instant, used verbatim in store keys.
pub fn canonical_timestamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn fixed_step(now: DateTime<Utc>, step_secs: i64, offset: i64) -> Option<DateTime<Utc>> {
    let ts = now.timestamp();
    let truncated = ts - ts.rem_euclid(step_secs);
    let shifted = truncated.checked_add(offset.checked_mul(step_secs)?)?;
    DateTime::from_timestamp(shifted, 0)
}

fn month_step(now: DateTime<Utc>, offset: i64) -> Option<DateTime<Utc>> {
    let months = i64::from(now.year()) * 12 + i64::from(now.month0()) + offset;
    let year = i32::try_from(months.div_euclid(12)).ok()?;
    let month = u32::try_from(months.rem_euclid(12)).ok()? + 1;
    let first = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&first))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_current_buckets_truncate() {
        let now = at("2026-10-17T14:05:42Z");
        assert_eq!(
            canonical_timestamp(TimeScale::Minute.bucket_start(now, 0)),
            "2026-10-17T14:05:00Z"
        );
        assert_eq!(
            canonical_timestamp(TimeScale::Hour.bucket_start(now, 0)),
            "2026-10-17T14:00:00Z"
        );
        assert_eq!(
            canonical_timestamp(TimeScale::Day.bucket_start(now, 0)),
            "2026-10-17T00:00:00Z"
        );
        assert_eq!(
            canonical_timestamp(TimeScale::Month.bucket_start(now, 0)),
            "2026-10-01T00:00:00Z"
        );
    }

    #[test]
    fn test_offsets_cross_boundaries() {
        let now = at("2026-01-01T00:00:30Z");
        assert_eq!(
            canonical_timestamp(TimeScale::Minute.bucket_start(now, -1)),
            "2025-12-31T23:59:00Z"
        );
        assert_eq!(
            canonical_timestamp(TimeScale::Day.bucket_start(now, -1)),
            "2025-12-31T00:00:00Z"
        );
        assert_eq!(
            canonical_timestamp(TimeScale::Month.bucket_start(now, -1)),
            "2025-12-01T00:00:00Z"
        );
        assert_eq!(
            canonical_timestamp(TimeScale::Month.bucket_start(now, 13)),
            "2027-02-01T00:00:00Z"
        );
    }

    #[test]
    fn test_expiry_is_retention_steps_ahead() {
        let now = at("2026-10-17T14:05:42Z");
        assert_eq!(
            canonical_timestamp(TimeScale::Minute.expiry(now)),
            "2026-10-17T15:05:00Z"
        );
        assert_eq!(
            canonical_timestamp(TimeScale::Hour.expiry(now)),
            "2026-10-18T14:00:00Z"
        );
        assert_eq!(
            canonical_timestamp(TimeScale::Month.expiry(now)),
            "2027-10-01T00:00:00Z"
        );
    }

    #[test]
    fn test_same_instant_same_bucket() {
        let a = at("2026-10-17T14:05:01Z");
        let b = at("2026-10-17T14:05:59Z");
        for scale in TimeScale::ALL {
            assert_eq!(scale.bucket_start(a, 0), scale.bucket_start(b, 0));
        }
    }

    #[test]
    fn test_time_step_mapping() {
        assert_eq!(TimeScale::from_time_step("hour"), TimeScale::Minute);
        assert_eq!(TimeScale::from_time_step("Day"), TimeScale::Hour);
        assert_eq!(TimeScale::from_time_step("month"), TimeScale::Day);
        assert_eq!(TimeScale::from_time_step("YEAR"), TimeScale::Month);
        assert_eq!(TimeScale::from_time_step("fortnight"), TimeScale::Minute);
        for scale in TimeScale::ALL {
            assert_eq!(TimeScale::from_time_step(scale.time_step()), scale);
        }
    }
}
