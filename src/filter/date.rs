//! Date ranges and relative date parsing ("-7d", "mStart", ISO dates)

use crate::error::{ResolverError, Result};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref RELATIVE_DATE: Regex =
        Regex::new(r"^-?(?P<number>[0-9]+)?(?P<unit>[hdwmy])(?P<position>Start|End)?$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hour,
    Day,
    Week,
    Month,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Hour => "hour",
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
        }
    }

    /// ClickHouse function truncating a timestamp to this interval.
    pub fn truncate_fn(self) -> &'static str {
        match self {
            Interval::Hour => "toStartOfHour",
            Interval::Day => "toStartOfDay",
            Interval::Week => "toStartOfWeek",
            Interval::Month => "toStartOfMonth",
        }
    }

    /// ClickHouse `INTERVAL` unit.
    pub fn sql_unit(self) -> &'static str {
        match self {
            Interval::Hour => "HOUR",
            Interval::Day => "DAY",
            Interval::Week => "WEEK",
            Interval::Month => "MONTH",
        }
    }

    /// ClickHouse function building an interval of N units.
    pub fn interval_fn(self) -> &'static str {
        match self {
            Interval::Hour => "toIntervalHour",
            Interval::Day => "toIntervalDay",
            Interval::Week => "toIntervalWeek",
            Interval::Month => "toIntervalMonth",
        }
    }

    /// Shift `date` by `n` intervals, `None` when the result leaves the
    /// representable range.
    pub fn shift(self, date: DateTime<Utc>, n: i64) -> Option<DateTime<Utc>> {
        let months = |n: i64| u32::try_from(n.unsigned_abs()).ok().map(Months::new);
        match self {
            Interval::Hour => date.checked_add_signed(Duration::try_hours(n)?),
            Interval::Day => date.checked_add_signed(Duration::try_days(n)?),
            Interval::Week => date.checked_add_signed(Duration::try_weeks(n)?),
            Interval::Month if n >= 0 => date.checked_add_months(months(n)?),
            Interval::Month => date.checked_sub_months(months(n)?),
        }
    }
}

impl FromStr for Interval {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hour" => Ok(Interval::Hour),
            "day" => Ok(Interval::Day),
            "week" => Ok(Interval::Week),
            "month" => Ok(Interval::Month),
            other => Err(ResolverError::validation(
                "Invalid parameter",
                format!("Unknown interval '{}'", other),
            )),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an absolute or relative date against `now`.
pub fn relative_date_parse(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default()));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    let caps = RELATIVE_DATE.captures(input).ok_or_else(|| {
        ResolverError::validation("Invalid date", format!("Could not parse date '{}'", input))
    })?;
    let out_of_range =
        || ResolverError::validation("Invalid date", format!("Date '{}' is out of range", input));
    let number: i64 = match caps.name("number") {
        Some(m) => m.as_str().parse().map_err(|_| out_of_range())?,
        None => 0,
    };
    let position = caps.name("position").map(|m| m.as_str());

    let mut date;
    match &caps["unit"] {
        "h" => {
            date = Interval::Hour.shift(now, -number).ok_or_else(out_of_range)?;
            return Ok(date
                .with_minute(0)
                .and_then(|d| d.with_second(0))
                .and_then(|d| d.with_nanosecond(0))
                .unwrap_or(date));
        }
        "d" => date = Interval::Day.shift(now, -number).ok_or_else(out_of_range)?,
        "w" => date = Interval::Week.shift(now, -number).ok_or_else(out_of_range)?,
        "m" => {
            date = Interval::Month.shift(now, -number).ok_or_else(out_of_range)?;
            match position {
                Some("Start") => date = date.with_day(1).unwrap_or(date),
                Some("End") => date = end_of_month(date).ok_or_else(out_of_range)?,
                _ => {}
            }
        }
        "y" => {
            date = number
                .checked_mul(-12)
                .and_then(|months| Interval::Month.shift(now, months))
                .ok_or_else(out_of_range)?;
            match position {
                Some("Start") => {
                    date = date.with_day(1).and_then(|d| d.with_month(1)).unwrap_or(date)
                }
                Some("End") => {
                    date = date.with_month(12).and_then(|d| d.with_day(31)).unwrap_or(date)
                }
                _ => {}
            }
        }
        _ => unreachable!("regex only admits h, d, w, m, y"),
    }
    Ok(start_of_day(date))
}

fn start_of_day(date: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default())
}

fn end_of_month(date: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let first = date.with_day(1).unwrap_or(date);
    Interval::Day.shift(Interval::Month.shift(first, 1)?, -1)
}

/// Requested time window. Raw inputs are kept so that relative ranges
/// normalise to the same cache key over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    #[serde(skip)]
    from: Option<DateTime<Utc>>,
    #[serde(skip)]
    to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub const DEFAULT_FROM: &'static str = "-7d";

    pub fn parse(date_from: Option<String>, date_to: Option<String>, now: DateTime<Utc>) -> Result<Self> {
        let from = match date_from.as_deref().unwrap_or(Self::DEFAULT_FROM) {
            "all" => None,
            raw => Some(relative_date_parse(raw, now)?),
        };
        let to = match date_to.as_deref() {
            Some(raw) => relative_date_parse(raw, now)?,
            None => now,
        };
        if let Some(from) = from {
            if from > to {
                return Err(ResolverError::validation(
                    "Invalid date range",
                    "date_from must not be after date_to",
                ));
            }
        }
        Ok(Self {
            date_from,
            date_to,
            from,
            to: Some(to),
        })
    }

    /// Start of range, `None` for all time.
    pub fn from(&self) -> Option<DateTime<Utc>> {
        self.from
    }

    pub fn to(&self) -> DateTime<Utc> {
        self.to.unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 3, 15, 13, 45, 10).unwrap()
    }

    #[test]
    fn test_relative_days() {
        let parsed = relative_date_parse("-7d", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2022, 3, 8, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_relative_hours_keep_hour() {
        let parsed = relative_date_parse("-24h", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2022, 3, 14, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_month_start() {
        let parsed = relative_date_parse("mStart", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap());
        let parsed = relative_date_parse("-1mStart", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2022, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_absolute_date() {
        let parsed = relative_date_parse("2021-01-01", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_garbage_date_rejected() {
        assert!(relative_date_parse("next tuesday", now()).is_err());
    }

    #[test]
    fn test_huge_relative_counts_rejected() {
        for input in ["-100000000d", "-99999999999999999999d", "-9999999999999999y", "-5000000000mStart", "-100000000000h"] {
            assert!(
                matches!(relative_date_parse(input, now()), Err(ResolverError::Validation { .. })),
                "{} should be rejected",
                input
            );
        }
        let range = DateRange::parse(Some("-100000000w".into()), None, now());
        assert!(range.is_err());
    }

    #[test]
    fn test_year_and_month_end() {
        let parsed = relative_date_parse("-1yStart", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
        let parsed = relative_date_parse("mEnd", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2022, 3, 31, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_all_time_range() {
        let range = DateRange::parse(Some("all".into()), None, now()).unwrap();
        assert!(range.from().is_none());
        assert_eq!(range.to(), now());
    }
}
