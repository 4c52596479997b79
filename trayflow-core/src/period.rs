//! Reporting periods in the configured reporting timezone.
//!
//! Period keys sort lexically in chronological order:
//! `2026-03-01 08:00` (hourly), `2026-03-01` (daily),
//! `2026-03-01~2026-03-07` (weekly, Sunday start), `2026-03` (monthly).

use crate::Timestamp;
use chrono::{Datelike, Duration, Months, NaiveDate, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bucket width for time-breakdown rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
        }
    }

    pub fn from_str_name(s: &str) -> Result<Self, GranularityParseError> {
        match s.trim().to_lowercase().as_str() {
            "hourly" | "hour" => Ok(Granularity::Hourly),
            "daily" | "day" => Ok(Granularity::Daily),
            "weekly" | "week" => Ok(Granularity::Weekly),
            "monthly" | "month" => Ok(Granularity::Monthly),
            _ => Err(GranularityParseError(s.to_string())),
        }
    }

    /// Period key of an instant, rendered in `tz`.
    pub fn key_for(&self, ts: Timestamp, tz: Tz) -> String {
        let local = ts.with_timezone(&tz);
        match self {
            Granularity::Hourly => {
                format!("{} {:02}:00", local.date_naive().format("%Y-%m-%d"), local.hour())
            }
            _ => self.key_for_date(local.date_naive()),
        }
    }

    /// Period key of a calendar date. Hourly falls back to the daily key.
    pub fn key_for_date(&self, date: NaiveDate) -> String {
        match self {
            Granularity::Hourly | Granularity::Daily => date.format("%Y-%m-%d").to_string(),
            Granularity::Weekly => {
                let start = week_start(date);
                let end = start + Duration::days(6);
                format!("{}~{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
            }
            Granularity::Monthly => date.format("%Y-%m").to_string(),
        }
    }

    /// Whether the period named by `key` overlaps the inclusive date window.
    ///
    /// Keys that do not parse for this granularity are kept.
    pub fn overlaps(&self, key: &str, start: NaiveDate, end: NaiveDate) -> bool {
        let parse = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok();
        let span = match self {
            Granularity::Hourly => key.get(..10).and_then(parse).map(|d| (d, d)),
            Granularity::Daily => parse(key).map(|d| (d, d)),
            Granularity::Weekly => key
                .split('~')
                .next()
                .and_then(parse)
                .map(|d| (d, d + Duration::days(6))),
            Granularity::Monthly => parse(&format!("{key}-01")).and_then(|d| {
                d.checked_add_months(Months::new(1))
                    .map(|next| (d, next - Duration::days(1)))
            }),
        };
        match span {
            Some((first, last)) => first <= end && last >= start,
            None => true,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = GranularityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_name(s)
    }
}

/// Error when parsing an invalid granularity string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranularityParseError(pub String);

impl fmt::Display for GranularityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid aggregation granularity: {}", self.0)
    }
}

impl std::error::Error for GranularityParseError {}

/// Sunday on or before `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_sunday() as i64)
}

/// Calendar date of an instant in `tz`.
pub fn local_date(ts: Timestamp, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// Render an instant in `tz` as `YYYY-MM-DD HH:MM:SS`.
pub fn format_local(ts: Timestamp, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string()
}
