//! Rollup bucket granularities
//!
//! All buckets are UTC. Weeks start on Monday, months on the first day of
//! the calendar month.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use rollup_common::error::{Error, QueryError, Result};
use rollup_common::types::{Timestamp, WindowBounds};

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;
pub const WEEK_MS: i64 = 7 * DAY_MS;

/// 1970-01-01 was a Thursday
const EPOCH_TO_MONDAY_MS: i64 = 3 * DAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Shortest possible bucket length
    pub fn min_length_ms(self) -> i64 {
        match self {
            Granularity::Minute => MINUTE_MS,
            Granularity::Hour => HOUR_MS,
            Granularity::Day => DAY_MS,
            Granularity::Week => WEEK_MS,
            Granularity::Month => 28 * DAY_MS,
        }
    }

    /// Bucket containing `ts`
    pub fn bucket(self, ts: Timestamp) -> Result<WindowBounds> {
        match self {
            Granularity::Minute => Ok(aligned(ts, MINUTE_MS, 0)),
            Granularity::Hour => Ok(aligned(ts, HOUR_MS, 0)),
            Granularity::Day => Ok(aligned(ts, DAY_MS, 0)),
            Granularity::Week => Ok(aligned(ts, WEEK_MS, EPOCH_TO_MONDAY_MS)),
            Granularity::Month => month(ts),
        }
    }
}

fn aligned(ts: Timestamp, size: i64, shift: i64) -> WindowBounds {
    let start = ts - (ts + shift).rem_euclid(size);
    WindowBounds::new(start, start + size)
}

fn month(ts: Timestamp) -> Result<WindowBounds> {
    let out_of_range = || Error::Query(QueryError::InvalidRange { start: ts, end: ts });

    let date = DateTime::from_timestamp_millis(ts)
        .ok_or_else(out_of_range)?
        .date_naive();
    let (next_year, next_month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };

    let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).ok_or_else(out_of_range)?;
    let next = NaiveDate::from_ymd_opt(next_year, next_month, 1).ok_or_else(out_of_range)?;
    let millis = |d: NaiveDate| {
        d.and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .ok_or_else(out_of_range)
    };

    Ok(WindowBounds::new(millis(first)?, millis(next)?))
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        };
        f.write_str(name)
    }
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            _ => Err(Error::Query(QueryError::UnknownGranularity(s.to_string()))),
        }
    }
}
