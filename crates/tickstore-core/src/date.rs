//! Trade dates and inclusive date ranges.
//!
//! Market data in this store is keyed by calendar day. The upstream provider
//! speaks `YYYYMMDD` strings, partitions store `yyyymmdd` integers, and the
//! coverage bitmaps need a dense `u32` domain. [`TradeDate`] converts between
//! all three:
//!
//! - `Display`/`FromStr`/serde use the `YYYYMMDD` form (parsing also accepts
//!   `YYYY-MM-DD`).
//! - [`TradeDate::to_yyyymmdd`] / [`TradeDate::from_yyyymmdd`] for the stored
//!   integer column.
//! - [`TradeDate::day_number`] counts days since 1970-01-01 and is monotonic,
//!   so consecutive calendar days map to consecutive bitmap buckets.

use std::{fmt, str::FromStr};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::prelude::*;

/// Errors produced while parsing or converting dates.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum DateError {
    /// Input string is not a `YYYYMMDD` or `YYYY-MM-DD` calendar date.
    #[snafu(display("Invalid date {input:?}: expected YYYYMMDD or YYYY-MM-DD"))]
    InvalidFormat {
        /// The rejected input.
        input: String,
    },

    /// Integer does not encode a valid `yyyymmdd` calendar date.
    #[snafu(display("Invalid yyyymmdd integer {value}"))]
    InvalidInteger {
        /// The rejected value.
        value: i64,
    },

    /// Day number is outside the supported calendar.
    #[snafu(display("Day number {value} is outside the supported calendar"))]
    DayNumberOutOfRange {
        /// The rejected day number.
        value: u32,
    },
}

fn epoch() -> NaiveDate {
    NaiveDate::default()
}

/// A single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TradeDate(NaiveDate);

impl TradeDate {
    /// Build a date from year, month and day.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(TradeDate)
    }

    /// Wrap a chrono date.
    pub fn from_naive(date: NaiveDate) -> Self {
        TradeDate(date)
    }

    /// The underlying chrono date.
    pub fn naive(&self) -> NaiveDate {
        self.0
    }

    /// Calendar year.
    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Calendar month, 1-based.
    pub fn month(&self) -> u32 {
        self.0.month()
    }

    /// Decode a `yyyymmdd` integer such as `20230103`.
    pub fn from_yyyymmdd(value: i64) -> Result<Self, DateError> {
        if !(10_000_101..=99_991_231).contains(&value) {
            return InvalidIntegerSnafu { value }.fail();
        }
        let year = (value / 10_000) as i32;
        let month = ((value / 100) % 100) as u32;
        let day = (value % 100) as u32;
        Self::from_ymd(year, month, day).context(InvalidIntegerSnafu { value })
    }

    /// Encode as a `yyyymmdd` integer.
    pub fn to_yyyymmdd(&self) -> i32 {
        self.0.year() * 10_000 + (self.0.month() as i32) * 100 + self.0.day() as i32
    }

    /// Days since 1970-01-01. Dates before the epoch clamp to 0.
    pub fn day_number(&self) -> u32 {
        let days = (self.0 - epoch()).num_days();
        debug_assert!(days >= 0, "pre-epoch trade date {self}");
        days.clamp(0, u32::MAX as i64) as u32
    }

    /// Inverse of [`TradeDate::day_number`].
    pub fn from_day_number(value: u32) -> Result<Self, DateError> {
        epoch()
            .checked_add_days(chrono::Days::new(value as u64))
            .map(TradeDate)
            .context(DayNumberOutOfRangeSnafu { value })
    }

    /// The following calendar day.
    pub fn succ(&self) -> Option<Self> {
        self.0.succ_opt().map(TradeDate)
    }

    /// The preceding calendar day.
    pub fn pred(&self) -> Option<Self> {
        self.0.pred_opt().map(TradeDate)
    }
}

impl fmt::Display for TradeDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

impl FromStr for TradeDate {
    type Err = DateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed.len() {
            8 => NaiveDate::parse_from_str(trimmed, "%Y%m%d"),
            10 => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"),
            _ => {
                return InvalidFormatSnafu {
                    input: s.to_string(),
                }
                .fail();
            }
        };
        parsed.map(TradeDate).map_err(|_| DateError::InvalidFormat {
            input: s.to_string(),
        })
    }
}

impl Serialize for TradeDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TradeDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive range of trade dates `[start, end]`.
///
/// A range with `start > end` is empty. Empty ranges are representable so
/// callers can pass user input through without pre-validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateRange {
    /// First day of the range.
    pub start: TradeDate,
    /// Last day of the range (inclusive).
    pub end: TradeDate,
}

impl DateRange {
    /// Build `[start, end]`.
    pub fn new(start: TradeDate, end: TradeDate) -> Self {
        Self { start, end }
    }

    /// Single-day range.
    pub fn single(day: TradeDate) -> Self {
        Self::new(day, day)
    }

    /// True when the range contains no day.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// True if `day` lies inside the range.
    pub fn contains(&self, day: TradeDate) -> bool {
        self.start <= day && day <= self.end
    }

    /// Overlap of two ranges, `None` if they are disjoint or either is empty.
    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let r = DateRange::new(self.start.max(other.start), self.end.min(other.end));
        (!r.is_empty()).then_some(r)
    }

    /// Number of calendar days in the range.
    pub fn num_days(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.end.naive() - self.start.naive()).num_days() as u64 + 1
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
