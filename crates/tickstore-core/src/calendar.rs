//! Trading-calendar oracles used for gap detection.

use std::collections::BTreeSet;

use chrono::{Datelike, Weekday};

use crate::date::{DateError, DateRange, TradeDate};

/// Source of the dates on which data is expected to exist.
pub trait TradingCalendar: Send + Sync {
    /// Expected trading dates inside `range`, ascending. Empty for an empty
    /// range.
    fn expected_dates(&self, range: DateRange) -> Vec<TradeDate>;
}

/// Calendar backed by an explicit set of trading dates, typically loaded
/// from the exchange calendar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticCalendar {
    days: BTreeSet<TradeDate>,
}

impl StaticCalendar {
    /// Build from any collection of dates. Duplicates are ignored.
    pub fn from_dates(days: impl IntoIterator<Item = TradeDate>) -> Self {
        Self {
            days: days.into_iter().collect(),
        }
    }

    /// Parse one date per line; blank lines and `#` comments are skipped.
    pub fn parse_lines(text: &str) -> Result<Self, DateError> {
        let days = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::parse)
            .collect::<Result<BTreeSet<TradeDate>, _>>()?;
        Ok(Self { days })
    }

    /// Number of trading dates known.
    pub fn len(&self) -> usize {
        self.days.len()
    }

    /// True if the calendar has no dates.
    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

impl TradingCalendar for StaticCalendar {
    fn expected_dates(&self, range: DateRange) -> Vec<TradeDate> {
        if range.is_empty() {
            return Vec::new();
        }
        self.days.range(range.start..=range.end).copied().collect()
    }
}

/// Monday to Friday, ignoring holidays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeekdayCalendar;

impl TradingCalendar for WeekdayCalendar {
    fn expected_dates(&self, range: DateRange) -> Vec<TradeDate> {
        if range.is_empty() {
            return Vec::new();
        }
        range
            .start
            .naive()
            .iter_days()
            .take_while(|d| *d <= range.end.naive())
            .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
            .map(TradeDate::from_naive)
            .collect()
    }
}
