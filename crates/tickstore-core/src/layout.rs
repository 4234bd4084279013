//! On-disk layout helpers for a store root.
//!
//! This module centralizes all *relative* path conventions under a store root:
//! - one directory per data type (`<data_type>/`)
//! - partition directories named after their key (`year=2023/`,
//!   `year_month=202301/`, and compacted spans such as `year=2019..2021/`)
//! - the partition data file (`data.parquet`)
//! - registry journals (`_registry/<namespace>.jsonl`)
//! - the optional configuration file (`tickstore.json`)
//!
//! The functions here return relative [`std::path::PathBuf`] values. Callers
//! join them with a [`crate::storage::StoreLocation`] before doing IO.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize, Serializer};
use snafu::prelude::*;

use crate::date::{DateRange, TradeDate};

/// File name of the Parquet file inside every partition.
pub const DATA_FILE_NAME: &str = "data.parquet";

/// Directory holding the identifier registry journals.
pub const REGISTRY_DIR_NAME: &str = "_registry";

/// Extension of registry journal files.
pub const JOURNAL_EXT: &str = "jsonl";

/// Optional store configuration file at the root.
pub const CONFIG_FILE_NAME: &str = "tickstore.json";

const YEAR_PREFIX: &str = "year";
const YEAR_MONTH_PREFIX: &str = "year_month";
const SPAN_SEPARATOR: &str = "..";

/// Errors from validating names that become path components.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Name is empty, reserved, or contains characters outside `[A-Za-z0-9_-]`.
    #[snafu(display(
        "Invalid {kind} name {name:?}: use ASCII letters, digits, '_' or '-', not starting with '_'"
    ))]
    InvalidName {
        /// What the name is for (`data type`, `namespace`).
        kind: &'static str,
        /// The rejected name.
        name: String,
    },
}

/// Check that `name` is safe to use as a data type directory or journal
/// file stem.
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), LayoutError> {
    let valid = !name.is_empty()
        && !name.starts_with('_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    ensure!(
        valid,
        InvalidNameSnafu {
            kind,
            name: name.to_string()
        }
    );
    Ok(())
}

/// How a data type's rows are split into partitions by date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// A single partition per data type.
    None,
    /// One partition per calendar year.
    #[default]
    Year,
    /// One partition per calendar month.
    YearMonth,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Granularity::None => "none",
            Granularity::Year => "year",
            Granularity::YearMonth => "year_month",
        };
        f.write_str(s)
    }
}

/// Key of one partition: a granularity plus an inclusive run of natural
/// units (years, or months counted as `year * 12 + month - 1`).
///
/// A key whose run has a single unit is *natural*; a longer run is a *span*
/// produced by compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    granularity: Granularity,
    first: i32,
    last: i32,
}

impl PartitionKey {
    /// The single partition of an unpartitioned data type.
    pub const UNPARTITIONED: PartitionKey = PartitionKey {
        granularity: Granularity::None,
        first: 0,
        last: 0,
    };

    /// Natural partition that holds `date` under `granularity`.
    pub fn natural(granularity: Granularity, date: TradeDate) -> Self {
        let unit = match granularity {
            Granularity::None => return Self::UNPARTITIONED,
            Granularity::Year => date.year(),
            Granularity::YearMonth => date.year() * 12 + date.month() as i32 - 1,
        };
        PartitionKey {
            granularity,
            first: unit,
            last: unit,
        }
    }

    /// Span covering the inclusive unit run `[first, last]`.
    ///
    /// Returns `None` for `Granularity::None` or an inverted run.
    pub fn span(granularity: Granularity, first: i32, last: i32) -> Option<Self> {
        if granularity == Granularity::None || first > last {
            return None;
        }
        Some(PartitionKey {
            granularity,
            first,
            last,
        })
    }

    /// Granularity of this key.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// First natural unit covered.
    pub fn first_unit(&self) -> i32 {
        self.first
    }

    /// Last natural unit covered.
    pub fn last_unit(&self) -> i32 {
        self.last
    }

    /// True if this key covers more than one natural unit.
    pub fn is_span(&self) -> bool {
        self.last > self.first
    }

    /// Number of natural units covered.
    pub fn width(&self) -> u32 {
        (self.last - self.first) as u32 + 1
    }

    /// True if every unit of `other` is also covered by `self`.
    pub fn covers(&self, other: &PartitionKey) -> bool {
        self.granularity == other.granularity
            && self.first <= other.first
            && other.last <= self.last
    }

    /// True if `other` starts right after `self` ends.
    pub fn is_followed_by(&self, other: &PartitionKey) -> bool {
        self.granularity == other.granularity
            && self.granularity != Granularity::None
            && self.last + 1 == other.first
    }

    /// The natural keys this key covers, in order.
    pub fn naturals(&self) -> Vec<PartitionKey> {
        (self.first..=self.last)
            .map(|u| PartitionKey {
                granularity: self.granularity,
                first: u,
                last: u,
            })
            .collect()
    }

    /// Merge two keys into the smallest span covering both.
    pub fn union(&self, other: &PartitionKey) -> Option<PartitionKey> {
        if self.granularity != other.granularity {
            return None;
        }
        PartitionKey::span(
            self.granularity,
            self.first.min(other.first),
            self.last.max(other.last),
        )
    }

    /// Calendar dates covered by this key (`None` for unpartitioned).
    pub fn date_range(&self) -> Option<DateRange> {
        let (start, end) = match self.granularity {
            Granularity::None => return None,
            Granularity::Year => (
                TradeDate::from_ymd(self.first, 1, 1)?,
                TradeDate::from_ymd(self.last, 12, 31)?,
            ),
            Granularity::YearMonth => {
                let (fy, fm) = split_month_unit(self.first);
                let (ly, lm) = split_month_unit(self.last);
                let next_month = if lm == 12 {
                    TradeDate::from_ymd(ly + 1, 1, 1)?
                } else {
                    TradeDate::from_ymd(ly, lm + 1, 1)?
                };
                (TradeDate::from_ymd(fy, fm, 1)?, next_month.pred()?)
            }
        };
        Some(DateRange::new(start, end))
    }

    /// Directory name for this key, `None` for unpartitioned data.
    pub fn dir_name(&self) -> Option<String> {
        let prefix = match self.granularity {
            Granularity::None => return None,
            Granularity::Year => YEAR_PREFIX,
            Granularity::YearMonth => YEAR_MONTH_PREFIX,
        };
        Some(if self.is_span() {
            format!(
                "{prefix}={}{SPAN_SEPARATOR}{}",
                self.format_unit(self.first),
                self.format_unit(self.last)
            )
        } else {
            format!("{prefix}={}", self.format_unit(self.first))
        })
    }

    fn format_unit(&self, unit: i32) -> String {
        match self.granularity {
            Granularity::YearMonth => {
                let (y, m) = split_month_unit(unit);
                format!("{y:04}{m:02}")
            }
            _ => format!("{unit:04}"),
        }
    }

    /// Parse a partition directory name such as `year=2023`,
    /// `year_month=202301` or `year=2019..2021`.
    ///
    /// Returns `None` for anything else; callers treat such directories as
    /// foreign and skip them.
    pub fn parse_dir_name(name: &str) -> Option<PartitionKey> {
        let (prefix, value) = name.split_once('=')?;
        let granularity = match prefix {
            YEAR_PREFIX => Granularity::Year,
            YEAR_MONTH_PREFIX => Granularity::YearMonth,
            _ => return None,
        };
        let parse_unit = |s: &str| match granularity {
            Granularity::YearMonth => parse_month_unit(s),
            _ => parse_year_unit(s),
        };
        let (first, last) = match value.split_once(SPAN_SEPARATOR) {
            Some((a, b)) => (parse_unit(a)?, parse_unit(b)?),
            None => {
                let u = parse_unit(value)?;
                (u, u)
            }
        };
        PartitionKey::span(granularity, first, last)
    }

    /// Path of this partition's data file relative to the store root.
    pub fn rel_path(&self, data_type: &str) -> PathBuf {
        let dir = data_type_rel_dir(data_type);
        match self.dir_name() {
            Some(name) => dir.join(name).join(DATA_FILE_NAME),
            None => dir.join(DATA_FILE_NAME),
        }
    }

    /// Directory of this partition relative to the store root, `None` for
    /// unpartitioned data (which lives directly in the data type directory).
    pub fn rel_dir(&self, data_type: &str) -> Option<PathBuf> {
        self.dir_name().map(|name| data_type_rel_dir(data_type).join(name))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dir_name() {
            Some(name) => f.write_str(&name),
            None => f.write_str("unpartitioned"),
        }
    }
}

impl Serialize for PartitionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn split_month_unit(unit: i32) -> (i32, u32) {
    (unit.div_euclid(12), unit.rem_euclid(12) as u32 + 1)
}

fn parse_year_unit(s: &str) -> Option<i32> {
    if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_month_unit(s: &str) -> Option<i32> {
    if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = s[..4].parse().ok()?;
    let month: i32 = s[4..].parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some(year * 12 + month - 1)
}

/// Split partition keys into the authoritative set and stale leftovers.
///
/// A key is stale when a wider key covers it; that only happens when a
/// compaction was interrupted between writing the new partition and removing
/// the ones it replaced. Both returned lists are sorted.
pub fn resolve_live(keys: &[PartitionKey]) -> (Vec<PartitionKey>, Vec<PartitionKey>) {
    let mut by_width: Vec<PartitionKey> = keys.to_vec();
    by_width.sort_by(|a, b| b.width().cmp(&a.width()).then(a.cmp(b)));
    by_width.dedup();

    let mut live: Vec<PartitionKey> = Vec::new();
    let mut stale = Vec::new();
    for key in by_width {
        if live.iter().any(|l| l.covers(&key)) {
            stale.push(key);
        } else {
            live.push(key);
        }
    }
    live.sort();
    stale.sort();
    (live, stale)
}

/// Relative path: `<data_type>/`
pub fn data_type_rel_dir(data_type: &str) -> PathBuf {
    PathBuf::from(data_type)
}

/// Relative path: `_registry/`
pub fn registry_rel_dir() -> PathBuf {
    PathBuf::from(REGISTRY_DIR_NAME)
}

/// Relative path: `_registry/<namespace>.jsonl`
pub fn journal_rel_path(namespace: &str) -> PathBuf {
    registry_rel_dir().join(format!("{namespace}.{JOURNAL_EXT}"))
}

/// Relative path: `tickstore.json`
pub fn config_rel_path() -> PathBuf {
    PathBuf::from(CONFIG_FILE_NAME)
}
