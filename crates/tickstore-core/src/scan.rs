//! Partition coverage scanner.
//!
//! Given a data type, the scanner walks its partitions, decodes only the
//! entity-ID and date columns of each file, and produces a [`CoverageMap`]:
//! per subject the first and last covered date, the number of covered dates
//! and, when a trading calendar is supplied, the gaps inside that span.
//!
//! Partition files are opened and decoded in parallel on a blocking thread,
//! each one streamed from its file handle. Decoded presence is cached per
//! file and keyed by the file's fingerprint, so a repeated scan only re-reads
//! files that changed.
//!
//! A partition that cannot be decoded does not fail the scan: it is recorded
//! as [`PartitionUnreadable`] together with the date span it would have
//! covered, and every other partition is still scanned.

pub(crate) mod cache;
pub(crate) mod partition_reader;

use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::Arc,
};

use log::{debug, warn};
use rayon::prelude::*;
use roaring::RoaringBitmap;
use serde::{Serialize, Serializer};
use snafu::prelude::*;

use crate::{
    calendar::TradingCalendar,
    config::DataTypeConfig,
    coverage::Coverage,
    date::{DateRange, TradeDate},
    layout::{self, Granularity, PartitionKey},
    registry::EntityId,
    storage::{self, FileFingerprint, StorageError, StoreLocation},
};

use cache::ScanCache;
use partition_reader::{FilePresence, read_presence_file};

/// Errors that abort a whole scan.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ScanError {
    /// The partition layout of a data type could not be listed.
    #[snafu(display("Failed to list partitions of {data_type:?}: {source}"))]
    ListPartitions {
        /// Data type being scanned.
        data_type: String,
        /// Underlying storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// The blocking decode task panicked or was cancelled.
    #[snafu(display("Partition decode task failed: {source}"))]
    DecodeTask {
        /// Join error of the blocking task.
        source: tokio::task::JoinError,
    },
}

/// Whose data a coverage record or work item is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    /// The data type as a whole (entity-less data, or "every entity").
    All,
    /// One registered entity.
    Entity(EntityId),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::All => f.write_str("all"),
            Subject::Entity(id) => write!(f, "{id}"),
        }
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What is stored for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageRecord {
    /// Earliest covered date.
    pub first: TradeDate,
    /// Latest covered date.
    pub last: TradeDate,
    /// Maximal runs of expected-but-missing dates inside `[first, last]`,
    /// ascending and disjoint.
    pub gaps: Vec<DateRange>,
    /// Number of distinct covered dates.
    pub covered_dates: u64,
}

impl CoverageRecord {
    /// The covered span `[first, last]`.
    pub fn span(&self) -> DateRange {
        DateRange::new(self.first, self.last)
    }
}

/// Whether the data type has any stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// No directory for the data type exists.
    Missing,
    /// The directory exists but holds no readable rows.
    Empty,
    /// At least one subject has coverage.
    Populated,
}

/// A partition that was excluded from the scan because it could not be
/// decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionUnreadable {
    /// Path of the partition file, relative to the store root.
    pub path: String,
    /// Partition key.
    pub partition: PartitionKey,
    /// Dates the partition would cover; `None` for unpartitioned data,
    /// whose whole history is uncertain.
    pub span: Option<DateRange>,
    /// Why decoding failed.
    pub reason: String,
}

/// Result of scanning one data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageMap {
    /// Data type scanned.
    pub data_type: String,
    /// Overall status.
    pub status: ScanStatus,
    /// Coverage per subject, in subject order.
    pub subjects: BTreeMap<Subject, CoverageRecord>,
    /// Partitions that could not be read.
    pub unreadable: Vec<PartitionUnreadable>,
    /// False when no trading calendar was available; `gaps` are then empty.
    pub gap_detection: bool,
    /// Number of partition files considered.
    pub partitions: usize,
    /// Rows decoded across all readable partitions.
    pub rows: u64,
}

impl CoverageMap {
    fn missing(data_type: &str, gap_detection: bool) -> Self {
        Self {
            data_type: data_type.to_string(),
            status: ScanStatus::Missing,
            subjects: BTreeMap::new(),
            unreadable: Vec::new(),
            gap_detection,
            partitions: 0,
            rows: 0,
        }
    }

    /// True iff at least one subject has a non-empty coverage record.
    pub fn has_data(&self) -> bool {
        !self.subjects.is_empty()
    }

    /// Coverage record of one subject.
    pub fn get(&self, subject: Subject) -> Option<&CoverageRecord> {
        self.subjects.get(&subject)
    }
}

/// One authoritative partition file of a data type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFile {
    /// Partition key.
    pub key: PartitionKey,
    /// Data file path relative to the store root.
    pub rel_path: PathBuf,
}

/// Partition files of a data type, split into authoritative ones and stale
/// leftovers of an interrupted compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionListing {
    /// Authoritative partitions in key order.
    pub live: Vec<PartitionFile>,
    /// Partitions subsumed by a wider live partition.
    pub stale: Vec<PartitionKey>,
    /// False if the data type directory does not exist.
    pub dir_exists: bool,
}

impl PartitionListing {
    /// The live partition that holds rows of natural key `natural`, if any.
    pub fn covering(&self, natural: &PartitionKey) -> Option<&PartitionFile> {
        self.live.iter().find(|p| p.key.covers(natural))
    }
}

/// List the partitions of `data_type`.
///
/// Directories that are not partition keys of `granularity` are ignored, as
/// are partition directories without a data file (for example, ones holding
/// only the temporary file of an interrupted write).
pub async fn list_partitions(
    location: &StoreLocation,
    data_type: &str,
    granularity: Granularity,
) -> Result<PartitionListing, StorageError> {
    let dir = layout::data_type_rel_dir(data_type);
    if !storage::exists(location, &dir).await? {
        return Ok(PartitionListing::default());
    }

    let mut listing = PartitionListing {
        dir_exists: true,
        ..PartitionListing::default()
    };

    if granularity == Granularity::None {
        let rel_path = PartitionKey::UNPARTITIONED.rel_path(data_type);
        if storage::exists(location, &rel_path).await? {
            listing.live.push(PartitionFile {
                key: PartitionKey::UNPARTITIONED,
                rel_path,
            });
        }
        return Ok(listing);
    }

    let mut keys = Vec::new();
    for entry in storage::list_dir(location, &dir).await? {
        if !entry.is_dir {
            continue;
        }
        let Some(key) = PartitionKey::parse_dir_name(&entry.name) else {
            debug!("{data_type}: ignoring foreign directory {}", entry.name);
            continue;
        };
        if key.granularity() != granularity {
            warn!(
                "{data_type}: ignoring partition {} with granularity {}, expected {granularity}",
                entry.name,
                key.granularity()
            );
            continue;
        }
        if storage::exists(location, &key.rel_path(data_type)).await? {
            keys.push(key);
        }
    }

    let (live, stale) = layout::resolve_live(&keys);
    listing.live = live
        .into_iter()
        .map(|key| PartitionFile {
            rel_path: key.rel_path(data_type),
            key,
        })
        .collect();
    listing.stale = stale;
    Ok(listing)
}

/// Coverage scanner with a per-file presence cache.
#[derive(Debug)]
pub struct Scanner {
    location: StoreLocation,
    cache: ScanCache,
}

impl Scanner {
    /// Create a scanner over a store root.
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            cache: ScanCache::default(),
        }
    }

    /// Forget cached presence for a data type.
    pub fn invalidate(&self, data_type: &str) {
        self.cache.invalidate(data_type);
    }

    /// Scan one data type.
    pub async fn scan(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
        calendar: Option<&dyn TradingCalendar>,
    ) -> Result<CoverageMap, ScanError> {
        let gap_detection = calendar.is_some();
        let listing = list_partitions(&self.location, data_type, config.granularity)
            .await
            .context(ListPartitionsSnafu { data_type })?;

        if !listing.dir_exists {
            return Ok(CoverageMap::missing(data_type, gap_detection));
        }
        for key in &listing.stale {
            debug!("{data_type}: skipping stale partition {key}");
        }

        let entity_id_column = config.entity_id_column();
        let date_int_column = config.date_int_column();

        let mut decoded: Vec<Arc<FilePresence>> = Vec::new();
        let mut unreadable = Vec::new();
        let mut misses: Vec<(PartitionFile, FileFingerprint, PathBuf)> = Vec::new();

        for part in &listing.live {
            let fp = match storage::fingerprint(&self.location, &part.rel_path).await {
                Ok(fp) => fp,
                Err(e) => {
                    unreadable.push(unreadable_entry(part, e.to_string()));
                    continue;
                }
            };
            if let Some(hit) = self.cache.get(data_type, &part.rel_path, fp) {
                debug!("{data_type}: cache hit for {}", part.rel_path.display());
                decoded.push(hit);
                continue;
            }
            misses.push((part.clone(), fp, self.location.resolve(&part.rel_path)));
        }

        let results = tokio::task::spawn_blocking(move || {
            misses
                .into_par_iter()
                .map(|(part, fp, path)| {
                    let res =
                        read_presence_file(&path, entity_id_column.as_deref(), &date_int_column);
                    (part, fp, res)
                })
                .collect::<Vec<_>>()
        })
        .await
        .context(DecodeTaskSnafu)?;

        for (part, fp, res) in results {
            match res {
                Ok(presence) => {
                    let presence = Arc::new(presence);
                    self.cache
                        .put(data_type, part.rel_path.clone(), fp, Arc::clone(&presence));
                    decoded.push(presence);
                }
                Err(e) => {
                    warn!(
                        "{data_type}: excluding unreadable partition {}: {e}",
                        part.rel_path.display()
                    );
                    unreadable.push(unreadable_entry(&part, e.to_string()));
                }
            }
        }

        let live_paths: Vec<PathBuf> = listing.live.iter().map(|p| p.rel_path.clone()).collect();
        self.cache.retain_paths(data_type, &live_paths);

        let mut merged: BTreeMap<Subject, Coverage> = BTreeMap::new();
        let mut rows = 0u64;
        for presence in &decoded {
            rows += presence.rows;
            for (subject, days) in &presence.subjects {
                merged.entry(*subject).or_default().union_inplace(days);
            }
        }

        let mut subjects = BTreeMap::new();
        for (subject, days) in merged {
            if let Some(record) = coverage_record(&days, calendar) {
                subjects.insert(subject, record);
            }
        }

        unreadable.sort_by(|a, b| a.path.cmp(&b.path));
        let status = if subjects.is_empty() {
            ScanStatus::Empty
        } else {
            ScanStatus::Populated
        };

        Ok(CoverageMap {
            data_type: data_type.to_string(),
            status,
            subjects,
            unreadable,
            gap_detection,
            partitions: listing.live.len(),
            rows,
        })
    }
}

fn unreadable_entry(part: &PartitionFile, reason: String) -> PartitionUnreadable {
    PartitionUnreadable {
        path: part.rel_path.display().to_string(),
        partition: part.key,
        span: part.key.date_range(),
        reason,
    }
}

/// Build a coverage record from the day numbers present for one subject.
///
/// Gaps are found in calendar-index space: the `i`-th expected date maps to
/// bucket `i`, so runs of missing buckets are runs of consecutive expected
/// dates even when they straddle non-trading days.
fn coverage_record(
    days: &Coverage,
    calendar: Option<&dyn TradingCalendar>,
) -> Option<CoverageRecord> {
    let first = TradeDate::from_day_number(days.first()?).ok()?;
    let last = TradeDate::from_day_number(days.last()?).ok()?;

    let gaps = match calendar {
        None => Vec::new(),
        Some(cal) => {
            let expected = cal.expected_dates(DateRange::new(first, last));
            let present: Coverage = expected
                .iter()
                .enumerate()
                .filter(|(_, d)| days.contains(d.day_number()))
                .map(|(i, _)| i as u32)
                .collect();
            let all: RoaringBitmap = (0..expected.len() as u32).collect();
            present
                .missing_runs(&all)
                .into_iter()
                .map(|run| {
                    DateRange::new(expected[*run.start() as usize], expected[*run.end() as usize])
                })
                .collect()
        }
    };

    Some(CoverageRecord {
        first,
        last,
        gaps,
        covered_dates: days.cardinality(),
    })
}
