//! Size-driven compaction of sibling partitions.
//!
//! A pass runs three phases over one data type:
//!
//! - **recovery**: stale partitions (subsumed by a wider span, left behind by
//!   an interrupted step) are deleted;
//! - **split**: span partitions above `high_watermark * target` are rewritten
//!   into their natural partitions, then the span is deleted;
//! - **merge**: runs of two or more adjacent partitions, each below
//!   `low_watermark * target` and together within `target`, are rewritten
//!   into one span, then the originals are deleted.
//!
//! Each step writes the new partition(s) before deleting the old ones, so a
//! crash in between leaves either the old layout or a wider span that makes
//! the old files stale. Every step holds partition leases on all keys it
//! touches; a step whose leases are busy is skipped and reported.

use std::{collections::BTreeMap, sync::Arc};

use arrow::{
    compute::{concat_batches, take_record_batch},
    error::ArrowError,
};
use arrow_array::{Array, Int32Array, RecordBatch, UInt32Array};
use bytes::Bytes;
use log::{info, warn};
use parquet::errors::ParquetError;
use serde::Serialize;
use snafu::prelude::*;
use tokio::sync::Mutex;

use crate::{
    config::{CompactionSettings, DataTypeConfig},
    date::TradeDate,
    layout::{Granularity, PartitionKey},
    lock::{Lease, LockError, LockKey, LockManager, LockTarget},
    scan::{self, Scanner},
    storage::{self, StorageError, StoreLocation},
    writer::{
        PartitionLeaseSettings, decode_partition, describe_schema, encode_partition,
        merge_dedup_sort, same_columns,
    },
};

/// Errors that abort a compaction pass.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CompactionError {
    /// Listing the partitions failed.
    #[snafu(display("Failed to list partitions of {data_type}: {source}"))]
    ListPartitions {
        /// Data type.
        data_type: String,
        /// Storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// Reading, writing or deleting a partition failed.
    #[snafu(display("Storage error on {path}: {source}"))]
    Io {
        /// Path involved.
        path: String,
        /// Storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// A partition could not be decoded or encoded.
    #[snafu(display("Parquet error on {path}: {source}"))]
    Parquet {
        /// Path involved.
        path: String,
        /// Parquet error.
        source: ParquetError,
    },

    /// Rows could not be combined or regrouped.
    #[snafu(display("Arrow error while compacting {partition}: {source}"))]
    Arrow {
        /// Partition key.
        partition: String,
        /// Arrow error.
        source: ArrowError,
    },
}

/// Partitions merged into one span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeStep {
    /// Partitions that were merged, in key order.
    pub sources: Vec<PartitionKey>,
    /// The new span.
    pub into: PartitionKey,
    /// Rows in the new span.
    pub rows: usize,
}

/// A span split back into natural partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitStep {
    /// The span that was split.
    pub span: PartitionKey,
    /// Natural partitions written (empty units produce none).
    pub into: Vec<PartitionKey>,
    /// Rows moved.
    pub rows: usize,
}

/// A step that was planned but not carried out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedStep {
    /// Partitions involved.
    pub partitions: Vec<PartitionKey>,
    /// Why.
    pub reason: String,
}

/// What a compaction pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Data type compacted.
    pub data_type: String,
    /// Stale partitions deleted during recovery.
    pub removed_stale: Vec<PartitionKey>,
    /// Spans split.
    pub split: Vec<SplitStep>,
    /// Runs merged.
    pub merged: Vec<MergeStep>,
    /// Steps skipped.
    pub skipped: Vec<SkippedStep>,
}

impl CompactionReport {
    /// True if the pass changed nothing on disk.
    pub fn is_noop(&self) -> bool {
        self.removed_stale.is_empty() && self.split.is_empty() && self.merged.is_empty()
    }

    fn skip(&mut self, partitions: Vec<PartitionKey>, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(
            "{}: compaction step over {partitions:?} skipped: {reason}",
            self.data_type
        );
        self.skipped.push(SkippedStep { partitions, reason });
    }
}

/// Runs compaction passes; passes over the same store are serialized.
#[derive(Debug)]
pub struct Compactor {
    location: StoreLocation,
    locks: Arc<LockManager>,
    scanner: Arc<Scanner>,
    leases: PartitionLeaseSettings,
    settings: CompactionSettings,
    pass: Mutex<()>,
}

impl Compactor {
    /// Create a compactor.
    pub fn new(
        location: StoreLocation,
        locks: Arc<LockManager>,
        scanner: Arc<Scanner>,
        leases: PartitionLeaseSettings,
        settings: CompactionSettings,
    ) -> Self {
        Self {
            location,
            locks,
            scanner,
            leases,
            settings,
            pass: Mutex::new(()),
        }
    }

    /// Run one pass over `data_type`. Unpartitioned data types are left
    /// alone.
    pub async fn compact(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
    ) -> Result<CompactionReport, CompactionError> {
        let _pass = self.pass.lock().await;
        let mut report = CompactionReport {
            data_type: data_type.to_string(),
            ..CompactionReport::default()
        };
        if config.granularity == Granularity::None {
            return Ok(report);
        }

        let result = self.run_phases(data_type, config, &mut report).await;
        if !report.is_noop() {
            self.scanner.invalidate(data_type);
        }
        result.map(|()| report)
    }

    async fn run_phases(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        let listing = self.list(data_type, config).await?;
        for stale in listing.stale {
            self.remove_stale(data_type, stale, report).await?;
        }

        let target = config.target_partition_bytes;
        let sizes = self.sizes(data_type, config).await?;

        let high = self.settings.high_watermark * target as f64;
        let oversized: Vec<PartitionKey> = sizes
            .iter()
            .filter(|(key, size)| key.is_span() && *size as f64 > high)
            .map(|(key, _)| *key)
            .collect();
        for span in &oversized {
            self.split(data_type, config, *span, report).await?;
        }

        // Units just split stay apart for this pass.
        let sizes: Vec<(PartitionKey, u64)> = self
            .sizes(data_type, config)
            .await?
            .into_iter()
            .filter(|(key, _)| !oversized.iter().any(|s| s.covers(key)))
            .collect();
        let low = self.settings.low_watermark * target as f64;
        for run in plan_merges(&sizes, low, target) {
            self.merge(data_type, config, run, report).await?;
        }
        Ok(())
    }

    async fn list(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
    ) -> Result<scan::PartitionListing, CompactionError> {
        scan::list_partitions(&self.location, data_type, config.granularity)
            .await
            .context(ListPartitionsSnafu { data_type })
    }

    async fn sizes(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
    ) -> Result<Vec<(PartitionKey, u64)>, CompactionError> {
        let listing = self.list(data_type, config).await?;
        let mut out = Vec::with_capacity(listing.live.len());
        for part in listing.live {
            let fp = storage::fingerprint(&self.location, &part.rel_path)
                .await
                .context(IoSnafu {
                    path: part.rel_path.display().to_string(),
                })?;
            out.push((part.key, fp.len));
        }
        Ok(out)
    }

    async fn lock_all(
        &self,
        data_type: &str,
        keys: &[PartitionKey],
    ) -> Result<Vec<Lease>, LockError> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            match self
                .locks
                .acquire_with_wait(
                    LockKey::new(data_type, LockTarget::Partition(key)),
                    self.leases.ttl,
                    self.leases.wait,
                )
                .await
            {
                Ok(lease) => held.push(lease),
                Err(e) => {
                    self.release_all(held);
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    fn release_all(&self, leases: Vec<Lease>) {
        for lease in leases {
            let key = lease.key().to_string();
            if let Err(e) = self.locks.release(lease) {
                warn!("releasing compaction lease on {key} failed: {e}");
            }
        }
    }

    async fn remove_stale(
        &self,
        data_type: &str,
        key: PartitionKey,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        let Some(dir) = key.rel_dir(data_type) else {
            return Ok(());
        };
        let leases = match self.lock_all(data_type, &[key]).await {
            Ok(l) => l,
            Err(e) => {
                report.skip(vec![key], e.to_string());
                return Ok(());
            }
        };
        let result = storage::remove_dir_all(&self.location, &dir)
            .await
            .context(IoSnafu {
                path: dir.display().to_string(),
            });
        self.release_all(leases);
        result?;
        info!("{data_type}: removed stale partition {key}");
        report.removed_stale.push(key);
        Ok(())
    }

    async fn read_rows(
        &self,
        data_type: &str,
        key: PartitionKey,
    ) -> Result<(arrow::datatypes::SchemaRef, Vec<RecordBatch>), CompactionError> {
        let rel = key.rel_path(data_type);
        let path = rel.display().to_string();
        let bytes = storage::read_all_bytes(&self.location, &rel)
            .await
            .context(IoSnafu { path: path.clone() })?;
        decode_partition(Bytes::from(bytes)).context(ParquetSnafu { path })
    }

    async fn replace(
        &self,
        data_type: &str,
        key: PartitionKey,
        batch: &RecordBatch,
    ) -> Result<(), CompactionError> {
        let rel = key.rel_path(data_type);
        let path = rel.display().to_string();
        let bytes = encode_partition(batch).context(ParquetSnafu { path: path.clone() })?;
        storage::write_atomic(&self.location, &rel, &bytes)
            .await
            .context(IoSnafu { path })
    }

    async fn remove_partition(
        &self,
        data_type: &str,
        key: PartitionKey,
    ) -> Result<(), CompactionError> {
        match key.rel_dir(data_type) {
            Some(dir) => storage::remove_dir_all(&self.location, &dir)
                .await
                .context(IoSnafu {
                    path: dir.display().to_string(),
                }),
            None => Ok(()),
        }
    }

    async fn split(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
        span: PartitionKey,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        let mut keys = span.naturals();
        keys.push(span);
        let leases = match self.lock_all(data_type, &keys).await {
            Ok(l) => l,
            Err(e) => {
                report.skip(vec![span], e.to_string());
                return Ok(());
            }
        };
        let result = self.split_locked(data_type, config, span, report).await;
        self.release_all(leases);
        result
    }

    async fn split_locked(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
        span: PartitionKey,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        let (schema, batches) = self.read_rows(data_type, span).await?;
        let all = concat_batches(&schema, &batches).context(ArrowSnafu {
            partition: span.to_string(),
        })?;

        let groups = match group_by_natural(&all, &config.date_int_column(), span) {
            Ok(groups) => groups,
            Err(reason) => {
                report.skip(vec![span], reason);
                return Ok(());
            }
        };

        let mut written = Vec::with_capacity(groups.len());
        for (natural, rows) in groups {
            let part = take_record_batch(&all, &UInt32Array::from(rows)).context(ArrowSnafu {
                partition: natural.to_string(),
            })?;
            self.replace(data_type, natural, &part).await?;
            written.push(natural);
        }
        self.remove_partition(data_type, span).await?;

        info!(
            "{data_type}: split {span} into {} partition(s), {} rows",
            written.len(),
            all.num_rows()
        );
        report.split.push(SplitStep {
            span,
            into: written,
            rows: all.num_rows(),
        });
        Ok(())
    }

    async fn merge(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
        sources: Vec<PartitionKey>,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        let Some(into) = sources
            .iter()
            .skip(1)
            .try_fold(sources[0], |acc, key| acc.union(key))
        else {
            report.skip(sources, "partitions do not form a span");
            return Ok(());
        };

        let mut keys = sources.clone();
        keys.push(into);
        let leases = match self.lock_all(data_type, &keys).await {
            Ok(l) => l,
            Err(e) => {
                report.skip(sources, e.to_string());
                return Ok(());
            }
        };
        let result = self
            .merge_locked(data_type, config, sources, into, report)
            .await;
        self.release_all(leases);
        result
    }

    async fn merge_locked(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
        sources: Vec<PartitionKey>,
        into: PartitionKey,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        // The layout may have moved since planning.
        let listing = self.list(data_type, config).await?;
        if !sources
            .iter()
            .all(|s| listing.live.iter().any(|p| p.key == *s))
        {
            report.skip(sources, "partition layout changed");
            return Ok(());
        }

        let mut parts: Vec<RecordBatch> = Vec::new();
        let mut first_schema = None;
        for key in &sources {
            let (schema, batches) = self.read_rows(data_type, *key).await?;
            match &first_schema {
                None => first_schema = Some(schema),
                Some(first) if !same_columns(first, &schema) => {
                    let reason = format!(
                        "schema of {key} [{}] differs from [{}]",
                        describe_schema(&schema),
                        describe_schema(first)
                    );
                    report.skip(sources.clone(), reason);
                    return Ok(());
                }
                Some(_) => {}
            }
            parts.extend(batches);
        }

        let merged = merge_dedup_sort(
            &parts,
            config.entity_id_column().as_deref(),
            &config.date_int_column(),
        )
        .context(ArrowSnafu {
            partition: into.to_string(),
        })?;
        self.replace(data_type, into, &merged).await?;
        for key in sources.iter().filter(|k| **k != into) {
            self.remove_partition(data_type, *key).await?;
        }

        info!(
            "{data_type}: merged {} partitions into {into}, {} rows",
            sources.len(),
            merged.num_rows()
        );
        report.merged.push(MergeStep {
            sources,
            into,
            rows: merged.num_rows(),
        });
        Ok(())
    }
}

/// Runs of adjacent partitions to merge.
///
/// `parts` must be in key order. A partition joins the current run if it
/// is below `low`, directly follows the run, and keeps the run within
/// `target` bytes. Only runs of two or more partitions are returned.
pub(crate) fn plan_merges(parts: &[(PartitionKey, u64)], low: f64, target: u64) -> Vec<Vec<PartitionKey>> {
    let mut plans = Vec::new();
    let mut run: Vec<PartitionKey> = Vec::new();
    let mut run_bytes = 0u64;

    for (key, size) in parts {
        if *size as f64 >= low {
            flush(&mut run, &mut plans);
            run_bytes = 0;
            continue;
        }
        let extends = run
            .last()
            .is_some_and(|last| last.is_followed_by(key) && run_bytes + size <= target);
        if !extends {
            flush(&mut run, &mut plans);
            run_bytes = 0;
        }
        run.push(*key);
        run_bytes += size;
    }
    flush(&mut run, &mut plans);
    plans
}

fn flush(run: &mut Vec<PartitionKey>, plans: &mut Vec<Vec<PartitionKey>>) {
    if run.len() >= 2 {
        plans.push(std::mem::take(run));
    } else {
        run.clear();
    }
}

/// Row indices of `batch` grouped by the natural partition of their date.
fn group_by_natural(
    batch: &RecordBatch,
    date_int_column: &str,
    span: PartitionKey,
) -> Result<BTreeMap<PartitionKey, Vec<u32>>, String> {
    let dates = batch
        .column_by_name(date_int_column)
        .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
        .ok_or_else(|| format!("missing Int32 column {date_int_column}"))?;

    let mut groups: BTreeMap<PartitionKey, Vec<u32>> = BTreeMap::new();
    for row in 0..dates.len() {
        if dates.is_null(row) {
            return Err(format!("null {date_int_column} at row {row}"));
        }
        let date = TradeDate::from_yyyymmdd(dates.value(row) as i64)
            .map_err(|e| format!("row {row}: {e}"))?;
        let natural = PartitionKey::natural(span.granularity(), date);
        if !span.covers(&natural) {
            return Err(format!("row {row} dated {date} lies outside {span}"));
        }
        groups.entry(natural).or_default().push(row as u32);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{daily_config, key_batch, parquet_bytes};
    use std::{path::Path, time::Duration};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn year(y: i32) -> PartitionKey {
        PartitionKey::span(Granularity::Year, y, y).expect("valid year")
    }

    fn years(a: i32, b: i32) -> PartitionKey {
        PartitionKey::span(Granularity::Year, a, b).expect("valid span")
    }

    fn compactor(tmp: &TempDir) -> Compactor {
        let location = StoreLocation::local(tmp.path());
        Compactor::new(
            location.clone(),
            Arc::new(LockManager::default()),
            Arc::new(Scanner::new(location)),
            PartitionLeaseSettings {
                ttl: Duration::from_secs(60),
                wait: Duration::from_millis(100),
            },
            CompactionSettings::default(),
        )
    }

    async fn put(tmp: &TempDir, key: PartitionKey, rows: &[(u32, i32)]) -> TestResult {
        let bytes = parquet_bytes(&key_batch(rows)?)?;
        storage::write_atomic(
            &StoreLocation::local(tmp.path()),
            &key.rel_path("daily"),
            &bytes,
        )
        .await?;
        Ok(())
    }

    fn dir_exists(tmp: &TempDir, dir: &str) -> bool {
        tmp.path().join(Path::new("daily")).join(dir).exists()
    }

    #[test]
    fn merge_plan_takes_adjacent_small_runs() {
        let parts = vec![
            (year(2018), 10),
            (year(2019), 10),
            (year(2020), 500),
            (year(2021), 10),
            (year(2023), 10),
            (year(2024), 10),
            (year(2025), 10),
        ];
        let plans = plan_merges(&parts, 100.0, 25);
        assert_eq!(
            plans,
            vec![
                vec![year(2018), year(2019)],
                vec![year(2023), year(2024)],
            ]
        );
    }

    #[test]
    fn merge_plan_ignores_single_partitions() {
        assert!(plan_merges(&[(year(2020), 1)], 100.0, 1000).is_empty());
        assert!(plan_merges(&[(year(2020), 1), (year(2022), 1)], 100.0, 1000).is_empty());
    }

    #[tokio::test]
    async fn small_neighbours_merge_into_a_span() -> TestResult {
        let tmp = TempDir::new()?;
        put(&tmp, year(2022), &[(1, 20220104)]).await?;
        put(&tmp, year(2023), &[(2, 20230103), (1, 20230103)]).await?;

        let report = compactor(&tmp).compact("daily", &daily_config()).await?;
        assert_eq!(report.merged.len(), 1);
        assert_eq!(report.merged[0].into, years(2022, 2023));
        assert_eq!(report.merged[0].rows, 3);
        assert!(dir_exists(&tmp, "year=2022..2023"));
        assert!(!dir_exists(&tmp, "year=2022"));
        assert!(!dir_exists(&tmp, "year=2023"));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_span_splits_into_naturals() -> TestResult {
        let tmp = TempDir::new()?;
        put(&tmp, years(2022, 2023), &[(1, 20220104), (1, 20230103)]).await?;

        let config = DataTypeConfig {
            target_partition_bytes: 1,
            ..daily_config()
        };
        let report = compactor(&tmp).compact("daily", &config).await?;
        assert_eq!(report.split.len(), 1);
        assert_eq!(report.split[0].into, vec![year(2022), year(2023)]);
        assert!(report.merged.is_empty());
        assert!(dir_exists(&tmp, "year=2022"));
        assert!(dir_exists(&tmp, "year=2023"));
        assert!(!dir_exists(&tmp, "year=2022..2023"));
        Ok(())
    }

    #[tokio::test]
    async fn recovery_removes_partitions_subsumed_by_a_span() -> TestResult {
        let tmp = TempDir::new()?;
        // An interrupted merge: the span was written, the originals remain.
        put(&tmp, year(2022), &[(1, 20220104)]).await?;
        put(&tmp, years(2022, 2023), &[(1, 20220104), (1, 20230103)]).await?;

        let config = DataTypeConfig {
            target_partition_bytes: 1 << 30,
            ..daily_config()
        };
        let report = compactor(&tmp).compact("daily", &config).await?;
        assert_eq!(report.removed_stale, vec![year(2022)]);
        assert!(!dir_exists(&tmp, "year=2022"));
        assert!(dir_exists(&tmp, "year=2022..2023"));
        Ok(())
    }

    #[tokio::test]
    async fn busy_partition_skips_the_step() -> TestResult {
        let tmp = TempDir::new()?;
        put(&tmp, year(2022), &[(1, 20220104)]).await?;
        put(&tmp, year(2023), &[(1, 20230103)]).await?;

        let compactor = compactor(&tmp);
        let held = compactor.locks.acquire(
            LockKey::new("daily", LockTarget::Partition(year(2023))),
            Duration::from_secs(60),
        )?;
        let report = compactor.compact("daily", &daily_config()).await?;
        assert!(report.merged.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(dir_exists(&tmp, "year=2022"));
        compactor.locks.release(held)?;
        Ok(())
    }

    #[tokio::test]
    async fn unpartitioned_types_are_left_alone() -> TestResult {
        let tmp = TempDir::new()?;
        let config = DataTypeConfig {
            granularity: Granularity::None,
            ..daily_config()
        };
        let report = compactor(&tmp).compact("daily", &config).await?;
        assert!(report.is_noop());
        Ok(())
    }
}
