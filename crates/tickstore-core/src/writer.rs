//! Partitioned storage writer.
//!
//! [`Writer::write`] merges an incoming Arrow batch into the partitions of a
//! data type:
//!
//! 1. entity codes are resolved to permanent IDs through the registry and
//!    stored as `<entity>_id`; dates are normalized into `<date>_int`;
//! 2. rows are grouped by the partition that currently holds their natural
//!    key (a compacted span if one exists, otherwise the natural partition);
//! 3. each partition is rewritten under a partition lease: existing rows are
//!    read, merged with the new ones (newest row wins per `(entity, date)`),
//!    sorted, staged to a temporary file and renamed over the partition.
//!
//! A partition whose rows are invalid, or whose stored schema differs from
//! the incoming one, is rejected on its own; the rest of the batch is still
//! written. The caller receives a [`WriteReport`] with one entry per
//! partition.

mod merge;
mod normalize;

pub(crate) use merge::{
    decode_partition, describe_schema, encode_partition, merge_dedup_sort, same_columns,
};

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use arrow::{compute::take_record_batch, error::ArrowError};
use arrow_array::{RecordBatch, UInt32Array};
use bytes::Bytes;
use log::{info, warn};
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{
    compaction::{CompactionError, CompactionReport, Compactor},
    config::{CompactionSettings, DataTypeConfig},
    date::TradeDate,
    layout::{Granularity, PartitionKey},
    lock::{Lease, LockError, LockKey, LockManager, LockTarget},
    registry::{EntityId, Registries, RegistryError},
    scan::{self, Scanner},
    storage::{self, StorageError, StoreLocation},
};

/// How many times a group of rows is re-routed after the partition layout
/// changed underneath it before the write gives up.
const MAX_REROUTES: u32 = 3;

/// Why a partition write was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A required column is absent from the batch.
    MissingColumn {
        /// Missing column.
        column: String,
    },
    /// The date column has a type that is not a supported date encoding.
    UnsupportedDateType {
        /// Date column.
        column: String,
        /// Its Arrow type.
        datatype: String,
    },
    /// The entity column is not a string column.
    UnsupportedEntityType {
        /// Entity column.
        column: String,
        /// Its Arrow type.
        datatype: String,
    },
    /// Rows with a null or unparsable date.
    InvalidDates {
        /// Date column.
        column: String,
        /// Number of affected rows.
        rows: usize,
    },
    /// Rows with a null or empty entity code.
    NullEntityCodes {
        /// Entity column.
        column: String,
        /// Number of affected rows.
        rows: usize,
    },
    /// Incoming columns differ from the stored partition's.
    SchemaMismatch {
        /// Stored columns.
        stored: String,
        /// Incoming columns.
        incoming: String,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingColumn { column } => write!(f, "missing column {column:?}"),
            RejectReason::UnsupportedDateType { column, datatype } => {
                write!(f, "date column {column:?} has unsupported type {datatype}")
            }
            RejectReason::UnsupportedEntityType { column, datatype } => {
                write!(f, "entity column {column:?} has unsupported type {datatype}")
            }
            RejectReason::InvalidDates { column, rows } => {
                write!(f, "{rows} row(s) with null or unparsable {column:?}")
            }
            RejectReason::NullEntityCodes { column, rows } => {
                write!(f, "{rows} row(s) with null {column:?}")
            }
            RejectReason::SchemaMismatch { stored, incoming } => {
                write!(f, "schema mismatch: stored [{stored}], incoming [{incoming}]")
            }
        }
    }
}

impl std::error::Error for RejectReason {}

/// Errors of the writer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WriteError {
    /// The partition was not written because its rows or schema are invalid.
    #[snafu(display("Write to {partition} rejected: {reason}"))]
    PartitionWriteRejected {
        /// Partition key, or `unassigned` for rows without a valid date.
        partition: String,
        /// Why.
        reason: RejectReason,
    },

    /// The caller's lease is not (or no longer) valid.
    #[snafu(display("Caller lease is not valid: {source}"))]
    LeaseInvalid {
        /// Lock manager verdict.
        source: LockError,
    },

    /// The caller's lease belongs to a different data type.
    #[snafu(display("Lease on {lease} does not cover data type {data_type:?}"))]
    LeaseMismatch {
        /// Lease key.
        lease: String,
        /// Data type being written.
        data_type: String,
    },

    /// The partition lease could not be obtained in time.
    #[snafu(display("Partition {partition} is busy: {source}"))]
    PartitionBusy {
        /// Partition key.
        partition: String,
        /// Lock manager verdict.
        source: LockError,
    },

    /// The partition layout kept changing while the write was routed.
    #[snafu(display("Partition layout of {partition} changed {attempts} times during the write"))]
    LayoutUnstable {
        /// Partition key last tried.
        partition: String,
        /// Number of attempts.
        attempts: u32,
    },

    /// Entity codes could not be resolved.
    #[snafu(display("Failed to resolve entity codes: {source}"))]
    ResolveCodes {
        /// Registry error.
        source: RegistryError,
    },

    /// The registry returned fewer IDs than routable rows.
    #[snafu(display("Registry resolved {resolved} ids for {routable} routable rows"))]
    UnresolvedCodes {
        /// Rows with both a code and a date.
        routable: usize,
        /// IDs the registry returned.
        resolved: usize,
    },

    /// Partition listing failed.
    #[snafu(display("Failed to list partitions: {source}"))]
    ListPartitions {
        /// Storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// Reading or replacing a partition file failed.
    #[snafu(display("Storage error on {path}: {source}"))]
    PartitionIo {
        /// Partition file.
        path: String,
        /// Storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// A stored partition could not be decoded or the merged one encoded.
    #[snafu(display("Parquet error on {path}: {source}"))]
    PartitionParquet {
        /// Partition file.
        path: String,
        /// Parquet error.
        source: ParquetError,
    },

    /// Column manipulation failed.
    #[snafu(display("Arrow error while merging {partition}: {source}"))]
    Merge {
        /// Partition key.
        partition: String,
        /// Arrow error.
        source: ArrowError,
    },
}

/// What happened to one partition.
#[derive(Debug)]
pub enum PartitionOutcome {
    /// The partition was replaced.
    Written {
        /// Rows in the stored partition after the write.
        rows_after: usize,
        /// Size of the new partition file.
        bytes: u64,
    },
    /// The rows were refused; the partition is untouched.
    Rejected(WriteError),
    /// The write failed; the partition is untouched.
    Failed(WriteError),
}

/// Per-partition entry of a [`WriteReport`].
#[derive(Debug)]
pub struct PartitionReport {
    /// Target partition; `None` for rows that could not be assigned one.
    pub partition: Option<PartitionKey>,
    /// Incoming rows routed to it.
    pub rows: usize,
    /// Outcome.
    pub outcome: PartitionOutcome,
}

/// Result of [`Writer::write`].
#[derive(Debug)]
pub struct WriteReport {
    /// Data type written.
    pub data_type: String,
    /// One entry per touched partition, in partition order; unassigned rows
    /// come first.
    pub partitions: Vec<PartitionReport>,
    /// Compaction that ran because of this write.
    pub compaction: Option<Result<CompactionReport, CompactionError>>,
}

impl WriteReport {
    fn new(data_type: &str) -> Self {
        Self {
            data_type: data_type.to_string(),
            partitions: Vec::new(),
            compaction: None,
        }
    }

    /// Incoming rows that landed in a written partition.
    pub fn rows_written(&self) -> usize {
        self.partitions
            .iter()
            .filter(|p| matches!(p.outcome, PartitionOutcome::Written { .. }))
            .map(|p| p.rows)
            .sum()
    }

    /// True if every partition was written.
    pub fn is_complete(&self) -> bool {
        self.partitions
            .iter()
            .all(|p| matches!(p.outcome, PartitionOutcome::Written { .. }))
    }

    /// Entries that were rejected or failed.
    pub fn problems(&self) -> impl Iterator<Item = &PartitionReport> {
        self.partitions
            .iter()
            .filter(|p| !matches!(p.outcome, PartitionOutcome::Written { .. }))
    }

    fn reject(&mut self, partition: Option<PartitionKey>, rows: usize, reason: RejectReason) {
        let label = partition.map_or_else(|| "unassigned".to_string(), |k| k.to_string());
        warn!("{}: write to {label} rejected: {reason}", self.data_type);
        self.partitions.push(PartitionReport {
            partition,
            rows,
            outcome: PartitionOutcome::Rejected(WriteError::PartitionWriteRejected {
                partition: label,
                reason,
            }),
        });
    }
}

/// Lease timing used by the writer and compaction for partition leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLeaseSettings {
    /// Lease TTL.
    pub ttl: Duration,
    /// Longest wait for a busy partition.
    pub wait: Duration,
}

/// A group of incoming rows bound for one partition.
struct RowGroup {
    target: PartitionKey,
    rows: Vec<u32>,
    attempts: u32,
}

/// Writer for all data types of a store.
#[derive(Debug)]
pub struct Writer {
    location: StoreLocation,
    registries: Arc<Registries>,
    locks: Arc<LockManager>,
    scanner: Arc<Scanner>,
    compactor: Arc<Compactor>,
    leases: PartitionLeaseSettings,
    compaction: CompactionSettings,
}

impl Writer {
    /// Create a writer.
    pub fn new(
        location: StoreLocation,
        registries: Arc<Registries>,
        locks: Arc<LockManager>,
        scanner: Arc<Scanner>,
        compactor: Arc<Compactor>,
        leases: PartitionLeaseSettings,
        compaction: CompactionSettings,
    ) -> Self {
        Self {
            location,
            registries,
            locks,
            scanner,
            compactor,
            leases,
            compaction,
        }
    }

    /// Merge `batch` into the partitions of `data_type`.
    ///
    /// `lease` must be a valid lease on a key of `data_type`; it is checked
    /// before the write starts and again before each partition is replaced.
    pub async fn write(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
        lease: &Lease,
        batch: &RecordBatch,
    ) -> Result<WriteReport, WriteError> {
        ensure!(
            lease.key().data_type == data_type,
            LeaseMismatchSnafu {
                lease: lease.key().to_string(),
                data_type,
            }
        );
        self.locks.validate(lease).context(LeaseInvalidSnafu)?;

        let mut report = WriteReport::new(data_type);
        let total_rows = batch.num_rows();
        if total_rows == 0 {
            return Ok(report);
        }

        // Dates.
        let date_column = &config.date_column;
        let Some(date_array) = batch.column_by_name(date_column) else {
            report.reject(
                None,
                total_rows,
                RejectReason::MissingColumn {
                    column: date_column.clone(),
                },
            );
            return Ok(report);
        };
        let dates = match normalize::parse_dates(date_column, date_array) {
            Ok(dates) => dates,
            Err(reason) => {
                report.reject(None, total_rows, reason);
                return Ok(report);
            }
        };

        // Entity codes.
        let codes: Option<Vec<Option<String>>> = match &config.entity_column {
            None => None,
            Some(col) => {
                let Some(array) = batch.column_by_name(col) else {
                    report.reject(
                        None,
                        total_rows,
                        RejectReason::MissingColumn {
                            column: col.clone(),
                        },
                    );
                    return Ok(report);
                };
                match normalize::entity_codes(col, array) {
                    Ok(codes) => Some(codes),
                    Err(reason) => {
                        report.reject(None, total_rows, reason);
                        return Ok(report);
                    }
                }
            }
        };

        // Rows without a usable date cannot be routed to any partition.
        let invalid_dates = dates.iter().filter(|d| d.is_none()).count();
        if invalid_dates > 0 {
            report.reject(
                None,
                invalid_dates,
                RejectReason::InvalidDates {
                    column: date_column.clone(),
                    rows: invalid_dates,
                },
            );
        }

        let naturals: Vec<Option<PartitionKey>> = dates
            .iter()
            .map(|d| d.map(|d| PartitionKey::natural(config.granularity, d)))
            .collect();

        // Resolve IDs for rows that will be routed.
        let entity_ids: Option<Vec<u32>> = match &codes {
            None => None,
            Some(codes) => {
                let routable: Vec<&str> = codes
                    .iter()
                    .zip(&dates)
                    .filter_map(|(c, d)| d.and(c.as_deref()))
                    .collect();
                let registry = self
                    .registries
                    .get(&config.entity_namespace)
                    .await
                    .context(ResolveCodesSnafu)?;
                let resolved = registry
                    .resolve_many(&routable)
                    .await
                    .context(ResolveCodesSnafu)?;
                Some(spread_ids(codes, &dates, resolved)?)
            }
        };

        let date_ints: Vec<i32> = dates
            .iter()
            .map(|d| d.map_or(0, |d: TradeDate| d.to_yyyymmdd()))
            .collect();
        let entity_id_column = config.entity_id_column();
        let date_int_column = config.date_int_column();
        let normalized = normalize::with_key_columns(
            batch,
            entity_ids
                .clone()
                .map(|ids| (entity_id_column.as_deref().unwrap_or_default(), ids)),
            (&date_int_column, date_ints),
        )
        .context(MergeSnafu {
            partition: "incoming batch",
        })?;

        // Initial routing.
        let listing = scan::list_partitions(&self.location, data_type, config.granularity)
            .await
            .context(ListPartitionsSnafu)?;
        let mut queue: VecDeque<RowGroup> = route(
            &listing,
            naturals
                .iter()
                .enumerate()
                .filter_map(|(row, n)| n.map(|n| (row as u32, n))),
        )
        .into_iter()
        .map(|(target, rows)| RowGroup {
            target,
            rows,
            attempts: 0,
        })
        .collect();

        let mut touched: Vec<(PartitionKey, u64)> = Vec::new();
        let mut results: Vec<PartitionReport> = Vec::new();

        while let Some(group) = queue.pop_front() {
            let key = group.target;
            let n_rows = group.rows.len();

            // Null codes poison the whole partition.
            if let Some(codes) = &codes {
                let nulls = group
                    .rows
                    .iter()
                    .filter(|r| codes[**r as usize].is_none())
                    .count();
                if nulls > 0 {
                    let column = config.entity_column.clone().unwrap_or_default();
                    results.push(rejected(
                        data_type,
                        key,
                        n_rows,
                        RejectReason::NullEntityCodes {
                            column,
                            rows: nulls,
                        },
                    ));
                    continue;
                }
            }

            let step = self
                .write_group(data_type, config, lease, &normalized, &naturals, group)
                .await;
            match step {
                GroupStep::Done(report) => {
                    if let PartitionOutcome::Written { bytes, .. } = report.outcome {
                        touched.push((key, bytes));
                    }
                    results.push(report);
                }
                GroupStep::Reroute(groups) => queue.extend(groups),
            }
        }

        results.sort_by_key(|r| r.partition);
        report.partitions.extend(results);

        if self.compaction.auto && self.needs_compaction(config, &touched) {
            info!("{data_type}: partition sizes drifted from target; compacting");
            report.compaction = Some(self.compactor.compact(data_type, config).await);
        }

        Ok(report)
    }

    async fn write_group(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
        lease: &Lease,
        normalized: &RecordBatch,
        naturals: &[Option<PartitionKey>],
        group: RowGroup,
    ) -> GroupStep {
        let key = group.target;
        let n_rows = group.rows.len();
        let failed = |error: WriteError| {
            GroupStep::Done(PartitionReport {
                partition: Some(key),
                rows: n_rows,
                outcome: PartitionOutcome::Failed(error),
            })
        };

        let part_lease = match self
            .locks
            .acquire_with_wait(
                LockKey::new(data_type, LockTarget::Partition(key)),
                self.leases.ttl,
                self.leases.wait,
            )
            .await
        {
            Ok(l) => l,
            Err(source) => {
                return failed(WriteError::PartitionBusy {
                    partition: key.to_string(),
                    source,
                });
            }
        };

        let step = self
            .write_group_locked(data_type, config, lease, normalized, naturals, group)
            .await;

        if let Err(e) = self.locks.release(part_lease) {
            warn!("{data_type}: releasing partition lease on {key} failed: {e}");
        }
        step
    }

    async fn write_group_locked(
        &self,
        data_type: &str,
        config: &DataTypeConfig,
        lease: &Lease,
        normalized: &RecordBatch,
        naturals: &[Option<PartitionKey>],
        group: RowGroup,
    ) -> GroupStep {
        let key = group.target;
        let n_rows = group.rows.len();
        let failed = |error: WriteError| {
            GroupStep::Done(PartitionReport {
                partition: Some(key),
                rows: n_rows,
                outcome: PartitionOutcome::Failed(error),
            })
        };

        // The layout may have changed while we waited for the lease.
        let listing =
            match scan::list_partitions(&self.location, data_type, config.granularity).await {
                Ok(l) => l,
                Err(e) => return failed(WriteError::ListPartitions { source: Box::new(e) }),
            };
        let rerouted = route(
            &listing,
            group
                .rows
                .iter()
                .filter_map(|r| naturals[*r as usize].map(|n| (*r, n))),
        );
        if rerouted.len() != 1 || !rerouted.contains_key(&key) {
            if group.attempts + 1 >= MAX_REROUTES {
                return failed(WriteError::LayoutUnstable {
                    partition: key.to_string(),
                    attempts: group.attempts + 1,
                });
            }
            return GroupStep::Reroute(
                rerouted
                    .into_iter()
                    .map(|(target, rows)| RowGroup {
                        target,
                        rows,
                        attempts: group.attempts + 1,
                    })
                    .collect(),
            );
        }

        let rel_path = key.rel_path(data_type);
        let path_str = rel_path.display().to_string();

        let incoming = match take_record_batch(normalized, &UInt32Array::from(group.rows.clone())) {
            Ok(b) => b,
            Err(source) => {
                return failed(WriteError::Merge {
                    partition: key.to_string(),
                    source,
                });
            }
        };

        let mut parts: Vec<RecordBatch> = Vec::new();
        match storage::read_all_bytes(&self.location, &rel_path).await {
            Ok(bytes) => {
                let (schema, batches) = match decode_partition(Bytes::from(bytes)) {
                    Ok(decoded) => decoded,
                    Err(source) => {
                        return failed(WriteError::PartitionParquet {
                            path: path_str,
                            source,
                        });
                    }
                };
                if !same_columns(&schema, &incoming.schema()) {
                    return GroupStep::Done(rejected(
                        data_type,
                        key,
                        n_rows,
                        RejectReason::SchemaMismatch {
                            stored: describe_schema(&schema),
                            incoming: describe_schema(&incoming.schema()),
                        },
                    ));
                }
                parts.extend(batches);
            }
            Err(StorageError::NotFound { .. }) => {}
            Err(e) => {
                return failed(WriteError::PartitionIo {
                    path: path_str,
                    source: Box::new(e),
                });
            }
        }
        parts.push(incoming);

        let entity_id_column = config.entity_id_column();
        let merged = match merge_dedup_sort(
            &parts,
            entity_id_column.as_deref(),
            &config.date_int_column(),
        ) {
            Ok(m) => m,
            Err(source) => {
                return failed(WriteError::Merge {
                    partition: key.to_string(),
                    source,
                });
            }
        };
        let bytes = match encode_partition(&merged) {
            Ok(b) => b,
            Err(source) => {
                return failed(WriteError::PartitionParquet {
                    path: path_str,
                    source,
                });
            }
        };

        let staged = match storage::stage_atomic(&self.location, &rel_path, &bytes).await {
            Ok(s) => s,
            Err(e) => {
                return failed(WriteError::PartitionIo {
                    path: path_str,
                    source: Box::new(e),
                });
            }
        };
        // Dropping `staged` on any early return removes the temporary file.
        if let Err(source) = self.locks.validate(lease) {
            return failed(WriteError::LeaseInvalid { source });
        }
        if let Err(e) = staged.commit().await {
            return failed(WriteError::PartitionIo {
                path: path_str,
                source: Box::new(e),
            });
        }
        self.scanner.invalidate(data_type);

        info!(
            "{data_type}: replaced {key} ({n_rows} incoming rows, {} stored, {} bytes)",
            merged.num_rows(),
            bytes.len()
        );

        GroupStep::Done(PartitionReport {
            partition: Some(key),
            rows: n_rows,
            outcome: PartitionOutcome::Written {
                rows_after: merged.num_rows(),
                bytes: bytes.len() as u64,
            },
        })
    }

    fn needs_compaction(&self, config: &DataTypeConfig, touched: &[(PartitionKey, u64)]) -> bool {
        if config.granularity == Granularity::None {
            return false;
        }
        let target = config.target_partition_bytes as f64;
        let low = self.compaction.low_watermark * target;
        let high = self.compaction.high_watermark * target;
        touched.iter().any(|(key, bytes)| {
            let size = *bytes as f64;
            if size > high && !key.is_span() {
                warn!("partition {key} is {bytes} bytes, above the high watermark, and cannot be split further");
                return false;
            }
            size < low || size > high
        })
    }
}

enum GroupStep {
    Done(PartitionReport),
    Reroute(Vec<RowGroup>),
}

fn rejected(
    data_type: &str,
    key: PartitionKey,
    rows: usize,
    reason: RejectReason,
) -> PartitionReport {
    warn!("{data_type}: write to {key} rejected: {reason}");
    PartitionReport {
        partition: Some(key),
        rows,
        outcome: PartitionOutcome::Rejected(WriteError::PartitionWriteRejected {
            partition: key.to_string(),
            reason,
        }),
    }
}

/// Group `(row, natural key)` pairs by the live partition that holds each
/// natural key, or the natural key itself when none does.
fn route(
    listing: &scan::PartitionListing,
    rows: impl Iterator<Item = (u32, PartitionKey)>,
) -> BTreeMap<PartitionKey, Vec<u32>> {
    let mut out: BTreeMap<PartitionKey, Vec<u32>> = BTreeMap::new();
    for (row, natural) in rows {
        let target = listing.covering(&natural).map_or(natural, |p| p.key);
        out.entry(target).or_default().push(row);
    }
    out
}

/// Place resolved IDs back on their rows.
///
/// `resolved` holds one ID per row that has both a code and a date, in row
/// order. Other rows get 0; they are rejected before routing and never
/// written.
fn spread_ids(
    codes: &[Option<String>],
    dates: &[Option<TradeDate>],
    resolved: Vec<EntityId>,
) -> Result<Vec<EntityId>, WriteError> {
    let routable: Vec<usize> = codes
        .iter()
        .zip(dates)
        .enumerate()
        .filter(|(_, (c, d))| c.is_some() && d.is_some())
        .map(|(row, _)| row)
        .collect();
    ensure!(
        resolved.len() == routable.len(),
        UnresolvedCodesSnafu {
            routable: routable.len(),
            resolved: resolved.len(),
        }
    );
    let mut ids = vec![0; codes.len()];
    for (row, id) in routable.into_iter().zip(resolved) {
        ids[row] = id;
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lock::ManualClock,
        test_support::{daily_batch, daily_config},
    };
    use arrow::{
        compute::concat_batches,
        datatypes::{DataType, Field, Schema},
    };
    use arrow_array::{ArrayRef, Float64Array, StringArray};
    use std::path::Path;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TTL: Duration = Duration::from_secs(60);

    fn writer(tmp: &TempDir, locks: Arc<LockManager>, auto_compact: bool) -> Writer {
        let location = StoreLocation::local(tmp.path());
        let leases = PartitionLeaseSettings {
            ttl: TTL,
            wait: Duration::from_millis(100),
        };
        let compaction = CompactionSettings {
            auto: auto_compact,
            ..CompactionSettings::default()
        };
        let scanner = Arc::new(Scanner::new(location.clone()));
        let compactor = Arc::new(Compactor::new(
            location.clone(),
            Arc::clone(&locks),
            Arc::clone(&scanner),
            leases,
            compaction.clone(),
        ));
        Writer::new(
            location.clone(),
            Arc::new(Registries::new(location)),
            locks,
            scanner,
            compactor,
            leases,
            compaction,
        )
    }

    fn caller_lease(locks: &LockManager) -> Result<Lease, LockError> {
        locks.acquire(LockKey::new("daily", LockTarget::All), TTL)
    }

    async fn stored(tmp: &TempDir, dir: &str) -> Result<RecordBatch, Box<dyn std::error::Error>> {
        let path = tmp.path().join("daily").join(dir).join("data.parquet");
        let bytes = tokio::fs::read(path).await?;
        let (schema, batches) = decode_partition(Bytes::from(bytes))?;
        Ok(concat_batches(&schema, &batches)?)
    }

    fn column_f64(batch: &RecordBatch, name: &str) -> Vec<f64> {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
            .map(|a| a.values().to_vec())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn rows_are_routed_to_natural_partitions() -> TestResult {
        let tmp = TempDir::new()?;
        let locks = Arc::new(LockManager::default());
        let writer = writer(&tmp, Arc::clone(&locks), false);
        let lease = caller_lease(&locks)?;

        let batch = daily_batch(&[
            ("600000.SH", "20230103", 1.0),
            ("000001.SZ", "20221230", 2.0),
            ("000001.SZ", "20230103", 3.0),
        ])?;
        let report = writer.write("daily", &daily_config(), &lease, &batch).await?;
        assert!(report.is_complete());
        assert_eq!(report.rows_written(), 3);
        assert_eq!(report.partitions.len(), 2);

        let y2023 = stored(&tmp, "year=2023").await?;
        // Sorted by entity ID: 600000.SH was resolved first.
        assert_eq!(column_f64(&y2023, "close"), vec![1.0, 3.0]);
        let names: Vec<String> = y2023
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(
            names,
            vec!["ts_code", "trade_date", "close", "ts_code_id", "trade_date_int"]
        );
        assert_eq!(stored(&tmp, "year=2022").await?.num_rows(), 1);
        assert_eq!(locks.held_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn rewriting_the_same_rows_changes_nothing() -> TestResult {
        let tmp = TempDir::new()?;
        let locks = Arc::new(LockManager::default());
        let writer = writer(&tmp, Arc::clone(&locks), false);
        let lease = caller_lease(&locks)?;
        let batch = daily_batch(&[("A", "20230103", 1.0), ("A", "20230104", 2.0)])?;

        writer.write("daily", &daily_config(), &lease, &batch).await?;
        let once = stored(&tmp, "year=2023").await?;
        writer.write("daily", &daily_config(), &lease, &batch).await?;
        let twice = stored(&tmp, "year=2023").await?;
        assert_eq!(once, twice);
        Ok(())
    }

    #[tokio::test]
    async fn newest_row_wins() -> TestResult {
        let tmp = TempDir::new()?;
        let locks = Arc::new(LockManager::default());
        let writer = writer(&tmp, Arc::clone(&locks), false);
        let lease = caller_lease(&locks)?;

        let first = daily_batch(&[("A", "20230103", 1.0), ("A", "20230104", 2.0)])?;
        writer.write("daily", &daily_config(), &lease, &first).await?;
        let second = daily_batch(&[("A", "2023-01-04", 20.0), ("A", "20230104", 21.0)])?;
        writer.write("daily", &daily_config(), &lease, &second).await?;

        let rows = stored(&tmp, "year=2023").await?;
        assert_eq!(column_f64(&rows, "close"), vec![1.0, 21.0]);
        Ok(())
    }

    #[tokio::test]
    async fn schema_mismatch_rejects_only_that_partition() -> TestResult {
        let tmp = TempDir::new()?;
        let locks = Arc::new(LockManager::default());
        let writer = writer(&tmp, Arc::clone(&locks), false);
        let lease = caller_lease(&locks)?;

        let first = daily_batch(&[("A", "20230103", 1.0)])?;
        writer.write("daily", &daily_config(), &lease, &first).await?;
        let path = tmp.path().join(Path::new("daily/year=2023/data.parquet"));
        let before = std::fs::read(&path)?;

        let schema = Schema::new(vec![
            Field::new("ts_code", DataType::Utf8, true),
            Field::new("trade_date", DataType::Utf8, true),
            Field::new("close", DataType::Float64, true),
            Field::new("open", DataType::Float64, true),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec!["A", "A"])),
            Arc::new(StringArray::from(vec!["20230105", "20240102"])),
            Arc::new(Float64Array::from(vec![1.0, 2.0])),
            Arc::new(Float64Array::from(vec![1.5, 2.5])),
        ];
        let wider = RecordBatch::try_new(Arc::new(schema), columns)?;
        let report = writer.write("daily", &daily_config(), &lease, &wider).await?;

        assert!(!report.is_complete());
        let problems: Vec<_> = report.problems().collect();
        assert_eq!(problems.len(), 1);
        assert!(matches!(
            &problems[0].outcome,
            PartitionOutcome::Rejected(WriteError::PartitionWriteRejected {
                reason: RejectReason::SchemaMismatch { .. },
                ..
            })
        ));
        assert_eq!(std::fs::read(&path)?, before);
        assert_eq!(stored(&tmp, "year=2024").await?.num_rows(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn rows_with_bad_dates_are_rejected_and_the_rest_written() -> TestResult {
        let tmp = TempDir::new()?;
        let locks = Arc::new(LockManager::default());
        let writer = writer(&tmp, Arc::clone(&locks), false);
        let lease = caller_lease(&locks)?;

        let batch = daily_batch(&[
            ("A", "20230103", 1.0),
            ("A", "not a date", 2.0),
            ("A", "20230230", 3.0),
        ])?;
        let report = writer.write("daily", &daily_config(), &lease, &batch).await?;
        assert_eq!(report.partitions.len(), 2);
        assert_eq!(report.partitions[0].partition, None);
        assert_eq!(report.partitions[0].rows, 2);
        assert!(matches!(
            &report.partitions[0].outcome,
            PartitionOutcome::Rejected(WriteError::PartitionWriteRejected {
                reason: RejectReason::InvalidDates { rows: 2, .. },
                ..
            })
        ));
        assert_eq!(stored(&tmp, "year=2023").await?.num_rows(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn null_entity_code_rejects_its_partition() -> TestResult {
        let tmp = TempDir::new()?;
        let locks = Arc::new(LockManager::default());
        let writer = writer(&tmp, Arc::clone(&locks), false);
        let lease = caller_lease(&locks)?;

        let schema = Schema::new(vec![
            Field::new("ts_code", DataType::Utf8, true),
            Field::new("trade_date", DataType::Utf8, true),
            Field::new("close", DataType::Float64, true),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec![Some("A"), None, Some("B")])),
            Arc::new(StringArray::from(vec!["20230103", "20230104", "20220103"])),
            Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0])),
        ];
        let batch = RecordBatch::try_new(Arc::new(schema), columns)?;
        let report = writer.write("daily", &daily_config(), &lease, &batch).await?;

        let problems: Vec<_> = report.problems().collect();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].partition.map(|k| k.to_string()), Some("year=2023".to_string()));
        assert!(!tmp.path().join("daily/year=2023").exists());
        assert_eq!(stored(&tmp, "year=2022").await?.num_rows(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_date_column_rejects_the_batch() -> TestResult {
        let tmp = TempDir::new()?;
        let locks = Arc::new(LockManager::default());
        let writer = writer(&tmp, Arc::clone(&locks), false);
        let lease = caller_lease(&locks)?;

        let config = DataTypeConfig {
            date_column: "cal_date".to_string(),
            ..daily_config()
        };
        let batch = daily_batch(&[("A", "20230103", 1.0)])?;
        let report = writer.write("daily", &config, &lease, &batch).await?;
        assert!(matches!(
            &report.partitions[0].outcome,
            PartitionOutcome::Rejected(WriteError::PartitionWriteRejected {
                reason: RejectReason::MissingColumn { .. },
                ..
            })
        ));
        assert!(!tmp.path().join("daily").exists());
        Ok(())
    }

    #[tokio::test]
    async fn expired_caller_lease_writes_nothing() -> TestResult {
        let tmp = TempDir::new()?;
        let clock = Arc::new(ManualClock::new());
        let locks = Arc::new(LockManager::new(clock.clone()));
        let writer = writer(&tmp, Arc::clone(&locks), false);
        let lease = caller_lease(&locks)?;
        clock.advance(TTL + Duration::from_secs(1));

        let batch = daily_batch(&[("A", "20230103", 1.0)])?;
        let result = writer.write("daily", &daily_config(), &lease, &batch).await;
        assert!(matches!(result, Err(WriteError::LeaseInvalid { .. })));

        let other = locks.acquire(LockKey::new("daily_basic", LockTarget::All), TTL)?;
        let result = writer.write("daily", &daily_config(), &other, &batch).await;
        assert!(matches!(result, Err(WriteError::LeaseMismatch { .. })));
        assert!(!tmp.path().join("daily").exists());
        Ok(())
    }

    #[tokio::test]
    async fn busy_partition_fails_only_that_partition() -> TestResult {
        let tmp = TempDir::new()?;
        let locks = Arc::new(LockManager::default());
        let writer = writer(&tmp, Arc::clone(&locks), false);
        let lease = caller_lease(&locks)?;

        let year_2023 = PartitionKey::natural(Granularity::Year, "20230103".parse()?);
        let held = locks.acquire(LockKey::new("daily", LockTarget::Partition(year_2023)), TTL)?;

        let batch = daily_batch(&[("A", "20230103", 1.0), ("A", "20220103", 2.0)])?;
        let report = writer.write("daily", &daily_config(), &lease, &batch).await?;
        let problems: Vec<_> = report.problems().collect();
        assert_eq!(problems.len(), 1);
        assert!(matches!(
            problems[0].outcome,
            PartitionOutcome::Failed(WriteError::PartitionBusy { .. })
        ));
        assert_eq!(stored(&tmp, "year=2022").await?.num_rows(), 1);
        locks.release(held)?;
        Ok(())
    }

    #[tokio::test]
    async fn small_partitions_are_compacted_and_later_writes_follow_the_span() -> TestResult {
        let tmp = TempDir::new()?;
        let locks = Arc::new(LockManager::default());
        let writer = writer(&tmp, Arc::clone(&locks), true);
        let lease = caller_lease(&locks)?;

        let batch = daily_batch(&[("A", "20220103", 1.0), ("A", "20230103", 2.0)])?;
        let report = writer.write("daily", &daily_config(), &lease, &batch).await?;
        let compaction = report.compaction.ok_or("compaction did not run")??;
        assert_eq!(compaction.merged.len(), 1);
        assert!(tmp.path().join("daily/year=2022..2023").exists());

        let more = daily_batch(&[("A", "20230104", 3.0)])?;
        let report = writer.write("daily", &daily_config(), &lease, &more).await?;
        assert_eq!(
            report.partitions[0].partition.map(|k| k.to_string()),
            Some("year=2022..2023".to_string())
        );
        assert!(!tmp.path().join("daily/year=2023").exists());
        assert_eq!(stored(&tmp, "year=2022..2023").await?.num_rows(), 3);
        Ok(())
    }

    #[test]
    fn resolved_ids_land_on_routable_rows_only() -> TestResult {
        let day: TradeDate = "20230103".parse()?;
        let codes = vec![Some("A".to_string()), None, Some("B".to_string()), Some("C".to_string())];
        let dates = vec![Some(day), Some(day), None, Some(day)];

        assert_eq!(spread_ids(&codes, &dates, vec![7, 9])?, vec![7, 0, 0, 9]);

        let err = spread_ids(&codes, &dates, vec![7]).expect_err("one id short");
        assert!(matches!(
            err,
            WriteError::UnresolvedCodes {
                routable: 2,
                resolved: 1
            }
        ));
        Ok(())
    }
}
