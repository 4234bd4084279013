//! Typed store configuration.
//!
//! A [`StoreConfig`] is resolved once when a store is opened: from
//! `<root>/tickstore.json` when that file exists, otherwise from the built-in
//! table of data types. Every field has a default, so a config file only
//! needs to mention what it changes.
//!
//! ```json
//! {
//!   "max_in_flight": 8,
//!   "data_types": {
//!     "daily": { "priority": 10, "date_column": "trade_date", "entity_column": "ts_code" }
//!   }
//! }
//! ```
//!
//! A `data_types` table in the file replaces the built-in table as a whole.

use std::{collections::BTreeMap, fmt, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    layout::{self, Granularity, LayoutError},
    storage::{self, StorageError, StoreLocation},
};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The requested data type is not configured.
    #[snafu(display("Unknown data type {name:?}"))]
    UnknownDataType {
        /// Name that was looked up.
        name: String,
    },

    /// A data type has an empty date column.
    #[snafu(display("Data type {data_type:?} has an empty date column"))]
    EmptyDateColumn {
        /// Offending data type.
        data_type: String,
    },

    /// A data type has an empty entity column name.
    #[snafu(display("Data type {data_type:?} has an empty entity column"))]
    EmptyEntityColumn {
        /// Offending data type.
        data_type: String,
    },

    /// A data type has a zero target partition size.
    #[snafu(display("Data type {data_type:?} has a zero target partition size"))]
    ZeroTargetSize {
        /// Offending data type.
        data_type: String,
    },

    /// Compaction watermarks are not `0 < low < 1 < high`.
    #[snafu(display(
        "Compaction watermarks must satisfy 0 < low < 1 < high (got low={low}, high={high})"
    ))]
    InvertedWatermarks {
        /// Configured low watermark.
        low: f64,
        /// Configured high watermark.
        high: f64,
    },

    /// `max_in_flight` is zero.
    #[snafu(display("max_in_flight must be at least 1"))]
    ZeroMaxInFlight,

    /// A data type or namespace name cannot be used as a path component.
    #[snafu(display("Invalid name in configuration: {source}"))]
    InvalidName {
        /// Underlying validation error.
        source: LayoutError,
    },

    /// The configuration file could not be read.
    #[snafu(display("Failed to read configuration: {source}"))]
    ReadConfig {
        /// Underlying storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// The configuration file is not valid JSON for [`StoreConfig`].
    #[snafu(display("Failed to parse configuration at {path}: {source}"))]
    ParseConfig {
        /// Path of the configuration file.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// How often upstream publishes new rows for a data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    /// Every trading day.
    #[default]
    Daily,
    /// Once a week or less.
    Weekly,
    /// Once per reporting quarter.
    Quarterly,
}

/// How an orchestrator slices requests to the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// One request per instrument.
    #[default]
    ByStock,
    /// One request per trading date.
    ByDate,
    /// One request per reporting period.
    ByPeriod,
    /// One request per exchange.
    ByExchange,
    /// One request per date range.
    ByDateRange,
}

impl fmt::Display for BatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStrategy::ByStock => "by_stock",
            BatchStrategy::ByDate => "by_date",
            BatchStrategy::ByPeriod => "by_period",
            BatchStrategy::ByExchange => "by_exchange",
            BatchStrategy::ByDateRange => "by_date_range",
        };
        f.write_str(s)
    }
}

/// Update policy of a data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePolicy {
    /// Publication frequency.
    pub frequency: UpdateFrequency,
    /// Request slicing strategy.
    pub batch_strategy: BatchStrategy,
    /// Targets per upstream batch.
    pub batch_size: u32,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            frequency: UpdateFrequency::Daily,
            batch_strategy: BatchStrategy::ByStock,
            batch_size: 50,
        }
    }
}

/// Descriptor of one data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataTypeConfig {
    /// Ordering of work items across data types; lower runs first.
    pub priority: u32,
    /// Column holding the date used for partitioning and coverage.
    pub date_column: String,
    /// Column holding the external entity code, `None` for entity-less data.
    pub entity_column: Option<String>,
    /// Registry namespace of the entity codes.
    pub entity_namespace: String,
    /// Partition granularity.
    pub granularity: Granularity,
    /// Update policy.
    pub update: UpdatePolicy,
    /// Upstream rows-per-minute limit, `None` when unlimited.
    pub api_limit: Option<u32>,
    /// Partition size compaction aims for, in bytes.
    pub target_partition_bytes: u64,
    /// Re-download date spans whose partitions could not be read.
    pub refetch_uncertain: bool,
}

/// Default target partition size: 40 MiB.
pub const DEFAULT_TARGET_PARTITION_BYTES: u64 = 40 * 1024 * 1024;

impl Default for DataTypeConfig {
    fn default() -> Self {
        Self {
            priority: 100,
            date_column: "trade_date".to_string(),
            entity_column: Some("ts_code".to_string()),
            entity_namespace: "instrument".to_string(),
            granularity: Granularity::Year,
            update: UpdatePolicy::default(),
            api_limit: None,
            target_partition_bytes: DEFAULT_TARGET_PARTITION_BYTES,
            refetch_uncertain: false,
        }
    }
}

impl DataTypeConfig {
    /// Name of the stored entity ID column (`<entity_column>_id`).
    pub fn entity_id_column(&self) -> Option<String> {
        self.entity_column.as_ref().map(|c| format!("{c}_id"))
    }

    /// Name of the stored integer date column (`<date_column>_int`).
    pub fn date_int_column(&self) -> String {
        format!("{}_int", self.date_column)
    }
}

/// Lease settings shared by all data types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Lease time-to-live in milliseconds.
    pub ttl_ms: u64,
    /// Longest time an acquire waits for a busy key, in milliseconds.
    pub wait_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 10 * 60 * 1000,
            wait_ms: 5_000,
        }
    }
}

/// Size thresholds that trigger compaction, as fractions of a data type's
/// `target_partition_bytes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    /// Partitions smaller than `low_watermark * target` are merge candidates.
    pub low_watermark: f64,
    /// Span partitions larger than `high_watermark * target` are split.
    pub high_watermark: f64,
    /// Run compaction automatically after writes.
    pub auto: bool,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            low_watermark: 0.25,
            high_watermark: 2.0,
            auto: true,
        }
    }
}

/// Store-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Lease settings.
    pub lock: LockSettings,
    /// Compaction thresholds.
    pub compaction: CompactionSettings,
    /// Upper bound on concurrent fetch-and-write pipelines in a build pass.
    pub max_in_flight: usize,
    /// Data type descriptors by name.
    pub data_types: BTreeMap<String, DataTypeConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock: LockSettings::default(),
            compaction: CompactionSettings::default(),
            max_in_flight: 4,
            data_types: builtin_data_types(),
        }
    }
}

fn builtin_data_types() -> BTreeMap<String, DataTypeConfig> {
    let instrument = |priority: u32,
                      date_column: &str,
                      granularity: Granularity,
                      batch_strategy: BatchStrategy,
                      batch_size: u32,
                      api_limit: Option<u32>| DataTypeConfig {
        priority,
        date_column: date_column.to_string(),
        granularity,
        update: UpdatePolicy {
            frequency: UpdateFrequency::Daily,
            batch_strategy,
            batch_size,
        },
        api_limit,
        ..DataTypeConfig::default()
    };

    let mut out = BTreeMap::new();
    out.insert(
        "trade_cal".to_string(),
        DataTypeConfig {
            priority: 0,
            date_column: "cal_date".to_string(),
            entity_column: None,
            granularity: Granularity::None,
            update: UpdatePolicy {
                frequency: UpdateFrequency::Weekly,
                batch_strategy: BatchStrategy::ByDateRange,
                batch_size: 100,
            },
            ..DataTypeConfig::default()
        },
    );
    out.insert(
        "stock_basic".to_string(),
        DataTypeConfig {
            priority: 1,
            date_column: "list_date".to_string(),
            granularity: Granularity::None,
            update: UpdatePolicy {
                frequency: UpdateFrequency::Weekly,
                batch_strategy: BatchStrategy::ByExchange,
                batch_size: 100,
            },
            ..DataTypeConfig::default()
        },
    );
    out.insert(
        "daily".to_string(),
        instrument(10, "trade_date", Granularity::Year, BatchStrategy::ByStock, 50, Some(500)),
    );
    out.insert(
        "daily_basic".to_string(),
        instrument(20, "trade_date", Granularity::Year, BatchStrategy::ByStock, 50, None),
    );
    out.insert(
        "moneyflow".to_string(),
        instrument(30, "trade_date", Granularity::Year, BatchStrategy::ByDate, 100, None),
    );
    out.insert(
        "stk_factor".to_string(),
        instrument(40, "trade_date", Granularity::Year, BatchStrategy::ByStock, 50, Some(100)),
    );
    out.insert(
        "suspend_d".to_string(),
        instrument(50, "trade_date", Granularity::YearMonth, BatchStrategy::ByDate, 100, None),
    );
    out.insert(
        "forecast".to_string(),
        instrument(60, "ann_date", Granularity::None, BatchStrategy::ByDate, 100, Some(200)),
    );
    let mut income = instrument(70, "end_date", Granularity::None, BatchStrategy::ByPeriod, 30, Some(30));
    income.update.frequency = UpdateFrequency::Quarterly;
    out.insert("income".to_string(), income);
    out
}

impl StoreConfig {
    /// Look up a data type descriptor.
    pub fn data_type(&self, name: &str) -> Result<&DataTypeConfig, ConfigError> {
        self.data_types
            .get(name)
            .context(UnknownDataTypeSnafu { name })
    }

    /// Lease time-to-live.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock.ttl_ms)
    }

    /// Longest wait for a busy lease.
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock.wait_ms)
    }

    /// Check every invariant the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let CompactionSettings {
            low_watermark: low,
            high_watermark: high,
            ..
        } = self.compaction;
        ensure!(
            low > 0.0 && low < 1.0 && high > 1.0,
            InvertedWatermarksSnafu { low, high }
        );
        ensure!(self.max_in_flight > 0, ZeroMaxInFlightSnafu);

        for (name, dt) in &self.data_types {
            layout::validate_name("data type", name).context(InvalidNameSnafu)?;
            layout::validate_name("namespace", &dt.entity_namespace).context(InvalidNameSnafu)?;
            ensure!(
                !dt.date_column.trim().is_empty(),
                EmptyDateColumnSnafu { data_type: name }
            );
            if let Some(col) = &dt.entity_column {
                ensure!(
                    !col.trim().is_empty(),
                    EmptyEntityColumnSnafu { data_type: name }
                );
            }
            ensure!(
                dt.target_partition_bytes > 0,
                ZeroTargetSizeSnafu { data_type: name }
            );
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json(path: &str, text: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = serde_json::from_str(text).context(ParseConfigSnafu { path })?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty JSON rendering, suitable for `tickstore.json`.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load `<root>/tickstore.json` if present, otherwise the defaults.
    pub async fn load(location: &StoreLocation) -> Result<Self, ConfigError> {
        let rel = layout::config_rel_path();
        if !storage::exists(location, &rel).await.context(ReadConfigSnafu)? {
            let config = StoreConfig::default();
            config.validate()?;
            return Ok(config);
        }
        let text = storage::read_to_string(location, &rel)
            .await
            .context(ReadConfigSnafu)?;
        Self::from_json(&display_path(location, &rel), &text)
    }
}

fn display_path(location: &StoreLocation, rel: &Path) -> String {
    location.resolve(rel).display().to_string()
}
