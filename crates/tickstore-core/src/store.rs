//! The store facade: one object per store root wiring the registry, scanner,
//! decision engine, lock manager, writer and compactor together.

use std::{path::PathBuf, sync::Arc};

use arrow_array::RecordBatch;
use snafu::prelude::*;

use crate::{
    calendar::TradingCalendar,
    compaction::{CompactionError, CompactionReport, Compactor},
    config::{ConfigError, DataTypeConfig, StoreConfig},
    date::DateRange,
    decision::{self, DecisionPolicy, WorkItem},
    lock::{Lease, LockError, LockKey, LockManager, LockTarget},
    registry::{EntityId, Registries, Registry, RegistryError},
    scan::{CoverageMap, ScanError, Scanner},
    storage::StoreLocation,
    writer::{PartitionLeaseSettings, WriteError, WriteReport, Writer},
};

/// Errors surfaced by [`Store`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// Configuration could not be loaded or is invalid.
    #[snafu(display("Configuration error: {source}"))]
    Config {
        /// Underlying error.
        source: ConfigError,
    },

    /// Scanning failed.
    #[snafu(display("Scan failed: {source}"))]
    Scan {
        /// Underlying error.
        source: ScanError,
    },

    /// A lease operation failed.
    #[snafu(display("{source}"))]
    Lock {
        /// Underlying error.
        source: LockError,
    },

    /// A write failed as a whole.
    #[snafu(display("Write failed: {source}"))]
    Write {
        /// Underlying error.
        source: WriteError,
    },

    /// Registry access failed.
    #[snafu(display("Registry error: {source}"))]
    Registry {
        /// Underlying error.
        source: RegistryError,
    },

    /// A compaction pass failed.
    #[snafu(display("Compaction failed: {source}"))]
    Compaction {
        /// Underlying error.
        source: CompactionError,
    },
}

/// An open store root.
pub struct Store {
    location: StoreLocation,
    config: StoreConfig,
    registries: Arc<Registries>,
    locks: Arc<LockManager>,
    scanner: Arc<Scanner>,
    compactor: Arc<Compactor>,
    writer: Writer,
    calendar: Option<Arc<dyn TradingCalendar>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("location", &self.location)
            .field("data_types", &self.config.data_types.keys().collect::<Vec<_>>())
            .field("gap_detection", &self.calendar.is_some())
            .finish()
    }
}

impl Store {
    /// Open the store at `root`, reading `tickstore.json` if present.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let location = StoreLocation::local(root);
        let config = StoreConfig::load(&location).await.context(ConfigSnafu)?;
        Self::with_config(location, config)
    }

    /// Open a store with an explicit configuration.
    pub fn with_config(location: StoreLocation, config: StoreConfig) -> Result<Self, StoreError> {
        Self::with_lock_manager(location, config, Arc::new(LockManager::default()))
    }

    /// Open a store sharing `locks` with other users of the same root.
    pub fn with_lock_manager(
        location: StoreLocation,
        config: StoreConfig,
        locks: Arc<LockManager>,
    ) -> Result<Self, StoreError> {
        config.validate().context(ConfigSnafu)?;

        let leases = PartitionLeaseSettings {
            ttl: config.lock_ttl(),
            wait: config.lock_wait(),
        };
        let registries = Arc::new(Registries::new(location.clone()));
        let scanner = Arc::new(Scanner::new(location.clone()));
        let compactor = Arc::new(Compactor::new(
            location.clone(),
            Arc::clone(&locks),
            Arc::clone(&scanner),
            leases,
            config.compaction.clone(),
        ));
        let writer = Writer::new(
            location.clone(),
            Arc::clone(&registries),
            Arc::clone(&locks),
            Arc::clone(&scanner),
            Arc::clone(&compactor),
            leases,
            config.compaction.clone(),
        );

        Ok(Self {
            location,
            config,
            registries,
            locks,
            scanner,
            compactor,
            writer,
            calendar: None,
        })
    }

    /// Use `calendar` for gap detection in scans.
    pub fn with_calendar(mut self, calendar: Arc<dyn TradingCalendar>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    /// Store root.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Lock manager of this store.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Descriptor of `data_type`.
    pub fn data_type(&self, data_type: &str) -> Result<&DataTypeConfig, StoreError> {
        self.config.data_type(data_type).context(ConfigSnafu)
    }

    /// Coverage of `data_type`.
    pub async fn scan(&self, data_type: &str) -> Result<CoverageMap, StoreError> {
        let config = self.data_type(data_type)?;
        self.scanner
            .scan(data_type, config, self.calendar.as_deref())
            .await
            .context(ScanSnafu)
    }

    /// True iff at least one subject of `data_type` has stored rows.
    pub async fn has_data(&self, data_type: &str) -> Result<bool, StoreError> {
        Ok(self.scan(data_type).await?.has_data())
    }

    /// Scan `data_type` and decide the fetches needed to cover `request`.
    pub async fn decide(
        &self,
        data_type: &str,
        request: DateRange,
        universe: Option<&[EntityId]>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let policy = DecisionPolicy::from(self.data_type(data_type)?);
        let coverage = self.scan(data_type).await?;
        Ok(decision::decide(request, &coverage, &policy, universe))
    }

    /// Take a lease on `(data_type, target)` without waiting.
    pub fn acquire(&self, data_type: &str, target: LockTarget) -> Result<Lease, StoreError> {
        self.locks
            .acquire(LockKey::new(data_type, target), self.config.lock_ttl())
            .context(LockSnafu)
    }

    /// Take a lease on `(data_type, target)`, waiting up to the configured
    /// lock wait.
    pub async fn acquire_with_wait(
        &self,
        data_type: &str,
        target: LockTarget,
    ) -> Result<Lease, StoreError> {
        self.locks
            .acquire_with_wait(
                LockKey::new(data_type, target),
                self.config.lock_ttl(),
                self.config.lock_wait(),
            )
            .await
            .context(LockSnafu)
    }

    /// Extend `lease` by the configured TTL.
    pub fn renew(&self, lease: &mut Lease) -> Result<(), StoreError> {
        self.locks
            .renew(lease, self.config.lock_ttl())
            .context(LockSnafu)
    }

    /// Give `lease` up.
    pub fn release(&self, lease: Lease) -> Result<(), StoreError> {
        self.locks.release(lease).context(LockSnafu)
    }

    /// Merge `batch` into `data_type` under `lease`.
    pub async fn write(
        &self,
        data_type: &str,
        lease: &Lease,
        batch: &RecordBatch,
    ) -> Result<WriteReport, StoreError> {
        let config = self.data_type(data_type)?;
        self.writer
            .write(data_type, config, lease, batch)
            .await
            .context(WriteSnafu)
    }

    /// Run a compaction pass over `data_type`.
    pub async fn compact(&self, data_type: &str) -> Result<CompactionReport, StoreError> {
        let config = self.data_type(data_type)?;
        self.compactor
            .compact(data_type, config)
            .await
            .context(CompactionSnafu)
    }

    /// The identifier registry of `namespace`.
    pub async fn registry(&self, namespace: &str) -> Result<Arc<Registry>, StoreError> {
        self.registries.get(namespace).await.context(RegistrySnafu)
    }
}
