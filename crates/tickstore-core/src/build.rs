//! Build pass: scan, decide, then fetch and write every work item.
//!
//! The upstream client is reached through the [`Fetcher`] trait. Each work
//! item runs under its own lease, taken before the fetch and held through
//! the write. At most `max_in_flight` items run at once. A failing item is
//! recorded in the [`BuildReport`] and never stops the others.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use arrow_array::RecordBatch;
use async_trait::async_trait;
use futures::future::join_all;
use log::{info, warn};
use serde::Serialize;
use snafu::prelude::*;
use tokio::sync::Semaphore;

use crate::{
    date::DateRange,
    decision::WorkItem,
    lock::{LockError, LockTarget},
    registry::EntityId,
    scan::Subject,
    store::{Store, StoreError},
};

/// One request to the upstream client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchRequest {
    /// Data type to fetch.
    pub data_type: String,
    /// Entity code, or `None` for every entity.
    pub entity_code: Option<String>,
    /// Dates to fetch, inclusive.
    pub range: DateRange,
}

/// Failure reported by a [`Fetcher`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FetchError {
    /// The provider throttled the request; retrying later may succeed.
    #[snafu(display("Rate limited: {message}"))]
    RateLimited {
        /// Provider message.
        message: String,
    },

    /// The request failed for good.
    #[snafu(display("Fetch failed: {message}"))]
    FetchFailed {
        /// Provider message.
        message: String,
    },
}

impl FetchError {
    /// True if the retry policy should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

/// Upstream API client.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the rows of `request`. Rows must carry the data type's entity
    /// code and date columns.
    async fn fetch(&self, request: &FetchRequest) -> Result<RecordBatch, FetchError>;
}

/// How often and how patiently a fetch is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Wait before retry `n` (1-based) is `backoff[n - 1]`; the last entry
    /// repeats.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(180),
            ],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Vec::new(),
        }
    }

    fn delay(&self, retry: u32) -> Duration {
        let idx = retry.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or(self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Result of one target in a build pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TargetOutcome {
    /// Fetched and written.
    Completed {
        /// Rows fetched.
        rows: usize,
    },
    /// The target's lease was held elsewhere.
    Skipped {
        /// Lock verdict.
        reason: String,
    },
    /// Fetch or write failed.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

impl fmt::Display for TargetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOutcome::Completed { rows } => write!(f, "completed ({rows} rows)"),
            TargetOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
            TargetOutcome::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Outcome of one work item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    /// The work item.
    pub item: WorkItem,
    /// What happened.
    pub outcome: TargetOutcome,
    /// Fetch attempts made.
    pub attempts: u32,
}

/// Result of [`BuildPass::run`].
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// Data type built.
    pub data_type: String,
    /// Requested dates.
    pub request: DateRange,
    /// One entry per work item, in decision order.
    pub items: Vec<ItemReport>,
}

impl BuildReport {
    /// Outcome per target. A target with several items is `Failed` if any
    /// failed, else `Skipped` if any was skipped, else `Completed` with the
    /// rows summed.
    pub fn by_target(&self) -> BTreeMap<Subject, TargetOutcome> {
        let mut out: BTreeMap<Subject, TargetOutcome> = BTreeMap::new();
        for report in &self.items {
            let merged = match (out.remove(&report.item.target), &report.outcome) {
                (None, outcome) => outcome.clone(),
                (Some(prev @ TargetOutcome::Failed { .. }), _) => prev,
                (Some(_), failed @ TargetOutcome::Failed { .. }) => failed.clone(),
                (Some(prev @ TargetOutcome::Skipped { .. }), _) => prev,
                (Some(_), skipped @ TargetOutcome::Skipped { .. }) => skipped.clone(),
                (Some(TargetOutcome::Completed { rows: a }), TargetOutcome::Completed { rows: b }) => {
                    TargetOutcome::Completed { rows: a + b }
                }
            };
            out.insert(report.item.target, merged);
        }
        out
    }

    /// True if every item completed.
    pub fn is_complete(&self) -> bool {
        self.items
            .iter()
            .all(|r| matches!(r.outcome, TargetOutcome::Completed { .. }))
    }
}

/// One build pass over a store.
pub struct BuildPass<'a> {
    store: &'a Store,
    fetcher: &'a dyn Fetcher,
    retry: RetryPolicy,
    universe: Option<Vec<EntityId>>,
}

impl<'a> BuildPass<'a> {
    /// A pass over `store` fetching through `fetcher` with the default
    /// retry policy.
    pub fn new(store: &'a Store, fetcher: &'a dyn Fetcher) -> Self {
        Self {
            store,
            fetcher,
            retry: RetryPolicy::default(),
            universe: None,
        }
    }

    /// Use `retry` for fetches.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Entities that should exist; members without coverage get `full`
    /// items.
    pub fn with_universe(mut self, universe: Vec<EntityId>) -> Self {
        self.universe = Some(universe);
        self
    }

    /// Bring `data_type` to full coverage of `request`.
    ///
    /// Errors only if the decision itself cannot be made; per-item problems
    /// are reported in the [`BuildReport`].
    pub async fn run(&self, data_type: &str, request: DateRange) -> Result<BuildReport, StoreError> {
        let items = self
            .store
            .decide(data_type, request, self.universe.as_deref())
            .await?;
        info!(
            "{data_type}: build pass over {}..={} with {} work item(s)",
            request.start,
            request.end,
            items.len()
        );

        let permits = Arc::new(Semaphore::new(self.store.config().max_in_flight));
        let runs = items.into_iter().map(|item| {
            let permits = Arc::clone(&permits);
            async move {
                let Ok(_permit) = permits.acquire().await else {
                    return ItemReport {
                        item,
                        outcome: TargetOutcome::Failed {
                            reason: "worker pool closed".to_string(),
                        },
                        attempts: 0,
                    };
                };
                self.run_item(item).await
            }
        });
        let reports = join_all(runs).await;

        for report in &reports {
            if !matches!(report.outcome, TargetOutcome::Completed { .. }) {
                warn!(
                    "{data_type}: {} {}..={}: {}",
                    report.item.target, report.item.range.start, report.item.range.end, report.outcome
                );
            }
        }

        Ok(BuildReport {
            data_type: data_type.to_string(),
            request,
            items: reports,
        })
    }

    async fn run_item(&self, item: WorkItem) -> ItemReport {
        let data_type = item.data_type.clone();
        let mut lease = match self
            .store
            .acquire_with_wait(&data_type, LockTarget::from(item.target))
            .await
        {
            Ok(lease) => lease,
            Err(StoreError::Lock {
                source: source @ LockError::Busy { .. },
            }) => {
                return ItemReport {
                    item,
                    outcome: TargetOutcome::Skipped {
                        reason: source.to_string(),
                    },
                    attempts: 0,
                };
            }
            Err(e) => {
                return ItemReport {
                    item,
                    outcome: TargetOutcome::Failed {
                        reason: e.to_string(),
                    },
                    attempts: 0,
                };
            }
        };

        let (outcome, attempts) = self.fetch_and_write(&item, &mut lease).await;

        if let Err(e) = self.store.release(lease) {
            warn!("{data_type}: releasing lease for {} failed: {e}", item.target);
        }
        ItemReport {
            item,
            outcome,
            attempts,
        }
    }

    async fn fetch_and_write(
        &self,
        item: &WorkItem,
        lease: &mut crate::lock::Lease,
    ) -> (TargetOutcome, u32) {
        let failed = |reason: String| TargetOutcome::Failed { reason };

        let entity_code = match self.entity_code(item).await {
            Ok(code) => code,
            Err(e) => return (failed(e.to_string()), 0),
        };
        let request = FetchRequest {
            data_type: item.data_type.clone(),
            entity_code,
            range: item.range,
        };

        let mut attempts = 0;
        let batch = loop {
            attempts += 1;
            match self.fetcher.fetch(&request).await {
                Ok(batch) => break batch,
                Err(e) if e.is_retryable() && attempts < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempts);
                    warn!(
                        "{}: attempt {attempts}/{} for {} failed ({e}); retrying in {delay:?}",
                        item.data_type, self.retry.max_attempts, item.target
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (failed(e.to_string()), attempts),
            }
        };

        // The fetch may have taken a while.
        if let Err(e) = self.store.renew(lease) {
            return (failed(e.to_string()), attempts);
        }

        let rows = batch.num_rows();
        match self.store.write(&item.data_type, lease, &batch).await {
            Ok(report) if report.is_complete() => (TargetOutcome::Completed { rows }, attempts),
            Ok(report) => {
                let reasons: Vec<String> = report
                    .problems()
                    .map(|p| match &p.outcome {
                        crate::writer::PartitionOutcome::Rejected(e)
                        | crate::writer::PartitionOutcome::Failed(e) => e.to_string(),
                        crate::writer::PartitionOutcome::Written { .. } => String::new(),
                    })
                    .collect();
                (failed(reasons.join("; ")), attempts)
            }
            Err(e) => (failed(e.to_string()), attempts),
        }
    }

    async fn entity_code(&self, item: &WorkItem) -> Result<Option<String>, StoreError> {
        match item.target {
            Subject::All => Ok(None),
            Subject::Entity(id) => {
                let namespace = &self.store.data_type(&item.data_type)?.entity_namespace;
                let registry = self.store.registry(namespace).await?;
                let code = registry
                    .lookup_code(id)
                    .await
                    .context(crate::store::RegistrySnafu)?;
                Ok(Some(code))
            }
        }
    }
}
