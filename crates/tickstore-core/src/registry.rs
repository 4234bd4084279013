//! Identifier registry: permanent integer IDs for external entity codes.
//!
//! Each namespace (`instrument`, `industry`, ...) has its own journal at
//! `_registry/<namespace>.jsonl`, one `{"id":..,"code":..}` record per line.
//! The journal is the only durable state: loading replays it, allocation
//! appends to it and syncs before the new ID becomes visible.
//!
//! Guarantees:
//! - an ID, once handed out, is never reassigned or reused;
//! - IDs are allocated sequentially from 1 within a namespace;
//! - allocation is linearizable (one writer at a time, readers in parallel);
//! - a failed durable write leaves the in-memory state untouched.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::sync::RwLock;

use crate::{
    layout::{self, LayoutError},
    storage::{self, StorageError, StoreLocation},
};

/// Permanent entity identifier.
pub type EntityId = u32;

/// First ID handed out in an empty namespace.
pub const FIRST_ENTITY_ID: EntityId = 1;

/// Errors produced by the identifier registry.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistryError {
    /// The journal could not be appended to or rewritten.
    #[snafu(display("Failed to persist registry {namespace:?}: {source}"))]
    RegistryWriteFailed {
        /// Namespace being written.
        namespace: String,
        /// Underlying storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// Reverse lookup of an ID that was never allocated.
    #[snafu(display("Entity id {id} is not registered in namespace {namespace:?}"))]
    NotFound {
        /// Namespace searched.
        namespace: String,
        /// Unknown ID.
        id: EntityId,
    },

    /// The journal exists but could not be read.
    #[snafu(display("Failed to read registry {namespace:?}: {source}"))]
    ReadJournal {
        /// Namespace being loaded.
        namespace: String,
        /// Underlying storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// A complete journal line is malformed or contradicts earlier lines.
    #[snafu(display("Corrupt registry journal {namespace:?} at line {line}: {reason}"))]
    CorruptJournal {
        /// Namespace being loaded.
        namespace: String,
        /// 1-based line number.
        line: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// The namespace cannot be used as a file name.
    #[snafu(display("Invalid registry namespace: {source}"))]
    InvalidNamespace {
        /// Underlying validation error.
        source: LayoutError,
    },

    /// Entity codes must be non-empty.
    #[snafu(display("Empty entity code in namespace {namespace:?}"))]
    EmptyCode {
        /// Namespace being written.
        namespace: String,
    },

    /// The ID space of the namespace is exhausted.
    #[snafu(display("Entity id space exhausted in namespace {namespace:?}"))]
    IdSpaceExhausted {
        /// Namespace being written.
        namespace: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    id: EntityId,
    code: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    by_code: HashMap<String, EntityId>,
    by_id: BTreeMap<EntityId, String>,
    next_id: EntityId,
    // Set after a failed append: the journal may end in a partial line and
    // must be rewritten from memory before the next append.
    needs_rewrite: bool,
}

impl RegistryState {
    fn empty() -> Self {
        Self {
            next_id: FIRST_ENTITY_ID,
            ..Self::default()
        }
    }

    fn render_journal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (id, code) in &self.by_id {
            push_record(&mut out, *id, code);
        }
        out
    }
}

fn push_record(out: &mut Vec<u8>, id: EntityId, code: &str) {
    let record = JournalRecord {
        id,
        code: code.to_string(),
    };
    // Serializing a struct of an integer and a string cannot fail.
    if let Ok(line) = serde_json::to_vec(&record) {
        out.extend_from_slice(&line);
        out.push(b'\n');
    }
}

/// Outcome of [`Registry::sync_codes`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Number of codes in the upstream list (after de-duplication).
    pub total: usize,
    /// Codes that were seen for the first time, with their new IDs.
    pub allocated: Vec<(String, EntityId)>,
    /// Known codes absent from the upstream list. They keep their IDs.
    pub retired: Vec<(String, EntityId)>,
}

/// Persistent, bidirectional code <-> ID mapping for one namespace.
#[derive(Debug)]
pub struct Registry {
    location: StoreLocation,
    namespace: String,
    state: RwLock<RegistryState>,
}

impl Registry {
    /// Rebuild the registry for `namespace` from its journal.
    ///
    /// Without a journal the registry is empty and its counter is at
    /// [`FIRST_ENTITY_ID`]; nothing is written. A torn trailing line left
    /// by a crash during append is dropped and the journal rewritten
    /// without it.
    pub async fn load(location: StoreLocation, namespace: &str) -> Result<Self, RegistryError> {
        layout::validate_name("namespace", namespace).context(InvalidNamespaceSnafu)?;
        let rel = layout::journal_rel_path(namespace);

        let text = match storage::read_to_string(&location, &rel).await {
            Ok(text) => Some(text),
            Err(StorageError::NotFound { .. }) => None,
            Err(source) => {
                return Err(source).context(ReadJournalSnafu { namespace });
            }
        };

        let mut state = RegistryState::empty();
        if let Some(text) = text {
            let torn = replay_journal(namespace, &text, &mut state)?;
            if torn {
                warn!(
                    "registry {namespace}: discarding torn trailing journal line; rewriting {}",
                    rel.display()
                );
                storage::write_atomic(&location, &rel, &state.render_journal())
                    .await
                    .context(RegistryWriteFailedSnafu { namespace })?;
            }
        }

        Ok(Self {
            location,
            namespace: namespace.to_string(),
            state: RwLock::new(state),
        })
    }

    /// Namespace this registry serves.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// True iff the namespace has durable state (its journal exists).
    pub async fn is_initialized(&self) -> Result<bool, RegistryError> {
        storage::exists(&self.location, &layout::journal_rel_path(&self.namespace))
            .await
            .context(ReadJournalSnafu {
                namespace: &self.namespace,
            })
    }

    /// Number of registered entities.
    pub async fn len(&self) -> usize {
        self.state.read().await.by_id.len()
    }

    /// True if no entity has been registered.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.by_id.is_empty()
    }

    /// All `(id, code)` pairs in ID order.
    pub async fn entries(&self) -> Vec<(EntityId, String)> {
        let state = self.state.read().await;
        state
            .by_id
            .iter()
            .map(|(id, code)| (*id, code.clone()))
            .collect()
    }

    /// Read-only forward lookup; never allocates.
    pub async fn lookup_id(&self, code: &str) -> Option<EntityId> {
        self.state.read().await.by_code.get(code).copied()
    }

    /// Reverse lookup.
    pub async fn lookup_code(&self, id: EntityId) -> Result<String, RegistryError> {
        let state = self.state.read().await;
        state.by_id.get(&id).cloned().context(NotFoundSnafu {
            namespace: &self.namespace,
            id,
        })
    }

    /// Permanent ID of `code`, allocating the next one if it is new.
    ///
    /// A newly allocated ID is durable before this returns.
    pub async fn resolve(&self, code: &str) -> Result<EntityId, RegistryError> {
        let ids = self.resolve_many(&[code]).await?;
        Ok(ids[0])
    }

    /// Resolve a batch of codes with at most one journal append.
    ///
    /// Returns IDs in input order. Repeated codes get the same ID.
    pub async fn resolve_many<S: AsRef<str>>(
        &self,
        codes: &[S],
    ) -> Result<Vec<EntityId>, RegistryError> {
        {
            let state = self.state.read().await;
            let known: Option<Vec<EntityId>> = codes
                .iter()
                .map(|c| state.by_code.get(c.as_ref()).copied())
                .collect();
            if let Some(ids) = known {
                return Ok(ids);
            }
        }

        let mut state = self.state.write().await;
        self.allocate_locked(&mut state, codes).await
    }

    /// Allocate IDs for the unseen codes of `codes` while the caller holds
    /// the write section. Returns IDs in input order.
    async fn allocate_locked<S: AsRef<str>>(
        &self,
        state: &mut RegistryState,
        codes: &[S],
    ) -> Result<Vec<EntityId>, RegistryError> {
        // Plan allocations without touching the state.
        let mut pending: Vec<(EntityId, &str)> = Vec::new();
        let mut pending_ids: HashMap<&str, EntityId> = HashMap::new();
        let mut ids = Vec::with_capacity(codes.len());
        let mut next = state.next_id;
        for code in codes {
            let code = code.as_ref();
            ensure!(
                !code.is_empty(),
                EmptyCodeSnafu {
                    namespace: &self.namespace
                }
            );
            if let Some(id) = state.by_code.get(code).or_else(|| pending_ids.get(code)) {
                ids.push(*id);
                continue;
            }
            pending.push((next, code));
            pending_ids.insert(code, next);
            ids.push(next);
            next = next.checked_add(1).context(IdSpaceExhaustedSnafu {
                namespace: &self.namespace,
            })?;
        }

        if !pending.is_empty() {
            self.persist(state, &pending).await?;
            for (id, code) in &pending {
                state.by_code.insert(code.to_string(), *id);
                state.by_id.insert(*id, code.to_string());
            }
            state.next_id = next;
        }
        Ok(ids)
    }

    async fn persist(
        &self,
        state: &mut RegistryState,
        pending: &[(EntityId, &str)],
    ) -> Result<(), RegistryError> {
        let rel = layout::journal_rel_path(&self.namespace);

        let result = if state.needs_rewrite {
            let mut bytes = state.render_journal();
            for (id, code) in pending {
                push_record(&mut bytes, *id, code);
            }
            storage::write_atomic(&self.location, &rel, &bytes).await
        } else {
            let mut bytes = Vec::new();
            for (id, code) in pending {
                push_record(&mut bytes, *id, code);
            }
            storage::append_durable(&self.location, &rel, &bytes).await
        };

        match result {
            Ok(()) => {
                state.needs_rewrite = false;
                Ok(())
            }
            Err(source) => {
                state.needs_rewrite = true;
                Err(source).context(RegistryWriteFailedSnafu {
                    namespace: &self.namespace,
                })
            }
        }
    }

    /// Resolve a full upstream code list and report what changed.
    ///
    /// The namespace is initialized even when `codes` is empty.
    pub async fn sync_codes<S: AsRef<str>>(&self, codes: &[S]) -> Result<SyncReport, RegistryError> {
        let mut seen: Vec<&str> = Vec::with_capacity(codes.len());
        let mut unique = std::collections::HashSet::new();
        for code in codes {
            if unique.insert(code.as_ref()) {
                seen.push(code.as_ref());
            }
        }

        // Snapshot and allocation share one write section, so a code
        // allocated by a concurrent caller is never reported here.
        let (before, ids) = {
            let mut state = self.state.write().await;
            let before: HashMap<String, EntityId> = state.by_code.clone();
            let ids = self.allocate_locked(&mut state, &seen).await?;
            (before, ids)
        };

        if !self.is_initialized().await? {
            let rel = layout::journal_rel_path(&self.namespace);
            match storage::write_new(&self.location, &rel, b"").await {
                Ok(()) | Err(StorageError::AlreadyExists { .. }) => {}
                Err(source) => {
                    return Err(source).context(RegistryWriteFailedSnafu {
                        namespace: &self.namespace,
                    });
                }
            }
        }

        let allocated: Vec<(String, EntityId)> = seen
            .iter()
            .zip(&ids)
            .filter(|(code, _)| !before.contains_key(**code))
            .map(|(code, id)| (code.to_string(), *id))
            .collect();

        let mut retired: Vec<(String, EntityId)> = before
            .into_iter()
            .filter(|(code, _)| !unique.contains(code.as_str()))
            .collect();
        retired.sort_by_key(|(_, id)| *id);

        if !allocated.is_empty() {
            info!(
                "registry {}: allocated {} new ids during sync",
                self.namespace,
                allocated.len()
            );
        }

        Ok(SyncReport {
            total: seen.len(),
            allocated,
            retired,
        })
    }
}

/// Lazily loaded registries of a store, one per namespace.
///
/// Every caller of [`Registries::get`] for the same namespace shares one
/// [`Registry`], so allocation stays linearizable across writers.
#[derive(Debug)]
pub struct Registries {
    location: StoreLocation,
    loaded: tokio::sync::Mutex<HashMap<String, Arc<Registry>>>,
}

impl Registries {
    /// Registries rooted at `location`. Nothing is loaded yet.
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            loaded: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The registry of `namespace`, loading it on first use.
    pub async fn get(&self, namespace: &str) -> Result<Arc<Registry>, RegistryError> {
        let mut loaded = self.loaded.lock().await;
        if let Some(registry) = loaded.get(namespace) {
            return Ok(Arc::clone(registry));
        }
        let registry = Arc::new(Registry::load(self.location.clone(), namespace).await?);
        loaded.insert(namespace.to_string(), Arc::clone(&registry));
        Ok(registry)
    }
}

/// Replay journal text into `state`. Returns true if a torn trailing line
/// was dropped.
fn replay_journal(
    namespace: &str,
    text: &str,
    state: &mut RegistryState,
) -> Result<bool, RegistryError> {
    let complete = text.ends_with('\n') || text.is_empty();
    let lines: Vec<&str> = text.split('\n').collect();
    // `split` yields a trailing "" after the final newline.
    let last_index = lines.len().saturating_sub(1);
    let mut torn = false;

    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let is_tail = idx == last_index && !complete;

        let record: JournalRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) if is_tail => {
                torn = true;
                break;
            }
            Err(e) => {
                return CorruptJournalSnafu {
                    namespace,
                    line: line_no,
                    reason: e.to_string(),
                }
                .fail();
            }
        };

        ensure!(
            !record.code.is_empty(),
            CorruptJournalSnafu {
                namespace,
                line: line_no,
                reason: "empty code",
            }
        );
        ensure!(
            record.id >= FIRST_ENTITY_ID && !state.by_id.contains_key(&record.id),
            CorruptJournalSnafu {
                namespace,
                line: line_no,
                reason: format!("id {} reused or out of range", record.id),
            }
        );
        ensure!(
            !state.by_code.contains_key(&record.code),
            CorruptJournalSnafu {
                namespace,
                line: line_no,
                reason: format!("code {:?} registered twice", record.code),
            }
        );

        state.next_id = state.next_id.max(record.id.saturating_add(1));
        state.by_code.insert(record.code.clone(), record.id);
        state.by_id.insert(record.id, record.code);
    }

    // A complete final line that merely lacks its newline still needs one
    // before the next append.
    if !complete && !torn {
        torn = true;
    }
    Ok(torn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{path::Path, sync::Arc};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn ids_are_sequential_and_stable() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let reg = Registry::load(location.clone(), "instrument").await?;
        assert!(!reg.is_initialized().await?);
        assert_eq!(reg.resolve("000001.SZ").await?, 1);
        assert_eq!(reg.resolve("600000.SH").await?, 2);
        assert_eq!(reg.resolve("000001.SZ").await?, 1);
        assert!(reg.is_initialized().await?);
        assert_eq!(reg.lookup_code(2).await?, "600000.SH");
        assert_eq!(reg.lookup_id("nope").await, None);
        assert!(matches!(
            reg.lookup_code(99).await,
            Err(RegistryError::NotFound { id: 99, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn reload_restores_mapping_and_counter() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        {
            let reg = Registry::load(location.clone(), "instrument").await?;
            reg.resolve_many(&["A", "B", "C"]).await?;
        }

        let reg = Registry::load(location.clone(), "instrument").await?;
        assert_eq!(reg.lookup_id("B").await, Some(2));
        assert_eq!(reg.resolve("D").await?, 4);

        // Load is side-effect free when the journal is intact.
        let before = storage::read_all_bytes(&location, &layout::journal_rel_path("instrument")).await?;
        let _again = Registry::load(location.clone(), "instrument").await?;
        let after = storage::read_all_bytes(&location, &layout::journal_rel_path("instrument")).await?;
        assert_eq!(before, after);
        Ok(())
    }

    #[tokio::test]
    async fn torn_tail_is_discarded_and_repaired() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel = layout::journal_rel_path("industry");
        storage::write_atomic(
            &location,
            &rel,
            b"{\"id\":1,\"code\":\"bank\"}\n{\"id\":2,\"co",
        )
        .await?;

        let reg = Registry::load(location.clone(), "industry").await?;
        assert_eq!(reg.len().await, 1);
        assert_eq!(
            storage::read_to_string(&location, &rel).await?,
            "{\"id\":1,\"code\":\"bank\"}\n"
        );
        assert_eq!(reg.resolve("steel").await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_middle_line_is_an_error() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        storage::write_atomic(
            &location,
            &layout::journal_rel_path("region"),
            b"{\"id\":1,\"code\":\"a\"}\ngarbage\n{\"id\":2,\"code\":\"b\"}\n",
        )
        .await?;

        let err = Registry::load(location, "region").await.expect_err("corrupt");
        assert!(matches!(err, RegistryError::CorruptJournal { line: 2, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn failed_append_does_not_advance_counter() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let reg = Registry::load(location.clone(), "instrument").await?;
        assert_eq!(reg.resolve("A").await?, 1);

        // Replace the journal with a directory so appends fail.
        let journal = tmp.path().join("_registry/instrument.jsonl");
        std::fs::remove_file(&journal)?;
        std::fs::create_dir(&journal)?;

        let err = reg.resolve("B").await.expect_err("append must fail");
        assert!(matches!(err, RegistryError::RegistryWriteFailed { .. }));
        assert_eq!(reg.lookup_id("B").await, None);
        assert_eq!(reg.len().await, 1);

        std::fs::remove_dir(&journal)?;
        assert_eq!(reg.resolve("B").await?, 2);

        let reloaded = Registry::load(location, "instrument").await?;
        assert_eq!(reloaded.entries().await, vec![(1, "A".to_string()), (2, "B".to_string())]);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_resolves_are_linearizable() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let reg = Arc::new(Registry::load(location.clone(), "instrument").await?);

        let mut handles = Vec::new();
        for task in 0..16u32 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                let mut out = Vec::new();
                for i in 0..20u32 {
                    let code = format!("E{}", (i + task) % 25);
                    out.push((code.clone(), reg.resolve(&code).await?));
                }
                Ok::<_, RegistryError>(out)
            }));
        }

        let mut seen: HashMap<String, EntityId> = HashMap::new();
        for h in handles {
            for (code, id) in h.await?? {
                let prev = seen.insert(code, id);
                assert!(prev.is_none() || prev == Some(id));
            }
        }

        let mut ids: Vec<EntityId> = seen.values().copied().collect();
        ids.sort_unstable();
        let expected: Vec<EntityId> = (1..=seen.len() as u32).collect();
        assert_eq!(ids, expected);

        let reloaded = Registry::load(location, "instrument").await?;
        for (code, id) in &seen {
            assert_eq!(reloaded.lookup_id(code).await, Some(*id));
        }
        Ok(())
    }

    #[tokio::test]
    async fn sync_reports_new_and_retired_codes() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let reg = Registry::load(location.clone(), "instrument").await?;

        let empty: [&str; 0] = [];
        let first = reg.sync_codes(&empty).await?;
        assert_eq!(first.total, 0);
        assert!(reg.is_initialized().await?);
        assert!(tmp.path().join(Path::new("_registry/instrument.jsonl")).exists());

        let report = reg.sync_codes(&["A", "B", "A"]).await?;
        assert_eq!(report.total, 2);
        assert_eq!(report.allocated, vec![("A".to_string(), 1), ("B".to_string(), 2)]);

        let report = reg.sync_codes(&["B", "C"]).await?;
        assert_eq!(report.allocated, vec![("C".to_string(), 3)]);
        assert_eq!(report.retired, vec![("A".to_string(), 1)]);
        assert_eq!(reg.lookup_id("A").await, Some(1));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_syncs_report_each_allocation_once() -> TestResult {
        let tmp = TempDir::new()?;
        let reg = Arc::new(Registry::load(StoreLocation::local(tmp.path()), "instrument").await?);
        let codes: Vec<String> = (0..40).map(|i| format!("{i:06}.SZ")).collect();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let codes = codes.clone();
                tokio::spawn(async move { reg.sync_codes(&codes).await })
            })
            .collect();
        let mut reported: Vec<(String, EntityId)> = Vec::new();
        for h in handles {
            reported.extend(h.await??.allocated);
        }

        reported.sort_by_key(|(_, id)| *id);
        assert_eq!(reported.len(), codes.len());
        for (code, id) in &reported {
            assert_eq!(reg.lookup_id(code).await, Some(*id));
        }
        Ok(())
    }

    #[tokio::test]
    async fn rejects_bad_namespace_and_empty_code() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        assert!(matches!(
            Registry::load(location.clone(), "../x").await,
            Err(RegistryError::InvalidNamespace { .. })
        ));
        let reg = Registry::load(location, "instrument").await?;
        assert!(matches!(
            reg.resolve("").await,
            Err(RegistryError::EmptyCode { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn registries_share_one_instance_per_namespace() -> TestResult {
        let tmp = TempDir::new()?;
        let registries = Registries::new(StoreLocation::local(tmp.path()));

        let a = registries.get("instrument").await?;
        let b = registries.get("instrument").await?;
        assert!(Arc::ptr_eq(&a, &b));
        a.resolve("A").await?;
        assert_eq!(b.lookup_id("A").await, Some(1));

        let other = registries.get("industry").await?;
        assert_eq!(other.resolve("Banks").await?, 1);
        Ok(())
    }
}
