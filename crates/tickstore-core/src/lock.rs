//! Lease-based mutual exclusion per `(data type, target)` key.
//!
//! A [`Lease`] is granted to exactly one holder at a time and carries an
//! opaque token plus an expiry. Once a lease expires any acquirer may
//! reclaim the key; the old holder then finds out through
//! [`LockManager::validate`], [`LockManager::renew`] or
//! [`LockManager::release`] returning [`LockError::NotOwner`].
//!
//! Time comes from a [`Clock`] so expiry can be driven by tests.
//!
//! Keys are independent of each other: a lease on [`LockTarget::All`] does
//! not exclude leases on [`LockTarget::Entity`] keys of the same data type.
//! An `All` refetch of an uncertain span may therefore run next to an
//! entity's tail fetch. Their writes still serialize per partition, because
//! the writer takes a [`LockTarget::Partition`] lease around every
//! read-merge-replace.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use snafu::prelude::*;
use tokio::{sync::Notify, time::Instant};

use crate::{layout::PartitionKey, registry::EntityId, scan::Subject};

/// Longest single sleep of a waiting acquirer before it re-checks the key.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors produced by the lock manager.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum LockError {
    /// Another holder has an unexpired lease on the key.
    #[snafu(display("Lock {key} is busy"))]
    Busy {
        /// Key that was requested.
        key: String,
    },

    /// The presented lease is not the current holder of its key.
    #[snafu(display("Lease on {key} is not held by the presenter"))]
    NotOwner {
        /// Key of the presented lease.
        key: String,
    },

    /// The presented lease is still the holder but has expired.
    #[snafu(display("Lease on {key} has expired"))]
    LeaseExpired {
        /// Key of the presented lease.
        key: String,
    },
}

/// What a lease protects within a data type.
///
/// Targets do not nest; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LockTarget {
    /// The whole data type.
    All,
    /// One entity's rows.
    Entity(EntityId),
    /// One partition file (held by the writer and compaction).
    Partition(PartitionKey),
}

impl From<Subject> for LockTarget {
    fn from(subject: Subject) -> Self {
        match subject {
            Subject::All => LockTarget::All,
            Subject::Entity(id) => LockTarget::Entity(id),
        }
    }
}

/// Identity of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LockKey {
    /// Data type the lock belongs to.
    pub data_type: String,
    /// Protected target.
    pub target: LockTarget,
}

impl LockKey {
    /// Build a key.
    pub fn new(data_type: impl Into<String>, target: LockTarget) -> Self {
        Self {
            data_type: data_type.into(),
            target,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            LockTarget::All => write!(f, "{}/all", self.data_type),
            LockTarget::Entity(id) => write!(f, "{}/entity={id}", self.data_type),
            LockTarget::Partition(key) => write!(f, "{}/partition={key}", self.data_type),
        }
    }
}

/// Source of monotonic time for lease expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// The runtime clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// A clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Proof of holding a key until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: LockKey,
    token: String,
    expires_at: Instant,
}

impl Lease {
    /// Key this lease holds.
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Opaque holder token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the lease stops being exclusive.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

#[derive(Debug, Clone)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// In-process lease table.
#[derive(Debug)]
pub struct LockManager {
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<LockKey, Held>>,
    released: Notify,
    seq: AtomicU64,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl LockManager {
    /// Create a manager driven by `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            held: Mutex::new(HashMap::new()),
            released: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<LockKey, Held>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn new_token(&self, key: &LockKey) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.to_string().as_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(&seq.to_le_bytes());
        hasher.update(&nanos.to_le_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }

    /// Try to take `key` for `ttl` without waiting.
    pub fn acquire(&self, key: LockKey, ttl: Duration) -> Result<Lease, LockError> {
        let now = self.clock.now();
        let mut table = self.table();
        if let Some(held) = table.get(&key) {
            ensure!(
                held.expires_at <= now,
                BusySnafu {
                    key: key.to_string()
                }
            );
        }
        let token = self.new_token(&key);
        let expires_at = now + ttl;
        table.insert(
            key.clone(),
            Held {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(Lease {
            key,
            token,
            expires_at,
        })
    }

    /// Take `key`, waiting up to `wait` for the current holder to release it
    /// or for its lease to expire.
    pub async fn acquire_with_wait(
        &self,
        key: LockKey,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Lease, LockError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.acquire(key.clone(), ttl) {
                Ok(lease) => return Ok(lease),
                Err(LockError::Busy { .. }) => {}
                Err(e) => return Err(e),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return BusySnafu {
                    key: key.to_string(),
                }
                .fail();
            }
            let nap = (deadline - now).min(WAIT_POLL_INTERVAL);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    fn check_holder<'t>(
        &self,
        table: &'t HashMap<LockKey, Held>,
        lease: &Lease,
    ) -> Result<&'t Held, LockError> {
        match table.get(&lease.key) {
            Some(held) if held.token == lease.token => Ok(held),
            _ => NotOwnerSnafu {
                key: lease.key.to_string(),
            }
            .fail(),
        }
    }

    /// Confirm that `lease` is the current, unexpired holder of its key.
    ///
    /// Expiry is read from the lease table, so a renewal made through a
    /// clone of the lease counts.
    pub fn validate(&self, lease: &Lease) -> Result<(), LockError> {
        let now = self.clock.now();
        let table = self.table();
        let held = self.check_holder(&table, lease)?;
        ensure!(
            held.expires_at > now,
            LeaseExpiredSnafu {
                key: lease.key.to_string()
            }
        );
        Ok(())
    }

    /// Extend `lease` to `ttl` from now.
    ///
    /// Fails with [`LockError::NotOwner`] if another acquirer reclaimed the
    /// key after the lease expired.
    pub fn renew(&self, lease: &mut Lease, ttl: Duration) -> Result<(), LockError> {
        let now = self.clock.now();
        let mut table = self.table();
        self.check_holder(&table, lease)?;
        let expires_at = now + ttl;
        if let Some(held) = table.get_mut(&lease.key) {
            held.expires_at = expires_at;
        }
        lease.expires_at = expires_at;
        Ok(())
    }

    /// Give `lease` up. Releasing an expired lease that nobody reclaimed
    /// succeeds.
    pub fn release(&self, lease: Lease) -> Result<(), LockError> {
        {
            let mut table = self.table();
            self.check_holder(&table, &lease)?;
            table.remove(&lease.key);
        }
        self.released.notify_waiters();
        Ok(())
    }

    /// Number of keys with a recorded holder (expired or not).
    pub fn held_count(&self) -> usize {
        self.table().len()
    }
}
