//! Node-Local Storage Engine with Admission Control
//!
//! This module implements the per-node table of id → [`Entry`] mappings.
//!
//! ## Design Decisions
//!
//! 1. **One Mutex**: The table and the allocation counters are protected by a
//!    single mutex. Operations are short key-value lookups, so coarse locking
//!    keeps the accounting exact without measurable contention.
//! 2. **Soft Budget**: Once usage reaches two thirds of the limit a
//!    capacity-pressure warning is raised, once per crossing.
//! 3. **Hard Limit**: A write that would push usage past the limit is
//!    rejected; reads keep being served.
//! 4. **No Routing**: The engine never consults the slot router; callers
//!    check ownership before touching it.
//!
//! ## Accounting
//!
//! ```text
//!   0 ─────────────── notify_threshold (2/3) ──────── alloc_limit
//!   │      quiet      │   pressure raised once   │ rejected │
//! ```

use crate::cluster::{Coordinator, PeerTable};
use crate::node::NodeId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Default bound on reading a handshake or the remainder of a frame.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A stored value together with its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: String,
    pub listing: Bytes,
}

impl Entry {
    pub fn new(id: impl Into<String>, listing: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            listing: listing.into(),
        }
    }

    /// Bytes charged against the allocation budget.
    #[inline]
    pub fn size(&self) -> u64 {
        (self.id.len() + self.listing.len()) as u64
    }
}

/// Errors returned by the storage engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The write would exceed the allocation limit
    #[error("allocation limit exceeded: {used} used + {incoming} incoming > {limit} bytes")]
    CapacityExceeded { used: u64, incoming: u64, limit: u64 },
}

/// Point-in-time view of the engine's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub entries: u64,
    pub alloc_used: u64,
    pub alloc_limit: u64,
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub rejected_writes: u64,
    pub pressure_events: u64,
}

/// State guarded by the table mutex.
#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, Entry>,
    alloc_used: u64,
    /// Set once usage crosses the notify threshold, cleared when it drops back.
    pressure_raised: bool,
}

/// The node-local database.
///
/// Wrap it in an `Arc` and share it across all connection handlers.
///
/// # Example
///
/// ```
/// use matchdb::cluster::{LocalMaster, PeerTable};
/// use matchdb::node::NodeId;
/// use matchdb::routing::{HashKey, SlotRouter};
/// use matchdb::storage::{Db, Entry};
/// use std::sync::Arc;
///
/// let router = Arc::new(SlotRouter::new(HashKey::new(1, 2)));
/// let id = NodeId::new("127.0.0.1", 8090).unwrap();
/// let db = Db::new(id, 1024 * 1024, Arc::new(LocalMaster::new(router)), Arc::new(PeerTable::new()));
///
/// db.set(Entry::new("a", "listing")).unwrap();
/// assert_eq!(db.get("a").unwrap().listing, "listing");
/// db.delete("a").unwrap();
/// assert!(db.get("a").is_none());
/// ```
pub struct Db {
    node_id: NodeId,
    alloc_limit: u64,
    notify_threshold: u64,
    coordinator: Arc<dyn Coordinator>,
    table: Mutex<Table>,
    seen: Arc<PeerTable>,
    request_timeout: Duration,

    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    rejected_count: AtomicU64,
    pressure_count: AtomicU64,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("node_id", &self.node_id)
            .field("alloc_limit", &self.alloc_limit)
            .field("alloc_used", &self.table.lock().alloc_used)
            .finish()
    }
}

impl Db {
    /// Creates an empty database with an allocation limit in bytes.
    pub fn new(
        node_id: NodeId,
        alloc_limit: u64,
        coordinator: Arc<dyn Coordinator>,
        seen: Arc<PeerTable>,
    ) -> Self {
        Self {
            node_id,
            alloc_limit,
            notify_threshold: (alloc_limit as u128 * 2 / 3) as u64,
            coordinator,
            table: Mutex::new(Table::default()),
            seen,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
            pressure_count: AtomicU64::new(0),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn notify_threshold(&self) -> u64 {
        self.notify_threshold
    }

    /// Whether this node currently holds cluster leadership.
    pub fn is_master(&self) -> bool {
        self.coordinator.is_self()
    }

    /// Local lookup. Does not check slot ownership.
    pub fn get(&self, id: &str) -> Option<Entry> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.table.lock().entries.get(id).cloned()
    }

    /// Stores an entry, replacing any existing entry with the same id.
    ///
    /// The write is admitted against the net change in usage: the size of
    /// a replaced entry is released before the new one is charged.
    pub fn set(&self, entry: Entry) -> Result<(), StorageError> {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let incoming = entry.size();
        let mut table = self.table.lock();
        let released = table.entries.get(&entry.id).map_or(0, Entry::size);
        let base = table.alloc_used - released;

        if base.saturating_add(incoming) > self.alloc_limit {
            self.rejected_count.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::CapacityExceeded {
                used: table.alloc_used,
                incoming,
                limit: self.alloc_limit,
            });
        }

        table.alloc_used = base + incoming;
        table.entries.insert(entry.id.clone(), entry);
        self.check_pressure(&mut table);
        Ok(())
    }

    /// Removes an entry. Deleting an absent id is not an error.
    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut table = self.table.lock();
        if let Some(old) = table.entries.remove(id) {
            table.alloc_used -= old.size();
            self.check_pressure(&mut table);
        }
        Ok(())
    }

    /// Liveness check; never touches the table.
    pub fn ping(&self) -> &'static str {
        "PONG"
    }

    /// Records a health check from a peer.
    pub fn heartbeat(&self, peer: NodeId) {
        self.seen.touch(peer);
    }

    /// Records a renew from a store node; only these own slots.
    pub fn renew(&self, peer: NodeId) {
        self.seen.renew(peer);
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.seen
    }

    pub fn len(&self) -> u64 {
        self.table.lock().entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn alloc_used(&self) -> u64 {
        self.table.lock().alloc_used
    }

    pub fn stats(&self) -> StorageStats {
        let (entries, alloc_used) = {
            let table = self.table.lock();
            (table.entries.len() as u64, table.alloc_used)
        };
        StorageStats {
            entries,
            alloc_used,
            alloc_limit: self.alloc_limit,
            gets: self.get_count.load(Ordering::Relaxed),
            sets: self.set_count.load(Ordering::Relaxed),
            deletes: self.del_count.load(Ordering::Relaxed),
            rejected_writes: self.rejected_count.load(Ordering::Relaxed),
            pressure_events: self.pressure_count.load(Ordering::Relaxed),
        }
    }

    /// Raises the pressure signal on an upward crossing and re-arms it once
    /// usage is back under the threshold. Caller holds the table lock.
    fn check_pressure(&self, table: &mut Table) {
        if table.alloc_used >= self.notify_threshold {
            if !table.pressure_raised {
                table.pressure_raised = true;
                self.pressure_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    used = table.alloc_used,
                    limit = self.alloc_limit,
                    threshold = self.notify_threshold,
                    "Allocation usage crossed two thirds of the limit"
                );
            }
        } else if table.pressure_raised {
            table.pressure_raised = false;
            info!(
                used = table.alloc_used,
                threshold = self.notify_threshold,
                "Allocation usage back under the pressure threshold"
            );
        }
    }
}
