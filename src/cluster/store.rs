//! External lease / routing store.
//!
//! The distributed coordinator keeps two kinds of rows in a strongly
//! consistent external service: the lease row (who leads the cluster and
//! until when) and the routing row (which nodes own which slots). Both are
//! read with a version and written conditionally on that version, so two
//! nodes racing for the same row cannot both win.
//!
//! [`ClusterStore`] abstracts the backend, allowing for different
//! implementations (an in-process map for tests and single-host clusters, an
//! object store for production).

use crate::node::NodeId;
use crate::routing::SlotRange;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// The leadership grant stored in the lease table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: NodeId,
    /// Wall-clock expiry in milliseconds since the Unix epoch.
    pub lease_expiry_ms: u64,
}

impl LeaseRecord {
    pub fn new(owner: NodeId, lease: Duration) -> Self {
        Self {
            owner,
            lease_expiry_ms: now_ms() + lease.as_millis() as u64,
        }
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.lease_expiry_ms <= now_ms
    }
}

/// The slot assignment stored in the routing table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub generation: u64,
    pub ranges: Vec<SlotRange>,
}

/// A value read from the store together with the version to write against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: String,
}

/// Errors returned by cluster store backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A conditional write lost against a concurrent writer
    #[error("conditional write conflict")]
    Conflict,

    /// The backend cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the request
    #[error("store error: {0}")]
    Backend(String),

    /// A stored row could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Versioned access to the lease and routing rows of a cluster.
///
/// `expected` is the version returned by the matching load; `None` means the
/// row must not exist yet.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn load_lease(&self, cluster: &str) -> StoreResult<Option<Versioned<LeaseRecord>>>;

    async fn put_lease(
        &self,
        cluster: &str,
        record: &LeaseRecord,
        expected: Option<&str>,
    ) -> StoreResult<()>;

    async fn load_routing(&self, cluster: &str) -> StoreResult<Option<Versioned<RoutingSnapshot>>>;

    async fn put_routing(
        &self,
        cluster: &str,
        snapshot: &RoutingSnapshot,
        expected: Option<&str>,
    ) -> StoreResult<()>;
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-process store.
///
/// Several coordinators in the same process can share one instance to form
/// a cluster. The availability switch and artificial latency let tests
/// simulate outages and slow backends.
#[derive(Debug)]
pub struct MemoryClusterStore {
    leases: Mutex<HashMap<String, (LeaseRecord, u64)>>,
    routing: Mutex<HashMap<String, (RoutingSnapshot, u64)>>,
    next_version: AtomicU64,
    available: AtomicBool,
    latency: Mutex<Duration>,
}

impl Default for MemoryClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            routing: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    async fn enter(&self) -> StoreResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }
}

/// Applies a conditional write to one map row.
fn conditional_put<T: Clone>(
    rows: &mut HashMap<String, (T, u64)>,
    key: &str,
    value: &T,
    expected: Option<&str>,
    version: u64,
) -> StoreResult<()> {
    let current = rows.get(key).map(|(_, v)| v.to_string());
    if current.as_deref() != expected {
        return Err(StoreError::Conflict);
    }
    rows.insert(key.to_string(), (value.clone(), version));
    Ok(())
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn load_lease(&self, cluster: &str) -> StoreResult<Option<Versioned<LeaseRecord>>> {
        self.enter().await?;
        Ok(self.leases.lock().get(cluster).map(|(record, version)| Versioned {
            value: record.clone(),
            version: version.to_string(),
        }))
    }

    async fn put_lease(
        &self,
        cluster: &str,
        record: &LeaseRecord,
        expected: Option<&str>,
    ) -> StoreResult<()> {
        self.enter().await?;
        let version = self.bump();
        conditional_put(&mut self.leases.lock(), cluster, record, expected, version)
    }

    async fn load_routing(&self, cluster: &str) -> StoreResult<Option<Versioned<RoutingSnapshot>>> {
        self.enter().await?;
        Ok(self.routing.lock().get(cluster).map(|(snapshot, version)| Versioned {
            value: snapshot.clone(),
            version: version.to_string(),
        }))
    }

    async fn put_routing(
        &self,
        cluster: &str,
        snapshot: &RoutingSnapshot,
        expected: Option<&str>,
    ) -> StoreResult<()> {
        self.enter().await?;
        let version = self.bump();
        conditional_put(&mut self.routing.lock(), cluster, snapshot, expected, version)
    }
}
