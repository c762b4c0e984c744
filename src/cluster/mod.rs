//! Cluster Coordinator
//!
//! Decides whether this process is the cluster leader and keeps the slot
//! routing table in sync. Call sites only ever see the [`Coordinator`]
//! trait; the deployment mode is chosen once at startup.
//!
//! ## Implementations
//!
//! - [`LocalMaster`]: single node, always the leader, owns every slot
//! - [`DistributedMaster`]: leases leadership and synchronises routing
//!   through an external [`ClusterStore`]
//!
//! ## Stores
//!
//! - [`MemoryClusterStore`]: in-process rows for tests and demos
//! - [`ObjectClusterStore`]: S3-compatible buckets with ETag conditional writes

pub mod distributed;
pub mod local;
pub mod object;
pub mod peers;
pub mod store;

pub use distributed::{DistributedConfig, DistributedMaster};
pub use local::LocalMaster;
pub use object::{ObjectClusterStore, ObjectStoreSettings};
pub use peers::PeerTable;
pub use store::{
    ClusterStore, LeaseRecord, MemoryClusterStore, RoutingSnapshot, StoreError, StoreResult,
    Versioned,
};

use crate::node::NodeId;
use async_trait::async_trait;

/// Leadership and routing coordination.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Whether this process currently leads the cluster.
    fn is_self(&self) -> bool;

    /// Runs the coordination loop for the lifetime of the process. Returns
    /// immediately when there is nothing to coordinate.
    async fn run(&self, self_id: NodeId);
}
