//! Node assembly.
//!
//! [`Server`] wires one node together: it binds the store port, derives the
//! node id from the bound address, builds the database and the coordinator,
//! and then serves connections until the listener fails.
//!
//! ```text
//!   Config ──> bind ──> NodeId ──> SlotRouter + PeerTable
//!                                     │
//!                     ┌───────────────┴──────────────┐
//!                     ▼                              ▼
//!              Coordinator task                Db + accept_loop
//! ```

use crate::cluster::{
    ClusterStore, Coordinator, DistributedConfig, DistributedMaster, LocalMaster,
    ObjectClusterStore, PeerTable, StoreError,
};
use crate::commands::CommandHandler;
use crate::config::{ClusterMode, Config};
use crate::connection::{accept_loop, ConnectionStats};
use crate::node::NodeId;
use crate::routing::SlotRouter;
use crate::storage::Db;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// Fatal startup errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    #[error("listener address is not IPv4: {0}")]
    NotIpv4(SocketAddr),

    #[error("cannot advertise the unspecified address {0}")]
    Unspecified(SocketAddrV4),

    #[error("cluster store: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the node takes part in the cluster.
pub enum Coordination {
    Local,
    Distributed(DistributedConfig, Arc<dyn ClusterStore>),
}

/// A bound, ready-to-serve node.
pub struct Server {
    listener: TcpListener,
    node_id: NodeId,
    router: Arc<SlotRouter>,
    db: Arc<Db>,
    /// Coordinator that still has a loop to run
    background: Option<Arc<dyn Coordinator>>,
    stats: Arc<ConnectionStats>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("node_id", &self.node_id)
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Binds with the coordinator selected by the configuration.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let coordination = match &config.mode {
            ClusterMode::Local => Coordination::Local,
            ClusterMode::Distributed {
                coordination,
                store,
            } => {
                let store: Arc<dyn ClusterStore> =
                    Arc::new(ObjectClusterStore::from_settings(store)?);
                Coordination::Distributed(coordination.clone(), store)
            }
        };
        Self::bind_with(config, coordination).await
    }

    /// Binds with an explicit coordination backend.
    pub async fn bind_with(
        config: &Config,
        coordination: Coordination,
    ) -> Result<Self, ServerError> {
        let requested = config.bind_addr();
        if requested.ip().is_unspecified() {
            return Err(ServerError::Unspecified(requested));
        }
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| ServerError::Bind {
                addr: requested,
                source,
            })?;

        let bound = match listener.local_addr()? {
            SocketAddr::V4(addr) => addr,
            other => return Err(ServerError::NotIpv4(other)),
        };
        let node_id = NodeId::for_addr(bound);

        let router = Arc::new(SlotRouter::new(config.hash_key));
        let peers = Arc::new(PeerTable::new());

        let (coordinator, background) = match coordination {
            Coordination::Local => {
                let local: Arc<dyn Coordinator> = Arc::new(LocalMaster::new(Arc::clone(&router)));
                // Nothing to keep running: assign every slot before serving.
                local.run(node_id).await;
                (local, None)
            }
            Coordination::Distributed(settings, store) => {
                let master: Arc<dyn Coordinator> = Arc::new(DistributedMaster::new(
                    settings,
                    store,
                    Arc::clone(&router),
                    Arc::clone(&peers),
                ));
                (Arc::clone(&master), Some(master))
            }
        };

        let db = Db::new(node_id, config.alloc_limit_bytes, coordinator, peers)
            .with_request_timeout(config.request_timeout);

        info!(
            addr = %bound,
            node = %node_id,
            alloc_limit = config.alloc_limit_bytes,
            distributed = background.is_some(),
            "Node bound"
        );

        Ok(Self {
            listener,
            node_id,
            router,
            db: Arc::new(db),
            background,
            stats: Arc::new(ConnectionStats::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.node_id.addr()
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn router(&self) -> &Arc<SlotRouter> {
        &self.router
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Starts the coordinator loop and serves connections. Returns only
    /// when the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        if let Some(coordinator) = self.background {
            let node_id = self.node_id;
            tokio::spawn(async move {
                coordinator.run(node_id).await;
            });
        }

        info!(addr = %self.node_id.addr(), "Accepting connections");
        let handler = CommandHandler::new(self.db, self.router);
        accept_loop(self.listener, handler, self.stats).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::cluster::MemoryClusterStore;
    use crate::protocol::Status;
    use crate::routing::HashKey;
    use std::time::Duration;

    fn config(alloc_limit_kb: u64) -> Config {
        Config {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            alloc_limit_bytes: alloc_limit_kb * 1024,
            hash_key: HashKey::from_hex("00112233445566778899aabbccddeeff").unwrap(),
            request_timeout: Duration::from_secs(1),
            mode: ClusterMode::Local,
        }
    }

    fn coordination(store: &Arc<MemoryClusterStore>) -> Coordination {
        let store: Arc<dyn ClusterStore> = store.clone();
        Coordination::Distributed(
            DistributedConfig {
                cluster_id: "server-test".to_string(),
                master_timeout: Duration::from_millis(300),
                routing_timeout: Duration::from_millis(100),
                dead_node_timeout: Duration::from_millis(900),
                replicas: 1,
            },
            store,
        )
    }

    #[tokio::test]
    async fn test_single_node_scenario() {
        let server = Server::bind_with(&config(1024), Coordination::Local)
            .await
            .unwrap();
        let addr = SocketAddr::V4(server.local_addr());
        let db = Arc::clone(server.db());
        assert!(db.is_master());
        tokio::spawn(server.run());

        let me = NodeId::new("127.0.0.1", 7000).unwrap();
        let mut client = Client::connect(addr, me).await.unwrap();

        assert_eq!(client.set("a", vec![1u8; 100]).await.unwrap().status, Status::Ok);
        let reply = client.get("a").await.unwrap();
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.payload.len(), 100);

        let reply = client.set("a2", vec![0u8; 2 * 1024 * 1024]).await.unwrap();
        assert_eq!(reply.status, Status::Capacity);

        assert_eq!(client.delete("a").await.unwrap().status, Status::Ok);
        assert_eq!(client.get("a").await.unwrap().status, Status::NotFound);
        assert_eq!(db.stats().rejected_writes, 1);
    }

    #[tokio::test]
    async fn test_port_in_use_is_fatal() {
        let first = Server::bind_with(&config(1024), Coordination::Local)
            .await
            .unwrap();
        let mut taken = config(1024);
        taken.port = first.local_addr().port();

        let result = Server::bind_with(&taken, Coordination::Local).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_wildcard_address_is_rejected() {
        let mut wildcard = config(1024);
        wildcard.host = "0.0.0.0".parse().unwrap();
        let result = Server::bind_with(&wildcard, Coordination::Local).await;
        assert!(matches!(result, Err(ServerError::Unspecified(_))));
    }

    #[tokio::test]
    async fn test_pinging_client_never_owns_slots() {
        let store = Arc::new(MemoryClusterStore::new());
        let server = Server::bind_with(&config(1024), coordination(&store))
            .await
            .unwrap();
        let node_addr = server.local_addr();
        let router = Arc::clone(server.router());
        tokio::spawn(server.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while router.snapshot().members().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no routing table");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let health_check = NodeId::new("127.0.0.1", 1).unwrap();
        let mut client = Client::connect(SocketAddr::V4(node_addr), health_check)
            .await
            .unwrap();
        assert_eq!(client.ping().await.unwrap().status, Status::Ok);

        // Several routing rounds pass; the table still holds only the node.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let members = router.snapshot().members();
        assert!(!members.contains(&health_check.addr()));
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![node_addr]);
    }

    #[tokio::test]
    async fn test_two_node_cluster_converges() {
        let store = Arc::new(MemoryClusterStore::new());
        let a = Server::bind_with(&config(1024), coordination(&store))
            .await
            .unwrap();
        let b = Server::bind_with(&config(1024), coordination(&store))
            .await
            .unwrap();

        let (a_addr, b_addr) = (a.local_addr(), b.local_addr());
        let (a_router, b_router) = (Arc::clone(a.router()), Arc::clone(b.router()));
        let (a_db, b_db) = (Arc::clone(a.db()), Arc::clone(b.db()));
        tokio::spawn(a.run());
        tokio::spawn(b.run());

        // Both nodes end up with the same two-member table.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let a_members = a_router.snapshot().members();
            let b_members = b_router.snapshot().members();
            if a_members.len() == 2 && a_members == b_members {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "cluster did not converge");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(a_db.is_master() ^ b_db.is_master());

        // A key is served by its owner and redirected by the other node.
        let slot = a_router.slot_for(b"listing:7");
        let owner = a_router.owners(slot)[0];
        let other = if owner == a_addr { b_addr } else { a_addr };
        let me = NodeId::new("127.0.0.1", 7001).unwrap();

        let mut client = Client::connect(SocketAddr::V4(owner), me).await.unwrap();
        assert_eq!(client.set("listing:7", "x").await.unwrap().status, Status::Ok);
        assert_eq!(
            client.query("listing:7").await.unwrap(),
            Some((slot, vec![owner]))
        );

        let mut client = Client::connect(SocketAddr::V4(other), me).await.unwrap();
        let reply = client.get("listing:7").await.unwrap();
        assert_eq!(reply.status, Status::Moved);
    }
}
