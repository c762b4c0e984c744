//! Distributed coordinator.
//!
//! Leadership is a lease row in the external [`ClusterStore`]. Every node
//! runs the same two loops concurrently, so a slow routing store never
//! delays a lease renewal:
//!
//! ```text
//!  every master_timeout/3           every routing_timeout
//!  ┌──────────────────────┐         ┌───────────────────────────────┐
//!  │ read lease           │         │ read routing row              │
//!  │  mine?   -> renew    │         │ leader:   evict stale peers,  │
//!  │  expired -> claim    │         │           recompute, CAS put  │
//!  │  other   -> follow   │         │ follower: install if newer    │
//!  │ heartbeat the leader │         └───────────────────────────────┘
//!  └──────────────────────┘
//! ```
//!
//! A node only believes it leads until `round start + master_timeout`; a
//! failed or slow renewal lets that deadline lapse, so a partitioned leader
//! stops acting as one within a single lease interval.

use super::peers::PeerTable;
use super::store::{now_ms, ClusterStore, LeaseRecord, RoutingSnapshot, StoreError, Versioned};
use super::Coordinator;
use crate::client::{Client, ClientError};
use crate::node::NodeId;
use crate::protocol::{Reply, Status};
use crate::routing::{assign_slots, RoutingTable, SlotRange, SlotRouter};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing and placement settings for the distributed coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedConfig {
    /// Key of this cluster's rows in the lease and routing tables
    pub cluster_id: String,
    /// Lease length; renewals happen every third of it
    pub master_timeout: Duration,
    /// Routing sync cadence and bound on each routing call
    pub routing_timeout: Duration,
    /// Peers silent for longer than this lose their slots
    pub dead_node_timeout: Duration,
    /// Owners per slot
    pub replicas: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            cluster_id: "matchdb".to_string(),
            master_timeout: Duration::from_millis(6000),
            routing_timeout: Duration::from_millis(3000),
            dead_node_timeout: Duration::from_millis(12000),
            replicas: 2,
        }
    }
}

#[derive(Debug, Default)]
struct Leadership {
    /// Leadership is valid strictly before this instant.
    deadline: Option<Instant>,
    /// When the current leadership term started.
    since: Option<Instant>,
    /// Last known lease owner.
    leader: Option<NodeId>,
}

impl Leadership {
    fn is_valid(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() < d)
    }
}

/// Coordinator that leases leadership through an external store.
pub struct DistributedMaster {
    config: DistributedConfig,
    store: Arc<dyn ClusterStore>,
    router: Arc<SlotRouter>,
    peers: Arc<PeerTable>,
    leadership: RwLock<Leadership>,
    leader_link: tokio::sync::Mutex<Option<(NodeId, Client)>>,
}

impl std::fmt::Debug for DistributedMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMaster")
            .field("config", &self.config)
            .field("is_self", &self.is_self())
            .finish()
    }
}

impl DistributedMaster {
    pub fn new(
        config: DistributedConfig,
        store: Arc<dyn ClusterStore>,
        router: Arc<SlotRouter>,
        peers: Arc<PeerTable>,
    ) -> Self {
        Self {
            config,
            store,
            router,
            peers,
            leadership: RwLock::new(Leadership::default()),
            leader_link: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    /// The last lease owner this node observed.
    pub fn leader(&self) -> Option<NodeId> {
        self.leadership.read().leader
    }

    /// One lease acquisition / renewal attempt.
    pub async fn lease_round(&self, self_id: NodeId) {
        let started = Instant::now();
        let bound = self.config.master_timeout;
        let cluster = self.config.cluster_id.as_str();

        let current = match timeout(bound, self.store.load_lease(cluster)).await {
            Ok(Ok(current)) => current,
            Ok(Err(e)) => {
                warn!(error = %e, "Lease read failed");
                self.step_down(None);
                return;
            }
            Err(_) => {
                warn!(timeout_ms = bound.as_millis() as u64, "Lease read timed out");
                self.step_down(None);
                return;
            }
        };

        let expected = match &current {
            Some(Versioned { value, version }) if value.owner == self_id => Some(version.clone()),
            Some(Versioned { value, .. }) if !value.is_expired_at(now_ms()) => {
                self.step_down(Some(value.owner));
                return;
            }
            Some(Versioned { version, .. }) => Some(version.clone()),
            None => None,
        };

        let record = LeaseRecord::new(self_id, bound);
        match timeout(bound, self.store.put_lease(cluster, &record, expected.as_deref())).await {
            Ok(Ok(())) => self.hold_lease(self_id, started + bound),
            Ok(Err(StoreError::Conflict)) => {
                debug!("Lost lease race to another node");
                self.step_down(None);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Lease write failed");
                self.step_down(None);
            }
            Err(_) => {
                warn!(timeout_ms = bound.as_millis() as u64, "Lease write timed out");
                self.step_down(None);
            }
        }
    }

    fn hold_lease(&self, self_id: NodeId, deadline: Instant) {
        let mut leadership = self.leadership.write();
        if !leadership.is_valid() {
            leadership.since = Some(Instant::now());
            info!(node = %self_id.addr(), "Acquired cluster leadership");
        }
        leadership.deadline = Some(deadline);
        leadership.leader = Some(self_id);
    }

    fn step_down(&self, leader: Option<NodeId>) {
        let mut leadership = self.leadership.write();
        if leadership.is_valid() {
            warn!("Giving up cluster leadership");
        }
        leadership.deadline = None;
        leadership.since = None;
        leadership.leader = leader;
    }

    /// Records our own liveness and, on followers, renews with the leader.
    pub async fn heartbeat_round(&self, self_id: NodeId) {
        self.peers.renew(self_id);

        let leader = match self.leader() {
            Some(leader) if leader != self_id && !self.is_self() => leader,
            _ => return,
        };

        // Bounded by one lease tick so the next lease round is not delayed.
        let bound = self.config.master_timeout / 3;
        let mut link = self.leader_link.lock().await;
        let result = timeout(bound, renew_with(&mut link, leader, self_id)).await;

        match result {
            Ok(Ok(reply)) if reply.status == Status::Ok => {
                debug!(leader = %leader.addr(), "Heartbeat acknowledged");
            }
            Ok(Ok(reply)) => {
                debug!(leader = %leader.addr(), status = ?reply.status, "Heartbeat rejected");
            }
            Ok(Err(e)) => {
                debug!(leader = %leader.addr(), error = %e, "Heartbeat failed");
                *link = None;
            }
            Err(_) => {
                debug!(leader = %leader.addr(), "Heartbeat timed out");
                *link = None;
            }
        }
    }

    /// One routing synchronisation pass.
    pub async fn routing_round(&self) {
        let bound = self.config.routing_timeout;
        let stored = match timeout(bound, self.store.load_routing(&self.config.cluster_id)).await {
            Ok(Ok(stored)) => stored,
            Ok(Err(e)) => {
                warn!(error = %e, "Routing read failed");
                return;
            }
            Err(_) => {
                warn!(timeout_ms = bound.as_millis() as u64, "Routing read timed out");
                return;
            }
        };

        if self.is_self() {
            self.rebalance(stored).await;
        } else if let Some(stored) = stored {
            self.adopt(&stored.value);
        }
    }

    fn adopt(&self, snapshot: &RoutingSnapshot) {
        if snapshot.generation > self.router.generation() {
            self.router
                .install(RoutingTable::from_ranges(snapshot.generation, &snapshot.ranges));
            info!(
                generation = snapshot.generation,
                ranges = snapshot.ranges.len(),
                "Installed routing table"
            );
        }
    }

    async fn rebalance(&self, stored: Option<Versioned<RoutingSnapshot>>) {
        let dead_after = self.config.dead_node_timeout;
        for evicted in self.peers.evict_stale(dead_after) {
            info!(peer = %evicted.addr(), "Evicting silent peer");
        }
        let live = self.peers.live_members(dead_after);

        let (current, version) = match stored {
            Some(Versioned { value, version }) => (value, Some(version)),
            None => (RoutingSnapshot::default(), None),
        };

        // A new leader has not heard from the followers yet; give them one
        // dead-node interval before dropping anyone from the table.
        let in_grace = self
            .leadership
            .read()
            .since
            .map_or(true, |since| since.elapsed() < dead_after);
        if in_grace && !members(&current.ranges).is_subset(&live) {
            self.adopt(&current);
            return;
        }

        let desired = assign_slots(&live, self.config.replicas);
        if desired == current.ranges {
            self.adopt(&current);
            return;
        }

        // Re-check right before writing; only the leader writes routing.
        if !self.is_self() {
            return;
        }

        let snapshot = RoutingSnapshot {
            generation: current.generation.max(self.router.generation()) + 1,
            ranges: desired,
        };
        let bound = self.config.routing_timeout;
        let write = self
            .store
            .put_routing(&self.config.cluster_id, &snapshot, version.as_deref());
        match timeout(bound, write).await {
            Ok(Ok(())) => {
                info!(
                    generation = snapshot.generation,
                    members = live.len(),
                    "Published routing table"
                );
                self.router
                    .install(RoutingTable::from_ranges(snapshot.generation, &snapshot.ranges));
            }
            Ok(Err(e)) => warn!(error = %e, "Routing write failed"),
            Err(_) => warn!(timeout_ms = bound.as_millis() as u64, "Routing write timed out"),
        }
    }
}

/// Sends a renew frame to the leader, reusing the cached connection when it
/// still points at the same leader.
async fn renew_with(
    link: &mut Option<(NodeId, Client)>,
    leader: NodeId,
    self_id: NodeId,
) -> Result<Reply, ClientError> {
    let reuse = matches!(link, Some((id, _)) if *id == leader);
    if !reuse {
        let client = Client::connect(SocketAddr::V4(leader.addr()), self_id).await?;
        *link = Some((leader, client));
    }
    match link {
        Some((_, client)) => client.renew().await,
        None => Err(ClientError::Closed),
    }
}

fn members(ranges: &[SlotRange]) -> BTreeSet<SocketAddrV4> {
    ranges
        .iter()
        .flat_map(|range| range.owners.iter().copied())
        .collect()
}

#[async_trait]
impl Coordinator for DistributedMaster {
    fn is_self(&self) -> bool {
        self.leadership.read().is_valid()
    }

    async fn run(&self, self_id: NodeId) {
        info!(
            node = %self_id.addr(),
            cluster = %self.config.cluster_id,
            master_timeout_ms = self.config.master_timeout.as_millis() as u64,
            routing_timeout_ms = self.config.routing_timeout.as_millis() as u64,
            "Distributed coordinator started"
        );

        tokio::join!(self.lease_loop(self_id), self.routing_loop());
    }
}

impl DistributedMaster {
    async fn lease_loop(&self, self_id: NodeId) {
        let mut tick = tokio::time::interval(self.config.master_timeout / 3);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.lease_round(self_id).await;
            self.heartbeat_round(self_id).await;
        }
    }

    async fn routing_loop(&self) {
        let mut tick = tokio::time::interval(self.config.routing_timeout);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.routing_round().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::StoreResult;
    use crate::cluster::MemoryClusterStore;
    use crate::routing::HashKey;

    fn config() -> DistributedConfig {
        DistributedConfig {
            cluster_id: "test".to_string(),
            master_timeout: Duration::from_millis(300),
            routing_timeout: Duration::from_millis(100),
            dead_node_timeout: Duration::from_millis(600),
            replicas: 1,
        }
    }

    fn master(store: &Arc<MemoryClusterStore>) -> Arc<DistributedMaster> {
        let store: Arc<dyn ClusterStore> = store.clone();
        Arc::new(DistributedMaster::new(
            config(),
            store,
            Arc::new(SlotRouter::new(HashKey::new(3, 4))),
            Arc::new(PeerTable::new()),
        ))
    }

    /// Healthy lease table, slow routing table.
    struct SlowRouting {
        inner: MemoryClusterStore,
        delay: Duration,
    }

    #[async_trait]
    impl ClusterStore for SlowRouting {
        async fn load_lease(&self, cluster: &str) -> StoreResult<Option<Versioned<LeaseRecord>>> {
            self.inner.load_lease(cluster).await
        }

        async fn put_lease(
            &self,
            cluster: &str,
            record: &LeaseRecord,
            expected: Option<&str>,
        ) -> StoreResult<()> {
            self.inner.put_lease(cluster, record, expected).await
        }

        async fn load_routing(
            &self,
            cluster: &str,
        ) -> StoreResult<Option<Versioned<RoutingSnapshot>>> {
            tokio::time::sleep(self.delay).await;
            self.inner.load_routing(cluster).await
        }

        async fn put_routing(
            &self,
            cluster: &str,
            snapshot: &RoutingSnapshot,
            expected: Option<&str>,
        ) -> StoreResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.put_routing(cluster, snapshot, expected).await
        }
    }

    fn spawn(master: &Arc<DistributedMaster>, id: NodeId) -> tokio::task::JoinHandle<()> {
        let master = Arc::clone(master);
        tokio::spawn(async move { master.run(id).await })
    }

    // Ports nothing listens on, so follower heartbeats fail fast.
    fn node(port: u16) -> NodeId {
        NodeId::new("127.0.0.1", port).unwrap()
    }

    #[tokio::test]
    async fn test_lease_round_claims_empty_lease() {
        let store = Arc::new(MemoryClusterStore::new());
        let m = master(&store);
        let id = node(1);

        assert!(!m.is_self());
        m.lease_round(id).await;
        assert!(m.is_self());
        assert_eq!(m.leader(), Some(id));

        let lease = store.load_lease("test").await.unwrap().unwrap();
        assert_eq!(lease.value.owner, id);
        assert!(!lease.value.is_expired_at(now_ms()));
    }

    #[tokio::test]
    async fn test_follower_does_not_claim_live_lease() {
        let store = Arc::new(MemoryClusterStore::new());
        let a = master(&store);
        let b = master(&store);

        a.lease_round(node(1)).await;
        b.lease_round(node(2)).await;

        assert!(a.is_self());
        assert!(!b.is_self());
        assert_eq!(b.leader(), Some(node(1)));
    }

    #[tokio::test]
    async fn test_only_one_leader() {
        let store = Arc::new(MemoryClusterStore::new());
        let masters: Vec<_> = (0..3).map(|_| master(&store)).collect();
        let tasks: Vec<_> = masters
            .iter()
            .enumerate()
            .map(|(i, m)| spawn(m, node(41 + i as u16)))
            .collect();

        tokio::time::sleep(Duration::from_millis(200)).await;
        for _ in 0..10 {
            let leaders = masters.iter().filter(|m| m.is_self()).count();
            assert_eq!(leaders, 1);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_failover_after_lease_expiry() {
        let store = Arc::new(MemoryClusterStore::new());
        let a = master(&store);
        let b = master(&store);

        let task_a = spawn(&a, node(51));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task_b = spawn(&b, node(52));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(a.is_self());
        assert!(!b.is_self());

        task_a.abort();
        // a's own view lapses within one lease interval.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!a.is_self());

        // b claims once the stored lease has expired.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(b.is_self());

        task_b.abort();
    }

    #[tokio::test]
    async fn test_store_outage_drops_leadership() {
        let store = Arc::new(MemoryClusterStore::new());
        let m = master(&store);
        let task = spawn(&m, node(61));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(m.is_self());

        store.set_available(false);
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!m.is_self());

        store.set_available(true);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(m.is_self());

        task.abort();
    }

    #[tokio::test]
    async fn test_slow_routing_store_keeps_leadership() {
        let store: Arc<dyn ClusterStore> = Arc::new(SlowRouting {
            inner: MemoryClusterStore::new(),
            delay: Duration::from_millis(280),
        });
        let settings = DistributedConfig {
            routing_timeout: Duration::from_millis(300),
            ..config()
        };
        let m = Arc::new(DistributedMaster::new(
            settings,
            store,
            Arc::new(SlotRouter::new(HashKey::new(3, 4))),
            Arc::new(PeerTable::new()),
        ));
        let task = spawn(&m, node(75));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut lapses = 0;
        for _ in 0..150 {
            if !m.is_self() {
                lapses += 1;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lapses, 0);

        task.abort();
    }

    #[tokio::test]
    async fn test_slow_store_never_grants_leadership() {
        let store = Arc::new(MemoryClusterStore::new());
        store.set_latency(Duration::from_millis(400));
        let m = master(&store);

        m.lease_round(node(71)).await;
        assert!(!m.is_self());
    }

    #[tokio::test]
    async fn test_leader_publishes_and_follower_installs() {
        let store = Arc::new(MemoryClusterStore::new());
        let leader = master(&store);
        let follower = master(&store);
        let leader_id = node(81);

        let task_l = spawn(&leader, leader_id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task_f = spawn(&follower, node(82));
        tokio::time::sleep(Duration::from_millis(400)).await;

        let stored = store.load_routing("test").await.unwrap().unwrap().value;
        assert!(stored.generation >= 1);
        assert_eq!(stored.ranges.len(), 1);
        assert_eq!(stored.ranges[0].owners, vec![leader_id.addr()]);

        assert_eq!(follower.router.owners(1234), vec![leader_id.addr()]);
        assert_eq!(follower.router.generation(), stored.generation);

        task_l.abort();
        task_f.abort();
    }

    #[tokio::test]
    async fn test_silent_peer_loses_its_slots() {
        let store = Arc::new(MemoryClusterStore::new());
        let m = master(&store);
        let id = node(91);
        let peer = node(92);
        let task = spawn(&m, id);

        // Keep the peer alive through the election grace period.
        for _ in 0..20 {
            m.peers.renew(peer);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let table = m.router.snapshot();
        let both: BTreeSet<_> = [id.addr(), peer.addr()].into_iter().collect();
        assert_eq!(table.members(), both);

        // Silence: after the dead-node timeout the slots move back.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let table = m.router.snapshot();
        let only_self: BTreeSet<_> = [id.addr()].into_iter().collect();
        assert_eq!(table.members(), only_self);
        assert!(m.peers.last_seen(&peer).is_none());

        task.abort();
    }
}
