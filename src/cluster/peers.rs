//! Peer liveness tracking (the `seen` map).
//!
//! Any identified connection that pings is recorded here, but only nodes
//! that renew with the leader (and the node itself) are members. The leader
//! assigns slots to live members only, so health checks never own slots.

use crate::node::NodeId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Seen {
    at: Instant,
    member: bool,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    seen: RwLock<HashMap<NodeId, Seen>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a health check from `id`. Does not grant membership.
    pub fn touch(&self, id: NodeId) {
        self.record(id, Instant::now(), false);
    }

    pub fn touch_at(&self, id: NodeId, at: Instant) {
        self.record(id, at, false);
    }

    /// Records a renew from a store node, making it eligible for slots.
    pub fn renew(&self, id: NodeId) {
        self.record(id, Instant::now(), true);
    }

    fn record(&self, id: NodeId, at: Instant, member: bool) {
        let mut seen = self.seen.write();
        let entry = seen.entry(id).or_insert(Seen { at, member });
        if entry.at < at {
            entry.at = at;
        }
        entry.member |= member;
    }

    pub fn last_seen(&self, id: &NodeId) -> Option<Instant> {
        self.seen.read().get(id).map(|seen| seen.at)
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        self.seen.read().get(id).map_or(false, |seen| seen.member)
    }

    /// Addresses of members heard from within `threshold`.
    pub fn live_members(&self, threshold: Duration) -> BTreeSet<SocketAddrV4> {
        let now = Instant::now();
        self.seen
            .read()
            .iter()
            .filter(|(_, seen)| seen.member && now.saturating_duration_since(seen.at) <= threshold)
            .map(|(id, _)| id.addr())
            .collect()
    }

    /// Drops every peer not heard from within `threshold` and returns them.
    pub fn evict_stale(&self, threshold: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.seen.write().retain(|id, seen| {
            let live = now.saturating_duration_since(seen.at) <= threshold;
            if !live {
                evicted.push(*id);
            }
            live
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }
}
