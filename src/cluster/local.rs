//! Single-node coordinator.

use super::Coordinator;
use crate::node::NodeId;
use crate::routing::SlotRouter;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Coordinator for single-node deployments: the local node is always the
/// leader and owns every slot.
#[derive(Debug)]
pub struct LocalMaster {
    router: Arc<SlotRouter>,
}

impl LocalMaster {
    pub fn new(router: Arc<SlotRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Coordinator for LocalMaster {
    fn is_self(&self) -> bool {
        true
    }

    async fn run(&self, self_id: NodeId) {
        self.router.assign_all(self_id.addr());
        info!(node = %self_id.addr(), "Single-node mode: all slots assigned locally");
    }
}
