//! Command Handler Module
//!
//! Dispatches parsed frames to the storage engine after checking that the
//! key's slot is owned by this node.
//!
//! ## Supported Commands
//!
//! - `G key` - Get an entry's listing
//! - `S key value` - Store an entry
//! - `D key` - Delete an entry (idempotent)
//! - `P` - Health check, refreshes the peer's heartbeat (never membership)
//! - `Q key` - Which slot and which nodes own a key
//! - `R` - Heartbeat to the leader, answers with the leader flag
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │  execute()  │───>│ shard check │───>│     Db      │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │         │                  │                               │
//! │         │                  ▼                               │
//! │         │           MOVED / UNASSIGNED                     │
//! │         ▼                                                  │
//! │   P / R / Q (no table access)                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::node::NodeId;
use crate::protocol::{Command, Frame, Reply};
use crate::routing::SlotRouter;
use crate::storage::{Db, Entry};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::{debug, trace};

/// Handles frames by dispatching them against the local [`Db`].
#[derive(Clone)]
pub struct CommandHandler {
    db: Arc<Db>,
    router: Arc<SlotRouter>,
    /// Address other nodes know this node by
    self_addr: SocketAddrV4,
}

impl CommandHandler {
    pub fn new(db: Arc<Db>, router: Arc<SlotRouter>) -> Self {
        let self_addr = db.node_id().addr();
        Self {
            db,
            router,
            self_addr,
        }
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Executes one frame sent by `peer` and returns the reply.
    pub fn execute(&self, peer: &NodeId, frame: Frame) -> Reply {
        trace!(
            peer = %peer.addr(),
            command = ?frame.command,
            key = frame.key_str(),
            "Executing frame"
        );

        match frame.command {
            Command::Ping => self.cmd_ping(peer),
            Command::Renew => self.cmd_renew(peer),
            Command::Query => self.cmd_query(&frame),
            Command::Get | Command::Set | Command::Delete => {
                if let Some(redirect) = self.check_shard(&frame) {
                    return redirect;
                }
                match frame.command {
                    Command::Get => self.cmd_get(&frame),
                    Command::Set => self.cmd_set(frame),
                    _ => self.cmd_delete(&frame),
                }
            }
        }
    }

    /// Returns a redirect when the key's slot is not served locally.
    fn check_shard(&self, frame: &Frame) -> Option<Reply> {
        let slot = self.router.slot_for(&frame.key);
        let owners = self.router.owners(slot);

        if owners.is_empty() {
            debug!(slot, "Slot unassigned");
            return Some(Reply::unassigned());
        }
        if !owners.contains(&self.self_addr) {
            debug!(slot, owners = ?owners, "Key owned elsewhere");
            return Some(Reply::moved(slot, &owners));
        }
        None
    }

    fn cmd_get(&self, frame: &Frame) -> Reply {
        match self.db.get(frame.key_str()) {
            Some(entry) => Reply::value(entry.listing),
            None => Reply::not_found(),
        }
    }

    fn cmd_set(&self, frame: Frame) -> Reply {
        let id = frame.key_str().to_string();
        let listing = frame.value.unwrap_or_default();

        match self.db.set(Entry::new(id, listing)) {
            Ok(()) => Reply::ok(),
            Err(e) => Reply::capacity(e.to_string()),
        }
    }

    fn cmd_delete(&self, frame: &Frame) -> Reply {
        match self.db.delete(frame.key_str()) {
            Ok(()) => Reply::ok(),
            Err(e) => Reply::capacity(e.to_string()),
        }
    }

    fn cmd_ping(&self, peer: &NodeId) -> Reply {
        self.db.heartbeat(*peer);
        Reply::value(self.db.ping())
    }

    fn cmd_renew(&self, peer: &NodeId) -> Reply {
        self.db.renew(*peer);
        Reply::renewed(self.db.is_master())
    }

    fn cmd_query(&self, frame: &Frame) -> Reply {
        let slot = self.router.slot_for(&frame.key);
        Reply::owners(slot, &self.router.owners(slot))
    }
}
