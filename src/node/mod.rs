//! Node Identity
//!
//! Every matchdb process is identified by a compact 14-byte [`NodeId`]. The
//! identifier is sent as the first thing on every store connection and is
//! stored in the lease table as the leader's identity, so it has to be
//! reversible: any node can recover the dial address of another node from
//! its id alone.
//!
//! ## Layout
//!
//! ```text
//! ┌───────────────┬─────────────┬──────────────────────────────────┐
//! │ IPv4 (4 bytes)│ port (2, LE)│ creation sequence (8, LE)        │
//! └───────────────┴─────────────┴──────────────────────────────────┘
//! ```

pub mod id;

pub use id::{NodeId, NodeIdError, NODE_ID_LEN};
