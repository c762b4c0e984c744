//! Slot Router
//!
//! Deterministically maps keys to one of 65536 routing slots with a keyed
//! SipHash, and tracks which nodes currently own each slot.
//!
//! ```text
//!   key ──siphash(k0,k1)──> u64 ──& 0xFFFF──> slot ──RoutingTable──> [replicas]
//! ```
//!
//! ## Example
//!
//! ```
//! use matchdb::routing::{HashKey, SlotRouter};
//! use std::net::SocketAddrV4;
//!
//! let key = HashKey::from_hex("00112233445566778899aabbccddeeff").unwrap();
//! let router = SlotRouter::new(key);
//! let slot = router.slot_for(b"listing:42");
//! assert!(router.owners(slot).is_empty());
//!
//! let me: SocketAddrV4 = "127.0.0.1:8090".parse().unwrap();
//! router.assign_all(me);
//! assert_eq!(router.owners(slot), vec![me]);
//! ```

pub mod hash;
pub mod table;

pub use hash::{HashKey, RoutingError, SLOT_COUNT};
pub use table::{assign_slots, RoutingTable, SlotRange, SlotRouter};
