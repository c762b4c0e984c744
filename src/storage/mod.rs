//! Storage Engine Module
//!
//! This module provides the node-local table that actually holds entries.
//! It is a plain id → [`Entry`] map behind one mutex, with admission control
//! against a byte budget.
//!
//! ## Features
//!
//! - **Admission Control**: writes beyond the allocation limit are rejected
//! - **Pressure Signal**: a warning fires when usage crosses two thirds
//! - **Idempotent Deletes**: deleting a missing id succeeds
//! - **Peer Heartbeats**: ping/renew handling records peers in `seen`

pub mod engine;

pub use engine::{Db, Entry, StorageError, StorageStats, DEFAULT_REQUEST_TIMEOUT};
