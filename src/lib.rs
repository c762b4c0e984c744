//! # matchdb - A Sharded, Replicated In-Memory Key-Value Store
//!
//! matchdb keeps listing entries in memory across a cluster of nodes. Keys
//! are hashed into 65536 slots with a keyed SipHash; each slot is owned by a
//! small replica set, and one elected leader keeps the slot table up to date
//! through an external lease and routing store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              matchdb node                               │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌──────────┐  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │───>│    Db    │  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │    │ (Mutex)  │  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘    └──────────┘  │
//! │                                               │ shard check             │
//! │                                               ▼                         │
//! │                                        ┌─────────────┐                  │
//! │                                        │ SlotRouter  │<──────┐          │
//! │                                        └─────────────┘       │ install  │
//! │                     ┌────────────────────────────────────────┴───────┐  │
//! │                     │  Coordinator (LocalMaster / DistributedMaster) │  │
//! │                     └────────────────────────┬───────────────────────┘  │
//! └──────────────────────────────────────────────┼──────────────────────────┘
//!                                                ▼
//!                                lease table + routing table (ClusterStore)
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use matchdb::config::{ClusterMode, Config};
//! use matchdb::routing::HashKey;
//! use matchdb::server::Server;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config {
//!         host: "127.0.0.1".parse()?,
//!         port: matchdb::DEFAULT_PORT,
//!         alloc_limit_bytes: 64 * 1024 * 1024,
//!         hash_key: HashKey::from_hex("00112233445566778899aabbccddeeff")?,
//!         request_timeout: Duration::from_secs(5),
//!         mode: ClusterMode::Local,
//!     };
//!
//!     Server::bind(&config).await?.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`node`]: 14-byte node identity
//! - [`routing`]: keyed slot hashing and the slot ownership table
//! - [`cluster`]: leadership lease, routing sync and peer liveness
//! - [`storage`]: node-local table with allocation admission control
//! - [`protocol`]: binary frames and replies
//! - [`commands`]: frame dispatch with shard checks
//! - [`connection`]: per-connection state machine and the listener loop
//! - [`client`]: request/reply client for peers and tests
//! - [`config`]: command-line and environment configuration
//! - [`server`]: node assembly

pub mod client;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod connection;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use client::{Client, ClientError};
pub use cluster::{Coordinator, DistributedMaster, LocalMaster};
pub use commands::CommandHandler;
pub use config::{Config, ConfigError};
pub use connection::{handle_connection, ConnectionStats};
pub use node::NodeId;
pub use protocol::{Frame, Reply, Status};
pub use routing::{HashKey, SlotRouter};
pub use server::Server;
pub use storage::{Db, Entry, StorageError};

/// The default store port
pub const DEFAULT_PORT: u16 = 8090;

/// Version of matchdb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
