//! Connection Handler Module
//!
//! This module manages peer connections to a matchdb node.
//! Each connection is handled by its own async task.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     accept_loop                             │
//! │              (listener.rs, AcceptBackoff)                   │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │  For each connection.. │
//!           └────────────┬───────────┘
//!                        │
//!                        │ spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │  NodeId     │───>│ Parse frame │───>│ Execute cmd │     │
//! │  │  handshake  │    └─────────────┘    └──────┬──────┘     │
//! │  └─────────────┘                              ▼             │
//! │                                      ┌─────────────┐        │
//! │                                      │ Send reply  │        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: Uses Tokio for non-blocking network operations
//! - **Pipelining**: Several frames may arrive in a single TCP packet
//! - **Fail Closed**: Any malformed handshake or frame ends the connection
//! - **Statistics**: Tracks connection and command metrics

pub mod handler;
pub mod listener;

pub use handler::{
    handle_connection, ConnectionError, ConnectionHandler, ConnectionState, ConnectionStats,
};
pub use listener::{accept_loop, is_temporary, serve, AcceptBackoff, Acceptor};
