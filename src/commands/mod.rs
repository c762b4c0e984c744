//! Command Handler Module
//!
//! Receives parsed frames, checks slot ownership, executes them against the
//! storage engine and builds the replies.
//!
//! ## Architecture
//!
//! ```text
//! Peer Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  FrameParser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Shard check  │──> SlotRouter
//! │  - Dispatch     │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │       Db        │  (storage module)
//! └─────────────────┘
//! ```

pub mod handler;

pub use handler::CommandHandler;
