//! matchdb Wire Protocol
//!
//! Length-prefixed binary frames spoken on a store connection once the peer
//! has sent its 14-byte node id.
//!
//! ## Modules
//!
//! - `types`: `Frame`, `Reply`, status codes and the owners payload
//! - `parser`: incremental parser for frames and replies
//!
//! ## Example
//!
//! ```
//! use matchdb::protocol::{parse_frame, Frame, Reply};
//!
//! let bytes = Frame::get("listing:42").serialize();
//! let (frame, consumed) = parse_frame(&bytes).unwrap().unwrap();
//! assert_eq!(frame.key_str(), "listing:42");
//! assert_eq!(consumed, bytes.len());
//!
//! let reply = Reply::value("Ariz").serialize();
//! assert_eq!(reply[0], 0);
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_frame, parse_reply, FrameParser, ParseError, ParseResult};
pub use types::{
    decode_owners, encode_owners, Command, Frame, Reply, Status, MAX_VALUE_SIZE,
};
