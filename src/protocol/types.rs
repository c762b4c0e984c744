//! matchdb Wire Types
//!
//! This module defines the request frames and replies exchanged on a store
//! connection, after the 14-byte node id handshake.
//!
//! ## Request Frame
//!
//! ```text
//! ┌─────────┬──────────────────┬───────────┬────────────────────┬─────────────┐
//! │ cmd (1) │ key len (2, BE)  │ key bytes │ value len (4, BE)  │ value bytes │
//! └─────────┴──────────────────┴───────────┴────────────────────┴─────────────┘
//!                                            └──────── `S` only ───────────────┘
//! ```
//!
//! ## Reply
//!
//! ```text
//! ┌────────────┬────────────────────┬─────────┐
//! │ status (1) │ payload len (4, BE)│ payload │
//! └────────────┴────────────────────┴─────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Largest accepted value in a `S` frame (32 MiB).
pub const MAX_VALUE_SIZE: usize = 32 * 1024 * 1024;

/// Size of the fixed frame header (command + key length).
pub const FRAME_HEADER_LEN: usize = 3;

/// Size of the fixed reply header (status + payload length).
pub const REPLY_HEADER_LEN: usize = 5;

/// Request commands, keyed by their wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Get,
    Set,
    Ping,
    Query,
    Renew,
    Delete,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'G' => Some(Command::Get),
            b'S' => Some(Command::Set),
            b'P' => Some(Command::Ping),
            b'Q' => Some(Command::Query),
            b'R' => Some(Command::Renew),
            b'D' => Some(Command::Delete),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Command::Get => b'G',
            Command::Set => b'S',
            Command::Ping => b'P',
            Command::Query => b'Q',
            Command::Renew => b'R',
            Command::Delete => b'D',
        }
    }

    /// Whether the frame carries a value section.
    pub fn has_value(self) -> bool {
        matches!(self, Command::Set)
    }
}

/// One request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl Frame {
    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::keyed(Command::Get, key)
    }

    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            command: Command::Set,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self::keyed(Command::Delete, key)
    }

    pub fn query(key: impl Into<Bytes>) -> Self {
        Self::keyed(Command::Query, key)
    }

    pub fn ping() -> Self {
        Self::keyed(Command::Ping, Bytes::new())
    }

    pub fn renew() -> Self {
        Self::keyed(Command::Renew, Bytes::new())
    }

    fn keyed(command: Command, key: impl Into<Bytes>) -> Self {
        Self {
            command,
            key: key.into(),
            value: None,
        }
    }

    /// The key as text. Keys are validated as UTF-8 by the parser.
    pub fn key_str(&self) -> &str {
        std::str::from_utf8(&self.key).unwrap_or_default()
    }

    /// Serializes the frame for sending over the wire.
    ///
    /// Keys longer than `u16::MAX` bytes cannot be represented; callers
    /// must not build such frames.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.to_vec()
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command.as_byte());
        buf.put_u16(self.key.len() as u16);
        buf.put_slice(&self.key);
        if self.command.has_value() {
            let value = self.value.as_deref().unwrap_or_default();
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
    }
}

/// Reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    Capacity = 2,
    Moved = 3,
    Unassigned = 4,
}

impl Status {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Status::Ok),
            1 => Some(Status::NotFound),
            2 => Some(Status::Capacity),
            3 => Some(Status::Moved),
            4 => Some(Status::Unassigned),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub payload: Bytes,
}

impl Reply {
    pub fn new(status: Status, payload: impl Into<Bytes>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Status::Ok, Bytes::new())
    }

    pub fn value(data: impl Into<Bytes>) -> Self {
        Self::new(Status::Ok, data)
    }

    pub fn pong() -> Self {
        Self::new(Status::Ok, Bytes::from_static(b"PONG"))
    }

    pub fn not_found() -> Self {
        Self::new(Status::NotFound, Bytes::new())
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(Status::Capacity, Bytes::from(message.into()))
    }

    pub fn unassigned() -> Self {
        Self::new(Status::Unassigned, Bytes::new())
    }

    /// Redirect to the nodes that own the key's slot.
    pub fn moved(slot: u16, owners: &[SocketAddrV4]) -> Self {
        Self::new(Status::Moved, encode_owners(slot, owners))
    }

    /// Answer to a slot ownership query.
    pub fn owners(slot: u16, owners: &[SocketAddrV4]) -> Self {
        Self::new(Status::Ok, encode_owners(slot, owners))
    }

    /// Answer to a renew frame: whether the receiver is the cluster leader.
    pub fn renewed(is_leader: bool) -> Self {
        Self::new(Status::Ok, Bytes::from(vec![is_leader as u8]))
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.to_vec()
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status.as_byte());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.payload) {
            Ok(s) if !s.is_empty() => write!(f, "{:?} \"{}\"", self.status, s),
            _ => write!(f, "{:?} ({} bytes)", self.status, self.payload.len()),
        }
    }
}

/// Encodes `[slot u16][count u8]` followed by `count` × `[ipv4][port u16]`.
/// At most 255 owners are encoded.
pub fn encode_owners(slot: u16, owners: &[SocketAddrV4]) -> Bytes {
    let owners = &owners[..owners.len().min(u8::MAX as usize)];
    let mut buf = BytesMut::with_capacity(3 + owners.len() * 6);
    buf.put_u16(slot);
    buf.put_u8(owners.len() as u8);
    for owner in owners {
        buf.put_slice(&owner.ip().octets());
        buf.put_u16(owner.port());
    }
    buf.freeze()
}

/// Decodes an owners payload; `None` if it is truncated.
pub fn decode_owners(payload: &[u8]) -> Option<(u16, Vec<SocketAddrV4>)> {
    let mut buf = payload;
    if buf.remaining() < 3 {
        return None;
    }
    let slot = buf.get_u16();
    let count = buf.get_u8() as usize;
    if buf.remaining() < count * 6 {
        return None;
    }
    let owners = (0..count)
        .map(|_| {
            let ip = Ipv4Addr::from(buf.get_u32());
            let port = buf.get_u16();
            SocketAddrV4::new(ip, port)
        })
        .collect();
    Some((slot, owners))
}
