//! Binary node identifiers.
//!
//! A [`NodeId`] packs an IPv4 address, a port and a creation sequence into
//! 14 bytes. The sequence is derived from the wall clock in nanoseconds,
//! shifted left by one bit, and forced to be strictly increasing within the
//! process so two ids created back to back never collide even when the
//! clock is coarse.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Length of an encoded node id on the wire.
pub const NODE_ID_LEN: usize = 14;

/// Last sequence handed out by [`NodeId::new`].
static LAST_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Errors that can occur while building or parsing a node id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeIdError {
    /// The host is not a dotted-quad IPv4 address
    #[error("host {0:?} is not an IPv4 address")]
    NotIpv4(String),

    /// Encoded id has the wrong number of bytes
    #[error("node id must be {NODE_ID_LEN} bytes, got {0}")]
    InvalidLength(usize),

    /// Textual id is not valid hex
    #[error("node id is not valid hex: {0:?}")]
    InvalidHex(String),
}

/// A 14-byte node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Creates a fresh id for a node listening on `host:port`.
    ///
    /// Fails if `host` does not parse as an IPv4 address.
    pub fn new(host: &str, port: u16) -> Result<Self, NodeIdError> {
        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| NodeIdError::NotIpv4(host.to_string()))?;
        Ok(Self::from_parts(ip, port, next_sequence()))
    }

    /// Creates a fresh id for an already-resolved socket address.
    pub fn for_addr(addr: SocketAddrV4) -> Self {
        Self::from_parts(*addr.ip(), addr.port(), next_sequence())
    }

    /// Assembles an id from its components.
    pub fn from_parts(ip: Ipv4Addr, port: u16, sequence: u64) -> Self {
        let mut raw = [0u8; NODE_ID_LEN];
        raw[..4].copy_from_slice(&ip.octets());
        raw[4..6].copy_from_slice(&port.to_le_bytes());
        raw[6..].copy_from_slice(&sequence.to_le_bytes());
        Self(raw)
    }

    /// Decodes an id received from the wire.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, NodeIdError> {
        let raw: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| NodeIdError::InvalidLength(bytes.len()))?;
        Ok(Self(raw))
    }

    /// Recovers the address the node was created for.
    pub fn addr(&self) -> SocketAddrV4 {
        let ip = Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3]);
        let port = u16::from_le_bytes([self.0[4], self.0[5]]);
        SocketAddrV4::new(ip, port)
    }

    /// The creation sequence embedded in the id.
    pub fn sequence(&self) -> u64 {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&self.0[6..]);
        u64::from_le_bytes(seq)
    }

    /// An id is usable as a peer identity when it names a real port and
    /// carries a non-zero sequence.
    pub fn is_valid(&self) -> bool {
        self.addr().port() != 0 && self.sequence() != 0
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }
}

fn next_sequence() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let candidate = (nanos << 1).max(1);

    let mut last = LAST_SEQUENCE.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(last + 1);
        match LAST_SEQUENCE.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}, seq={})", self.addr(), self.sequence())
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != NODE_ID_LEN * 2 || !s.is_ascii() {
            return Err(NodeIdError::InvalidHex(s.to_string()));
        }
        let mut raw = [0u8; NODE_ID_LEN];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| NodeIdError::InvalidHex(s.to_string()))?;
        }
        Ok(Self(raw))
    }
}

// Ids are stored as hex strings in the lease table.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
