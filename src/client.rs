//! Store client.
//!
//! A thin request/reply client over one TCP connection. It is used by the
//! distributed coordinator to heartbeat the leader and by tests to drive a
//! running server end to end.

use crate::node::NodeId;
use crate::protocol::{
    decode_owners, parse_reply, Frame, ParseError, Reply, Status, MAX_VALUE_SIZE,
};
use bytes::{Bytes, BytesMut};
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Errors that can occur while talking to a store node.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Parse(#[from] ParseError),

    #[error("key of {0} bytes exceeds the 65535 byte frame limit")]
    KeyTooLong(usize),

    #[error("value of {size} bytes exceeds the {max} byte frame limit")]
    ValueTooLarge { size: usize, max: usize },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,
}

/// A connected client.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    buffer: BytesMut,
    request_timeout: Option<Duration>,
    /// Set once a reply was abandoned mid-read; the stream is out of step.
    broken: bool,
}

impl Client {
    /// Connects to `addr` and identifies as `self_id`.
    pub async fn connect(addr: SocketAddr, self_id: NodeId) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(self_id.as_bytes()).await?;

        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            request_timeout: None,
            broken: false,
        })
    }

    /// Bounds every request by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sends one frame and waits for its reply.
    ///
    /// After a timeout the client is unusable; later requests fail with
    /// [`ClientError::Closed`].
    pub async fn request(&mut self, frame: &Frame) -> Result<Reply, ClientError> {
        if self.broken {
            return Err(ClientError::Closed);
        }
        if frame.key.len() > u16::MAX as usize {
            return Err(ClientError::KeyTooLong(frame.key.len()));
        }
        if let Some(value) = &frame.value {
            if value.len() > MAX_VALUE_SIZE {
                return Err(ClientError::ValueTooLarge {
                    size: value.len(),
                    max: MAX_VALUE_SIZE,
                });
            }
        }

        match self.request_timeout {
            Some(limit) => match timeout(limit, self.round_trip(frame)).await {
                Ok(result) => result,
                Err(_) => {
                    self.broken = true;
                    self.buffer.clear();
                    Err(ClientError::Timeout(limit))
                }
            },
            None => self.round_trip(frame).await,
        }
    }

    async fn round_trip(&mut self, frame: &Frame) -> Result<Reply, ClientError> {
        self.stream.write_all(&frame.serialize()).await?;
        self.stream.flush().await?;

        loop {
            if let Some((reply, consumed)) = parse_reply(&self.buffer)? {
                let _ = self.buffer.split_to(consumed);
                return Ok(reply);
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Reply, ClientError> {
        self.request(&Frame::get(key.to_string())).await
    }

    pub async fn set(&mut self, key: &str, value: impl Into<Bytes>) -> Result<Reply, ClientError> {
        self.request(&Frame::set(key.to_string(), value)).await
    }

    pub async fn delete(&mut self, key: &str) -> Result<Reply, ClientError> {
        self.request(&Frame::delete(key.to_string())).await
    }

    pub async fn ping(&mut self) -> Result<Reply, ClientError> {
        self.request(&Frame::ping()).await
    }

    /// Asks which nodes own `key`. Returns the slot and owners on success.
    pub async fn query(
        &mut self,
        key: &str,
    ) -> Result<Option<(u16, Vec<SocketAddrV4>)>, ClientError> {
        let reply = self.request(&Frame::query(key.to_string())).await?;
        match reply.status {
            Status::Ok => Ok(decode_owners(&reply.payload)),
            _ => Ok(None),
        }
    }

    /// Heartbeats the receiving node.
    pub async fn renew(&mut self) -> Result<Reply, ClientError> {
        self.request(&Frame::renew()).await
    }
}
