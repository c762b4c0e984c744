//! Connection Handler Module
//!
//! This module handles individual peer connections to a matchdb node.
//! Each connection gets its own handler task that first reads the peer's
//! node id and then loops reading frames and sending replies.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Peer connects (TCP handshake)
//!        │
//!        ▼
//! 2. AwaitIdentity: read 14-byte NodeId (bounded by the request timeout)
//!        │   invalid / late ──> Closed
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  ServingCommands             │
//!    │                              │
//!    │  read ─> parse ─> execute    │
//!    │              └─> reply       │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │   malformed frame / EOF / I/O error
//!        ▼
//! 4. Closed: handler task ends
//! ```
//!
//! ## Buffer Management
//!
//! A BytesMut buffer accumulates incoming data because TCP is a stream
//! protocol: a read may hold a partial frame or several pipelined frames.
//! An idle connection may wait forever between frames, but once a frame has
//! started arriving its remainder must arrive within the request timeout.

use crate::commands::CommandHandler;
use crate::node::{NodeId, NodeIdError, NODE_ID_LEN};
use crate::protocol::{Frame, FrameParser, ParseError, Reply, MAX_VALUE_SIZE};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Largest frame: header, the longest key, value length and the largest value.
const MAX_BUFFER_SIZE: usize = 3 + u16::MAX as usize + 4 + MAX_VALUE_SIZE;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Connections closed for a bad or missing identity
    pub handshake_failures: AtomicU64,
    /// Total frames processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitIdentity,
    ServingCommands(NodeId),
    Closed,
}

/// Handles a single peer connection.
///
/// Generic over the stream so the state machine can be driven by a mock
/// in tests as well as by a `TcpStream`.
pub struct ConnectionHandler<S> {
    stream: BufWriter<S>,

    /// Peer's socket address (for logging)
    addr: SocketAddr,

    buffer: BytesMut,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    parser: FrameParser,

    state: ConnectionState,

    /// Bound on the handshake and on the remainder of a started frame
    request_timeout: Duration,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection handler. The request timeout is taken from
    /// the node's database.
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();
        let request_timeout = command_handler.db().request_timeout();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: FrameParser::new(),
            state: ConnectionState::AwaitIdentity,
            request_timeout,
            stats,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Runs the connection to completion, leaving the handler `Closed`.
    ///
    /// Returns `Ok(())` when the peer closes the connection between frames.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        debug!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;
        self.state = ConnectionState::Closed;

        match &result {
            Ok(()) => debug!(client = %self.addr, "Client disconnected"),
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection closed on error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let peer = match self.read_identity().await {
            Ok(peer) => peer,
            Err(e) => {
                self.stats.handshake_failed();
                return Err(e);
            }
        };
        self.state = ConnectionState::ServingCommands(peer);
        info!(client = %self.addr, peer = %peer.addr(), "Peer identified");

        loop {
            while let Some(frame) = self.try_parse_frame()? {
                let reply = self.command_handler.execute(&peer, frame);
                self.stats.command_processed();
                self.send_reply(&reply).await?;
            }

            if !self.read_more_data().await? {
                return Ok(());
            }
        }
    }

    /// Reads and validates the 14-byte node id that opens every connection.
    async fn read_identity(&mut self) -> Result<NodeId, ConnectionError> {
        let limit = self.request_timeout;
        let read = async {
            while self.buffer.len() < NODE_ID_LEN {
                let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
                if n == 0 {
                    return Err(ConnectionError::UnexpectedEof);
                }
                self.stats.bytes_read(n);
            }
            Ok::<(), ConnectionError>(())
        };
        timeout(limit, read)
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout(limit))??;

        let raw = self.buffer.split_to(NODE_ID_LEN);
        let peer = NodeId::from_slice(&raw)?;
        if !peer.is_valid() {
            return Err(ConnectionError::InvalidIdentity(peer));
        }
        Ok(peer)
    }

    /// Attempts to parse a frame from the buffer.
    fn try_parse_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((frame, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed frame"
                );
                Ok(Some(frame))
            }
            Ok(None) => {
                trace!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    "Incomplete frame, need more data"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Malformed frame");
                Err(ConnectionError::ParseError(e))
            }
        }
    }

    /// Reads more data into the buffer. Returns `false` on a clean close
    /// between frames.
    async fn read_more_data(&mut self) -> Result<bool, ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let mid_frame = !self.buffer.is_empty();
        let n = if mid_frame {
            let limit = self.request_timeout;
            timeout(limit, self.stream.get_mut().read_buf(&mut self.buffer))
                .await
                .map_err(|_| ConnectionError::RequestTimeout(limit))??
        } else {
            self.stream.get_mut().read_buf(&mut self.buffer).await?
        };

        if n == 0 {
            if mid_frame {
                return Err(ConnectionError::UnexpectedEof);
            }
            return Ok(false);
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");
        Ok(true)
    }

    async fn send_reply(&mut self, reply: &Reply) -> Result<(), ConnectionError> {
        let bytes = reply.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(
            client = %self.addr,
            bytes = bytes.len(),
            status = ?reply.status,
            "Sent reply"
        );
        Ok(())
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed or oversized frame
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Handshake bytes do not form a node id
    #[error("Bad handshake: {0}")]
    BadHandshake(#[from] NodeIdError),

    /// Handshake carried a zero port or sequence
    #[error("Invalid peer identity: {0:?}")]
    InvalidIdentity(NodeId),

    #[error("No identity received within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Frame not completed within {0:?}")]
    RequestTimeout(Duration),

    /// Unexpected end of stream (partial handshake or frame)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Handles a peer connection.
///
/// Creates a [`ConnectionHandler`] and runs it to completion. Errors are
/// logged by the handler and never reach other connections.
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handler = ConnectionHandler::new(stream, addr, command_handler, stats);
    let _ = handler.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::cluster::{LocalMaster, PeerTable};
    use crate::protocol::Status;
    use crate::routing::{HashKey, SlotRouter};
    use crate::storage::Db;
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::io::Builder;

    fn create_command_handler(limit: u64, request_timeout: Duration) -> CommandHandler {
        let key = HashKey::from_hex("00112233445566778899aabbccddeeff").unwrap();
        let router = Arc::new(SlotRouter::new(key));
        let id = NodeId::new("127.0.0.1", 8090).unwrap();
        router.assign_all(id.addr());
        let db = Db::new(
            id,
            limit,
            Arc::new(LocalMaster::new(Arc::clone(&router))),
            Arc::new(PeerTable::new()),
        )
        .with_request_timeout(request_timeout);
        CommandHandler::new(Arc::new(db), router)
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn create_test_server(limit: u64) -> (SocketAddr, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = create_command_handler(limit, Duration::from_millis(200));
        let stats = Arc::new(ConnectionStats::new());

        let stats_clone = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let handler = handler.clone();
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(stream, client_addr, handler, stats));
            }
        });

        (addr, stats)
    }

    #[tokio::test]
    async fn test_handshake_then_ping() {
        let peer = NodeId::new("127.0.0.1", 9000).unwrap();
        let mock = Builder::new()
            .read(peer.as_bytes())
            .read(b"P\x00\x00")
            .write(&Reply::pong().serialize())
            .build();

        let stats = Arc::new(ConnectionStats::new());
        let handler = create_command_handler(1024, Duration::from_secs(1));
        let db = Arc::clone(handler.db());

        let mut conn = ConnectionHandler::new(mock, test_addr(), handler, Arc::clone(&stats));
        assert_eq!(conn.state(), ConnectionState::AwaitIdentity);
        conn.run().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        assert!(db.peers().last_seen(&peer).is_some());
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_identity_and_frame_in_one_read() {
        let peer = NodeId::new("127.0.0.1", 9000).unwrap();
        let mut input = peer.as_bytes().to_vec();
        input.extend(Frame::set("k", "v").serialize());
        input.extend(Frame::get("k").serialize());

        let mut expected = Reply::ok().serialize();
        expected.extend(Reply::value("v").serialize());

        let mock = Builder::new().read(&input).write(&expected).build();
        let handler = create_command_handler(1024, Duration::from_secs(1));
        let stats = Arc::new(ConnectionStats::new());

        ConnectionHandler::new(mock, test_addr(), handler, stats)
            .run()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_port_identity_rejected() {
        let bogus = [0u8; NODE_ID_LEN];
        let mock = Builder::new().read(&bogus).build();
        let handler = create_command_handler(1024, Duration::from_secs(1));
        let stats = Arc::new(ConnectionStats::new());

        let result = ConnectionHandler::new(mock, test_addr(), handler, Arc::clone(&stats))
            .run()
            .await;
        assert!(matches!(result, Err(ConnectionError::InvalidIdentity(_))));
        assert_eq!(stats.handshake_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_short_identity() {
        let mock = Builder::new().read(b"\x7f\x00\x00\x01").build();
        let handler = create_command_handler(1024, Duration::from_secs(1));
        let stats = Arc::new(ConnectionStats::new());

        let result = ConnectionHandler::new(mock, test_addr(), handler, stats)
            .run()
            .await;
        assert!(matches!(result, Err(ConnectionError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let peer = NodeId::new("127.0.0.1", 9000).unwrap();
        let mock = Builder::new()
            .read(peer.as_bytes())
            .read(b"Z\x00\x00")
            .build();
        let handler = create_command_handler(1024, Duration::from_secs(1));
        let stats = Arc::new(ConnectionStats::new());

        let mut conn = ConnectionHandler::new(mock, test_addr(), handler, stats);
        let result = conn.run().await;
        assert!(matches!(
            result,
            Err(ConnectionError::ParseError(ParseError::UnknownCommand(b'Z')))
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_unexpected_eof() {
        let peer = NodeId::new("127.0.0.1", 9000).unwrap();
        let mock = Builder::new()
            .read(peer.as_bytes())
            .read(b"G\x00\x05ab")
            .build();
        let handler = create_command_handler(1024, Duration::from_secs(1));
        let stats = Arc::new(ConnectionStats::new());

        let result = ConnectionHandler::new(mock, test_addr(), handler, stats)
            .run()
            .await;
        assert!(matches!(result, Err(ConnectionError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (addr, stats) = create_test_server(1024).await;
        let _client = TcpStream::connect(addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(stats.handshake_failures.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_single_node_end_to_end() {
        let (addr, stats) = create_test_server(1024 * 1024).await;
        let me = NodeId::new("127.0.0.1", 9100).unwrap();
        let mut client = Client::connect(addr, me).await.unwrap();

        let listing = Bytes::from(vec![b'x'; 100]);
        let reply = client.set("a", listing.clone()).await.unwrap();
        assert_eq!(reply.status, Status::Ok);

        let reply = client.get("a").await.unwrap();
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.payload, listing);

        let reply = client.set("big", vec![0u8; 2 * 1024 * 1024]).await.unwrap();
        assert_eq!(reply.status, Status::Capacity);

        let reply = client.delete("a").await.unwrap();
        assert_eq!(reply.status, Status::Ok);

        let reply = client.get("a").await.unwrap();
        assert_eq!(reply.status, Status::NotFound);

        assert_eq!(client.ping().await.unwrap().payload, "PONG");
        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 6);
    }
}
