//! Listener loop.
//!
//! Accepts peer connections and spawns one handler task per connection.
//! Temporary accept failures (aborted handshakes, descriptor exhaustion) are
//! retried after an exponential backoff; any other failure ends the loop.

use super::handler::{handle_connection, ConnectionStats};
use crate::commands::CommandHandler;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, warn};

/// First retry delay after a temporary accept failure
const BASE_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound on the retry delay
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Exponential backoff for temporary accept failures.
///
/// Starts at 5ms, doubles on each consecutive failure up to 1s, and resets
/// after a successful accept.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait after the next failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => BASE_BACKOFF,
            Some(prev) => (prev * 2).min(MAX_BACKOFF),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// The delay used for the most recent failure, if not reset since.
    pub fn last_delay(&self) -> Option<Duration> {
        self.current
    }
}

/// Whether an accept error is worth retrying.
pub fn is_temporary(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        // ENFILE / EMFILE
        _ => matches!(e.raw_os_error(), Some(23) | Some(24)),
    }
}

/// A source of incoming connections.
#[async_trait]
pub trait Acceptor: Send {
    type Stream: Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Drives `acceptor` until a non-temporary error, handing every accepted
/// stream to `on_accept`.
pub async fn serve<A, F>(
    acceptor: &mut A,
    backoff: &mut AcceptBackoff,
    mut on_accept: F,
) -> io::Result<()>
where
    A: Acceptor,
    F: FnMut(A::Stream, SocketAddr) + Send,
{
    loop {
        match acceptor.accept().await {
            Ok((stream, addr)) => {
                backoff.reset();
                on_accept(stream, addr);
            }
            Err(e) if is_temporary(&e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "Temporary accept failure");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(error = %e, "Listener failed");
                return Err(e);
            }
        }
    }
}

/// Accepts connections until a non-temporary error occurs.
pub async fn accept_loop(
    mut listener: TcpListener,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) -> io::Result<()> {
    let mut backoff = AcceptBackoff::new();

    serve(&mut listener, &mut backoff, |stream, addr| {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let handler = command_handler.clone();
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            handle_connection(stream, addr, handler, stats).await;
        });
    })
    .await
}
