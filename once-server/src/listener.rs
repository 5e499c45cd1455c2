//! # TCP Listener
//!
//! Socket setup and the interruptible accept path.
//!
//! ## Design Principles
//!
//! 1. **Interruptible Without Polling**: `accept` selects over the listening
//!    socket and a watch-channel shutdown signal, so a shutdown request wakes
//!    a blocked accept immediately.
//! 2. **Transient Errors Stay Internal**: Interrupted or aborted accepts are
//!    retried inside `accept`; only real transport failures surface.
//! 3. **Fatal Only at Startup**: Bind and listen failures propagate; nothing
//!    after startup can take the listener down.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use once_common::{ServerError, ServerResult};

/// Idempotent, cloneable shutdown trigger. The one piece of process-wide
/// coordination state, owned by the top-level driver and shared with
/// whatever needs to request a stop (signal handler, tests).
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        ShutdownSignal {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Requests shutdown. Safe to call any number of times, from anywhere.
    pub fn request_shutdown(&self) {
        let first = self.tx.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        });
        if first {
            tracing::info!("shutdown requested");
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One accepted socket, owned exclusively by whichever worker handles it.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Outcome of a successful `accept` call.
pub enum Accepted {
    Connection(Connection),
    /// Shutdown was requested; no more connections will be accepted.
    Shutdown,
}

#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    shutdown: watch::Receiver<bool>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Creates the listening socket: IPv4, address reuse (best effort, like
    /// the deployment it replaces), bound to `0.0.0.0:port` with the given
    /// backlog. Must be called from within a tokio runtime.
    pub fn bind(port: u16, backlog: i32, shutdown: watch::Receiver<bool>) -> ServerResult<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;

        if let Err(err) = socket.set_reuse_address(true) {
            // Not fatal; the bind may still succeed.
            tracing::warn!(%err, "failed to set SO_REUSEADDR");
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        socket
            .bind(&addr.into())
            .map_err(|source| ServerError::Bind { port, source })?;
        socket
            .listen(backlog)
            .map_err(|source| ServerError::Listen { backlog, source })?;
        socket.set_nonblocking(true)?;

        let socket = TcpListener::from_std(socket.into())?;
        let local_addr = socket.local_addr()?;
        tracing::info!(%local_addr, backlog, "listening");

        Ok(Listener {
            socket,
            shutdown,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for either a client connection or a shutdown request. Transient
    /// accept errors are retried here and never surface.
    pub async fn accept(&mut self) -> io::Result<Accepted> {
        loop {
            tokio::select! {
                changed = self.shutdown.wait_for(|&requested| requested) => {
                    // Err means the signal owner is gone; treat it as a stop.
                    if changed.is_err() {
                        tracing::warn!("shutdown signal dropped; stopping accept loop");
                    }
                    return Ok(Accepted::Shutdown);
                }
                result = self.socket.accept() => match result {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        return Ok(Accepted::Connection(Connection { stream, peer }));
                    }
                    Err(err) if is_transient(&err) => {
                        tracing::debug!(%err, "transient accept error; retrying");
                    }
                    Err(err) => return Err(err),
                },
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
