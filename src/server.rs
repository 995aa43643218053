//! TCP server for the message log.
//!
//! Owns the listening socket and runs the accept loop. Each accepted
//! connection is served to completion before the next `accept`, so the
//! store is never touched by two conversations at once.

use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::signals::{self, ShutdownToken};
use crate::storage::MessageStore;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

const LISTENER_TOKEN: Token = Token(0);

/// Longest wait before the shutdown flag is checked again
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Fatal errors while bringing the server up
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Server socket create failed: {0}")]
    Socket(#[source] io::Error),
    #[error("Socket option setting failed: {0}")]
    SocketOption(#[source] io::Error),
    #[error("Server socket bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Server socket listen failed: {0}")]
    Listen(#[source] io::Error),
    #[error("Failed to register listener: {0}")]
    Poll(#[source] io::Error),
    #[error("Failed to set up signal handler: {0}")]
    Signal(#[source] io::Error),
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    store: MessageStore,
    shutdown: ShutdownToken,
    chunk_size: usize,
}

impl Server {
    /// Create, bind and register the listening socket, then install the
    /// termination signal handlers.
    ///
    /// On failure everything acquired so far is dropped, which closes the
    /// socket.
    pub fn init(config: &Config, shutdown: ShutdownToken) -> Result<Self, SetupError> {
        let listener = create_listener(config.listen, config.backlog)?;
        info!(addr = %config.listen, "Listening");

        let poll = Poll::new().map_err(SetupError::Poll)?;
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                LISTENER_TOKEN,
                Interest::READABLE,
            )
            .map_err(SetupError::Poll)?;

        signals::install(&shutdown).map_err(SetupError::Signal)?;

        Ok(Server {
            listener,
            poll,
            events: Events::with_capacity(8),
            store: MessageStore::new(config.store_path.clone()),
            shutdown,
            chunk_size: config.chunk_size,
        })
    }

    /// Accept and serve connections until shutdown is requested.
    pub fn run(&mut self) {
        let handler = ConnectionHandler::new(&self.store, self.chunk_size);

        while !self.shutdown.is_requested() {
            match self.poll.poll(&mut self.events, Some(POLL_INTERVAL)) {
                Ok(()) => {}
                // A signal landed; the loop condition decides what happens
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Failed to wait for connections");
                    continue;
                }
            }

            // Try accepting on timeouts too: readiness is edge-triggered and
            // a failed accept can leave connections queued without a new edge.
            while !self.shutdown.is_requested() {
                match self.listener.accept() {
                    Ok((stream, _)) => handler.converse(stream),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(error = %e, "Failed to accept client connection");
                        break;
                    }
                }
            }
        }

        info!("Caught signal, exiting");
    }

    /// Close the listening socket and delete the message store.
    ///
    /// Failures are logged and never stop the teardown.
    pub fn shutdown(self) {
        if let Err(e) = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&self.listener.as_raw_fd()))
        {
            debug!(error = %e, "Failed to deregister listener");
        }
        drop(self.listener);

        match self.store.delete() {
            Ok(()) => info!(path = %self.store.path().display(), "Removed message store"),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No message store to remove")
            }
            Err(e) => error!(error = %e, "Could not delete message store"),
        }
    }

    /// Address the listener is bound to
    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, SetupError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(SetupError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(SetupError::SocketOption)?;
    socket
        .bind(&addr.into())
        .map_err(|source| SetupError::Bind { addr, source })?;
    socket.listen(backlog).map_err(SetupError::Listen)?;
    socket
        .set_nonblocking(true)
        .map_err(SetupError::SocketOption)?;

    Ok(socket.into())
}
