//! Connection errors.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while establishing, using or tearing down connections.
///
/// Variants follow the layer that failed: local socket, session handshake,
/// stream setup, or the established handle.
#[derive(Debug, Error)]
pub enum Error {
    /// Local address resolution or UDP socket bind failed.
    #[error("{op} {network} {addr}: {source}")]
    Bind {
        /// Operation that was binding (`"dial"` or `"listen"`).
        op: &'static str,
        /// Network name the caller asked for.
        network: String,
        /// Address as given by the caller.
        addr: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// Remote address could not be resolved.
    #[error("resolve {addr}: {source}")]
    Resolve {
        /// Address as given by the caller.
        addr: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// TLS configuration is unusable for QUIC.
    #[error("TLS configuration rejected: {0}")]
    Tls(String),

    /// The QUIC engine refused to start the handshake.
    #[error("connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    /// Session establishment failed before the handshake completed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] quinn::ConnectionError),

    /// The session was established but its stream could not be opened or accepted.
    #[error("stream setup failed: {0}")]
    Stream(#[source] quinn::ConnectionError),

    /// The listener has been closed.
    #[error("listener closed")]
    ListenerClosed,

    /// The connection handle has already been closed.
    #[error("connection closed")]
    Closed,

    /// One or more layers failed to release on close.
    #[error("close failed: {}", CloseFailures(.0))]
    Close(Vec<Error>),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means the listener or handle is gone for good.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ListenerClosed | Error::Closed)
    }
}

struct CloseFailures<'a>(&'a [Error]);

impl fmt::Display for CloseFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
