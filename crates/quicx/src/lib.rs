//! Stream-socket style connections over QUIC.
//!
//! Each connection is one QUIC session carrying exactly one bidirectional
//! stream, exposed as a single value implementing tokio's
//! [`AsyncRead`](tokio::io::AsyncRead) and [`AsyncWrite`](tokio::io::AsyncWrite).
//! Code written against a plain byte stream runs unmodified over an encrypted,
//! low-latency transport.
//!
//! - [`dial`] binds a UDP socket, completes the handshake and opens the stream
//! - [`listen`] binds a server endpoint; [`QuicListener::accept`] yields one
//!   [`QuicConn`] per inbound session once its stream has been accepted
//! - [`serve`] drives an accept loop into a [`Handler`] until cancelled
//!
//! # Example
//!
//! ```no_run
//! use quicx::{dial, listen, tls};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (server_tls, cert) = tls::self_signed(&["localhost"])?;
//! let listener = listen("udp", "127.0.0.1:0", server_tls, None).await?;
//! let addr = listener.local_addr()?;
//!
//! let client_tls = tls::trusting(cert)?.with_server_name("localhost");
//! let mut conn = dial(&addr.to_string(), &client_tls, None).await?;
//! conn.write_all(b"ping").await?;
//!
//! let mut accepted = listener.accept().await?;
//! let mut buf = [0u8; 4];
//! accepted.read_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod conn;
pub mod dial;
pub mod error;
pub mod listener;
pub mod serve;
mod socket;
pub mod tls;

pub use config::{Config, TlsClientConfig};
pub use conn::QuicConn;
pub use dial::dial;
pub use error::{Error, Result};
pub use listener::{listen, Listener, QuicListener};
pub use serve::{serve, Handler};
