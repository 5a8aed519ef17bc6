//! Connection handle: one socket, one session, one stream.

use crate::socket;
use crate::{Error, Result};
use quinn::{Endpoint, RecvStream, SendStream, VarInt};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// How long `close` waits for the peer to acknowledge buffered writes, and for
/// an owned endpoint to drain, before releasing anyway.
pub const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Application error code sent when a handle closes its stream and session.
const CLOSE_CODE: VarInt = VarInt::from_u32(0);

/// Socket layer of a connection.
#[derive(Debug)]
enum SocketLayer {
    /// Dialed: the handle is the only user of the endpoint.
    Owned(Endpoint),
    /// Accepted: the endpoint belongs to the listener.
    Shared(Endpoint),
}

impl SocketLayer {
    fn endpoint(&self) -> &Endpoint {
        match self {
            SocketLayer::Owned(endpoint) | SocketLayer::Shared(endpoint) => endpoint,
        }
    }
}

/// A QUIC session carrying exactly one bidirectional stream, usable as a
/// plain byte stream.
///
/// Reads and writes go straight to the stream. [`close`](Self::close) releases
/// the stream, the session and, for dialed connections, the socket; afterwards
/// every read, write and close fails.
///
/// Dropping a handle without closing it still releases everything: the
/// engine closes sessions and endpoints whose last handle goes away.
#[derive(Debug)]
pub struct QuicConn {
    socket: SocketLayer,
    session: quinn::Connection,
    send: SendStream,
    recv: RecvStream,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    closed: bool,
}

impl QuicConn {
    /// Compose a dialed connection. The handle owns the endpoint.
    pub(crate) fn dialed(
        endpoint: Endpoint,
        session: quinn::Connection,
        (send, recv): (SendStream, RecvStream),
    ) -> io::Result<Self> {
        Self::compose(SocketLayer::Owned(endpoint), session, send, recv)
    }

    /// Compose an accepted connection on the listener's endpoint.
    pub(crate) fn accepted(
        endpoint: Endpoint,
        session: quinn::Connection,
        (send, recv): (SendStream, RecvStream),
    ) -> io::Result<Self> {
        Self::compose(SocketLayer::Shared(endpoint), session, send, recv)
    }

    fn compose(
        socket: SocketLayer,
        session: quinn::Connection,
        send: SendStream,
        recv: RecvStream,
    ) -> io::Result<Self> {
        let local_addr = socket::session_local_addr(socket.endpoint(), &session)?;
        let remote_addr = session.remote_address();
        debug!(
            local = %local_addr,
            remote = %remote_addr,
            stream = %send.id(),
            "connection ready"
        );
        Ok(Self {
            socket,
            session,
            send,
            recv,
            local_addr,
            remote_addr,
            closed: false,
        })
    }

    /// Local address used by the session.
    ///
    /// Never the wildcard bind address: the concrete source address the
    /// session sends from, with the bound port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote address negotiated by the session.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Underlying QUIC session, for statistics and handshake data.
    pub fn session(&self) -> &quinn::Connection {
        &self.session
    }

    /// Whether closing this handle also closes its UDP socket.
    ///
    /// True for dialed connections, false for accepted ones whose socket
    /// belongs to the listener.
    pub fn is_owned_socket(&self) -> bool {
        matches!(self.socket, SocketLayer::Owned(_))
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the stream, the session and (when owned) the socket.
    ///
    /// Every layer is released even if an earlier one fails; failures are
    /// collected into [`Error::Close`]. A layer reporting it was already
    /// released (stream finished or reset, session lost) counts as released.
    ///
    /// Buffered writes get up to [`CLOSE_LINGER`] to be acknowledged before
    /// the session is closed.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the handle was already closed
    /// - [`Error::Io`] with `TimedOut` if an owned socket still had sessions
    ///   draining after [`CLOSE_LINGER`]; it is freed when the handle drops
    /// - [`Error::Close`] when more than one layer failed
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.closed = true;
        let mut failures = Vec::new();

        // Stream: FIN our half, wait for the peer to take it, stop theirs.
        if self.send.finish().is_ok() {
            match tokio::time::timeout(CLOSE_LINGER, self.send.stopped()).await {
                Ok(Ok(_)) => {}
                Ok(Err(quinn::StoppedError::ConnectionLost(_))) => {}
                Ok(Err(e)) => {
                    failures.push(Error::Io(io::Error::new(io::ErrorKind::Other, e)));
                }
                Err(_) => {
                    debug!(remote = %self.remote_addr, "stream not drained before linger");
                }
            }
        }
        // Err only when the receive half has already ended.
        let _ = self.recv.stop(CLOSE_CODE);

        // Session.
        self.session.close(CLOSE_CODE, b"close");

        // Socket, when it is ours.
        if let SocketLayer::Owned(endpoint) = &self.socket {
            if let Err(e) = socket::release(endpoint, b"close").await {
                failures.push(Error::Io(e));
            }
        }

        debug!(local = %self.local_addr, remote = %self.remote_addr, "connection closed");
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(Error::Close(failures)),
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, Error::Closed)
}

impl AsyncRead for QuicConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_error()));
        }
        AsyncRead::poll_read(Pin::new(&mut this.recv), cx, buf)
    }
}

impl AsyncWrite for QuicConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_error()));
        }
        AsyncWrite::poll_write(Pin::new(&mut this.send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_error()));
        }
        AsyncWrite::poll_flush(Pin::new(&mut this.send), cx)
    }

    /// Finishes the send half; the peer reads EOF. Reading stays possible.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_error()));
        }
        AsyncWrite::poll_shutdown(Pin::new(&mut this.send), cx)
    }
}
