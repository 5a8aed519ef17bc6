//! Server side: a bound endpoint producing one connection per inbound session.

use crate::config::{self, host_of};
use crate::socket;
use crate::{Config, Error, QuicConn, Result};
use async_trait::async_trait;
use quinn::{Endpoint, VarInt};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
mod tests;

/// Inbound connections held ready (handshake done, stream accepted) before
/// anyone calls `accept`.
pub const ACCEPT_QUEUE_DEPTH: usize = 32;

/// Outcome of one inbound session, as queued for `accept`.
type Ready = Result<QuicConn>;

/// Something that hands out connections, one `accept` at a time.
///
/// [`serve`](crate::serve) is written against this trait rather than
/// [`QuicListener`] directly.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Connection type produced by `accept`.
    type Conn: Send + 'static;

    /// Wait for the next connection.
    ///
    /// Must return an error satisfying [`Error::is_closed`] once the listener
    /// has been closed.
    async fn accept(&self) -> Result<Self::Conn>;

    /// Stop accepting; blocked and future `accept` calls fail.
    fn close(&self) -> Result<()>;

    /// Address the listener is reachable on.
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Address family selected by the network name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn parse(network: &str) -> io::Result<Self> {
        match network {
            "udp" => Ok(Family::Any),
            "udp4" => Ok(Family::V4),
            "udp6" => Ok(Family::V6),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown network {network}"),
            )),
        }
    }

    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }

    fn unspecified(self) -> IpAddr {
        match self {
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            Family::Any | Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Bind a QUIC server on `laddr` and return a listener for it.
///
/// `network` is `"udp"`, `"udp4"` or `"udp6"` and restricts which resolved
/// addresses are acceptable; `"udp"` prefers IPv4. An empty host (`":4433"`)
/// binds the wildcard address of the family, and an empty `laddr` is `":0"`.
///
/// Inbound handshakes run in the background from here on, whether or not
/// anyone is accepting; up to [`ACCEPT_QUEUE_DEPTH`] ready connections wait
/// for [`accept`](QuicListener::accept).
///
/// # Errors
///
/// [`Error::Bind`], carrying the operation, network and address, if the
/// network is unknown, `laddr` does not resolve, or the socket cannot be
/// bound; [`Error::Tls`] if `tls` cannot be used for QUIC.
pub async fn listen(
    network: &str,
    laddr: &str,
    tls: Arc<rustls::ServerConfig>,
    config: Option<Arc<Config>>,
) -> Result<QuicListener> {
    let bind_err = |source| Error::Bind {
        op: "listen",
        network: network.to_string(),
        addr: laddr.to_string(),
        source,
    };

    let family = Family::parse(network).map_err(bind_err)?;
    let local = resolve_local(family, laddr).await.map_err(bind_err)?;
    let server_config = config::server_config(tls, config)?;
    let endpoint = socket::bind_endpoint(local, Some(server_config)).map_err(bind_err)?;

    let closed = CancellationToken::new();
    let (ready_tx, ready_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
    tokio::spawn(accept_sessions(endpoint.clone(), ready_tx, closed.clone()));

    debug!(network, local = ?endpoint.local_addr().ok(), "listening");
    Ok(QuicListener {
        endpoint,
        ready: Mutex::new(ready_rx),
        closing: AtomicBool::new(false),
        closed,
    })
}

async fn resolve_local(family: Family, laddr: &str) -> io::Result<SocketAddr> {
    let laddr = if laddr.is_empty() { ":0" } else { laddr };
    if host_of(laddr).is_empty() {
        let port = laddr
            .rsplit_once(':')
            .map(|(_, port)| port)
            .unwrap_or_default()
            .parse::<u16>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        return Ok(SocketAddr::new(family.unspecified(), port));
    }

    let addrs = tokio::net::lookup_host(laddr)
        .await?
        .filter(|addr| family.admits(addr));
    socket::prefer_ipv4(addrs)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no suitable address found"))
}

/// Drive inbound sessions until the listener closes. Each one is completed
/// on its own task so a slow or silent peer holds up nobody else.
async fn accept_sessions(
    endpoint: Endpoint,
    ready: mpsc::Sender<Ready>,
    closed: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = closed.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };
        tokio::spawn(establish(
            endpoint.clone(),
            incoming,
            ready.clone(),
            closed.clone(),
        ));
    }
    debug!(local = ?endpoint.local_addr().ok(), "accept task stopped");
}

/// Finish one inbound session and queue it. Dropped sessions are closed by
/// the engine.
async fn establish(
    endpoint: Endpoint,
    incoming: quinn::Incoming,
    ready: mpsc::Sender<Ready>,
    closed: CancellationToken,
) {
    let outcome = tokio::select! {
        _ = closed.cancelled() => return,
        outcome = accept_session(&endpoint, incoming) => outcome,
    };
    if let Err(e) = &outcome {
        debug!(error = %e, "inbound session failed");
    }
    tokio::select! {
        _ = closed.cancelled() => {}
        _ = ready.send(outcome) => {}
    }
}

async fn accept_session(endpoint: &Endpoint, incoming: quinn::Incoming) -> Result<QuicConn> {
    let session = incoming.await.map_err(Error::Handshake)?;
    debug!(remote = %session.remote_address(), "session accepted");

    let stream = match session.accept_bi().await {
        Ok(stream) => stream,
        Err(e) => {
            session.close(VarInt::from_u32(0), b"stream accept failed");
            return Err(Error::Stream(e));
        }
    };
    QuicConn::accepted(endpoint.clone(), session, stream).map_err(Error::from)
}

/// A bound QUIC server endpoint.
///
/// Each [`accept`](Self::accept) yields one [`QuicConn`] per inbound session.
/// Accepted connections share the listener's UDP socket and outlive
/// [`close`](Self::close); the socket itself is released once the listener and
/// every connection accepted from it are gone.
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
    ready: Mutex<mpsc::Receiver<Ready>>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl QuicListener {
    /// Wait for the next inbound session and its first stream.
    ///
    /// Yields connections in the order they became ready: handshake finished
    /// and the peer's stream accepted, which happens once the peer writes to
    /// it. Safe to call from several tasks at once.
    ///
    /// # Errors
    ///
    /// - [`Error::ListenerClosed`] when the listener is closed, including while
    ///   this call is waiting
    /// - [`Error::Handshake`] if an inbound session fails to establish
    /// - [`Error::Stream`] if the session ends before opening its stream
    pub async fn accept(&self) -> Result<QuicConn> {
        if self.closed.is_cancelled() {
            return Err(Error::ListenerClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::ListenerClosed),
            ready = self.next_ready() => ready,
        }
    }

    async fn next_ready(&self) -> Result<QuicConn> {
        self.ready
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Err(Error::ListenerClosed))
    }

    /// Stop accepting.
    ///
    /// New handshakes are refused, sessions still in progress or queued
    /// but never accepted are dropped, and every pending or future
    /// [`accept`](Self::accept) returns [`Error::ListenerClosed`] promptly.
    /// Connections already accepted keep working.
    ///
    /// # Errors
    ///
    /// [`Error::ListenerClosed`] if the listener was already closed.
    pub fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Err(Error::ListenerClosed);
        }
        self.endpoint.set_server_config(None);
        self.closed.cancel();
        // A blocked accept holding the queue lets go once it sees the cancel;
        // its leftovers go with the listener.
        if let Ok(mut ready) = self.ready.try_lock() {
            ready.close();
            while ready.try_recv().is_ok() {}
        }
        debug!(local = ?self.endpoint.local_addr().ok(), "listener closed");
        Ok(())
    }

    /// Address the endpoint is bound to, with the port the kernel assigned.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl Listener for QuicListener {
    type Conn = QuicConn;

    async fn accept(&self) -> Result<QuicConn> {
        QuicListener::accept(self).await
    }

    fn close(&self) -> Result<()> {
        QuicListener::close(self)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        QuicListener::local_addr(self)
    }
}
