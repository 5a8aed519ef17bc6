//! Client side: socket, handshake, stream, in that order.

use crate::config::host_of;
use crate::socket;
use crate::{Config, Error, QuicConn, Result, TlsClientConfig};
use quinn::{Endpoint, RecvStream, SendStream, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Open a QUIC connection to `addr` and return it as a byte stream.
///
/// Binds a UDP socket on an ephemeral port, completes the handshake and opens
/// one bidirectional stream. Returns only once the session is secured with
/// forward-secure keys and the stream is usable.
///
/// `addr` is `host:port`; DNS names are resolved, preferring an IPv4 address.
/// The TLS server name is the one set on `tls`, or else the host part of
/// `addr`.
///
/// Nothing is retried. On failure everything acquired so far (socket, session)
/// is released before the error is returned.
///
/// The peer learns about the stream when the first bytes are written, so the
/// server's [`accept`](crate::QuicListener::accept) completes after the first
/// write on the returned handle.
///
/// # Errors
///
/// - [`Error::Resolve`] if `addr` does not resolve
/// - [`Error::Tls`] if `tls` cannot be used for QUIC
/// - [`Error::Bind`] if the local socket cannot be bound
/// - [`Error::Connect`] / [`Error::Handshake`] if the session is not established
/// - [`Error::Stream`] if the stream cannot be opened
pub async fn dial(
    addr: &str,
    tls: &TlsClientConfig,
    config: Option<Arc<Config>>,
) -> Result<QuicConn> {
    let remote = resolve(addr).await?;
    let client_config = tls.to_quinn(config)?;
    let server_name = tls.server_name().unwrap_or_else(|| host_of(addr));

    let local = socket::wildcard_for(&remote);
    let endpoint = socket::bind_endpoint(local, None).map_err(|source| Error::Bind {
        op: "dial",
        network: "udp".into(),
        addr: local.to_string(),
        source,
    })?;

    let established = establish(&endpoint, client_config, remote, server_name).await;
    match established.and_then(|(session, stream)| {
        QuicConn::dialed(endpoint.clone(), session, stream).map_err(Error::from)
    }) {
        Ok(conn) => Ok(conn),
        Err(err) => {
            debug!(%remote, error = %err, "dial failed, releasing socket");
            if let Err(e) = socket::release(&endpoint, b"dial failed").await {
                debug!(%remote, error = %e, "socket released before draining");
            }
            Err(err)
        }
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    let resolve_err = |source| Error::Resolve {
        addr: addr.to_string(),
        source,
    };
    let addrs = tokio::net::lookup_host(addr).await.map_err(resolve_err)?;
    socket::prefer_ipv4(addrs).ok_or_else(|| {
        resolve_err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no addresses found",
        ))
    })
}

async fn establish(
    endpoint: &Endpoint,
    client_config: quinn::ClientConfig,
    remote: SocketAddr,
    server_name: &str,
) -> Result<(quinn::Connection, (SendStream, RecvStream))> {
    let connecting = endpoint.connect_with(client_config, remote, server_name)?;
    let session = connecting.await.map_err(Error::Handshake)?;
    debug!(%remote, "session established");

    match session.open_bi().await {
        Ok(stream) => Ok((session, stream)),
        Err(e) => {
            session.close(VarInt::from_u32(0), b"stream open failed");
            Err(Error::Stream(e))
        }
    }
}
