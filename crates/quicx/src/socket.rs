//! UDP socket binding and the endpoint that drives it.

use crate::conn::CLOSE_LINGER;
use quinn::{Endpoint, EndpointConfig, ServerConfig, VarInt};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use tracing::debug;

/// Wildcard address of the same family as `remote`, ephemeral port.
pub(crate) fn wildcard_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Bind `addr` and hand the socket to a new endpoint.
///
/// The endpoint takes ownership of the socket; it is released once the
/// endpoint is closed and every handle to it has been dropped.
pub(crate) fn bind_endpoint(
    addr: SocketAddr,
    server_config: Option<ServerConfig>,
) -> io::Result<Endpoint> {
    let socket = UdpSocket::bind(addr)?;
    let runtime = quinn::default_runtime()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no async runtime found"))?;
    let endpoint = Endpoint::new(EndpointConfig::default(), server_config, socket, runtime)?;
    debug!(local = ?endpoint.local_addr().ok(), "udp socket bound");
    Ok(endpoint)
}

/// Close `endpoint` and give in-flight close frames a bounded chance to go out.
///
/// Fails with `TimedOut` when sessions are still draining after
/// [`CLOSE_LINGER`]; the socket is freed anyway once the endpoint is dropped.
pub(crate) async fn release(endpoint: &Endpoint, reason: &'static [u8]) -> io::Result<()> {
    endpoint.close(VarInt::from_u32(0), reason);
    tokio::time::timeout(CLOSE_LINGER, endpoint.wait_idle())
        .await
        .map_err(|_| {
            debug!("endpoint still draining after linger, dropping");
            io::Error::new(io::ErrorKind::TimedOut, "endpoint did not drain")
        })
}

/// Pick the address to use out of a resolver answer: the first IPv4 one,
/// else the first one.
pub(crate) fn prefer_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut first = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        first.get_or_insert(addr);
    }
    first
}

/// Local address the session actually uses.
///
/// An endpoint bound to the wildcard address reports `0.0.0.0`; the session
/// knows better on servers, and on clients the routing table tells which
/// source address reaches the peer.
pub(crate) fn session_local_addr(
    endpoint: &Endpoint,
    session: &quinn::Connection,
) -> io::Result<SocketAddr> {
    let bound = endpoint.local_addr()?;
    let ip = session
        .local_ip()
        .filter(|ip| !ip.is_unspecified())
        .or_else(|| Some(bound.ip()).filter(|ip| !ip.is_unspecified()))
        .or_else(|| route_local_ip(session.remote_address()))
        .unwrap_or_else(|| bound.ip());
    Ok(SocketAddr::new(ip, bound.port()))
}

/// Source address the kernel would pick to reach `remote`. Sends nothing.
fn route_local_ip(remote: SocketAddr) -> Option<IpAddr> {
    let probe = UdpSocket::bind(wildcard_for(&remote)).ok()?;
    probe.connect(remote).ok()?;
    probe.local_addr().ok().map(|addr| addr.ip())
}
