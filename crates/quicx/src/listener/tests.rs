//! Unit tests for the listener.

use super::*;
use crate::{dial, tls, TlsClientConfig};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

fn setup() -> (Arc<rustls::ServerConfig>, TlsClientConfig) {
    tls::install_crypto_provider();
    let (server, cert) = tls::self_signed(&["localhost"]).expect("server config");
    let client = tls::trusting(cert).expect("client config").with_server_name("localhost");
    (server, client)
}

async fn bound() -> (QuicListener, TlsClientConfig) {
    let (server, client) = setup();
    let listener = listen("udp", "127.0.0.1:0", server, None)
        .await
        .expect("listen failed");
    (listener, client)
}

#[tokio::test]
async fn test_listen_reports_assigned_port() {
    let (listener, _) = bound().await;
    let addr = listener.local_addr().expect("local addr");
    assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_ne!(addr.port(), 0, "kernel should assign a port");
}

#[tokio::test]
async fn test_listen_empty_host_binds_wildcard() {
    let (server, _) = setup();
    let listener = listen("udp4", ":0", server, None).await.expect("listen failed");
    let addr = listener.local_addr().expect("local addr");
    assert!(addr.ip().is_unspecified());
}

#[tokio::test]
async fn test_listen_empty_address_is_wildcard_any_port() {
    let (server, _) = setup();
    let listener = listen("udp", "", server, None).await.expect("listen failed");
    let addr = listener.local_addr().expect("local addr");
    assert!(addr.ip().is_unspecified());
    assert_ne!(addr.port(), 0);
}

#[tokio::test]
async fn test_listen_unknown_network() {
    let (server, _) = setup();
    let err = listen("tcp", "127.0.0.1:0", server, None).await.unwrap_err();
    match err {
        Error::Bind { op, network, addr, source } => {
            assert_eq!(op, "listen");
            assert_eq!(network, "tcp");
            assert_eq!(addr, "127.0.0.1:0");
            assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
        }
        other => panic!("expected bind error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_listen_family_mismatch() {
    let (server, _) = setup();
    let err = listen("udp6", "127.0.0.1:0", server, None).await.unwrap_err();
    assert!(matches!(err, Error::Bind { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_listen_port_in_use() {
    let (listener, _) = bound().await;
    let taken = listener.local_addr().unwrap().to_string();

    let (server, _) = setup();
    let err = listen("udp", &taken, server, None).await.unwrap_err();
    match err {
        Error::Bind { source, .. } => assert_eq!(source.kind(), io::ErrorKind::AddrInUse),
        other => panic!("expected bind error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_close_twice_is_stable_error() {
    let (listener, _) = bound().await;
    assert!(listener.close().is_ok());
    assert!(matches!(listener.close(), Err(Error::ListenerClosed)));
    assert!(matches!(listener.close(), Err(Error::ListenerClosed)));
}

#[tokio::test]
async fn test_accept_after_close_fails() {
    let (listener, _) = bound().await;
    listener.close().unwrap();
    let result = timeout(Duration::from_secs(1), listener.accept())
        .await
        .expect("accept hung after close");
    assert!(matches!(result, Err(Error::ListenerClosed)));
}

#[tokio::test]
async fn test_close_unblocks_pending_accept() {
    let (listener, _) = bound().await;
    let listener = Arc::new(listener);

    let pending = tokio::spawn({
        let listener = listener.clone();
        async move { listener.accept().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished(), "accept should block without peers");

    listener.close().unwrap();
    let result = timeout(Duration::from_secs(1), pending)
        .await
        .expect("accept not unblocked by close")
        .expect("accept task panicked");
    assert!(matches!(result, Err(Error::ListenerClosed)));
}

#[tokio::test]
async fn test_accept_waits_for_first_stream() {
    let (listener, client) = bound().await;
    let addr = listener.local_addr().unwrap().to_string();
    let listener = Arc::new(listener);

    let server_task = tokio::spawn({
        let listener = listener.clone();
        async move { listener.accept().await }
    });

    let mut conn = dial(&addr, &client, None).await.expect("dial failed");

    // Session is up, but the stream is not announced until data flows.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !server_task.is_finished(),
        "accept must not return before the stream is accepted"
    );

    conn.write_all(b"x").await.unwrap();
    let mut accepted = timeout(Duration::from_secs(5), server_task)
        .await
        .expect("accept timed out")
        .expect("server task panicked")
        .expect("accept failed");

    let mut buf = [0u8; 1];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"x");
    assert!(!accepted.is_owned_socket());
}

#[tokio::test]
async fn test_accepted_connection_outlives_listener_close() {
    let (listener, client) = bound().await;
    let addr = listener.local_addr().unwrap().to_string();

    let mut conn = dial(&addr, &client, None).await.expect("dial failed");
    conn.write_all(b"hi").await.unwrap();
    let mut accepted = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept failed");

    listener.close().unwrap();

    accepted.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(&buf, b"still here");
}

#[tokio::test]
async fn test_accept_through_trait_object() {
    let (listener, _) = bound().await;
    let listener: Box<dyn Listener<Conn = QuicConn>> = Box::new(listener);
    assert!(listener.local_addr().is_ok());
    listener.close().unwrap();
    assert!(listener.accept().await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_dial_completes_without_pending_accept() {
    let (listener, client) = bound().await;
    let addr = listener.local_addr().unwrap().to_string();

    // Nobody is inside accept while the handshake runs.
    let mut conn = timeout(Duration::from_secs(5), dial(&addr, &client, None))
        .await
        .expect("dial timed out")
        .expect("dial failed");
    conn.write_all(b"early").await.unwrap();

    let mut accepted = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept failed");
    let mut buf = [0u8; 5];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"early");
}

#[tokio::test]
async fn test_silent_client_does_not_block_others() {
    let (listener, client) = bound().await;
    let addr = listener.local_addr().unwrap().to_string();

    let mut quiet = timeout(Duration::from_secs(5), dial(&addr, &client, None))
        .await
        .expect("first dial timed out")
        .expect("first dial failed");
    let mut chatty = timeout(Duration::from_secs(5), dial(&addr, &client, None))
        .await
        .expect("second dial blocked by a silent peer")
        .expect("second dial failed");

    chatty.write_all(b"b").await.unwrap();
    let mut first = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept failed");
    let mut buf = [0u8; 1];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"b", "the peer that wrote first is accepted first");

    quiet.write_all(b"a").await.unwrap();
    let mut second = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept failed");
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"a");
}

#[tokio::test]
async fn test_close_drops_unaccepted_connections() {
    let (listener, client) = bound().await;
    let addr = listener.local_addr().unwrap().to_string();

    let mut conn = dial(&addr, &client, None).await.expect("dial failed");
    conn.write_all(b"x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    listener.close().unwrap();
    assert!(matches!(listener.accept().await, Err(Error::ListenerClosed)));

    let reason = timeout(Duration::from_secs(5), conn.session().closed())
        .await
        .expect("queued session should be closed with the listener");
    assert!(matches!(
        reason,
        quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::ConnectionClosed(_)
    ));
}
