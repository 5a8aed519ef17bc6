//! Configuration passed through to the QUIC engine.

use crate::{Error, Result};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use std::sync::Arc;

/// Transport configuration (idle timeout, stream limits, congestion control).
///
/// Passed through to the engine unexamined; `None` wherever a `Config` is
/// accepted means the engine defaults.
pub type Config = quinn::TransportConfig;

/// Client TLS settings for [`dial`](crate::dial).
///
/// Wraps a rustls client config, which carries no server name of its own.
/// When no name is set, the host part of the dialed address is used.
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    crypto: Arc<rustls::ClientConfig>,
    server_name: Option<String>,
}

impl TlsClientConfig {
    /// Wrap a rustls client config.
    pub fn new(crypto: Arc<rustls::ClientConfig>) -> Self {
        Self {
            crypto,
            server_name: None,
        }
    }

    /// Name to verify the server certificate against.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Configured server name, if any.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Underlying rustls config.
    pub fn crypto(&self) -> &Arc<rustls::ClientConfig> {
        &self.crypto
    }

    pub(crate) fn to_quinn(&self, transport: Option<Arc<Config>>) -> Result<quinn::ClientConfig> {
        let crypto = QuicClientConfig::try_from(self.crypto.clone())
            .map_err(|e| Error::Tls(e.to_string()))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        if let Some(transport) = transport {
            client_config.transport_config(transport);
        }
        Ok(client_config)
    }
}

impl From<Arc<rustls::ClientConfig>> for TlsClientConfig {
    fn from(crypto: Arc<rustls::ClientConfig>) -> Self {
        Self::new(crypto)
    }
}

pub(crate) fn server_config(
    tls: Arc<rustls::ServerConfig>,
    transport: Option<Arc<Config>>,
) -> Result<quinn::ServerConfig> {
    let crypto = QuicServerConfig::try_from(tls).map_err(|e| Error::Tls(e.to_string()))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    if let Some(transport) = transport {
        server_config.transport_config(transport);
    }
    Ok(server_config)
}

/// Host part of a `host:port` string, without IPv6 brackets.
pub(crate) fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
