//! TLS helpers for development and tests.
//!
//! [`self_signed`] and [`trusting`] build a matching server/client pair without
//! touching the system trust store: the client pins the generated certificate
//! as its only root. Both use the `ring` provider explicitly, so no process
//! default has to be installed for them.

use crate::{Error, Result, TlsClientConfig};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::sync::Arc;

/// Install `ring` as the process-wide rustls crypto provider.
///
/// Needed only by callers that build rustls configs with the plain
/// `builder()` API. Installing twice is harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Generate a self-signed certificate for `names` and a TLS 1.3 server config
/// presenting it.
///
/// Returns the config together with the certificate so a client can trust it.
pub fn self_signed(
    names: &[&str],
) -> Result<(Arc<rustls::ServerConfig>, CertificateDer<'static>)> {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let cert = rcgen::generate_simple_self_signed(names)
        .map_err(|e| Error::Tls(format!("certificate generation failed: {e}")))?;
    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let priv_key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let server_crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], priv_key.into())
        .map_err(|e| Error::Tls(format!("certificate error: {e}")))?;

    Ok((Arc::new(server_crypto), cert_der))
}

/// TLS 1.3 client config whose only trust anchor is `cert`.
pub fn trusting(cert: CertificateDer<'static>) -> Result<TlsClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(cert)
        .map_err(|e| Error::Tls(format!("untrusted certificate: {e}")))?;

    let client_crypto = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsClientConfig::new(Arc::new(client_crypto)))
}
