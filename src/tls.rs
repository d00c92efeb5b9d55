//! TLS termination with on-demand leaf certificates
//!
//! The handshake is accepted lazily: the ClientHello is read first so the
//! SNI can pick the leaf, then the handshake completes against a
//! per-connection server config. Failures are turned into a
//! [`TlsRequest`](crate::TlsRequest)-shaped cause for the event bus.

use crate::ca::CertificateAuthority;
use crate::socket::BoxedStream;
use std::sync::Arc;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::LazyConfigAcceptor;

/// Why a handshake did not complete, plus the SNI if one was seen.
pub(crate) struct TlsFailure {
  pub cause: String,
  pub sni: Option<String>,
}

/// Accept a TLS handshake over `stream`, minting a leaf for the SNI (or
/// `fallback_hostname` when the ClientHello carries none). Returns the
/// decrypted stream and the SNI.
pub(crate) async fn terminate(
  ca: &CertificateAuthority,
  stream: BoxedStream,
  fallback_hostname: &str,
) -> Result<(BoxedStream, Option<String>), TlsFailure> {
  let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
  let start = acceptor.await.map_err(|e| TlsFailure {
    cause: format!("invalid ClientHello: {}", e),
    sni: None,
  })?;

  let client_hello = start.client_hello();
  let sni = client_hello.server_name().map(str::to_string);
  let hostname = sni.clone().unwrap_or_else(|| fallback_hostname.to_string());

  let (chain, key) = ca.cert_for(&hostname).await.map_err(|e| TlsFailure {
    cause: format!("certificate generation failed: {}", e),
    sni: sni.clone(),
  })?;

  let mut config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| TlsFailure {
      cause: format!("invalid leaf certificate: {}", e),
      sni: sni.clone(),
    })?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];

  let tls_stream = start
    .into_stream(Arc::new(config))
    .await
    .map_err(|e| TlsFailure {
      cause: format!("handshake failed: {}", e),
      sni: sni.clone(),
    })?;

  Ok((Box::new(tls_stream), sni))
}
