//! Passthrough to the real origin
//!
//! Each passthrough opens a fresh connection: dial the origin
//! reconstructed from the request's effective URL, forward the request
//! minus hop-by-hop headers, read the origin's response back. Origins in
//! test environments routinely present self-signed certificates, so the
//! upstream TLS client skips verification.

use crate::error::{Error, Result};
use crate::http1;
use crate::record::{Protocol, RequestRecord};
use crate::rule::ResponseSpec;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Cap for buffered origin response bodies.
const MAX_UPSTREAM_BODY: usize = 100 * 1024 * 1024;

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

/// The origin coordinates reconstructed from a request's effective URL.
fn origin_of(request: &RequestRecord) -> Result<(String, u16, String)> {
  let uri: http::Uri = request
    .url
    .parse()
    .map_err(|_| Error::upstream(format!("unparsable request URL {:?}", request.url)))?;
  let host = uri
    .host()
    .map(str::to_string)
    .or_else(|| request.hostname.clone())
    .ok_or_else(|| Error::upstream("request has no origin host"))?;
  let port = uri
    .port_u16()
    .unwrap_or_else(|| request.protocol.default_port());
  let target = uri
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());
  Ok((host, port, target))
}

fn forwardable_headers(request: &RequestRecord, host: &str, port: u16) -> Vec<(String, String)> {
  let mut headers: Vec<(String, String)> = request
    .headers
    .iter()
    .filter(|(name, _)| !http1::is_hop_by_hop(name))
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect();
  if !request.headers.contains("host") {
    let value = if port == request.protocol.default_port() {
      host.to_string()
    } else {
      format!("{}:{}", host, port)
    };
    headers.push(("host".to_string(), value));
  }
  headers.push(("connection".to_string(), "close".to_string()));
  headers
}

/// Forward `request` to its origin and return the origin's response as a
/// descriptor. Any dial/handshake/read failure surfaces as
/// [`Error::Upstream`].
pub(crate) async fn forward(request: &RequestRecord) -> Result<ResponseSpec> {
  let (host, port, target) = origin_of(request)?;
  let headers = forwardable_headers(request, &host, port);
  let body = request.body.bytes().clone();

  let tcp = TcpStream::connect((host.as_str(), port))
    .await
    .map_err(|e| Error::upstream(format!("connect to {}:{} failed: {}", host, port, e)))?;

  match request.protocol {
    Protocol::Http => {
      exchange(tcp, request, &target, &headers, &body).await
    }
    Protocol::Https => {
      let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
      let connector = TlsConnector::from(Arc::new(config));
      let server_name = ServerName::try_from(host.clone())
        .map_err(|_| Error::upstream(format!("invalid server name {:?}", host)))?;
      let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::upstream(format!("TLS to {}:{} failed: {}", host, port, e)))?;
      exchange(tls, request, &target, &headers, &body).await
    }
  }
}

async fn exchange<S>(
  mut stream: S,
  request: &RequestRecord,
  target: &str,
  headers: &[(String, String)],
  body: &[u8],
) -> Result<ResponseSpec>
where
  S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
  http1::write_request(&mut stream, &request.method, target, headers, body)
    .await
    .map_err(|e| Error::upstream(format!("write to origin failed: {}", e)))?;

  let mut buf = Vec::new();
  let head = http1::read_response_head(&mut stream, &mut buf, 64 * 1024)
    .await
    .map_err(|e| Error::upstream(format!("read from origin failed: {}", e)))?;
  let body = http1::read_response_body(&mut stream, &mut buf, &head.headers, MAX_UPSTREAM_BODY)
    .await
    .map_err(|e| Error::upstream(format!("read from origin failed: {}", e)))?;

  let headers = head
    .headers
    .iter()
    .filter(|(name, _)| !http1::is_hop_by_hop(name))
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect();

  Ok(ResponseSpec {
    status: head.status.as_u16(),
    status_message: Some(head.reason),
    headers,
    body: body.into(),
  })
}

/// The 502 descriptor written when the origin cannot be reached.
pub(crate) fn bad_gateway(error: &Error) -> ResponseSpec {
  ResponseSpec::new(502)
    .with_header("content-type", "text/plain")
    .with_body(format!("Passthrough failed: {}", error))
}
