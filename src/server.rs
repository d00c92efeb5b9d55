//! The mock proxy instance
//!
//! One `MockProxy` owns its rule registry, CA cache, port binding and
//! event bus; there is no process-global state. Each accepted connection
//! is handled by one spawned task that demultiplexes the first byte,
//! terminates TLS when needed, parses HTTP exchanges and answers them
//! through the rule pipeline.

use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind, ProxyEvent, Subscription};
use crate::http1::{self, RequestHead};
use crate::pipeline::{self, Outcome};
use crate::ports::{self, PortSpec};
use crate::record::{now_millis, Headers, Protocol, RequestRecord, ResponseRecord, Timing, TlsRequest};
use crate::registry::{MockedEndpoint, RuleRegistry};
use crate::rule::RuleData;
use crate::socket::{BoxedStream, ConnHandle, Rewind};
use crate::tls;
use crate::Body;
use bytes::Bytes;
use http::{Method, StatusCode, Version};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

/// First byte of a TLS record marking a handshake.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;
/// How long `stop` waits for connection tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

enum CaSource {
  Pem { cert: String, key: String },
  Files { cert: PathBuf, key: PathBuf },
  Generated,
}

/// Builder for [`MockProxy`].
pub struct MockProxyBuilder {
  ca: Option<CaSource>,
  handler_timeout: Duration,
  default_tls_hostname: String,
  max_head_bytes: usize,
  max_body_bytes: usize,
}

impl Default for MockProxyBuilder {
  fn default() -> Self {
    Self {
      ca: None,
      handler_timeout: Duration::from_secs(30),
      default_tls_hostname: "localhost".to_string(),
      max_head_bytes: 64 * 1024,
      max_body_bytes: 100 * 1024 * 1024,
    }
  }
}

impl MockProxyBuilder {
  /// Terminate TLS with the given PEM-encoded root certificate and key.
  pub fn ca_pem(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
    self.ca = Some(CaSource::Pem {
      cert: cert.into(),
      key: key.into(),
    });
    self
  }

  /// Terminate TLS with a root read from the given PEM files. The files
  /// are only ever read, never written.
  pub fn ca_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
    self.ca = Some(CaSource::Files {
      cert: cert.into(),
      key: key.into(),
    });
    self
  }

  /// Terminate TLS with a freshly generated in-memory root; fetch it via
  /// [`MockProxy::ca_cert_pem`] to trust it in clients.
  pub fn generate_ca(mut self) -> Self {
    self.ca = Some(CaSource::Generated);
    self
  }

  /// Budget for callback handlers before the exchange is failed with 500.
  pub fn handler_timeout(mut self, timeout: Duration) -> Self {
    self.handler_timeout = timeout;
    self
  }

  /// Hostname used for leaf certificates when a ClientHello carries no
  /// SNI and no tunnel target is known.
  pub fn default_tls_hostname(mut self, hostname: impl Into<String>) -> Self {
    self.default_tls_hostname = hostname.into();
    self
  }

  /// Cap on request/response head size.
  pub fn max_head_bytes(mut self, max: usize) -> Self {
    self.max_head_bytes = max;
    self
  }

  /// Cap on buffered request body size.
  pub fn max_body_bytes(mut self, max: usize) -> Self {
    self.max_body_bytes = max;
    self
  }

  /// Validate the configuration and build the (not yet started) proxy.
  pub async fn build(self) -> Result<MockProxy> {
    let ca = match self.ca {
      None => None,
      Some(CaSource::Pem { cert, key }) => Some(CertificateAuthority::from_pem(&cert, &key)?),
      Some(CaSource::Files { cert, key }) => {
        Some(CertificateAuthority::from_files(&cert, &key).await?)
      }
      Some(CaSource::Generated) => Some(CertificateAuthority::generate()?),
    };

    Ok(MockProxy {
      shared: Arc::new(Shared {
        config: Config {
          handler_timeout: self.handler_timeout,
          default_tls_hostname: self.default_tls_hostname,
          max_head_bytes: self.max_head_bytes,
          max_body_bytes: self.max_body_bytes,
        },
        ca: ca.map(Arc::new),
        registry: RuleRegistry::new(),
        events: EventBus::new(),
      }),
      running: Arc::new(Mutex::new(None)),
    })
  }
}

struct Config {
  handler_timeout: Duration,
  default_tls_hostname: String,
  max_head_bytes: usize,
  max_body_bytes: usize,
}

struct Shared {
  config: Config,
  ca: Option<Arc<CertificateAuthority>>,
  registry: RuleRegistry,
  events: EventBus,
}

struct Running {
  local_addr: SocketAddr,
  shutdown: watch::Sender<bool>,
  acceptor: JoinHandle<()>,
}

/// An HTTP/HTTPS mocking and intercepting proxy instance.
#[derive(Clone)]
pub struct MockProxy {
  shared: Arc<Shared>,
  running: Arc<Mutex<Option<Running>>>,
}

impl MockProxy {
  /// Create a builder with default configuration.
  pub fn builder() -> MockProxyBuilder {
    MockProxyBuilder::default()
  }

  /// Bind per `spec` and start serving. Fails if already started, if the
  /// port is taken, or if the range is exhausted.
  pub async fn start(&self, spec: impl Into<PortSpec>) -> Result<()> {
    let mut running = self.running.lock().await;
    if running.is_some() {
      return Err(Error::config("instance already started"));
    }

    let listener = ports::bind(spec.into()).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let acceptor = tokio::spawn(accept_loop(self.shared.clone(), listener, shutdown_rx));

    tracing::debug!("mock proxy listening on {}", local_addr);
    *running = Some(Running {
      local_addr,
      shutdown,
      acceptor,
    });
    Ok(())
  }

  /// Close the listener, cancel connection tasks and wait for them to
  /// wind down. Idempotent.
  pub async fn stop(&self) {
    let taken = self.running.lock().await.take();
    if let Some(running) = taken {
      let _ = running.shutdown.send(true);
      if let Err(e) = running.acceptor.await {
        tracing::warn!("acceptor task ended abnormally: {}", e);
      }
      tracing::debug!("mock proxy on {} stopped", running.local_addr);
    }
  }

  /// The bound port while started.
  pub async fn port(&self) -> Option<u16> {
    self.running.lock().await.as_ref().map(|r| r.local_addr.port())
  }

  /// The proxy URL while started.
  pub async fn url(&self) -> Option<String> {
    self
      .port()
      .await
      .map(|port| format!("http://127.0.0.1:{}", port))
  }

  /// Environment variables pointing tested processes at this proxy.
  pub async fn proxy_env(&self) -> HashMap<String, String> {
    match self.url().await {
      Some(url) => HashMap::from([
        ("HTTP_PROXY".to_string(), url.clone()),
        ("HTTPS_PROXY".to_string(), url),
      ]),
      None => HashMap::new(),
    }
  }

  /// The root certificate clients must trust for HTTPS interception.
  pub fn ca_cert_pem(&self) -> Option<&str> {
    self.shared.ca.as_deref().map(CertificateAuthority::ca_cert_pem)
  }

  /// Register a rule at the tail of the active list.
  pub async fn add_rule(&self, data: RuleData) -> Result<MockedEndpoint> {
    self.shared.registry.add(data).await
  }

  /// Remove every rule. In-flight requests complete against the snapshot
  /// they captured.
  pub async fn reset(&self) {
    self.shared.registry.reset().await;
  }

  /// Handles for all active rules, in registration order.
  pub async fn mocked_endpoints(&self) -> Vec<MockedEndpoint> {
    self.shared.registry.endpoints().await
  }

  /// Subscribe to lifecycle events; an empty `kinds` list means all.
  /// The subscription is durable once this returns.
  pub async fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
    self.shared.events.subscribe(kinds).await
  }
}

async fn accept_loop(
  shared: Arc<Shared>,
  listener: TcpListener,
  mut shutdown: watch::Receiver<bool>,
) {
  let mut tasks = JoinSet::new();
  loop {
    tokio::select! {
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          let shared = shared.clone();
          let shutdown = shutdown.clone();
          tasks.spawn(async move {
            handle_connection(shared, stream, peer, shutdown).await;
          });
        }
        Err(e) => tracing::error!("failed to accept connection: {}", e),
      },
      _ = shutdown.changed() => break,
    }
  }

  drop(listener);
  let drain = async {
    while tasks.join_next().await.is_some() {}
  };
  if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
    tasks.shutdown().await;
  }
}

/// Per-connection context threaded through tunnels and TLS layers.
#[derive(Clone)]
struct ConnCtx {
  shared: Arc<Shared>,
  peer: SocketAddr,
  handle: Arc<ConnHandle>,
  shutdown: watch::Receiver<bool>,
  protocol: Protocol,
  /// Hostname from the innermost CONNECT target or SNI, used when
  /// requests carry no Host header.
  tunnel_host: Option<String>,
}

async fn handle_connection(
  shared: Arc<Shared>,
  stream: TcpStream,
  peer: SocketAddr,
  shutdown: watch::Receiver<bool>,
) {
  let (stream, handle) = match ConnHandle::pair(stream) {
    Ok(pair) => pair,
    Err(e) => {
      tracing::debug!("failed to prepare connection from {}: {}", peer, e);
      return;
    }
  };
  let ctx = ConnCtx {
    shared,
    peer,
    handle: Arc::new(handle),
    shutdown,
    protocol: Protocol::Http,
    tunnel_host: None,
  };
  demux(ctx, Box::new(stream)).await;
}

/// Peek the first byte of a stream and route it: `0x16` is a TLS
/// handshake, everything else goes to the HTTP front-end. The byte is
/// re-injected at the head of the stream either way. Boxed so `CONNECT`
/// tunnels can recurse through it.
fn demux(ctx: ConnCtx, mut stream: BoxedStream) -> Pin<Box<dyn Future<Output = ()> + Send>> {
  Box::pin(async move {
    let mut first = [0u8; 1];
    if let Err(e) = stream.read_exact(&mut first).await {
      // Closed before a single byte arrived: drop silently.
      tracing::debug!("connection from {} yielded no data: {}", ctx.peer, e);
      return;
    }
    let stream = Rewind::boxed(Bytes::copy_from_slice(&first), stream);

    if first[0] == TLS_HANDSHAKE_BYTE {
      serve_tls(ctx, stream).await;
    } else {
      serve_http(ctx, stream).await;
    }
  })
}

async fn serve_tls(mut ctx: ConnCtx, stream: BoxedStream) {
  let Some(ca) = ctx.shared.ca.clone() else {
    ctx
      .shared
      .events
      .emit(ProxyEvent::TlsClientError {
        failure: Arc::new(TlsRequest {
          failure_cause: "TLS connection received but no CA is configured".to_string(),
          hostname: None,
          remote_ip: ctx.peer.ip(),
        }),
      })
      .await;
    return;
  };

  let fallback = ctx
    .tunnel_host
    .clone()
    .unwrap_or_else(|| ctx.shared.config.default_tls_hostname.clone());

  match tls::terminate(&ca, stream, &fallback).await {
    Ok((tls_stream, sni)) => {
      ctx.protocol = Protocol::Https;
      if sni.is_some() {
        ctx.tunnel_host = sni;
      }
      serve_http(ctx, tls_stream).await;
    }
    Err(failure) => {
      tracing::debug!("TLS handshake with {} failed: {}", ctx.peer, failure.cause);
      ctx
        .shared
        .events
        .emit(ProxyEvent::TlsClientError {
          failure: Arc::new(TlsRequest {
            failure_cause: failure.cause,
            hostname: failure.sni,
            remote_ip: ctx.peer.ip(),
          }),
        })
        .await;
    }
  }
}

/// Drive sequential HTTP exchanges over one (possibly TLS-decrypted)
/// stream until it closes.
async fn serve_http(ctx: ConnCtx, mut stream: BoxedStream) {
  let mut buf = Vec::new();
  loop {
    let head = match http1::read_request_head(
      &mut stream,
      &mut buf,
      ctx.shared.config.max_head_bytes,
    )
    .await
    {
      Ok(Some(head)) => head,
      Ok(None) => return,
      Err(e) => {
        // Nothing of the request was assembled; answer 400 and close.
        tracing::debug!("bad request head from {}: {}", ctx.peer, e);
        let _ = http1::write_response(
          &mut stream,
          StatusCode::BAD_REQUEST,
          None,
          &[],
          b"Malformed request\n",
        )
        .await;
        return;
      }
    };
    let started = now_millis();

    if head.method == Method::CONNECT {
      if stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
        || stream.flush().await.is_err()
      {
        return;
      }
      let mut next = ctx.clone();
      next.tunnel_host = Some(host_of_authority(&head.target));
      // Bytes read past the CONNECT head belong to the tunneled stream.
      let inner = Rewind::boxed(Bytes::from(std::mem::take(&mut buf)), stream);
      demux(next, inner).await;
      return;
    }

    let mut record = build_record(&ctx, &head, started);
    let partial = Arc::new(record.clone());
    ctx
      .shared
      .events
      .emit(ProxyEvent::RequestInitiated {
        request: partial.clone(),
      })
      .await;

    let body = match http1::read_body(
      &mut stream,
      &mut buf,
      &head.headers,
      ctx.shared.config.max_body_bytes,
    )
    .await
    {
      Ok(body) => body,
      Err(e) => {
        tracing::debug!("request body from {} failed: {}", ctx.peer, e);
        record.timing.aborted = Some(now_millis());
        ctx
          .shared
          .events
          .emit(ProxyEvent::Abort {
            request: Arc::new(record),
          })
          .await;
        let _ = http1::write_response(
          &mut stream,
          StatusCode::BAD_REQUEST,
          None,
          &[],
          b"Malformed request body\n",
        )
        .await;
        return;
      }
    };
    record.body = Body::from(body);
    record.timing.body_received = Some(now_millis());
    let request = Arc::new(record);
    ctx
      .shared
      .events
      .emit(ProxyEvent::Request {
        request: request.clone(),
      })
      .await;

    let snapshot = ctx.shared.registry.snapshot().await;
    let outcome =
      pipeline::dispatch(&request, &snapshot, ctx.shared.config.handler_timeout).await;
    let client_close = wants_close(&head);

    match outcome {
      Outcome::Respond { spec, close, abort } => {
        let status =
          StatusCode::from_u16(spec.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut timing = request.timing;
        timing.response_started = Some(now_millis());
        let written = http1::write_response(
          &mut stream,
          status,
          spec.status_message.as_deref(),
          &spec.headers,
          spec.body.bytes(),
        )
        .await;
        if written.is_err() {
          emit_abort(&ctx, &request).await;
          return;
        }
        timing.response_completed = Some(now_millis());

        if abort {
          emit_abort(&ctx, &request).await;
          return;
        }
        emit_response(&ctx, &request, status, spec.status_message, spec.headers, spec.body, timing)
          .await;
        if close || client_close {
          return;
        }
      }

      Outcome::Stream {
        status,
        headers,
        chunks,
      } => {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        let mut timing = request.timing;
        timing.response_started = Some(now_millis());
        let written =
          http1::write_chunked_response(&mut stream, status, None, &headers, &chunks).await;
        if written.is_err() {
          emit_abort(&ctx, &request).await;
          return;
        }
        timing.response_completed = Some(now_millis());

        let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        emit_response(&ctx, &request, status, None, headers, Body::from(body), timing).await;
        if client_close {
          return;
        }
      }

      Outcome::Close => {
        emit_abort(&ctx, &request).await;
        return;
      }

      Outcome::Reset => {
        ctx.handle.arm_reset();
        emit_abort(&ctx, &request).await;
        return;
      }

      Outcome::Hold => {
        hold_open(&ctx, &mut stream, &request).await;
        return;
      }
    }
  }
}

/// Keep the connection open, releasing only on client disconnect or
/// instance stop.
async fn hold_open(ctx: &ConnCtx, stream: &mut BoxedStream, request: &Arc<RequestRecord>) {
  let mut shutdown = ctx.shutdown.clone();
  let mut sink = [0u8; 1024];
  loop {
    tokio::select! {
      _ = shutdown.changed() => {
        emit_abort(ctx, request).await;
        return;
      }
      read = stream.read(&mut sink) => match read {
        Ok(0) | Err(_) => {
          emit_abort(ctx, request).await;
          return;
        }
        // Swallow whatever the client pipelines while we hold.
        Ok(_) => {}
      },
    }
  }
}

async fn emit_abort(ctx: &ConnCtx, request: &Arc<RequestRecord>) {
  let mut aborted = (**request).clone();
  aborted.timing.aborted = Some(now_millis());
  ctx
    .shared
    .events
    .emit(ProxyEvent::Abort {
      request: Arc::new(aborted),
    })
    .await;
}

async fn emit_response(
  ctx: &ConnCtx,
  request: &Arc<RequestRecord>,
  status: StatusCode,
  status_message: Option<String>,
  headers: Vec<(String, String)>,
  body: Body,
  timing: Timing,
) {
  let status_message = status_message
    .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());
  ctx
    .shared
    .events
    .emit(ProxyEvent::Response {
      response: Arc::new(ResponseRecord {
        request_id: request.id,
        status,
        status_message,
        headers: Headers::from(headers),
        body,
        timing,
      }),
    })
    .await;
}

fn wants_close(head: &RequestHead) -> bool {
  let connection = head
    .headers
    .get("connection")
    .map(|v| v.to_ascii_lowercase());
  match head.version {
    Version::HTTP_10 => connection.as_deref() != Some("keep-alive"),
    _ => connection.as_deref() == Some("close"),
  }
}

fn build_record(ctx: &ConnCtx, head: &RequestHead, started: u64) -> RequestRecord {
  let (url, path, hostname) = effective_url(ctx, head);
  RequestRecord {
    id: Uuid::new_v4(),
    protocol: ctx.protocol,
    version: head.version,
    method: head.method.clone(),
    url,
    path,
    hostname,
    headers: head.headers.clone(),
    body: Body::empty(),
    remote_addr: ctx.peer,
    timing: Timing {
      start: Some(started),
      headers_received: Some(now_millis()),
      ..Timing::default()
    },
  }
}

/// Reconstruct the absolute URL a request addressed, plus its path and
/// hostname. Proxy-style requests carry an absolute target; origin-form
/// targets are completed from the Host header, the tunnel target or the
/// SNI.
fn effective_url(ctx: &ConnCtx, head: &RequestHead) -> (String, String, Option<String>) {
  if head.target.starts_with("http://") || head.target.starts_with("https://") {
    if let Ok(uri) = head.target.parse::<http::Uri>() {
      return (
        head.target.clone(),
        uri.path().to_string(),
        uri.host().map(str::to_string),
      );
    }
  }

  let authority = head
    .headers
    .get("host")
    .map(str::to_string)
    .or_else(|| ctx.tunnel_host.clone())
    .unwrap_or_else(|| "localhost".to_string());
  let hostname = host_of_authority(&authority);
  let path = head
    .target
    .split('?')
    .next()
    .unwrap_or(&head.target)
    .to_string();
  let url = format!("{}://{}{}", ctx.protocol, authority, head.target);
  (url, path, Some(hostname))
}

/// Hostname part of an authority string, handling bracketed IPv6.
fn host_of_authority(authority: &str) -> String {
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some(end) = rest.find(']') {
      return rest[..end].to_string();
    }
  }
  match authority.rsplit_once(':') {
    Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
    _ => authority.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn authority_host_extraction() {
    assert_eq!(host_of_authority("example.com:443"), "example.com");
    assert_eq!(host_of_authority("example.com"), "example.com");
    assert_eq!(host_of_authority("[::1]:8443"), "::1");
    assert_eq!(host_of_authority("127.0.0.1:80"), "127.0.0.1");
  }

  #[tokio::test]
  async fn builder_defaults_build_without_ca() {
    let proxy = MockProxy::builder().build().await.unwrap();
    assert!(proxy.ca_cert_pem().is_none());
    assert!(proxy.port().await.is_none());
    assert!(proxy.proxy_env().await.is_empty());
  }

  #[tokio::test]
  async fn start_twice_is_a_config_error() {
    let proxy = MockProxy::builder().build().await.unwrap();
    proxy.start(PortSpec::Default).await.unwrap();
    let second = proxy.start(PortSpec::Default).await;
    assert!(matches!(second, Err(Error::Config(_))));
    proxy.stop().await;
  }

  #[tokio::test]
  async fn proxy_env_points_at_the_bound_port() {
    let proxy = MockProxy::builder().build().await.unwrap();
    proxy.start(PortSpec::Default).await.unwrap();
    let port = proxy.port().await.unwrap();

    let env = proxy.proxy_env().await;
    let expected = format!("http://127.0.0.1:{}", port);
    assert_eq!(env.get("HTTP_PROXY"), Some(&expected));
    assert_eq!(env.get("HTTPS_PROXY"), Some(&expected));
    proxy.stop().await;
  }
}
