//! Error types for the mock proxy engine

use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `decoy::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while configuring or running a mock proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error(transparent)]
  Io(#[from] io::Error),

  /// Invalid configuration (bad option combination, bad rule data)
  #[error("configuration error: {0}")]
  Config(String),

  /// Bad CA material
  #[error("certificate error: {0}")]
  Certificate(String),

  /// No free port in the requested range
  #[error("no free port in [{start}, {end})")]
  PortExhausted {
    /// First port tried
    start: u16,
    /// One past the last port tried
    end: u16,
  },

  /// TLS handshake with a client failed
  #[error("TLS handshake error: {0}")]
  TlsHandshake(String),

  /// Malformed HTTP request line, headers or body framing
  #[error("protocol error: {0}")]
  Protocol(String),

  /// A rule handler panicked, failed or exceeded its timeout
  #[error("handler error: {0}")]
  Handler(String),

  /// Passthrough to the real origin failed
  #[error("upstream error: {0}")]
  Upstream(String),

  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),
}

impl Error {
  /// Create a configuration error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("configuration error: {}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("certificate error: {}", error);
    error
  }

  /// Create a TLS handshake error
  pub fn tls_handshake(msg: impl Into<String>) -> Self {
    Error::TlsHandshake(msg.into())
  }

  /// Create a protocol error
  pub fn protocol(msg: impl Into<String>) -> Self {
    Error::Protocol(msg.into())
  }

  /// Create a handler error and log it
  pub fn handler(msg: impl Into<String>) -> Self {
    let error = Error::Handler(msg.into());
    tracing::warn!("handler error: {}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::warn!("upstream error: {}", error);
    error
  }

  /// Whether this error is fatal for the whole instance rather than a
  /// single connection.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Error::Config(_) | Error::Certificate(_) | Error::PortExhausted { .. }
    )
  }
}
