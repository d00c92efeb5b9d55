//! Request, response and TLS failure records
//!
//! Records are assembled by the HTTP front-end, frozen behind an `Arc` and
//! shared between the rule registry and the event bus. Once a record has
//! been emitted on the event bus it is never mutated.

use crate::body::Body;
use http::{Method, StatusCode, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// The scheme a request was received over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  /// Plain HTTP
  #[default]
  Http,
  /// HTTP over TLS
  Https,
}

impl Protocol {
  /// The scheme string, `"http"` or `"https"`.
  pub fn as_str(&self) -> &'static str {
    match self {
      Protocol::Http => "http",
      Protocol::Https => "https",
    }
  }

  /// The well-known port for this scheme.
  pub fn default_port(&self) -> u16 {
    match self {
      Protocol::Http => 80,
      Protocol::Https => 443,
    }
  }
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An ordered header multimap preserving the name case and line order of
/// the wire format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
  entries: Vec<(String, String)>,
}

impl Headers {
  /// Create an empty header map.
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a header line, keeping arrival order.
  pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.entries.push((name.into(), value.into()));
  }

  /// First value for `name`, compared case-insensitively.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// All values for `name` in arrival order.
  pub fn get_all(&self, name: &str) -> Vec<&str> {
    self
      .entries
      .iter()
      .filter(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
      .collect()
  }

  /// Whether any line has the given name.
  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  /// Iterate over all lines in arrival order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }

  /// Number of header lines.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether the map holds no lines.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl From<Vec<(String, String)>> for Headers {
  fn from(entries: Vec<(String, String)>) -> Self {
    Self { entries }
  }
}

/// Epoch-millisecond stamps for the phases of one exchange. Fields are
/// `None` until the phase has happened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
  /// First byte of the request seen
  pub start: Option<u64>,
  /// Request head fully parsed
  pub headers_received: Option<u64>,
  /// Request body fully read
  pub body_received: Option<u64>,
  /// First byte of the response written
  pub response_started: Option<u64>,
  /// Response fully written
  pub response_completed: Option<u64>,
  /// Exchange aborted
  pub aborted: Option<u64>,
}

/// One HTTP request as seen by the proxy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestRecord {
  /// Unique within the instance
  pub id: Uuid,
  /// Scheme the request arrived over
  pub protocol: Protocol,
  /// HTTP version from the request line
  #[serde(with = "http_serde::version")]
  pub version: Version,
  /// Request method
  #[serde(with = "http_serde::method")]
  pub method: Method,
  /// Absolute effective URL as seen by the server
  pub url: String,
  /// Path component (no query string)
  pub path: String,
  /// Hostname without port, when one could be determined
  pub hostname: Option<String>,
  /// Header lines in wire order
  pub headers: Headers,
  /// Request body
  pub body: Body,
  /// Client address
  pub remote_addr: SocketAddr,
  /// Phase stamps
  pub timing: Timing,
}

impl RequestRecord {
  /// Query parameters parsed from the effective URL, in order.
  pub fn query_pairs(&self) -> Vec<(String, String)> {
    let Some(query) = self.url.split_once('?').map(|(_, q)| q) else {
      return Vec::new();
    };
    query
      .split('&')
      .filter(|p| !p.is_empty())
      .map(|pair| match pair.split_once('=') {
        Some((k, v)) => (k.to_string(), v.to_string()),
        None => (pair.to_string(), String::new()),
      })
      .collect()
  }

  /// Body decoded as text per the request `Content-Type` charset.
  pub fn body_text(&self) -> String {
    self
      .body
      .text_with_content_type(self.headers.get("content-type"))
  }
}

/// One synthesized (or passed-through) response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseRecord {
  /// Id of the request this response answers
  pub request_id: Uuid,
  /// Status code
  #[serde(with = "http_serde::status_code")]
  pub status: StatusCode,
  /// Status message as written on the wire
  pub status_message: String,
  /// Header lines in wire order
  pub headers: Headers,
  /// Response body
  pub body: Body,
  /// Phase stamps
  pub timing: Timing,
}

impl ResponseRecord {
  /// Body decoded as text per the response `Content-Type` charset.
  pub fn body_text(&self) -> String {
    self
      .body
      .text_with_content_type(self.headers.get("content-type"))
  }
}

/// A client connection that started a TLS handshake but never completed
/// one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsRequest {
  /// Short description of what went wrong
  pub failure_cause: String,
  /// Requested hostname from SNI, when the ClientHello carried one
  pub hostname: Option<String>,
  /// Client IP
  pub remote_ip: IpAddr,
}
