//! Rule data: matchers, handlers and completion checkers
//!
//! A rule pairs an AND-combined matcher set with exactly one handler and
//! an optional completion checker. Every variant serializes as a tagged
//! object with a `type` discriminator so rule data can be transported
//! across a control channel; `custom` variants carry an opaque
//! registration id instead of code, and in-process users attach closures
//! directly.

use crate::body::Body;
use crate::error::{Error, Result};
use crate::record::{Protocol, RequestRecord};
use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Opaque async predicate over a request record.
#[async_trait]
pub trait RequestPredicate: Send + Sync {
  /// Whether the request should be accepted.
  async fn matches(&self, request: &RequestRecord) -> bool;
}

/// Opaque async response producer.
#[async_trait]
pub trait Responder: Send + Sync {
  /// Produce the response descriptor for a matched request.
  async fn respond(&self, request: &RequestRecord) -> Result<ResponseSpec>;
}

/// Opaque async predicate over a rule's seen-request history.
#[async_trait]
pub trait SeenPredicate: Send + Sync {
  /// Whether the rule should accept another request.
  async fn accepts(&self, seen: &[Arc<RequestRecord>]) -> bool;
}

#[async_trait]
impl<F> RequestPredicate for F
where
  F: Fn(&RequestRecord) -> bool + Send + Sync,
{
  async fn matches(&self, request: &RequestRecord) -> bool {
    self(request)
  }
}

#[async_trait]
impl<F> SeenPredicate for F
where
  F: Fn(&[Arc<RequestRecord>]) -> bool + Send + Sync,
{
  async fn accepts(&self, seen: &[Arc<RequestRecord>]) -> bool {
    self(seen)
  }
}

/// A `custom` matcher: a registration id for transport, a predicate when
/// attached in-process.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CustomMatcher {
  /// Reference the remote side can resolve to a registered predicate
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  /// In-process predicate; never serialized
  #[serde(skip)]
  pub predicate: Option<Arc<dyn RequestPredicate>>,
}

impl fmt::Debug for CustomMatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CustomMatcher")
      .field("id", &self.id)
      .field("resolved", &self.predicate.is_some())
      .finish()
  }
}

/// A `custom` completion checker, transported like [`CustomMatcher`].
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CustomChecker {
  /// Reference the remote side can resolve to a registered predicate
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  /// In-process predicate; never serialized
  #[serde(skip)]
  pub predicate: Option<Arc<dyn SeenPredicate>>,
}

impl fmt::Debug for CustomChecker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CustomChecker")
      .field("id", &self.id)
      .field("resolved", &self.predicate.is_some())
      .finish()
  }
}

/// A predicate over a request record, AND-combined inside a rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RequestMatcher {
  /// Accept every request
  AnyRequest,
  /// Exact method
  Method {
    /// Method to require
    #[serde(with = "http_serde::method")]
    method: Method,
  },
  /// Hostname, compared case-insensitively and without port
  Hostname {
    /// Hostname to require
    hostname: String,
  },
  /// Scheme the request arrived over
  Protocol {
    /// Scheme to require
    protocol: Protocol,
  },
  /// Exact path (query string excluded)
  Path {
    /// Path to require
    path: String,
  },
  /// Regex over the path
  PathRegex {
    /// Pattern, validated at registration
    pattern: String,
  },
  /// Required query parameters (a subset match)
  Query {
    /// Name/value pairs that must all be present
    params: BTreeMap<String, String>,
  },
  /// A header line with the given name and value
  Header {
    /// Header name, compared case-insensitively
    name: String,
    /// Required value
    value: String,
  },
  /// Exact body bytes
  Body {
    /// Expected body content
    content: String,
  },
  /// Regex over the body decoded as text
  BodyRegex {
    /// Pattern, validated at registration
    pattern: String,
  },
  /// JSON body containing the given fragment
  JsonBody {
    /// Fragment that must be contained in the body JSON
    fragment: Value,
  },
  /// A cookie with the given name and value
  Cookie {
    /// Cookie name
    name: String,
    /// Required value
    value: String,
  },
  /// User predicate
  Custom(CustomMatcher),
}

impl RequestMatcher {
  /// Evaluate against a completed request record.
  pub async fn matches(&self, request: &RequestRecord) -> bool {
    match self {
      RequestMatcher::AnyRequest => true,
      RequestMatcher::Method { method } => request.method == *method,
      RequestMatcher::Hostname { hostname } => request
        .hostname
        .as_deref()
        .is_some_and(|h| h.eq_ignore_ascii_case(hostname)),
      RequestMatcher::Protocol { protocol } => request.protocol == *protocol,
      RequestMatcher::Path { path } => request.path == *path,
      RequestMatcher::PathRegex { pattern } => match Regex::new(pattern) {
        Ok(re) => re.is_match(&request.path),
        Err(_) => false,
      },
      RequestMatcher::Query { params } => {
        let pairs = request.query_pairs();
        params
          .iter()
          .all(|(k, v)| pairs.iter().any(|(pk, pv)| pk == k && pv == v))
      }
      RequestMatcher::Header { name, value } => {
        request.headers.get_all(name).iter().any(|v| *v == value)
      }
      RequestMatcher::Body { content } => request.body.bytes().as_ref() == content.as_bytes(),
      RequestMatcher::BodyRegex { pattern } => match Regex::new(pattern) {
        Ok(re) => re.is_match(&request.body_text()),
        Err(_) => false,
      },
      RequestMatcher::JsonBody { fragment } => {
        match serde_json::from_slice::<Value>(request.body.bytes()) {
          Ok(actual) => json_contains(&actual, fragment),
          Err(_) => false,
        }
      }
      RequestMatcher::Cookie { name, value } => request
        .headers
        .get_all("cookie")
        .iter()
        .flat_map(|line| cookie::Cookie::split_parse(line.to_string()))
        .flatten()
        .any(|c| c.name() == name && c.value() == value),
      RequestMatcher::Custom(custom) => match &custom.predicate {
        Some(predicate) => predicate.matches(request).await,
        // An unresolved reference can never be evaluated locally.
        None => false,
      },
    }
  }

  fn validate(&self) -> Result<()> {
    match self {
      RequestMatcher::PathRegex { pattern } | RequestMatcher::BodyRegex { pattern } => {
        Regex::new(pattern)
          .map(|_| ())
          .map_err(|e| Error::config(format!("invalid matcher regex {:?}: {}", pattern, e)))
      }
      _ => Ok(()),
    }
  }
}

/// Subset containment for JSON: objects must contain every fragment key,
/// arrays must match element-wise prefixes of equal length, scalars must
/// be equal.
fn json_contains(actual: &Value, fragment: &Value) -> bool {
  match (actual, fragment) {
    (Value::Object(actual), Value::Object(fragment)) => fragment
      .iter()
      .all(|(k, fv)| actual.get(k).is_some_and(|av| json_contains(av, fv))),
    (Value::Array(actual), Value::Array(fragment)) => {
      actual.len() == fragment.len()
        && actual
          .iter()
          .zip(fragment.iter())
          .all(|(av, fv)| json_contains(av, fv))
    }
    (a, f) => a == f,
  }
}

/// Byte chunks given to a stream handler at rule creation, consumed by
/// the first matching request.
#[derive(Clone, Default)]
pub struct StreamChunks {
  chunks: Arc<Mutex<Option<Vec<Bytes>>>>,
}

impl StreamChunks {
  /// Wrap the chunks a single request may consume.
  pub fn new(chunks: Vec<Bytes>) -> Self {
    Self {
      chunks: Arc::new(Mutex::new(Some(chunks))),
    }
  }

  /// Take the chunks; `None` once drained.
  pub fn take(&self) -> Option<Vec<Bytes>> {
    self.chunks.lock().expect("stream chunks lock").take()
  }
}

impl fmt::Debug for StreamChunks {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let drained = self.chunks.lock().map(|g| g.is_none()).unwrap_or(true);
    f.debug_struct("StreamChunks").field("drained", &drained).finish()
  }
}

/// A `callback` handler: a registration id for transport, a responder
/// when attached in-process.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CallbackHandler {
  /// Reference the remote side can resolve to a registered responder
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  /// In-process responder; never serialized
  #[serde(skip)]
  pub responder: Option<Arc<dyn Responder>>,
}

impl fmt::Debug for CallbackHandler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallbackHandler")
      .field("id", &self.id)
      .field("resolved", &self.responder.is_some())
      .finish()
  }
}

/// What a matched rule does with the request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResponseHandler {
  /// Fixed status, headers and body
  Static {
    /// Status code
    status: u16,
    /// Status message override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_message: Option<String>,
    /// Response headers in write order
    #[serde(default)]
    headers: Vec<(String, String)>,
    /// Response body
    #[serde(default)]
    body: Body,
  },
  /// User function producing a response descriptor, bounded by the
  /// configured handler timeout
  Callback(CallbackHandler),
  /// Stream chunks supplied at rule creation, answered chunked; a
  /// drained stream answers 500
  Stream {
    /// Status code (200 when omitted)
    #[serde(default)]
    status: Option<u16>,
    /// Response headers in write order
    #[serde(default)]
    headers: Vec<(String, String)>,
    /// One-shot chunk source; never serialized
    #[serde(skip)]
    chunks: StreamChunks,
  },
  /// Forward to the real origin over a fresh connection
  Passthrough,
  /// Close the connection without a response
  CloseConnection,
  /// Send a TCP RST
  ResetConnection,
  /// Hold the connection open until the client goes away or the
  /// instance stops
  Timeout,
}

impl ResponseHandler {
  fn validate(&self) -> Result<()> {
    let status = match self {
      ResponseHandler::Static { status, .. } => Some(*status),
      ResponseHandler::Stream { status, .. } => *status,
      _ => None,
    };
    if let Some(status) = status {
      if http::StatusCode::from_u16(status).is_err() {
        return Err(Error::config(format!("invalid response status {}", status)));
      }
    }
    Ok(())
  }
}

/// Gates how many matches a rule accepts over its lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CompletionChecker {
  /// Never complete
  Always,
  /// Accept a single request
  Once,
  /// Accept two requests
  Twice,
  /// Accept three requests
  Thrice,
  /// Accept `count` requests
  Times {
    /// Number of requests to accept
    count: usize,
  },
  /// User predicate over the seen history
  Custom(CustomChecker),
}

impl CompletionChecker {
  /// Whether the rule should accept another request, given its seen
  /// history.
  pub async fn accepts(&self, seen: &[Arc<RequestRecord>]) -> bool {
    match self {
      CompletionChecker::Always => true,
      CompletionChecker::Once => seen.is_empty(),
      CompletionChecker::Twice => seen.len() < 2,
      CompletionChecker::Thrice => seen.len() < 3,
      CompletionChecker::Times { count } => seen.len() < *count,
      CompletionChecker::Custom(custom) => match &custom.predicate {
        Some(predicate) => predicate.accepts(seen).await,
        // An unresolved reference keeps the rule active.
        None => true,
      },
    }
  }
}

/// A response descriptor produced by a handler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseSpec {
  /// Status code
  pub status: u16,
  /// Status message; the canonical reason when omitted
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status_message: Option<String>,
  /// Headers in write order
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  /// Body bytes
  #[serde(default)]
  pub body: Body,
}

impl Default for ResponseSpec {
  fn default() -> Self {
    Self::new(200)
  }
}

impl ResponseSpec {
  /// A response with the given status and no headers or body.
  pub fn new(status: u16) -> Self {
    Self {
      status,
      status_message: None,
      headers: Vec::new(),
      body: Body::empty(),
    }
  }

  /// Set the body.
  pub fn with_body(mut self, body: impl Into<Body>) -> Self {
    self.body = body.into();
    self
  }

  /// Append a header line.
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }
}

/// Everything needed to register one rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleData {
  /// AND-combined matcher set
  pub matchers: Vec<RequestMatcher>,
  /// Exactly one handler
  pub handler: ResponseHandler,
  /// Optional gate over repeat matches
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completion_checker: Option<CompletionChecker>,
}

impl RuleData {
  /// A rule with the given handler and no matchers (matches everything).
  pub fn new(handler: ResponseHandler) -> Self {
    Self {
      matchers: Vec::new(),
      handler,
      completion_checker: None,
    }
  }

  /// A rule answering every matched request with a fixed status and body.
  pub fn respond(status: u16, body: impl Into<Body>) -> Self {
    Self::new(ResponseHandler::Static {
      status,
      status_message: None,
      headers: Vec::new(),
      body: body.into(),
    })
  }

  /// Add a matcher.
  pub fn matching(mut self, matcher: RequestMatcher) -> Self {
    self.matchers.push(matcher);
    self
  }

  /// Set the completion checker.
  pub fn up_to(mut self, checker: CompletionChecker) -> Self {
    self.completion_checker = Some(checker);
    self
  }

  /// Validate the rule data; called at registration.
  pub fn validate(&self) -> Result<()> {
    for matcher in &self.matchers {
      matcher.validate()?;
    }
    self.handler.validate()
  }
}
