//! Rule dispatch
//!
//! Walks a registry snapshot in registration order, picks the first rule
//! whose matchers all accept and whose completion checker still admits
//! the request, records the request in the rule's seen list before the
//! handler runs, then turns the handler into a connection-level outcome.

use crate::error::Error;
use crate::record::RequestRecord;
use crate::registry::Rule;
use crate::rule::{CompletionChecker, ResponseHandler, ResponseSpec, RuleData};
use crate::upstream;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// What the connection driver should do after dispatch.
pub(crate) enum Outcome {
  /// Write a response. `abort` marks a handler failure that closes the
  /// connection and ends the exchange with an abort event instead of a
  /// response event.
  Respond {
    spec: ResponseSpec,
    close: bool,
    abort: bool,
  },
  /// Write the head, then the chunks as chunked transfer coding.
  Stream {
    status: u16,
    headers: Vec<(String, String)>,
    chunks: Vec<Bytes>,
  },
  /// Drop the connection without a response.
  Close,
  /// Send a TCP RST.
  Reset,
  /// Hold the connection until the client disconnects or the instance
  /// stops.
  Hold,
}

impl Outcome {
  fn respond(spec: ResponseSpec) -> Self {
    Outcome::Respond {
      spec,
      close: false,
      abort: false,
    }
  }

  fn handler_failure(error: &Error) -> Self {
    Outcome::Respond {
      spec: ResponseSpec::new(500)
        .with_header("content-type", "text/plain")
        .with_body(format!("Handler failed: {}", error)),
      close: true,
      abort: true,
    }
  }
}

async fn rule_matches(data: &RuleData, request: &RequestRecord) -> bool {
  for matcher in &data.matchers {
    if !matcher.matches(request).await {
      return false;
    }
  }
  true
}

/// Select and run the handler for `request` against `snapshot`.
pub(crate) async fn dispatch(
  request: &Arc<RequestRecord>,
  snapshot: &[Arc<Rule>],
  handler_timeout: Duration,
) -> Outcome {
  for rule in snapshot {
    if !rule_matches(&rule.data, request).await {
      continue;
    }

    let checker = rule
      .data
      .completion_checker
      .clone()
      .unwrap_or(CompletionChecker::Always);
    let seen = rule.seen();
    if !checker.accepts(&seen).await {
      // A completed rule does not consume the match; later rules still
      // get a look at this request.
      continue;
    }

    let mut seen_after = seen;
    seen_after.push(request.clone());
    let completed = !checker.accepts(&seen_after).await;
    rule.record_seen(request.clone(), completed);

    tracing::debug!(
      "request {} matched rule {} ({} previously seen)",
      request.id,
      rule.id,
      seen_after.len() - 1
    );
    return run_handler(&rule.data.handler, request, handler_timeout).await;
  }

  tracing::debug!("request {} matched no rule", request.id);
  Outcome::respond(
    ResponseSpec::new(503)
      .with_header("content-type", "text/plain")
      .with_body(format!(
        "No rules matched this request: {} {}",
        request.method, request.url
      )),
  )
}

async fn run_handler(
  handler: &ResponseHandler,
  request: &Arc<RequestRecord>,
  handler_timeout: Duration,
) -> Outcome {
  match handler {
    ResponseHandler::Static {
      status,
      status_message,
      headers,
      body,
    } => Outcome::respond(ResponseSpec {
      status: *status,
      status_message: status_message.clone(),
      headers: headers.clone(),
      body: body.clone(),
    }),

    ResponseHandler::Callback(callback) => {
      let Some(responder) = callback.responder.clone() else {
        return Outcome::handler_failure(&Error::handler("callback handler has no responder"));
      };
      let request = request.clone();
      // Run on a task of its own so a panicking callback is contained.
      let mut task = tokio::spawn(async move { responder.respond(&request).await });
      match timeout(handler_timeout, &mut task).await {
        Ok(Ok(Ok(spec))) => Outcome::respond(spec),
        Ok(Ok(Err(e))) => Outcome::handler_failure(&Error::handler(e.to_string())),
        Ok(Err(join_error)) => {
          Outcome::handler_failure(&Error::handler(format!("callback panicked: {}", join_error)))
        }
        Err(_) => {
          task.abort();
          Outcome::handler_failure(&Error::handler(format!(
            "callback exceeded {:?} timeout",
            handler_timeout
          )))
        }
      }
    }

    ResponseHandler::Stream {
      status,
      headers,
      chunks,
    } => match chunks.take() {
      Some(chunks) => Outcome::Stream {
        status: status.unwrap_or(200),
        headers: headers.clone(),
        chunks,
      },
      None => Outcome::handler_failure(&Error::handler("response stream already drained")),
    },

    ResponseHandler::Passthrough => match upstream::forward(request).await {
      Ok(spec) => Outcome::respond(spec),
      Err(e) => Outcome::respond(upstream::bad_gateway(&e)),
    },

    ResponseHandler::CloseConnection => Outcome::Close,
    ResponseHandler::ResetConnection => Outcome::Reset,
    ResponseHandler::Timeout => Outcome::Hold,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{Headers, Protocol, Timing};
  use crate::registry::RuleRegistry;
  use crate::rule::{CallbackHandler, RequestMatcher, Responder, RuleData};
  use async_trait::async_trait;
  use http::{Method, Version};
  use uuid::Uuid;

  const TIMEOUT: Duration = Duration::from_millis(200);

  fn request(path: &str) -> Arc<RequestRecord> {
    Arc::new(RequestRecord {
      id: Uuid::new_v4(),
      protocol: Protocol::Http,
      version: Version::HTTP_11,
      method: Method::GET,
      url: format!("http://localhost{}", path),
      path: path.to_string(),
      hostname: Some("localhost".to_string()),
      headers: Headers::new(),
      body: crate::Body::empty(),
      remote_addr: "127.0.0.1:4100".parse().unwrap(),
      timing: Timing::default(),
    })
  }

  fn body_of(outcome: Outcome) -> (u16, String) {
    match outcome {
      Outcome::Respond { spec, .. } => (spec.status, spec.body.text()),
      _ => panic!("expected a response outcome"),
    }
  }

  #[tokio::test]
  async fn first_registered_rule_wins() {
    let registry = RuleRegistry::new();
    registry
      .add(RuleData::respond(200, "first").matching(RequestMatcher::Path {
        path: "/foo".to_string(),
      }))
      .await
      .unwrap();
    registry
      .add(RuleData::respond(200, "second"))
      .await
      .unwrap();

    let snapshot = registry.snapshot().await;
    let (status, body) = body_of(dispatch(&request("/foo"), &snapshot, TIMEOUT).await);
    assert_eq!((status, body.as_str()), (200, "first"));
  }

  #[tokio::test]
  async fn completed_rules_fall_through_to_later_rules() {
    let registry = RuleRegistry::new();
    registry
      .add(RuleData::respond(200, "A").up_to(CompletionChecker::Once))
      .await
      .unwrap();
    registry.add(RuleData::respond(200, "B")).await.unwrap();

    let snapshot = registry.snapshot().await;
    let mut bodies = Vec::new();
    for _ in 0..3 {
      let (_, body) = body_of(dispatch(&request("/"), &snapshot, TIMEOUT).await);
      bodies.push(body);
    }
    assert_eq!(bodies, vec!["A", "B", "B"]);
  }

  #[tokio::test]
  async fn no_match_is_a_503_response() {
    let registry = RuleRegistry::new();
    registry
      .add(RuleData::respond(200, "x").matching(RequestMatcher::Path {
        path: "/elsewhere".to_string(),
      }))
      .await
      .unwrap();

    let snapshot = registry.snapshot().await;
    let (status, body) = body_of(dispatch(&request("/foo"), &snapshot, TIMEOUT).await);
    assert_eq!(status, 503);
    assert!(body.contains("No rules matched"));
  }

  #[tokio::test]
  async fn seen_is_recorded_before_the_handler_runs() {
    // A responder that reads back its own rule's history: the request
    // must already be visible to observers while the handler is still
    // producing the response.
    struct SeenObserver {
      registry: RuleRegistry,
    }

    #[async_trait]
    impl Responder for SeenObserver {
      async fn respond(&self, request: &RequestRecord) -> crate::Result<ResponseSpec> {
        let endpoints = self.registry.endpoints().await;
        assert_eq!(endpoints.len(), 1);
        let seen = endpoints[0].seen_requests().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, request.id);
        Ok(ResponseSpec::new(204))
      }
    }

    let registry = RuleRegistry::new();
    registry
      .add(RuleData::new(ResponseHandler::Callback(CallbackHandler {
        id: None,
        responder: Some(Arc::new(SeenObserver {
          registry: registry.clone(),
        })),
      })))
      .await
      .unwrap();

    let snapshot = registry.snapshot().await;
    let (status, _) = body_of(dispatch(&request("/observe"), &snapshot, TIMEOUT).await);
    assert_eq!(status, 204);
  }

  #[tokio::test]
  async fn slow_callbacks_time_out_with_500() {
    struct Sleeper;

    #[async_trait]
    impl Responder for Sleeper {
      async fn respond(&self, _request: &RequestRecord) -> crate::Result<ResponseSpec> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ResponseSpec::new(200))
      }
    }

    let registry = RuleRegistry::new();
    registry
      .add(RuleData::new(ResponseHandler::Callback(CallbackHandler {
        id: None,
        responder: Some(Arc::new(Sleeper)),
      })))
      .await
      .unwrap();

    let snapshot = registry.snapshot().await;
    match dispatch(&request("/slow"), &snapshot, Duration::from_millis(50)).await {
      Outcome::Respond { spec, close, abort } => {
        assert_eq!(spec.status, 500);
        assert!(close);
        assert!(abort);
      }
      _ => panic!("expected a 500 response outcome"),
    }
  }

  #[tokio::test]
  async fn drained_stream_answers_500() {
    let registry = RuleRegistry::new();
    registry
      .add(RuleData::new(ResponseHandler::Stream {
        status: Some(200),
        headers: Vec::new(),
        chunks: crate::rule::StreamChunks::new(vec![Bytes::from_static(b"only once")]),
      }))
      .await
      .unwrap();

    let snapshot = registry.snapshot().await;
    match dispatch(&request("/s"), &snapshot, TIMEOUT).await {
      Outcome::Stream { chunks, .. } => assert_eq!(&chunks[0][..], b"only once"),
      _ => panic!("expected a streamed outcome"),
    }
    match dispatch(&request("/s"), &snapshot, TIMEOUT).await {
      Outcome::Respond { spec, .. } => assert_eq!(spec.status, 500),
      _ => panic!("expected a 500 response outcome"),
    }
  }
}
