//! Ordered, concurrency-safe rule storage
//!
//! The registry exclusively owns rule records. Endpoint handles resolve
//! through it by id, so `reset` stays safe while handles are outstanding
//! and nothing holds a back-pointer into the list.

use crate::error::Result;
use crate::record::RequestRecord;
use crate::rule::{CompletionChecker, RuleData};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct RuleState {
  seen: Vec<Arc<RequestRecord>>,
  completed: bool,
}

/// One registered rule with its match history.
pub(crate) struct Rule {
  pub(crate) id: Uuid,
  pub(crate) data: RuleData,
  state: Mutex<RuleState>,
}

impl Rule {
  fn new(data: RuleData) -> Self {
    Self {
      id: Uuid::new_v4(),
      data,
      state: Mutex::new(RuleState::default()),
    }
  }

  /// Snapshot of the seen list, in request arrival order.
  pub(crate) fn seen(&self) -> Vec<Arc<RequestRecord>> {
    self.state.lock().expect("rule state lock").seen.clone()
  }

  pub(crate) fn is_completed(&self) -> bool {
    self.state.lock().expect("rule state lock").completed
  }

  /// Append a matched request; must happen before the handler runs so a
  /// concurrent observer sees the request no later than the response.
  pub(crate) fn record_seen(&self, request: Arc<RequestRecord>, completed: bool) {
    let mut state = self.state.lock().expect("rule state lock");
    state.seen.push(request);
    state.completed = completed;
  }

  /// Whether the rule's checker still admits another request.
  pub(crate) async fn is_pending(&self) -> bool {
    let seen = self.seen();
    match &self.data.completion_checker {
      Some(checker) => checker.accepts(&seen).await,
      None => CompletionChecker::Always.accepts(&seen).await,
    }
  }
}

/// The ordered, mutable list of active rules.
#[derive(Clone, Default)]
pub struct RuleRegistry {
  rules: Arc<RwLock<Vec<Arc<Rule>>>>,
}

impl RuleRegistry {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Validate and append a rule at the tail of the active list.
  pub async fn add(&self, data: RuleData) -> Result<MockedEndpoint> {
    data.validate()?;
    let rule = Arc::new(Rule::new(data));
    let id = rule.id;
    self.rules.write().await.push(rule);
    Ok(MockedEndpoint {
      id,
      registry: self.clone(),
    })
  }

  /// Atomic point-in-time view used by the pipeline per request.
  pub(crate) async fn snapshot(&self) -> Vec<Arc<Rule>> {
    self.rules.read().await.clone()
  }

  /// Remove every rule. In-flight requests finish against the snapshot
  /// they captured at arrival.
  pub async fn reset(&self) {
    self.rules.write().await.clear();
  }

  async fn find(&self, id: Uuid) -> Option<Arc<Rule>> {
    self
      .rules
      .read()
      .await
      .iter()
      .find(|r| r.id == id)
      .cloned()
  }

  /// Recorded requests for the rule with the given endpoint id; empty if
  /// the rule was removed.
  pub async fn seen_for(&self, id: Uuid) -> Vec<Arc<RequestRecord>> {
    match self.find(id).await {
      Some(rule) => rule.seen(),
      None => Vec::new(),
    }
  }

  /// Handles for every active rule, in registration order.
  pub async fn endpoints(&self) -> Vec<MockedEndpoint> {
    self
      .rules
      .read()
      .await
      .iter()
      .map(|rule| MockedEndpoint {
        id: rule.id,
        registry: self.clone(),
      })
      .collect()
  }
}

/// A stable handle onto a rule and its recorded traffic.
#[derive(Clone)]
pub struct MockedEndpoint {
  id: Uuid,
  registry: RuleRegistry,
}

impl MockedEndpoint {
  /// The rule id.
  pub fn id(&self) -> Uuid {
    self.id
  }

  /// The requests this rule has served, in arrival order. Empty once the
  /// rule has been removed by `reset`.
  pub async fn seen_requests(&self) -> Vec<Arc<RequestRecord>> {
    self.registry.seen_for(self.id).await
  }

  /// Whether the rule still accepts requests. `false` once completed or
  /// removed.
  pub async fn is_pending(&self) -> bool {
    match self.registry.find(self.id).await {
      Some(rule) => rule.is_pending().await,
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{Headers, Protocol, Timing};
  use crate::rule::RuleData;
  use http::{Method, Version};

  fn record(path: &str) -> Arc<RequestRecord> {
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
      remote_addr: "127.0.0.1:4000".parse().unwrap(),
      timing: Timing::default(),
    })
  }

  #[tokio::test]
  async fn snapshot_keeps_registration_order() {
    let registry = RuleRegistry::new();
    let a = registry.add(RuleData::respond(200, "a")).await.unwrap();
    let b = registry.add(RuleData::respond(200, "b")).await.unwrap();

    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].id, a.id());
    assert_eq!(snapshot[1].id, b.id());
  }

  #[tokio::test]
  async fn seen_lists_grow_in_arrival_order() {
    let registry = RuleRegistry::new();
    let endpoint = registry.add(RuleData::respond(200, "ok")).await.unwrap();
    let rule = registry.find(endpoint.id()).await.unwrap();

    rule.record_seen(record("/1"), false);
    rule.record_seen(record("/2"), false);

    let seen = endpoint.seen_requests().await;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].path, "/1");
    assert_eq!(seen[1].path, "/2");
  }

  #[tokio::test]
  async fn reset_empties_outstanding_handles() {
    let registry = RuleRegistry::new();
    let endpoint = registry.add(RuleData::respond(200, "ok")).await.unwrap();
    registry
      .find(endpoint.id())
      .await
      .unwrap()
      .record_seen(record("/x"), false);

    registry.reset().await;
    assert!(registry.snapshot().await.is_empty());
    assert!(endpoint.seen_requests().await.is_empty());
    assert!(!endpoint.is_pending().await);
  }

  #[tokio::test]
  async fn pending_follows_the_checker() {
    let registry = RuleRegistry::new();
    let endpoint = registry
      .add(RuleData::respond(200, "once").up_to(crate::rule::CompletionChecker::Once))
      .await
      .unwrap();
    assert!(endpoint.is_pending().await);

    let rule = registry.find(endpoint.id()).await.unwrap();
    rule.record_seen(record("/only"), true);
    assert!(!endpoint.is_pending().await);
    assert!(rule.is_completed());
  }
}
