//! Lifecycle event fan-out
//!
//! Each subscriber gets its own bounded buffer; delivery is best-effort
//! and never blocks request handling. When a buffer overflows the event
//! is dropped and a warning is logged once for that subscriber.

use crate::record::{RequestRecord, ResponseRecord, TlsRequest};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Events buffered per subscriber before overflow drops begin.
pub const EVENT_BUFFER_SIZE: usize = 128;

/// A lifecycle event carrying its frozen record.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ProxyEvent {
  /// Request head parsed; the record's body is not yet available
  RequestInitiated {
    /// Headers-received view of the request
    request: Arc<RequestRecord>,
  },
  /// Request fully received
  Request {
    /// Completed request record
    request: Arc<RequestRecord>,
  },
  /// Response fully written
  Response {
    /// Completed response record
    response: Arc<ResponseRecord>,
  },
  /// Exchange ended without a response
  Abort {
    /// Whatever portion of the request was assembled
    request: Arc<RequestRecord>,
  },
  /// A TLS client failed its handshake
  TlsClientError {
    /// Failure description
    failure: Arc<TlsRequest>,
  },
}

impl ProxyEvent {
  /// The kind of this event.
  pub fn kind(&self) -> EventKind {
    match self {
      ProxyEvent::RequestInitiated { .. } => EventKind::RequestInitiated,
      ProxyEvent::Request { .. } => EventKind::Request,
      ProxyEvent::Response { .. } => EventKind::Response,
      ProxyEvent::Abort { .. } => EventKind::Abort,
      ProxyEvent::TlsClientError { .. } => EventKind::TlsClientError,
    }
  }
}

/// Subscribable event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
  /// Request head parsed
  RequestInitiated,
  /// Request fully received
  Request,
  /// Response fully written
  Response,
  /// Exchange aborted
  Abort,
  /// TLS handshake failure
  TlsClientError,
}

struct Subscriber {
  id: u64,
  kinds: Vec<EventKind>,
  tx: mpsc::Sender<ProxyEvent>,
  overflow_warned: AtomicBool,
}

impl Subscriber {
  fn wants(&self, kind: EventKind) -> bool {
    self.kinds.is_empty() || self.kinds.contains(&kind)
  }
}

/// The instance-owned subscriber table.
#[derive(Clone, Default)]
pub(crate) struct EventBus {
  subscribers: Arc<RwLock<Vec<Subscriber>>>,
  next_id: Arc<AtomicU64>,
}

impl EventBus {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Register a subscriber for the given kinds (all kinds when empty).
  /// The subscription is durable once this returns.
  pub(crate) async fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.subscribers.write().await.push(Subscriber {
      id,
      kinds: kinds.to_vec(),
      tx,
      overflow_warned: AtomicBool::new(false),
    });
    Subscription { rx }
  }

  /// Fan an event out to every interested subscriber without blocking.
  pub(crate) async fn emit(&self, event: ProxyEvent) {
    let kind = event.kind();
    let mut closed = Vec::new();
    {
      let subscribers = self.subscribers.read().await;
      for subscriber in subscribers.iter().filter(|s| s.wants(kind)) {
        match subscriber.tx.try_send(event.clone()) {
          Ok(()) => {}
          Err(mpsc::error::TrySendError::Full(_)) => {
            if !subscriber.overflow_warned.swap(true, Ordering::Relaxed) {
              tracing::warn!(
                "event subscriber {} is too slow, dropping events",
                subscriber.id
              );
            }
          }
          Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
        }
      }
    }
    if !closed.is_empty() {
      self
        .subscribers
        .write()
        .await
        .retain(|s| !closed.contains(&s.id));
    }
  }
}

/// A live event subscription.
pub struct Subscription {
  rx: mpsc::Receiver<ProxyEvent>,
}

impl Subscription {
  /// Next event, or `None` once the instance has shut down.
  pub async fn recv(&mut self) -> Option<ProxyEvent> {
    self.rx.recv().await
  }

  /// Next event if one is already buffered.
  pub fn try_recv(&mut self) -> Option<ProxyEvent> {
    self.rx.try_recv().ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::TlsRequest;

  fn tls_event(cause: &str) -> ProxyEvent {
    ProxyEvent::TlsClientError {
      failure: Arc::new(TlsRequest {
        failure_cause: cause.to_string(),
        hostname: None,
        remote_ip: "127.0.0.1".parse().unwrap(),
      }),
    }
  }

  #[tokio::test]
  async fn delivers_to_interested_subscribers_only() {
    let bus = EventBus::new();
    let mut all = bus.subscribe(&[]).await;
    let mut tls_only = bus.subscribe(&[EventKind::TlsClientError]).await;
    let mut responses = bus.subscribe(&[EventKind::Response]).await;

    bus.emit(tls_event("handshake failed")).await;

    assert!(matches!(
      all.recv().await,
      Some(ProxyEvent::TlsClientError { .. })
    ));
    assert!(matches!(
      tls_only.recv().await,
      Some(ProxyEvent::TlsClientError { .. })
    ));
    assert!(responses.try_recv().is_none());
  }

  #[tokio::test]
  async fn slow_subscribers_drop_instead_of_blocking() {
    let bus = EventBus::new();
    let mut slow = bus.subscribe(&[]).await;

    for i in 0..(EVENT_BUFFER_SIZE + 10) {
      bus.emit(tls_event(&format!("event {}", i))).await;
    }

    // The buffer holds exactly EVENT_BUFFER_SIZE events; the rest were
    // dropped without stalling emit.
    let mut received = 0;
    while slow.try_recv().is_some() {
      received += 1;
    }
    assert_eq!(received, EVENT_BUFFER_SIZE);
  }

  #[tokio::test]
  async fn dropped_subscriptions_are_pruned() {
    let bus = EventBus::new();
    let subscription = bus.subscribe(&[]).await;
    drop(subscription);

    bus.emit(tls_event("x")).await;
    assert!(bus.subscribers.read().await.is_empty());
  }
}
