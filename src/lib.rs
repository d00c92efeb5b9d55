#![deny(missing_docs)]

//! # decoy
//!
//! The `decoy` crate provides an HTTP/HTTPS mocking and intercepting
//! proxy for automated tests: start an instance on a local port, register
//! rules that match incoming requests and synthesize responses, point the
//! code under test at the proxy, and observe the recorded traffic.
//!
//! A single listening port serves plain HTTP, implicit TLS and `CONNECT`
//! tunnels (nested tunnels included). HTTPS is terminated on the fly with
//! leaf certificates minted per hostname by a configurable root CA.
//!
//! ## Mocking a request
//!
//! ```no_run
//! use decoy::{MockProxy, RequestMatcher, RuleData};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), decoy::Error> {
//!   let proxy = MockProxy::builder().build().await?;
//!   proxy.start(decoy::PortSpec::Default).await?;
//!
//!   let endpoint = proxy
//!     .add_rule(RuleData::respond(200, "hello").matching(RequestMatcher::Path {
//!       path: "/foo".to_string(),
//!     }))
//!     .await?;
//!
//!   // ... drive the code under test against proxy.url() ...
//!
//!   assert_eq!(endpoint.seen_requests().await.len(), 0);
//!   proxy.stop().await;
//!   Ok(())
//! }
//! ```
//!
//! ## Observing traffic
//!
//! Subscribe to lifecycle events (`request-initiated`, `request`,
//! `response`, `abort`, `tls-client-error`) through
//! [`MockProxy::subscribe`]; delivery is buffered per subscriber and a
//! slow consumer never blocks request handling.
//!
//! ## HTTPS interception
//!
//! Configure a CA via [`MockProxyBuilder::ca_pem`],
//! [`MockProxyBuilder::ca_files`] or [`MockProxyBuilder::generate_ca`]
//! and install [`MockProxy::ca_cert_pem`] in the client's trust store.
//! The root key is never written to disk.

mod body;
mod ca;
mod error;
mod events;
mod http1;
mod pipeline;
mod ports;
mod record;
mod registry;
mod rule;
mod server;
mod socket;
mod tls;
mod upstream;

pub use body::Body;
pub use ca::CertificateAuthority;
pub use error::{Error, Result};
pub use events::{EventKind, ProxyEvent, Subscription, EVENT_BUFFER_SIZE};
pub use ports::{PortSpec, DEFAULT_PORT_RANGE};
pub use record::{Headers, Protocol, RequestRecord, ResponseRecord, Timing, TlsRequest};
pub use registry::{MockedEndpoint, RuleRegistry};
pub use rule::{
  CallbackHandler, CompletionChecker, CustomChecker, CustomMatcher, RequestMatcher,
  RequestPredicate, Responder, ResponseHandler, ResponseSpec, RuleData, SeenPredicate,
  StreamChunks,
};
pub use server::{MockProxy, MockProxyBuilder};
