//! Port selection and binding
//!
//! A candidate port is only used when it can be transiently bound on the
//! IPv4 loopback, and on the IPv6 loopback when one exists, so a started
//! instance is reachable however `localhost` resolves.

use crate::error::{Error, Result};
use tokio::net::TcpListener;

/// Default scan range, `[8000, 9000)`.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (8000, 9000);

/// Where to bind the data plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortSpec {
  /// Scan the default range for the first free port
  Default,
  /// Bind exactly this port or fail
  Exact(u16),
  /// Scan `[start, end)` for the first free port
  Range {
    /// First port to try
    start: u16,
    /// One past the last port to try
    end: u16,
  },
}

impl Default for PortSpec {
  fn default() -> Self {
    PortSpec::Default
  }
}

impl From<u16> for PortSpec {
  fn from(port: u16) -> Self {
    PortSpec::Exact(port)
  }
}

impl From<std::ops::Range<u16>> for PortSpec {
  fn from(range: std::ops::Range<u16>) -> Self {
    PortSpec::Range {
      start: range.start,
      end: range.end,
    }
  }
}

async fn has_ipv6_loopback() -> bool {
  TcpListener::bind(("::1", 0)).await.is_ok()
}

/// Bind a listener for the requested port selection. The returned
/// listener is the IPv4 loopback binding the instance serves on.
pub(crate) async fn bind(spec: PortSpec) -> Result<TcpListener> {
  match spec {
    PortSpec::Exact(port) => {
      let probe_v6 = has_ipv6_loopback().await;
      try_bind(port, probe_v6).await.map_err(Error::Io)
    }
    PortSpec::Default => {
      let (start, end) = DEFAULT_PORT_RANGE;
      scan(start, end).await
    }
    PortSpec::Range { start, end } => {
      if start >= end {
        return Err(Error::config(format!(
          "invalid port range [{}, {})",
          start, end
        )));
      }
      scan(start, end).await
    }
  }
}

async fn scan(start: u16, end: u16) -> Result<TcpListener> {
  let probe_v6 = has_ipv6_loopback().await;
  for port in start..end {
    match try_bind(port, probe_v6).await {
      Ok(listener) => return Ok(listener),
      Err(e) => tracing::debug!("port {} unavailable: {}", port, e),
    }
  }
  Err(Error::PortExhausted { start, end })
}

async fn try_bind(port: u16, probe_v6: bool) -> std::io::Result<TcpListener> {
  if probe_v6 {
    // Transient probe; dropped immediately so only the v4 binding stays.
    let v6 = TcpListener::bind(("::1", port)).await?;
    drop(v6);
  }
  TcpListener::bind(("127.0.0.1", port)).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn exact_port_binds_and_conflicts() {
    let listener = bind(PortSpec::Default).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let conflict = bind(PortSpec::Exact(port)).await;
    assert!(matches!(conflict, Err(Error::Io(_))));
  }

  #[tokio::test]
  async fn range_scan_skips_taken_ports() {
    let first = bind(PortSpec::Range {
      start: 18200,
      end: 18210,
    })
    .await
    .unwrap();
    let second = bind(PortSpec::Range {
      start: 18200,
      end: 18210,
    })
    .await
    .unwrap();

    let p1 = first.local_addr().unwrap().port();
    let p2 = second.local_addr().unwrap().port();
    assert_ne!(p1, p2);
    assert!((18200..18210).contains(&p1));
    assert!((18200..18210).contains(&p2));
  }

  #[tokio::test]
  async fn exhaustion_is_a_dedicated_error() {
    let _taken = bind(PortSpec::Range {
      start: 18300,
      end: 18301,
    })
    .await
    .unwrap();

    let err = bind(PortSpec::Range {
      start: 18300,
      end: 18301,
    })
    .await;
    assert!(matches!(err, Err(Error::PortExhausted { .. })));
  }

  #[tokio::test]
  async fn empty_range_is_a_config_error() {
    let err = bind(PortSpec::Range {
      start: 9000,
      end: 8000,
    })
    .await;
    assert!(matches!(err, Err(Error::Config(_))));
  }
}
