//! Stream plumbing shared by the demultiplexer, the TLS terminator and
//! `CONNECT` tunnels
//!
//! Every layer (raw TCP, TLS over TCP, TLS inside a tunnel) is erased to
//! the same boxed stream type so the front-end and the demultiplexer can
//! recurse through nested tunnels without caring what they sit on.

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// The byte streams the proxy drives.
pub(crate) trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub(crate) type BoxedStream = Box<dyn Transport>;

/// A stream with already-read bytes re-injected at its head.
///
/// Used by the demultiplexer to hand back the peeked first byte, and by
/// the `CONNECT` path to hand back bytes that were read past the end of
/// the tunnel request head.
pub(crate) struct Rewind {
  prefix: Bytes,
  inner: BoxedStream,
}

impl Rewind {
  pub(crate) fn new(prefix: Bytes, inner: BoxedStream) -> Self {
    Self { prefix, inner }
  }

  pub(crate) fn boxed(prefix: Bytes, inner: BoxedStream) -> BoxedStream {
    if prefix.is_empty() {
      inner
    } else {
      Box::new(Self::new(prefix, inner))
    }
  }
}

impl AsyncRead for Rewind {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if !this.prefix.is_empty() {
      let n = this.prefix.len().min(buf.remaining());
      buf.put_slice(&this.prefix.split_to(n));
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Rewind {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

/// A handle onto the underlying TCP socket that stays usable after the
/// stream itself has been layered under TLS and boxed.
///
/// Holds a dup of the accepted socket; SO_LINGER applies to the socket,
/// not the descriptor, so arming it here turns the eventual close of the
/// connection into a TCP RST.
pub(crate) struct ConnHandle {
  sock: std::net::TcpStream,
}

impl ConnHandle {
  /// Split an accepted stream into the async stream the proxy drives and
  /// a socket-level control handle.
  pub(crate) fn pair(stream: TcpStream) -> io::Result<(TcpStream, ConnHandle)> {
    let std_stream = stream.into_std()?;
    let sock = std_stream.try_clone()?;
    Ok((TcpStream::from_std(std_stream)?, ConnHandle { sock }))
  }

  /// Arm an immediate RST on close.
  pub(crate) fn arm_reset(&self) {
    let sock = socket2::SockRef::from(&self.sock);
    if let Err(e) = sock.set_linger(Some(Duration::from_secs(0))) {
      tracing::warn!("failed to arm connection reset: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn rewind_serves_prefix_before_inner() {
    let (client, mut server) = tokio::io::duplex(64);
    tokio::spawn(async move {
      use tokio::io::AsyncWriteExt;
      server.write_all(b" world").await.unwrap();
    });

    let inner: BoxedStream = Box::new(client);
    let mut stream = Rewind::new(Bytes::from_static(b"hello"), inner);

    let mut out = vec![0u8; 11];
    stream.read_exact(&mut out).await.unwrap();
    assert_eq!(&out, b"hello world");
  }
}
