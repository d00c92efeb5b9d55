//! Buffered request/response bodies
//!
//! The front-end completes a body before dispatching the request, so a
//! `Body` is a cheaply clonable buffer. Decoding to text is lazy and
//! driven by the `charset` parameter of `Content-Type`.

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use mime::Mime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write;

/// A body.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
  inner: Bytes,
}

impl Body {
  /// An empty body.
  pub fn empty() -> Self {
    Self::default()
  }

  /// The raw bytes.
  pub fn bytes(&self) -> &Bytes {
    &self.inner
  }

  /// Length in bytes.
  pub fn len(&self) -> usize {
    self.inner.len()
  }

  /// Whether the body holds no bytes.
  pub fn is_empty(&self) -> bool {
    self.inner.is_empty()
  }

  /// Decode as text, assuming UTF-8.
  pub fn text(&self) -> String {
    self.decode_with(UTF_8)
  }

  /// Decode as text using the charset parameter of the given
  /// `Content-Type` value, falling back to UTF-8.
  pub fn text_with_content_type(&self, content_type: Option<&str>) -> String {
    let encoding = content_type
      .and_then(|ct| ct.parse::<Mime>().ok())
      .and_then(|mime| {
        mime
          .get_param("charset")
          .and_then(|charset| Encoding::for_label(charset.as_str().as_bytes()))
      })
      .unwrap_or(UTF_8);
    self.decode_with(encoding)
  }

  /// View the body as a stream of chunks of at most `chunk_size` bytes.
  pub fn stream(&self, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
    let chunk_size = chunk_size.max(1);
    self
      .inner
      .chunks(chunk_size)
      .map(|chunk| self.inner.slice_ref(chunk))
  }

  fn decode_with(&self, encoding: &'static Encoding) -> String {
    let (text, _, _) = encoding.decode(&self.inner);
    text.into_owned()
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Body {
      inner: Bytes::from_static(s.as_bytes()),
    }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Display::fmt(s, f),
      Err(_err) => fmt::Display::fmt(
        &self
          .inner
          .as_ref()
          .iter()
          .fold(String::new(), |mut output, b| {
            let _ = write!(output, "\\x{b:02x}");
            output
          }),
        f,
      ),
    }
  }
}
