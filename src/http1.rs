//! HTTP/1.x wire reading and writing
//!
//! Hand-rolled over tokio streams: head parsing keeps header lines in
//! arrival order with their original case, body reading understands
//! Content-Length and chunked framing, and all reads are size-capped.
//! The `buf` passed around is the connection's leftover buffer; bytes
//! read past the current element stay in it for the next one.

use crate::error::{Error, Result};
use crate::record::Headers;
use bytes::Bytes;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 8 * 1024;

/// Parsed request line plus headers.
#[derive(Debug)]
pub(crate) struct RequestHead {
  pub method: Method,
  pub target: String,
  pub version: Version,
  pub headers: Headers,
}

/// Parsed status line plus headers.
#[derive(Debug)]
pub(crate) struct ResponseHead {
  pub status: StatusCode,
  pub reason: String,
  pub headers: Headers,
}

/// Headers that describe the connection hop, never forwarded upstream.
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
  const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
  ];
  HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize> {
  let mut tmp = [0u8; READ_CHUNK];
  let n = reader.read(&mut tmp).await?;
  buf.extend_from_slice(&tmp[..n]);
  Ok(n)
}

/// Index one past the blank line ending a head, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
  let mut i = 0;
  while i < buf.len() {
    if buf[i] == b'\n' {
      match buf.get(i + 1) {
        Some(b'\n') => return Some(i + 2),
        Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some(i + 3),
        _ => {}
      }
    }
    i += 1;
  }
  None
}

/// Read one request head. `Ok(None)` means the peer closed cleanly before
/// sending anything.
pub(crate) async fn read_request_head<R: AsyncRead + Unpin>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  max: usize,
) -> Result<Option<RequestHead>> {
  let head = match read_head_bytes(reader, buf, max).await? {
    Some(head) => head,
    None => return Ok(None),
  };
  parse_request_head(&head).map(Some)
}

/// Read one response head; a closed peer is a protocol error here.
pub(crate) async fn read_response_head<R: AsyncRead + Unpin>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  max: usize,
) -> Result<ResponseHead> {
  match read_head_bytes(reader, buf, max).await? {
    Some(head) => parse_response_head(&head),
    None => Err(Error::protocol("connection closed before response head")),
  }
}

async fn read_head_bytes<R: AsyncRead + Unpin>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  max: usize,
) -> Result<Option<Vec<u8>>> {
  loop {
    if let Some(end) = find_head_end(buf) {
      let head: Vec<u8> = buf.drain(..end).collect();
      return Ok(Some(head));
    }
    if buf.len() > max {
      return Err(Error::protocol("request head exceeds size limit"));
    }
    if fill(reader, buf).await? == 0 {
      if buf.is_empty() {
        return Ok(None);
      }
      return Err(Error::protocol("connection closed mid-head"));
    }
  }
}

fn parse_version(token: &str) -> Result<Version> {
  match token {
    "HTTP/1.1" => Ok(Version::HTTP_11),
    "HTTP/1.0" => Ok(Version::HTTP_10),
    "HTTP/0.9" => Ok(Version::HTTP_09),
    other => Err(Error::protocol(format!("unsupported version {:?}", other))),
  }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
  let mut headers = Headers::new();
  for line in lines {
    if line.is_empty() {
      break;
    }
    let (name, value) = line
      .split_once(':')
      .ok_or_else(|| Error::protocol(format!("malformed header line {:?}", line)))?;
    headers.push(name.trim(), value.trim_start());
  }
  Ok(headers)
}

fn parse_request_head(head: &[u8]) -> Result<RequestHead> {
  let text = String::from_utf8_lossy(head);
  let mut lines = text.lines();
  let request_line = lines
    .next()
    .ok_or_else(|| Error::protocol("empty request head"))?;

  let parts: Vec<&str> = request_line.split_whitespace().collect();
  if parts.len() != 3 {
    return Err(Error::protocol(format!(
      "malformed request line {:?}",
      request_line
    )));
  }

  let method = Method::from_bytes(parts[0].as_bytes())
    .map_err(|_| Error::protocol(format!("invalid method {:?}", parts[0])))?;
  let version = parse_version(parts[2])?;
  let headers = parse_header_lines(lines)?;

  Ok(RequestHead {
    method,
    target: parts[1].to_string(),
    version,
    headers,
  })
}

fn parse_response_head(head: &[u8]) -> Result<ResponseHead> {
  let text = String::from_utf8_lossy(head);
  let mut lines = text.lines();
  let status_line = lines
    .next()
    .ok_or_else(|| Error::protocol("empty response head"))?;

  let mut parts = status_line.splitn(3, ' ');
  let version = parts
    .next()
    .ok_or_else(|| Error::protocol("empty status line"))?;
  parse_version(version)?;
  let code = parts
    .next()
    .and_then(|c| c.parse::<u16>().ok())
    .and_then(|c| StatusCode::from_u16(c).ok())
    .ok_or_else(|| Error::protocol(format!("malformed status line {:?}", status_line)))?;
  let reason = parts.next().unwrap_or_default().to_string();
  let headers = parse_header_lines(lines)?;

  Ok(ResponseHead {
    status: code,
    reason,
    headers,
  })
}

fn is_chunked(headers: &Headers) -> bool {
  headers
    .get_all("transfer-encoding")
    .iter()
    .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Read the body described by `headers`. Requests without framing headers
/// have no body.
pub(crate) async fn read_body<R: AsyncRead + Unpin>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  headers: &Headers,
  max: usize,
) -> Result<Bytes> {
  if is_chunked(headers) {
    return read_chunked_body(reader, buf, max).await;
  }
  match headers.get("content-length") {
    Some(raw) => {
      let len: usize = raw
        .trim()
        .parse()
        .map_err(|_| Error::protocol(format!("invalid content-length {:?}", raw)))?;
      if len > max {
        return Err(Error::protocol("request body exceeds size limit"));
      }
      read_exact_body(reader, buf, len).await
    }
    None => Ok(Bytes::new()),
  }
}

/// Read a response body: chunked, sized, or everything until EOF.
pub(crate) async fn read_response_body<R: AsyncRead + Unpin>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  headers: &Headers,
  max: usize,
) -> Result<Bytes> {
  if is_chunked(headers) {
    return read_chunked_body(reader, buf, max).await;
  }
  if let Some(raw) = headers.get("content-length") {
    let len: usize = raw
      .trim()
      .parse()
      .map_err(|_| Error::protocol(format!("invalid content-length {:?}", raw)))?;
    if len > max {
      return Err(Error::protocol("response body exceeds size limit"));
    }
    return read_exact_body(reader, buf, len).await;
  }
  // No framing: the origin delimits the body by closing.
  loop {
    if buf.len() > max {
      return Err(Error::protocol("response body exceeds size limit"));
    }
    if fill(reader, buf).await? == 0 {
      let body: Vec<u8> = buf.drain(..).collect();
      return Ok(body.into());
    }
  }
}

async fn read_exact_body<R: AsyncRead + Unpin>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  len: usize,
) -> Result<Bytes> {
  while buf.len() < len {
    if fill(reader, buf).await? == 0 {
      return Err(Error::protocol("connection closed mid-body"));
    }
  }
  let body: Vec<u8> = buf.drain(..len).collect();
  Ok(body.into())
}

async fn read_line<R: AsyncRead + Unpin>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  max: usize,
) -> Result<String> {
  loop {
    if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
      let line: Vec<u8> = buf.drain(..=pos).collect();
      let text = String::from_utf8_lossy(&line);
      return Ok(text.trim_end_matches(['\r', '\n']).to_string());
    }
    if buf.len() > max {
      return Err(Error::protocol("chunk line exceeds size limit"));
    }
    if fill(reader, buf).await? == 0 {
      return Err(Error::protocol("connection closed mid-chunk"));
    }
  }
}

async fn read_chunked_body<R: AsyncRead + Unpin>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  max: usize,
) -> Result<Bytes> {
  let mut body = Vec::new();
  loop {
    let size_line = read_line(reader, buf, max).await?;
    let size_token = size_line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_token, 16)
      .map_err(|_| Error::protocol(format!("invalid chunk size {:?}", size_token)))?;

    if size == 0 {
      // Drain optional trailers up to the blank line.
      loop {
        let trailer = read_line(reader, buf, max).await?;
        if trailer.is_empty() {
          break;
        }
      }
      return Ok(body.into());
    }

    if body.len() + size > max {
      return Err(Error::protocol("chunked body exceeds size limit"));
    }
    let chunk = read_exact_body(reader, buf, size).await?;
    body.extend_from_slice(&chunk);

    // Chunk data is followed by its own CRLF.
    let sep = read_line(reader, buf, max).await?;
    if !sep.is_empty() {
      return Err(Error::protocol("missing CRLF after chunk data"));
    }
  }
}

fn reason_for(status: StatusCode, reason: Option<&str>) -> String {
  match reason {
    Some(r) if !r.is_empty() => r.to_string(),
    _ => status.canonical_reason().unwrap_or("Unknown").to_string(),
  }
}

fn head_bytes(
  status: StatusCode,
  reason: Option<&str>,
  headers: &[(String, String)],
  framing: Framing,
) -> Vec<u8> {
  let mut out = Vec::new();
  out.extend_from_slice(
    format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason_for(status, reason)).as_bytes(),
  );
  let mut has_length = false;
  for (name, value) in headers {
    if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
    {
      has_length = true;
    }
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
  }
  if !has_length {
    match framing {
      Framing::Sized(len) => {
        out.extend_from_slice(format!("content-length: {}\r\n", len).as_bytes());
      }
      Framing::Chunked => {
        out.extend_from_slice(b"transfer-encoding: chunked\r\n");
      }
    }
  }
  out.extend_from_slice(b"\r\n");
  out
}

enum Framing {
  Sized(usize),
  Chunked,
}

/// Write a complete response with a sized body.
pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
  writer: &mut W,
  status: StatusCode,
  reason: Option<&str>,
  headers: &[(String, String)],
  body: &[u8],
) -> Result<()> {
  let mut out = head_bytes(status, reason, headers, Framing::Sized(body.len()));
  out.extend_from_slice(body);
  writer.write_all(&out).await?;
  writer.flush().await?;
  Ok(())
}

/// Write a response whose body goes out as chunked transfer coding.
pub(crate) async fn write_chunked_response<W: AsyncWrite + Unpin>(
  writer: &mut W,
  status: StatusCode,
  reason: Option<&str>,
  headers: &[(String, String)],
  chunks: &[Bytes],
) -> Result<()> {
  let head = head_bytes(status, reason, headers, Framing::Chunked);
  writer.write_all(&head).await?;
  for chunk in chunks.iter().filter(|c| !c.is_empty()) {
    writer
      .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
      .await?;
    writer.write_all(chunk).await?;
    writer.write_all(b"\r\n").await?;
  }
  writer.write_all(b"0\r\n\r\n").await?;
  writer.flush().await?;
  Ok(())
}

/// Write a request head plus body, for passthrough to an origin.
pub(crate) async fn write_request<W: AsyncWrite + Unpin>(
  writer: &mut W,
  method: &Method,
  target: &str,
  headers: &[(String, String)],
  body: &[u8],
) -> Result<()> {
  let mut out = Vec::new();
  out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method.as_str(), target).as_bytes());
  let mut has_length = false;
  for (name, value) in headers {
    if name.eq_ignore_ascii_case("content-length") {
      has_length = true;
    }
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
  }
  if !has_length && !body.is_empty() {
    out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
  }
  out.extend_from_slice(b"\r\n");
  out.extend_from_slice(body);
  writer.write_all(&out).await?;
  writer.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn parses_request_head_preserving_header_order() {
    let raw: &[u8] = b"POST /api?x=1 HTTP/1.1\r\nHost: example.com\r\nX-One: a\r\nx-one: b\r\n\r\nrest";
    let mut reader = raw;
    let mut buf = Vec::new();
    let head = read_request_head(&mut reader, &mut buf, 64 * 1024)
      .await
      .unwrap()
      .unwrap();

    assert_eq!(head.method, Method::POST);
    assert_eq!(head.target, "/api?x=1");
    assert_eq!(head.version, Version::HTTP_11);
    assert_eq!(head.headers.get_all("x-one"), vec!["a", "b"]);
    assert_eq!(buf, b"rest", "bytes past the head stay buffered");
  }

  #[tokio::test]
  async fn clean_eof_before_any_byte_is_none() {
    let mut reader: &[u8] = b"";
    let mut buf = Vec::new();
    let head = read_request_head(&mut reader, &mut buf, 1024).await.unwrap();
    assert!(head.is_none());
  }

  #[tokio::test]
  async fn garbage_request_line_is_a_protocol_error() {
    let mut reader: &[u8] = b"\x16\x03\x01 junk\r\n\r\n";
    let mut buf = Vec::new();
    let err = read_request_head(&mut reader, &mut buf, 1024).await;
    assert!(matches!(err, Err(Error::Protocol(_))));
  }

  #[tokio::test]
  async fn reads_content_length_body_and_keeps_leftover() {
    let mut reader: &[u8] = b"pingNEXT";
    let mut buf = Vec::new();
    let mut headers = Headers::new();
    headers.push("Content-Length", "4");
    let body = read_body(&mut reader, &mut buf, &headers, 1024).await.unwrap();
    assert_eq!(&body[..], b"ping");
    assert_eq!(buf, b"NEXT");
  }

  #[tokio::test]
  async fn reads_chunked_body() {
    let mut reader: &[u8] = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut buf = Vec::new();
    let mut headers = Headers::new();
    headers.push("Transfer-Encoding", "chunked");
    let body = read_body(&mut reader, &mut buf, &headers, 1024).await.unwrap();
    assert_eq!(&body[..], b"Wikipedia");
  }

  #[tokio::test]
  async fn write_response_adds_content_length() {
    let mut out = Vec::new();
    write_response(
      &mut out,
      StatusCode::OK,
      None,
      &[("x-test".to_string(), "1".to_string())],
      b"hello",
    )
    .await
    .unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("x-test: 1\r\n"));
    assert!(text.contains("content-length: 5\r\n"));
    assert!(text.ends_with("\r\n\r\nhello"));
  }

  #[tokio::test]
  async fn chunked_writer_round_trips_with_reader() {
    let mut out = Vec::new();
    write_chunked_response(
      &mut out,
      StatusCode::OK,
      None,
      &[],
      &[Bytes::from_static(b"abc"), Bytes::from_static(b"defg")],
    )
    .await
    .unwrap();

    let mut reader: &[u8] = &out;
    let mut buf = Vec::new();
    let head = read_response_head(&mut reader, &mut buf, 1024).await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    let body = read_response_body(&mut reader, &mut buf, &head.headers, 1024)
      .await
      .unwrap();
    assert_eq!(&body[..], b"abcdefg");
  }
}
