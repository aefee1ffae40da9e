//! HTTP/1.1 request framing
//!
//! [`RequestCodec`] decodes one complete request at a time: head plus a
//! body framed by `Content-Length` or `Transfer-Encoding: chunked`. Chunked
//! bodies are de-chunked. Nothing is yielded until the whole body is
//! buffered, and a body over the cap is refused before it is read.

use super::request::{Headers, TrafficRequest};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Largest request head accepted
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Longest chunk-size line accepted
const MAX_CHUNK_LINE: usize = 1024;

/// Framing failure
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn malformed(msg: impl Into<String>) -> FramingError {
    FramingError::Malformed(msg.into())
}

/// A decoded request before it is attached to a destination
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: String,
    /// Request target as sent: origin-form, absolute-form or authority-form
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked,
}

struct Head {
    method: String,
    target: String,
    version: String,
    headers: Headers,
    framing: Framing,
}

/// Decoder for one HTTP/1.1 request
#[derive(Debug, Clone)]
pub struct RequestCodec {
    max_body: usize,
}

impl RequestCodec {
    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }
}

impl Decoder for RequestCodec {
    type Item = RawRequest;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawRequest>, FramingError> {
        let head_len = match find(src, b"\r\n\r\n") {
            Some(pos) => pos + 4,
            None if src.len() > MAX_HEAD_BYTES => {
                return Err(malformed("request head too large"));
            }
            None => return Ok(None),
        };
        if head_len > MAX_HEAD_BYTES {
            return Err(malformed("request head too large"));
        }

        let head = parse_head(&src[..head_len])?;

        let (body, consumed) = match head.framing {
            Framing::Empty => (Bytes::new(), head_len),
            Framing::Length(len) => {
                if len > self.max_body {
                    return Err(FramingError::TooLarge {
                        limit: self.max_body,
                    });
                }
                if src.len() < head_len + len {
                    src.reserve(head_len + len - src.len());
                    return Ok(None);
                }
                (
                    Bytes::copy_from_slice(&src[head_len..head_len + len]),
                    head_len + len,
                )
            }
            Framing::Chunked => match dechunk(&src[head_len..], self.max_body)? {
                Some((body, used)) => (Bytes::from(body), head_len + used),
                None => return Ok(None),
            },
        };

        src.advance(consumed);
        Ok(Some(RawRequest {
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            body,
        }))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn parse_head(raw: &[u8]) -> Result<Head, FramingError> {
    let text = std::str::from_utf8(raw).map_err(|_| malformed("request head is not UTF-8"))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) if is_token(m) && !t.is_empty() => (m, t, v),
        _ => return Err(malformed(format!("invalid request line '{}'", request_line))),
    };
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(malformed(format!("unsupported version '{}'", version)));
    }

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(malformed("folded header lines are not accepted"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| malformed(format!("invalid header line '{}'", line)))?;
        if !is_token(name) {
            return Err(malformed(format!("invalid header name '{}'", name)));
        }
        headers.append(name, value.trim().as_bytes());
    }

    let framing = framing(&headers)?;
    Ok(Head {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        framing,
    })
}

fn framing(headers: &Headers) -> Result<Framing, FramingError> {
    let lengths: Vec<&[u8]> = headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v)
        .collect();

    if headers.contains("transfer-encoding") {
        if !lengths.is_empty() {
            return Err(malformed(
                "both Content-Length and Transfer-Encoding are present",
            ));
        }
        let last = headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .last()
            .unwrap_or_default();
        if !last.eq_ignore_ascii_case("chunked") {
            return Err(malformed(format!("unsupported transfer coding '{}'", last)));
        }
        return Ok(Framing::Chunked);
    }

    match lengths.split_first() {
        None => Ok(Framing::Empty),
        Some((first, rest)) => {
            if rest.iter().any(|v| v != first) {
                return Err(malformed("conflicting Content-Length values"));
            }
            let text = std::str::from_utf8(first)
                .ok()
                .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
                .ok_or_else(|| malformed("invalid Content-Length"))?;
            let len: usize = text
                .parse()
                .map_err(|_| malformed("invalid Content-Length"))?;
            Ok(if len == 0 {
                Framing::Empty
            } else {
                Framing::Length(len)
            })
        }
    }
}

/// De-chunk a complete chunked body. `None` while more bytes are needed;
/// otherwise the body and the number of bytes it occupied.
fn dechunk(data: &[u8], max_body: usize) -> Result<Option<(Vec<u8>, usize)>, FramingError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = match find(&data[pos..], b"\r\n") {
            Some(i) => pos + i,
            None if data.len() - pos > MAX_CHUNK_LINE => {
                return Err(malformed("chunk size line too long"))
            }
            None => return Ok(None),
        };

        let line = std::str::from_utf8(&data[pos..line_end])
            .map_err(|_| malformed("invalid chunk size"))?;
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| malformed(format!("invalid chunk size '{}'", size_text)))?;
        pos = line_end + 2;

        if size == 0 {
            // Trailer section ends with an empty line
            loop {
                match find(&data[pos..], b"\r\n") {
                    Some(0) => return Ok(Some((body, pos + 2))),
                    Some(i) => pos += i + 2,
                    None => return Ok(None),
                }
            }
        }

        if body.len().saturating_add(size) > max_body {
            return Err(FramingError::TooLarge { limit: max_body });
        }
        if data.len() < pos + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&data[pos..pos + size]);
        if &data[pos + size..pos + size + 2] != b"\r\n" {
            return Err(malformed("chunk not terminated by CRLF"));
        }
        pos += size + 2;
    }
}

/// Headers never forwarded upstream
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "expect",
    "host",
    "content-length",
];

/// Serialize a vetted request for the upstream connection: hop-by-hop
/// headers dropped, body re-framed with `Content-Length`, one request per
/// connection.
pub fn encode_upstream(request: &TrafficRequest) -> Vec<u8> {
    let listed: Vec<String> = request
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("connection"))
        .filter_map(|(_, v)| std::str::from_utf8(v).ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();

    let mut out = Vec::with_capacity(request.body.len() + 1024);
    out.extend_from_slice(
        format!("{} {} HTTP/1.1\r\nHost: {}\r\n", request.method, request.target(), request.authority())
            .as_bytes(),
    );

    for (name, value) in request.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || listed.contains(&lower) {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    if !request.body.is_empty() || matches!(request.method.as_str(), "POST" | "PUT" | "PATCH") {
        out.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&request.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::request::Scheme;

    fn decode_all(input: &[u8], max: usize) -> Result<Option<RawRequest>, FramingError> {
        let mut codec = RequestCodec::new(max);
        let mut buf = BytesMut::from(input);
        codec.decode(&mut buf)
    }

    #[test]
    fn test_simple_get() {
        let req = decode_all(b"GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\n\r\n", 1024)
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/a?b=1");
        assert_eq!(req.headers.get_str("host"), Some("example.com"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_partial_input_waits() {
        let mut codec = RequestCodec::new(1024);
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"cde");
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&req.body[..], b"abcde");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_chunked_body() {
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\n";
        let req = decode_all(input, 1024).unwrap().unwrap();
        assert_eq!(&req.body[..], b"Wikipedia");
    }

    #[test]
    fn test_chunked_incomplete() {
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWi";
        assert!(decode_all(input, 1024).unwrap().is_none());
    }

    #[test]
    fn test_body_over_cap() {
        let input = b"POST / HTTP/1.1\r\nContent-Length: 2048\r\n\r\n";
        assert!(matches!(
            decode_all(input, 1024),
            Err(FramingError::TooLarge { limit: 1024 })
        ));

        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n10\r\n";
        assert!(matches!(
            decode_all(input, 8),
            Err(FramingError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_malformed() {
        for input in [
            &b"GET /\r\n\r\n"[..],
            b"GET / HTTP/2.0\r\n\r\n",
            b"GET / HTTP/1.1\r\nBad Header\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nab",
            b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n",
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
            b"GET / HTTP/1.1\r\nX: a\r\n  folded\r\n\r\n",
        ] {
            assert!(
                matches!(decode_all(input, 1024), Err(FramingError::Malformed(_))),
                "{}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn test_encode_upstream_reframes() {
        let mut headers = Headers::new();
        headers.append("Host", "api.example.com");
        headers.append("Connection", "keep-alive, X-Custom");
        headers.append("X-Custom", "drop me");
        headers.append("Transfer-Encoding", "chunked");
        headers.append("Proxy-Authorization", "Basic abc");
        headers.append("Accept", "*/*");
        let request = TrafficRequest {
            method: "POST".to_string(),
            scheme: Scheme::Https,
            host: "api.example.com".to_string(),
            port: 443,
            path: "/v1".to_string(),
            query: None,
            headers,
            body: Bytes::from_static(b"hello"),
            session_id: None,
        };

        let text = String::from_utf8(encode_upstream(&request)).unwrap();
        assert!(text.starts_with("POST /v1 HTTP/1.1\r\nHost: api.example.com\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Connection: close\r\n\r\nhello"));
        assert!(!text.contains("X-Custom"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(!text.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn test_framed_read_across_partial_reads() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let io = tokio_test::io::Builder::new()
            .read(b"POST /upload HTTP/1.1\r\nHost: example.com\r\n")
            .read(b"Transfer-Encoding: chunked\r\n\r\n5\r\nhel")
            .read(b"lo\r\n0\r\n\r\n")
            .build();
        let mut frames = FramedRead::new(io, RequestCodec::new(1024));

        let request = frames.next().await.unwrap().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.target, "/upload");
        assert_eq!(&request.body[..], b"hello");
        assert!(frames.next().await.is_none());
    }
}
