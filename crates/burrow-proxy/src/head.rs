//! Raw HTTP/1.x head parsing
//!
//! Header order, case and duplicates are preserved so preambles can be
//! reconstructed verbatim; some WebSocket subprotocol negotiators care
//! about header order, and normalizing through a header map would destroy
//! it.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a request or response head.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Parse failure modes for an inbound head.
#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    /// The connection ended before a complete head arrived
    #[error("connection closed before a complete head")]
    Closed,

    /// Head exceeds [`MAX_HEAD_SIZE`]
    #[error("head larger than {MAX_HEAD_SIZE} bytes")]
    TooLarge,

    /// Not HTTP/1.x
    #[error("malformed head: {0}")]
    Malformed(httparse::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    None,
    /// Exactly this many bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Response bodies only: the body ends when the sender closes
    Eof,
}

/// A parsed request head with the original header sequence.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target as it appeared on the wire (path + query)
    pub target: String,
    /// Minor HTTP version: 0 or 1
    pub version_minor: u8,
    /// Headers in wire order, original case, duplicates preserved
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Lowercased `Host` with any port (or IPv6 brackets aside) stripped.
    pub fn hostname(&self) -> Option<String> {
        let host = self.header("host")?.trim();
        let host = if let Some(rest) = host.strip_prefix('[') {
            // IPv6 literal: keep everything inside the brackets.
            rest.split(']').next().unwrap_or(rest)
        } else {
            host.split(':').next().unwrap_or(host)
        };
        if host.is_empty() {
            None
        } else {
            Some(host.to_ascii_lowercase())
        }
    }

    /// Whether the `Connection` header carries an `upgrade` token.
    pub fn is_upgrade(&self) -> bool {
        self.header("connection")
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false)
    }

    /// Whether the peer connection should close after this exchange.
    pub fn wants_close(&self) -> bool {
        match self.header("connection") {
            Some(v) => v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")),
            // HTTP/1.0 closes unless keep-alive was requested.
            None => self.version_minor == 0,
        }
    }

    /// Request body framing. Requests are never EOF-delimited.
    pub fn body_framing(&self) -> BodyFraming {
        if self
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
        {
            return BodyFraming::Chunked;
        }
        if let Some(len) = self.header("content-length") {
            return match len.trim().parse::<u64>() {
                Ok(0) | Err(_) => BodyFraming::None,
                Ok(n) => BodyFraming::Length(n),
            };
        }
        BodyFraming::None
    }

    /// Reconstruct the wire preamble: request line, headers in their
    /// original order and case, blank line.
    pub fn write_preamble(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.");
        out.extend_from_slice(if self.version_minor == 0 { b"0" } else { b"1" });
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// A parsed response head. The raw bytes are passed through to the peer
/// separately; this struct only informs framing decisions.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body framing for a response to `method` with this status.
    pub fn body_framing(&self, method: &str) -> BodyFraming {
        if method.eq_ignore_ascii_case("HEAD")
            || self.status / 100 == 1
            || self.status == 204
            || self.status == 304
        {
            return BodyFraming::None;
        }
        if self
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
        {
            return BodyFraming::Chunked;
        }
        if let Some(len) = self.header("content-length") {
            return match len.trim().parse::<u64>() {
                Ok(n) => BodyFraming::Length(n),
                Err(_) => BodyFraming::Eof,
            };
        }
        BodyFraming::Eof
    }

    pub fn wants_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    }
}

/// Read from `stream` into `buf` until a complete request head parses.
///
/// On success the head bytes are still at the front of `buf`; the returned
/// length says how many bytes they span, so the caller can either replay
/// them (management fall-through) or discard them (tunnel paths).
pub async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<(RequestHead, usize), HeadError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(buf) {
                Ok(httparse::Status::Complete(len)) => {
                    let head = RequestHead {
                        method: req.method.unwrap_or("").to_string(),
                        target: req.path.unwrap_or("/").to_string(),
                        version_minor: req.version.unwrap_or(1) as u8,
                        headers: collect_headers(req.headers),
                    };
                    return Ok((head, len));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(HeadError::Malformed(e)),
            }
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HeadError::TooLarge);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(HeadError::Closed);
        }
    }
}

/// Response-side counterpart of [`read_request_head`].
pub async fn read_response_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<(ResponseHead, usize), HeadError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(buf) {
                Ok(httparse::Status::Complete(len)) => {
                    let status = resp
                        .code
                        .ok_or(HeadError::Malformed(httparse::Error::Status))?;
                    let head = ResponseHead {
                        status,
                        headers: collect_headers(resp.headers),
                    };
                    return Ok((head, len));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(HeadError::Malformed(e)),
            }
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HeadError::TooLarge);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(HeadError::Closed);
        }
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &[u8]) -> (RequestHead, usize, BytesMut) {
        let mut reader = std::io::Cursor::new(raw.to_vec());
        let mut buf = BytesMut::new();
        let (head, len) = read_request_head(&mut reader, &mut buf).await.unwrap();
        (head, len, buf)
    }

    #[tokio::test]
    async fn test_parse_preserves_header_order_and_case() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: abcd.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: k\r\n\r\n";
        let (head, len, _) = parse(raw).await;

        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/chat");
        assert_eq!(head.version_minor, 1);
        assert_eq!(len, raw.len());
        assert_eq!(head.headers[0].0, "Host");
        assert_eq!(head.headers[1].0, "Connection");
        assert_eq!(head.headers[2].0, "Upgrade");
        assert_eq!(head.headers[3].0, "Sec-WebSocket-Key");

        // Reconstruction is byte-identical for a canonical head.
        let mut out = Vec::new();
        head.write_preamble(&mut out);
        assert_eq!(out, raw);
    }

    #[tokio::test]
    async fn test_duplicate_headers_survive() {
        let raw = b"GET / HTTP/1.1\r\nHost: a.example.com\r\nX-Tag: one\r\nX-Tag: two\r\n\r\n";
        let (head, _, _) = parse(raw).await;
        let tags: Vec<_> = head
            .headers
            .iter()
            .filter(|(n, _)| n == "X-Tag")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(tags, ["one", "two"]);
        // `header` returns the first occurrence.
        assert_eq!(head.header("x-tag"), Some("one"));
    }

    #[tokio::test]
    async fn test_leftover_bytes_stay_in_buffer() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a.example.com\r\nContent-Length: 4\r\n\r\nbody";
        let (head, len, buf) = parse(raw).await;
        assert_eq!(head.body_framing(), BodyFraming::Length(4));
        assert_eq!(&buf[len..], b"body");
    }

    #[tokio::test]
    async fn test_hostname_strips_port() {
        let raw = b"GET / HTTP/1.1\r\nHost: ABCD.Example.com:8080\r\n\r\n";
        let (head, _, _) = parse(raw).await;
        assert_eq!(head.hostname().as_deref(), Some("abcd.example.com"));
    }

    #[tokio::test]
    async fn test_hostname_ipv6_literal() {
        let raw = b"GET / HTTP/1.1\r\nHost: [::1]:8080\r\n\r\n";
        let (head, _, _) = parse(raw).await;
        assert_eq!(head.hostname().as_deref(), Some("::1"));
    }

    #[tokio::test]
    async fn test_no_host_header() {
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        let (head, _, _) = parse(raw).await;
        assert!(head.hostname().is_none());
    }

    #[tokio::test]
    async fn test_upgrade_detection() {
        let raw = b"GET / HTTP/1.1\r\nHost: a.example.com\r\nConnection: keep-alive, Upgrade\r\n\r\n";
        let (head, _, _) = parse(raw).await;
        assert!(head.is_upgrade());

        let raw = b"GET / HTTP/1.1\r\nHost: a.example.com\r\nConnection: keep-alive\r\n\r\n";
        let (head, _, _) = parse(raw).await;
        assert!(!head.is_upgrade());
    }

    #[tokio::test]
    async fn test_wants_close() {
        let (head, _, _) = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(head.wants_close());

        let (head, _, _) = parse(b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(!head.wants_close());

        let (head, _, _) = parse(b"GET / HTTP/1.0\r\n\r\n").await;
        assert!(head.wants_close());
    }

    #[tokio::test]
    async fn test_chunked_body_framing() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (head, _, _) = parse(raw).await;
        assert_eq!(head.body_framing(), BodyFraming::Chunked);
    }

    #[tokio::test]
    async fn test_oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'x').take(MAX_HEAD_SIZE));
        let mut reader = std::io::Cursor::new(raw);
        let mut buf = BytesMut::new();
        let err = read_request_head(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, HeadError::TooLarge));
    }

    #[tokio::test]
    async fn test_truncated_head_reports_closed() {
        let mut reader = std::io::Cursor::new(b"GET / HT".to_vec());
        let mut buf = BytesMut::new();
        let err = read_request_head(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, HeadError::Closed));
    }

    #[tokio::test]
    async fn test_response_head_framing() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
        let mut reader = std::io::Cursor::new(raw.to_vec());
        let mut buf = BytesMut::new();
        let (resp, len) = read_response_head(&mut reader, &mut buf).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_framing("GET"), BodyFraming::Length(2));
        assert_eq!(resp.body_framing("HEAD"), BodyFraming::None);
        assert_eq!(&buf[len..], b"OK");
    }

    #[tokio::test]
    async fn test_response_framing_edge_statuses() {
        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        let mut reader = std::io::Cursor::new(raw.to_vec());
        let mut buf = BytesMut::new();
        let (resp, _) = read_response_head(&mut reader, &mut buf).await.unwrap();
        assert_eq!(resp.body_framing("GET"), BodyFraming::None);

        let raw = b"HTTP/1.1 200 OK\r\n\r\n";
        let mut reader = std::io::Cursor::new(raw.to_vec());
        let mut buf = BytesMut::new();
        let (resp, _) = read_response_head(&mut reader, &mut buf).await.unwrap();
        // Neither length nor chunked: body runs to EOF.
        assert_eq!(resp.body_framing("GET"), BodyFraming::Eof);
    }
}
