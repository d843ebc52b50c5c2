//! Minimal HTTP/1.0 support: request parsing for the accept path, response
//! parsing for the relay path, and response serialization.
//!
//! Requests and responses are `Connection: close`; there is no chunked
//! transfer, no keep-alive, and bodies only matter for ingest streams,
//! where the bytes following the header block are the stream itself.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Cap on a request or relay response head, in bytes.
pub const MAX_HEAD_SIZE: usize = 4096;

const MAX_HEADERS: usize = 64;

/// An unparsable or oversized HTTP head.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("invalid HTTP head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("HTTP head larger than {MAX_HEAD_SIZE} bytes")]
    Oversized,
    #[error("missing {0} in HTTP head")]
    Missing(&'static str),
}

/// Request methods the server reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    /// Shoutcast's ingest verb.
    Source,
    /// Anything else; always answered with 405.
    Other,
}

impl Method {
    fn from_token(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "PUT" => Method::Put,
            "POST" => Method::Post,
            "SOURCE" => Method::Source,
            _ => Method::Other,
        }
    }

    /// Whether this verb creates a source.
    pub fn is_ingest(self) -> bool {
        matches!(self, Method::Put | Method::Post | Method::Source)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Source => "SOURCE",
            Method::Other => "?",
        };
        f.write_str(s)
    }
}

/// A parsed request head plus whatever followed it in the read buffer.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: u8,
    headers: Vec<(String, Vec<u8>)>,
    /// Bytes past the header block. For ingest requests this is the start
    /// of the stream.
    pub body: Bytes,
}

impl Request {
    /// Parses a request head from `buf`. Returns `None` while the head is
    /// still incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Request>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let consumed = match req.parse(buf)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Ok(None),
        };

        let method = Method::from_token(req.method.ok_or(HttpError::Missing("method"))?);
        let path = req.path.ok_or(HttpError::Missing("path"))?.to_owned();
        let version = req.version.ok_or(HttpError::Missing("version"))?;
        let headers = req
            .headers
            .iter()
            .map(|h| (h.name.to_owned(), h.value.to_vec()))
            .collect();

        Ok(Some(Request {
            method,
            path,
            version,
            headers,
            body: Bytes::copy_from_slice(&buf[consumed..]),
        }))
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Header lookup as UTF-8, for headers that are text by contract.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// A parsed relay response head plus the leading stream bytes.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl ResponseHead {
    /// Parses a response head from `buf`. Returns `None` while incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<ResponseHead>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);

        let consumed = match resp.parse(buf)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Ok(None),
        };

        let status = resp.code.ok_or(HttpError::Missing("status code"))?;
        let reason = resp.reason.unwrap_or_default().to_owned();
        let headers = resp
            .headers
            .iter()
            .map(|h| (h.name.to_owned(), h.value.to_vec()))
            .collect();

        Ok(Some(ResponseHead {
            status,
            reason,
            headers,
            body: Bytes::copy_from_slice(&buf[consumed..]),
        }))
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// A response under construction.
///
/// Serialization appends `Connection: close`, and `Content-Length` unless
/// the response is an unbounded stream.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    streaming: bool,
}

impl Response {
    pub fn new(status: u16, reason: &str) -> Response {
        Response {
            status,
            reason: reason.to_owned(),
            headers: Vec::new(),
            body: Bytes::new(),
            streaming: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Response {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Response {
        self.body = body.into();
        self
    }

    /// Marks the response as an unbounded stream: no `Content-Length`.
    pub fn streaming(mut self) -> Response {
        self.streaming = true;
        self
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("HTTP/1.0 {} {}\r\n", self.status, self.reason).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n");
        if !self.streaming {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        Bytes::from(out)
    }
}

/// Collapses any run of consecutive `/` in a path into one.
pub fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_a_get() {
        let raw = b"GET /stream HTTP/1.0\r\nHost: example\r\nIcy-Metadata: 1\r\n\r\n";
        let req = Request::parse(raw).unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/stream");
        assert_eq!(req.version, 0);
        assert_eq!(req.header("icy-metadata"), Some(&b"1"[..]));
        assert!(req.body.is_empty());
    }

    #[test]
    fn parses_source_with_leading_body() {
        let raw = b"SOURCE /live HTTP/1.0\r\nContent-Type: audio/mpeg\r\n\r\n\xff\xfb";
        let req = Request::parse(raw).unwrap().unwrap();
        assert_eq!(req.method, Method::Source);
        assert!(req.method.is_ingest());
        assert_eq!(req.header_str("content-type"), Some("audio/mpeg"));
        assert_eq!(req.body.as_ref(), b"\xff\xfb");
    }

    #[test]
    fn partial_head_is_not_an_error() {
        assert_matches!(Request::parse(b"GET /stream HT"), Ok(None));
    }

    #[test]
    fn garbage_is_an_error() {
        assert_matches!(Request::parse(b"\x00\x01\x02\r\n\r\n"), Err(HttpError::Parse(_)));
    }

    #[test]
    fn parses_a_response_head() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: video/MP2T\r\n\r\nGGGG";
        let head = ResponseHead::parse(raw).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.header_str("content-type"), Some("video/MP2T"));
        assert_eq!(head.body.as_ref(), b"GGGG");
    }

    #[test]
    fn response_serialization() {
        let resp = Response::new(404, "Stream Not Found")
            .with_header("Content-Type", "text/plain")
            .with_body(&b"nope"[..]);
        let bytes = resp.to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.0 404 Stream Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nnope"));
    }

    #[test]
    fn streaming_response_has_no_length() {
        let resp = Response::new(200, "OK")
            .with_header("Content-Type", "video/x-flv")
            .streaming();
        let text = resp.to_bytes();
        let text = std::str::from_utf8(&text).unwrap();
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn slash_collapsing() {
        assert_eq!(collapse_slashes("//stream///a"), "/stream/a");
        assert_eq!(collapse_slashes("/stream"), "/stream");
    }
}
