use std::collections::HashMap;
use std::io::Cursor;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::urlencoded::{decode_form, decode_query};
use crate::{canonical_header_name, Headers};

const LINE_SEPARATOR: &str = "\r\n";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A parsed request. Built once per connection by [Request::parse] and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    path: String,
    protocol: String,
    headers: Headers,
    body: String,
    content_type: String,
    content_length: u64,
    host: String,
    remote_addr: String,
    ip: String,
    query: HashMap<String, String>,
    form: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Patch,
    Connect,
    Trace,
    Options,
}

impl Method {
    /// Method tokens are matched exactly; `get` is not a method.
    pub fn from_token(token: &str) -> Option<Self> {
        let method = match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "PATCH" => Self::Patch,
            "CONNECT" => Self::Connect,
            "TRACE" => Self::Trace,
            "OPTIONS" => Self::Options,
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Connect => "CONNECT",
            Self::Trace => "TRACE",
            Self::Options => "OPTIONS",
        }
    }

    /// False for GET, HEAD and OPTIONS, whose content headers are not
    /// captured while parsing.
    pub fn has_body(self) -> bool {
        !matches!(self, Self::Get | Self::Head | Self::Options)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

impl Request {
    /// Parses one raw request as read from a connection.
    ///
    /// `remote_addr` is the peer address in `host:port` form; the IP is
    /// everything before the last colon.
    pub fn parse(message: &str, remote_addr: &str) -> Result<Self, ParseError> {
        let lines: Vec<&str> = message.split(LINE_SEPARATOR).collect();

        let request_line: Vec<&str> = lines[0].split(' ').collect();
        let [method, path, protocol] = request_line[..] else {
            return Err(ParseError::RequestLine(lines[0].to_owned()));
        };
        let method = Method::from_token(method)
            .ok_or_else(|| ParseError::UnknownMethod(method.to_owned()))?;
        if !path.starts_with('/') {
            return Err(ParseError::Path(path.to_owned()));
        }
        if !protocol.starts_with("HTTP/") {
            return Err(ParseError::Protocol(protocol.to_owned()));
        }

        let mut headers = Headers::new();
        let mut content_type = String::new();
        let mut content_length = 0;
        let mut body = String::new();
        for (i, line) in lines.iter().enumerate().skip(1) {
            if line.is_empty() {
                body = lines[i + 1..].join(LINE_SEPARATOR);
                break;
            }
            let entry: Vec<&str> = line.split(": ").collect();
            let [name, value] = entry[..] else {
                return Err(ParseError::Header((*line).to_owned()));
            };
            let name = canonical_header_name(name);
            if method.has_body() {
                match name.replace('-', "").as_str() {
                    "ContentType" => content_type = value.to_owned(),
                    "ContentLength" => content_length = value.parse().unwrap_or(0),
                    _ => {}
                }
            }
            headers.set(name, value);
        }

        if content_length == 0 && !body.is_empty() {
            content_length = body.len() as u64;
        }

        let host = headers.get("Host").unwrap_or_default().to_owned();
        let mut req = Self {
            method,
            path: path.to_owned(),
            protocol: protocol.to_owned(),
            headers,
            body,
            content_type,
            content_length,
            host,
            remote_addr: remote_addr.to_owned(),
            ip: ip_of(remote_addr).to_owned(),
            query: HashMap::new(),
            form: HashMap::new(),
        };
        req.query = decode_query(&req.path);
        if req.content_length != 0 && req.content_type.starts_with(FORM_CONTENT_TYPE) {
            req.form = decode_form(&req.body);
        }
        Ok(req)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The raw request target, including any `?query` suffix.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        self.body.as_bytes()
    }

    pub fn body_str(&self) -> &str {
        &self.body
    }

    pub fn body_reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.body())
    }

    /// Empty for GET, HEAD and OPTIONS.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn query_map(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// First value submitted for `key`.
    pub fn form(&self, key: &str) -> Option<&str> {
        self.form_values(key)?.first().map(String::as_str)
    }

    pub fn form_values(&self, key: &str) -> Option<&[String]> {
        self.form.get(key).map(Vec::as_slice)
    }

    pub fn form_map(&self) -> &HashMap<String, Vec<String>> {
        &self.form
    }
}

fn ip_of(remote_addr: &str) -> &str {
    let host = remote_addr
        .rsplit_once(':')
        .map_or(remote_addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    RequestLine(String),
    UnknownMethod(String),
    Path(String),
    Protocol(String),
    Header(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::RequestLine(line) => write!(f, "malformed request line: {:?}", line),
            Self::UnknownMethod(method) => write!(f, "unknown method: {:?}", method),
            Self::Path(path) => write!(f, "malformed path: {:?}", path),
            Self::Protocol(protocol) => write!(f, "malformed protocol: {:?}", protocol),
            Self::Header(line) => write!(f, "malformed header: {:?}", line),
        }
    }
}

impl std::error::Error for ParseError {}

/// Bounds for [read_message].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    pub chunk_size: usize,
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            max_head_bytes: 8 * 1024,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug)]
pub enum ReadError {
    /// The peer closed the connection before sending anything.
    Closed,
    HeadTooLarge(usize),
    BodyTooLarge(usize),
    Io(std::io::Error),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Closed => write!(f, "client disconnected"),
            Self::HeadTooLarge(limit) => write!(f, "header block exceeds {} bytes", limit),
            Self::BodyTooLarge(len) => write!(f, "declared body of {} bytes exceeds limit", len),
            Self::Io(e) => write!(f, "read failed: {}", e),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Reads one request: chunks up to the blank line ending the header block,
/// then exactly `Content-Length` more bytes. Without a `Content-Length` the
/// body is whatever arrived together with the head. Bytes past the end of
/// the request are dropped.
///
/// A peer that closes early yields what was received so far.
pub async fn read_message<R: AsyncRead + Unpin>(
    src: &mut R,
    limits: &ReadLimits,
) -> Result<Vec<u8>, ReadError> {
    let mut buf = Vec::with_capacity(limits.chunk_size);
    let mut chunk = vec![0; limits.chunk_size.max(1)];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > limits.max_head_bytes {
            return Err(ReadError::HeadTooLarge(limits.max_head_bytes));
        }
        let n = src.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(ReadError::Closed);
            }
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let body_start = head_end + 4;
    let expected = match declared_length(&buf[..head_end]) {
        Some(len) if len > limits.max_body_bytes => return Err(ReadError::BodyTooLarge(len)),
        Some(len) => body_start + len,
        None => buf.len(),
    };
    while buf.len() < expected {
        let want = (expected - buf.len()).min(chunk.len());
        let n = src.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf.truncate(expected);
    Ok(buf)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn declared_length(head: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(head)
        .split(LINE_SEPARATOR)
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "192.168.1.20:53412";

    fn parse(raw: &str) -> Result<Request, ParseError> {
        Request::parse(raw, PEER)
    }

    #[test]
    fn request_line_round_trips() {
        let req = parse("DELETE /items/7 HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.method(), Method::Delete);
        assert_eq!(req.path(), "/items/7");
        assert_eq!(req.protocol(), "HTTP/1.0");
    }

    #[test]
    fn request_line_needs_three_tokens() {
        assert!(matches!(parse("GET /\r\n\r\n"), Err(ParseError::RequestLine(_))));
        assert!(matches!(
            parse("GET / HTTP/1.1 extra\r\n\r\n"),
            Err(ParseError::RequestLine(_))
        ));
        assert!(matches!(parse("GET  / HTTP/1.1\r\n\r\n"), Err(ParseError::RequestLine(_))));
        assert!(matches!(parse(""), Err(ParseError::RequestLine(_))));
    }

    #[test]
    fn rejects_unknown_method() {
        assert_eq!(
            parse("FOO /x HTTP/1.1\r\n\r\n"),
            Err(ParseError::UnknownMethod("FOO".into()))
        );
        assert!(matches!(
            parse("get /x HTTP/1.1\r\n\r\n"),
            Err(ParseError::UnknownMethod(_))
        ));
    }

    #[test]
    fn rejects_bad_path_and_protocol() {
        assert_eq!(
            parse("GET x HTTP/1.1\r\n\r\n"),
            Err(ParseError::Path("x".into()))
        );
        assert_eq!(
            parse("GET / SPDY/3\r\n\r\n"),
            Err(ParseError::Protocol("SPDY/3".into()))
        );
    }

    #[test]
    fn rejects_malformed_header() {
        let err = parse("GET / HTTP/1.1\r\nHost:example.com\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::Header("Host:example.com".into()));
        assert!(err.to_string().starts_with("malformed header"));
        assert!(parse("GET / HTTP/1.1\r\nX-Time: 10: 30\r\n\r\n").is_err());
    }

    #[test]
    fn header_names_are_canonical() {
        let req = parse("GET / HTTP/1.1\r\ncontent-type: text/plain\r\nx-request-id: 42\r\n\r\n")
            .unwrap();
        assert_eq!(req.headers().get("Content-Type"), Some("text/plain"));
        assert_eq!(req.headers().get("X-Request-Id"), Some("42"));
        assert!(!req.headers().has("content-type"));
    }

    #[test]
    fn repeated_headers_overwrite() {
        let req = parse("GET / HTTP/1.1\r\nAccept: a\r\naccept: b\r\n\r\n").unwrap();
        assert_eq!(req.headers().len(), 1);
        assert_eq!(req.headers().get("Accept"), Some("b"));
    }

    #[test]
    fn content_headers_ignored_for_no_body_methods() {
        let req = parse(
            "GET / HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 3\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.content_type(), "");
        assert_eq!(req.content_length(), 0);
        assert_eq!(req.headers().get("Content-Length"), Some("3"));
    }

    #[test]
    fn content_headers_captured_for_post() {
        let req = parse(
            "POST /upload HTTP/1.1\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\nhello",
        )
        .unwrap();
        assert_eq!(req.content_type(), "text/plain");
        assert_eq!(req.content_length(), 5);
        assert_eq!(req.body_str(), "hello");
    }

    #[test]
    fn content_length_falls_back_to_body_length() {
        let req = parse("PUT /doc HTTP/1.1\r\nHost: a\r\n\r\nline one\r\nline two").unwrap();
        assert_eq!(req.body_str(), "line one\r\nline two");
        assert_eq!(req.content_length(), 18);
    }

    #[test]
    fn declared_length_wins_over_buffer() {
        let req = parse("POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nabcdef").unwrap();
        assert_eq!(req.content_length(), 2);
        assert_eq!(req.body_str(), "abcdef");
    }

    #[test]
    fn unparsable_content_length_counts_as_absent() {
        let req = parse("POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\nabc").unwrap();
        assert_eq!(req.content_length(), 3);
    }

    #[test]
    fn missing_blank_line_means_no_body() {
        let req = parse("GET / HTTP/1.1\r\nHost: a").unwrap();
        assert_eq!(req.body(), b"");
        assert_eq!(req.content_length(), 0);
    }

    #[test]
    fn body_reader_yields_body() {
        let req = parse("POST / HTTP/1.1\r\n\r\npayload").unwrap();
        let mut out = String::new();
        std::io::Read::read_to_string(&mut req.body_reader(), &mut out).unwrap();
        assert_eq!(out, "payload");
    }

    #[test]
    fn remote_addr_and_ip() {
        let req = parse("GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n").unwrap();
        assert_eq!(req.remote_addr(), PEER);
        assert_eq!(req.ip(), "192.168.1.20");
        assert_eq!(req.host(), "example.com:8080");

        let req = Request::parse("GET / HTTP/1.1\r\n\r\n", "[::1]:4000").unwrap();
        assert_eq!(req.ip(), "::1");
        assert_eq!(req.host(), "");
    }

    #[test]
    fn query_is_decoded() {
        let req = parse("GET /search?q=a%20b&x HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/search?q=a%20b&x");
        assert_eq!(req.query("q"), Some("a b"));
        assert_eq!(req.query("x"), Some(""));
        assert_eq!(req.query("missing"), None);
        assert_eq!(req.query_map().len(), 2);
    }

    #[test]
    fn form_is_decoded() {
        let req = parse(
            "POST /submit HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded; charset=utf-8\r\n\r\na=1&a=2&list[]=9",
        )
        .unwrap();
        assert_eq!(req.form_values("a"), Some(&["1".to_owned(), "2".to_owned()][..]));
        assert_eq!(req.form("a"), Some("1"));
        assert_eq!(req.form_values("list"), Some(&["9".to_owned()][..]));
        assert_eq!(req.form_map().len(), 2);
    }

    #[test]
    fn form_needs_form_content_type() {
        let req = parse("POST / HTTP/1.1\r\nContent-Type: text/plain\r\n\r\na=1").unwrap();
        assert!(req.form_map().is_empty());

        let req = parse("GET / HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\na=1")
            .unwrap();
        assert!(req.form_map().is_empty());
    }

    #[test]
    fn parsing_is_pure() {
        let raw = "POST /p?k=v HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nx=1";
        assert_eq!(parse(raw).unwrap(), parse(raw).unwrap());
    }

    #[test]
    fn method_tokens() {
        for token in ["GET", "POST", "PUT", "DELETE", "HEAD", "PATCH", "CONNECT", "TRACE", "OPTIONS"] {
            let method = Method::from_token(token).unwrap();
            assert_eq!(method.to_string(), token);
        }
        assert!(!Method::Head.has_body());
        assert!(Method::Patch.has_body());
    }

    #[tokio::test]
    async fn read_message_stops_at_head_without_length() {
        let mut src: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let raw = read_message(&mut src, &ReadLimits::default()).await.unwrap();
        assert_eq!(raw, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    }

    #[tokio::test]
    async fn read_message_reads_declared_body_across_chunks() {
        let body = "x".repeat(3000);
        let raw = format!("POST / HTTP/1.1\r\nContent-Length: 3000\r\n\r\n{}trailing", body);
        let mut src = raw.as_bytes();
        let limits = ReadLimits {
            chunk_size: 16,
            ..ReadLimits::default()
        };
        let got = read_message(&mut src, &limits).await.unwrap();
        assert_eq!(got.len(), raw.len() - "trailing".len());
        assert!(got.ends_with(b"xxx"));
    }

    #[tokio::test]
    async fn read_message_reports_closed_peer() {
        let mut src: &[u8] = b"";
        let err = read_message(&mut src, &ReadLimits::default()).await.unwrap_err();
        assert!(matches!(err, ReadError::Closed));
    }

    #[tokio::test]
    async fn read_message_returns_partial_on_eof() {
        let mut src: &[u8] = b"GET / HTTP/1.1\r\nHost";
        let got = read_message(&mut src, &ReadLimits::default()).await.unwrap();
        assert_eq!(got, b"GET / HTTP/1.1\r\nHost");
    }

    #[tokio::test]
    async fn read_message_limits_head_and_body() {
        let limits = ReadLimits {
            chunk_size: 8,
            max_head_bytes: 32,
            max_body_bytes: 4,
        };
        let big_head = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "p".repeat(64));
        let mut src = big_head.as_bytes();
        assert!(matches!(
            read_message(&mut src, &limits).await,
            Err(ReadError::HeadTooLarge(32))
        ));

        let mut src: &[u8] = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789";
        assert!(matches!(
            read_message(&mut src, &limits).await,
            Err(ReadError::BodyTooLarge(10))
        ));
    }
}
