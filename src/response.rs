use std::time::{SystemTime, UNIX_EPOCH};

use crate::request::Request;
use crate::{canonical_header_name, Headers};

const CONTENT_TYPE: &str = "Content-Type";
const CONTENT_LENGTH: &str = "Content-Length";
const DEFAULT_HTML_TYPE: &str = "text/html;charset=utf-8";

/// Response to a single [Request]. The handler fills in headers and calls
/// one of the `html`/`json`/`file` methods; the connection task writes the
/// produced bytes once the handler returns.
#[derive(Debug)]
pub struct Response<'a> {
    request: &'a Request,
    headers: Headers,
    status: Option<u16>,
    output: Vec<u8>,
}

impl<'a> Response<'a> {
    pub fn new(request: &'a Request) -> Self {
        Self {
            request,
            headers: Headers::new(),
            status: None,
            output: Vec::new(),
        }
    }

    pub fn request(&self) -> &'a Request {
        self.request
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) -> &mut Self {
        self.headers.set(name, value);
        self
    }

    /// Serializes an HTML response. `Content-Type` defaults to
    /// `text/html;charset=utf-8` and `Content-Length` is always replaced by
    /// the byte length of `html`.
    pub fn html(&mut self, status: u16, html: &str) {
        let status_line = format!("{} {} {}", self.request.protocol(), status, reason_phrase(status));
        self.normalize_headers();
        if !self.headers.has(CONTENT_TYPE) {
            self.headers.set(CONTENT_TYPE, DEFAULT_HTML_TYPE);
        }
        self.headers.set(CONTENT_LENGTH, html.len().to_string());

        let mut lines = vec![status_line];
        lines.extend(self.headers.iter().map(|(n, v)| format!("{}: {}", n, v)));
        lines.push(String::new());
        lines.push(html.to_owned());

        self.output.extend_from_slice(lines.join("\r\n").as_bytes());
        self.status = Some(status);
    }

    /// Not implemented: nothing is written and the client sees the
    /// connection close without a response.
    pub fn json(&mut self, _status: u16, _body: &str) {}

    /// Not implemented: nothing is written and the client sees the
    /// connection close without a response.
    pub fn file(&mut self, _path: &str) {}

    /// Status of the last serialized response, if any.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Bytes waiting to be written to the connection.
    pub fn as_bytes(&self) -> &[u8] {
        &self.output
    }

    pub(crate) fn into_output(self) -> (Option<u16>, Vec<u8>) {
        (self.status, self.output)
    }

    /// Renames keys to their canonical form. A key whose canonical form is
    /// already present is left alone, so both are sent.
    fn normalize_headers(&mut self) {
        let renames: Vec<String> = self
            .headers
            .iter()
            .map(|(name, _)| name)
            .filter(|name| canonical_header_name(name) != *name)
            .map(str::to_owned)
            .collect();
        for name in renames {
            let canonical = canonical_header_name(&name);
            if self.headers.has(&canonical) {
                continue;
            }
            if let Some(value) = self.headers.delete(&name) {
                self.headers.set(canonical, value);
            }
        }
    }
}

/// One line in common log format, e.g.
/// `10.0.0.1 - - [2024-05-01T12:00:00Z] "GET /index HTTP/1.1" 200 -`.
pub fn access_log_line(request: &Request, status: u16, at: SystemTime) -> String {
    format!(
        "{} - - [{}] \"{} {} {}\" {} -",
        request.ip(),
        rfc3339(at),
        request.method(),
        request.path(),
        request.protocol(),
        status
    )
}

/// UTC timestamp with second precision.
fn rfc3339(at: SystemTime) -> String {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        rem / 3600,
        rem % 3600 / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// Standard reason text for `code`, or an empty string for unregistered codes.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",

        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",

        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",

        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        421 => "Misdirected Request",
        422 => "Unprocessable Entity",
        423 => "Locked",
        424 => "Failed Dependency",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",

        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",

        _ => "",
    }
}
