//! HTTP/1.1 message model and wire encoding.

use crate::buffer::ByteBuf;
use crate::protocols::Encode;
use std::collections::BTreeMap;

pub const HTTP_1_1: &str = "HTTP/1.1";
pub const HTTP_1_0: &str = "HTTP/1.0";

/// Request line: method, URI and version.
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: String,
    pub uri: String,
    pub version: String,
}

impl RequestLine {
    pub fn new(method: &str, uri: &str) -> RequestLine {
        RequestLine {
            method: method.to_string(),
            uri: uri.to_string(),
            version: HTTP_1_1.to_string(),
        }
    }

    /// Parse `METHOD URI VERSION`. The URI may not contain spaces.
    pub fn parse(line: &str) -> Option<RequestLine> {
        let mut fields = line.split_whitespace();
        let method = fields.next()?;
        let uri = fields.next()?;
        let version = fields.next()?;
        if fields.next().is_some() {
            return None;
        }
        if !version.eq_ignore_ascii_case(HTTP_1_1) && !version.eq_ignore_ascii_case(HTTP_1_0) {
            return None;
        }
        Some(RequestLine {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
        })
    }

    /// URI without the query string.
    pub fn uri_path(&self) -> &str {
        match self.uri.find('?') {
            Some(at) => &self.uri[..at],
            None => &self.uri,
        }
    }

    /// Value of a query-string parameter, if present.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        let query = &self.uri[self.uri.find('?')? + 1..];
        for pair in query.split('&') {
            let (key, value) = match pair.find('=') {
                Some(at) => (&pair[..at], &pair[at + 1..]),
                None => (pair, ""),
            };
            if key == name {
                return Some(value);
            }
        }
        None
    }
}

impl Encode for RequestLine {
    fn encode(&self, buf: &ByteBuf) {
        buf.write_bytes(format!("{} {} {}\r\n", self.method, self.uri, self.version).as_bytes());
    }
}

/// Status line: version, code and reason phrase.
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: String,
}

impl StatusLine {
    pub fn new(code: u16, reason: &str) -> StatusLine {
        StatusLine {
            version: HTTP_1_1.to_string(),
            code,
            reason: reason.to_string(),
        }
    }

    /// Parse `VERSION CODE REASON`; the reason phrase may contain spaces.
    pub fn parse(line: &str) -> Option<StatusLine> {
        let mut fields = line.splitn(3, ' ');
        let version = fields.next()?;
        let code = fields.next()?.parse::<u16>().ok()?;
        let reason = fields.next().unwrap_or("").trim();
        if !version.eq_ignore_ascii_case(HTTP_1_1) && !version.eq_ignore_ascii_case(HTTP_1_0) {
            return None;
        }
        Some(StatusLine {
            version: version.to_string(),
            code,
            reason: reason.to_string(),
        })
    }
}

impl Encode for StatusLine {
    fn encode(&self, buf: &ByteBuf) {
        buf.write_bytes(format!("{} {} {}\r\n", self.version, self.code, self.reason).as_bytes());
    }
}

/// Case-insensitive header map preserving the original header-name casing.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    // uppercased name -> (original name, value)
    map: BTreeMap<String, (String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.map.insert(
            name.to_ascii_uppercase(),
            (name.to_string(), value.to_string()),
        );
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map
            .get(&name.to_ascii_uppercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(&name.to_ascii_uppercase())
    }

    pub fn remove(&mut self, name: &str) {
        self.map.remove(&name.to_ascii_uppercase());
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Iterate `(original name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Parse one `Name: value` line.
    pub fn parse_line(line: &str) -> Option<(&str, &str)> {
        let at = line.find(':')?;
        let name = line[..at].trim();
        let value = line[at + 1..].trim();
        if name.is_empty() {
            return None;
        }
        Some((name, value))
    }

    /// Transfer-Encoding is exactly "chunked".
    pub fn is_chunked(&self) -> bool {
        self.get("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// Parsed Content-Length, or `None` when absent or malformed.
    pub fn content_length(&self) -> Option<Result<usize, ()>> {
        self.get("Content-Length")
            .map(|v| v.trim().parse::<usize>().map_err(|_| ()))
    }
}

impl Encode for Headers {
    fn encode(&self, buf: &ByteBuf) {
        for (name, value) in self.iter() {
            buf.write_bytes(format!("{}: {}\r\n", name, value).as_bytes());
        }
        buf.write_bytes(b"\r\n");
    }
}

/// One piece of message body.
///
/// Streaming decoders deliver a sequence of these per message; `is_last`
/// marks the final piece. Trailing headers ride on the last piece of a
/// chunked body.
pub struct HttpContent {
    pub data: ByteBuf,
    pub is_last: bool,
    pub is_chunked: bool,
    pub trailing: Headers,
}

impl HttpContent {
    /// Empty, not final.
    pub fn new() -> HttpContent {
        HttpContent {
            data: ByteBuf::new(),
            is_last: false,
            is_chunked: false,
            trailing: Headers::new(),
        }
    }

    /// A complete body in one piece.
    pub fn from_slice(bytes: &[u8]) -> HttpContent {
        let content = HttpContent {
            data: ByteBuf::new(),
            is_last: true,
            is_chunked: false,
            trailing: Headers::new(),
        };
        content.data.write_bytes(bytes);
        content
    }

    pub fn len(&self) -> usize {
        self.data.readable_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode with explicit framing, consuming the data.
    ///
    /// Chunked framing writes a sized chunk per non-empty piece and, on the
    /// last piece, the terminal chunk plus trailers. Plain framing writes
    /// the raw bytes.
    pub fn encode_framed(&self, buf: &ByteBuf, chunked: bool) {
        if chunked {
            let length = self.data.readable_bytes();
            if length > 0 {
                buf.write_bytes(format!("{:X}\r\n", length).as_bytes());
                buf.write_from(&self.data, None);
                buf.write_bytes(b"\r\n");
            }
            if self.is_last {
                buf.write_bytes(b"0\r\n");
                self.trailing.encode(buf);
            }
        } else {
            buf.write_from(&self.data, None);
        }
    }
}

impl Default for HttpContent {
    fn default() -> Self {
        Self::new()
    }
}

impl Encode for HttpContent {
    fn encode(&self, buf: &ByteBuf) {
        self.encode_framed(buf, self.is_chunked);
    }
}

/// An HTTP request; `content` present makes it a full message.
pub struct HttpRequest {
    pub line: RequestLine,
    pub headers: Headers,
    pub content: Option<HttpContent>,
}

impl HttpRequest {
    /// Head-only request (streaming style).
    pub fn new(method: &str, uri: &str) -> HttpRequest {
        HttpRequest {
            line: RequestLine::new(method, uri),
            headers: Headers::new(),
            content: None,
        }
    }

    /// Request with an attached (initially empty) body.
    pub fn full(method: &str, uri: &str) -> HttpRequest {
        HttpRequest {
            content: Some(HttpContent {
                is_last: true,
                ..HttpContent::new()
            }),
            ..HttpRequest::new(method, uri)
        }
    }
}

impl Encode for HttpRequest {
    fn encode(&self, buf: &ByteBuf) {
        self.line.encode(buf);
        self.headers.encode(buf);
        if let Some(content) = &self.content {
            content.encode_framed(buf, self.headers.is_chunked());
        }
    }
}

/// An HTTP response; `content` present makes it a full message.
pub struct HttpResponse {
    pub status: StatusLine,
    pub headers: Headers,
    pub content: Option<HttpContent>,
}

impl HttpResponse {
    pub fn new(code: u16, reason: &str) -> HttpResponse {
        HttpResponse {
            status: StatusLine::new(code, reason),
            headers: Headers::new(),
            content: None,
        }
    }

    pub fn full(code: u16, reason: &str) -> HttpResponse {
        HttpResponse {
            content: Some(HttpContent {
                is_last: true,
                ..HttpContent::new()
            }),
            ..HttpResponse::new(code, reason)
        }
    }

    /// Full response carrying `body`, with Content-Length set.
    pub fn with_body(code: u16, reason: &str, body: &[u8]) -> HttpResponse {
        let mut response = HttpResponse::full(code, reason);
        response
            .headers
            .set("Content-Length", &body.len().to_string());
        if let Some(content) = &response.content {
            content.data.write_bytes(body);
        }
        response
    }
}

impl Encode for HttpResponse {
    fn encode(&self, buf: &ByteBuf) {
        self.status.encode(buf);
        self.headers.encode(buf);
        if let Some(content) = &self.content {
            content.encode_framed(buf, self.headers.is_chunked());
        }
    }
}
