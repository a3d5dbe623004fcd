//! Incremental HTTP/1.1 decoder.
//!
//! The streaming decoder delivers the head (request or response) as soon
//! as the header block completes, then the body as a sequence of content
//! pieces with `is_last` on the final one. Fixed-length, chunked (with
//! trailers) and variable-length bodies are supported; a variable-length
//! response body only finalizes when the transport closes.
//!
//! `HttpFullDecoder` wraps the streaming decoder and delivers one fully
//! assembled message instead.

use crate::buffer::ByteBuf;
use crate::config::HttpOptions;
use crate::error::SessionError;
use crate::protocols::http::message::{
    Headers, HttpContent, HttpRequest, HttpResponse, RequestLine, StatusLine,
};
use crate::protocols::{Decoder, Message, MessageSink};

const CRLF: &str = "\r\n";

/// Which side of the exchange is being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpDirection {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Header,
    ChunkSize,
    ChunkedContent,
    ChunkDelimiter,
    ChunkFooter,
    FixedContent,
    VariableContent,
}

enum Head {
    Request(RequestLine),
    Response(StatusLine),
}

/// Streaming HTTP decoder for one direction.
pub struct HttpDecoder {
    direction: HttpDirection,
    max_first_line: usize,
    max_header: usize,
    max_content: Option<usize>,
    state: State,
    head: Option<Head>,
    headers: Headers,
    trailing: Headers,
    remaining: usize,
    content_total: usize,
    // bytes consumed so far by the current header or trailer block
    header_total: usize,
}

impl HttpDecoder {
    pub fn new(direction: HttpDirection, options: &HttpOptions) -> HttpDecoder {
        HttpDecoder {
            direction,
            max_first_line: options.max_first_line_size,
            max_header: options.max_header_size,
            max_content: options.max_content_size,
            state: State::Initial,
            head: None,
            headers: Headers::new(),
            trailing: Headers::new(),
            remaining: 0,
            content_total: 0,
            header_total: 0,
        }
    }

    pub fn request(options: &HttpOptions) -> HttpDecoder {
        Self::new(HttpDirection::Request, options)
    }

    pub fn response(options: &HttpOptions) -> HttpDecoder {
        Self::new(HttpDirection::Response, options)
    }

    /// Pull one line, enforcing `limit` both on the completed line and on
    /// unterminated data. `Ok(None)` means more bytes are needed.
    fn get_limited_line(
        buf: &ByteBuf,
        limit: usize,
        what: &str,
    ) -> Result<Option<String>, SessionError> {
        match buf.get_line(CRLF) {
            Some(line) => {
                if line.len() + CRLF.len() > limit {
                    return Err(SessionError::HttpMessage(format!("{} too long", what)));
                }
                Ok(Some(line))
            }
            None => {
                if buf.readable_bytes() >= limit {
                    return Err(SessionError::HttpMessage(format!("{} too long", what)));
                }
                Ok(None)
            }
        }
    }

    fn take_head(&mut self) -> Option<Message> {
        let headers = std::mem::take(&mut self.headers);
        match self.head.take()? {
            Head::Request(line) => Some(Message::Request(HttpRequest {
                line,
                headers,
                content: None,
            })),
            Head::Response(status) => Some(Message::Response(HttpResponse {
                status,
                headers,
                content: None,
            })),
        }
    }

    /// Body length decided by the header block. `None` means read until
    /// the transport closes (variable length).
    fn body_length(&self) -> Result<Option<usize>, SessionError> {
        match self.headers.content_length() {
            Some(Ok(length)) => Ok(Some(length)),
            Some(Err(())) => Err(SessionError::HttpMessage(
                "invalid Content-Length".to_string(),
            )),
            None => match self.direction {
                HttpDirection::Request => Ok(Some(0)),
                HttpDirection::Response => {
                    let close = self
                        .headers
                        .get("Connection")
                        .map(|v| v.eq_ignore_ascii_case("close"))
                        .unwrap_or(false);
                    if close {
                        Ok(None)
                    } else {
                        Ok(Some(0))
                    }
                }
            },
        }
    }

    fn check_content_limit(&self, total: usize) -> Result<(), SessionError> {
        if let Some(max) = self.max_content {
            if total > max {
                return Err(SessionError::HttpMessage(format!(
                    "content exceeds {} byte limit",
                    max
                )));
            }
        }
        Ok(())
    }

    /// Emit a body piece of up to `remaining` bytes from `buf`.
    fn emit_content(
        buf: &ByteBuf,
        sink: &mut MessageSink<'_>,
        take: usize,
        is_last: bool,
        is_chunked: bool,
    ) -> bool {
        let content = HttpContent {
            is_last,
            is_chunked,
            ..HttpContent::new()
        };
        content.data.write_from(buf, Some(take));
        sink(Message::Content(content))
    }
}

impl Decoder for HttpDecoder {
    fn reset(&mut self) {
        self.state = State::Initial;
        self.head = None;
        self.headers.clear();
        self.trailing.clear();
        self.remaining = 0;
        self.content_total = 0;
        self.header_total = 0;
    }

    fn decode(
        &mut self,
        buf: &ByteBuf,
        sink: &mut MessageSink<'_>,
        peer_closed: bool,
    ) -> Result<bool, SessionError> {
        if self.state == State::Initial {
            self.reset();
            let line =
                match Self::get_limited_line(buf, self.max_first_line, "http first line")? {
                    Some(line) => line,
                    None => return Ok(true),
                };
            self.head = Some(match self.direction {
                HttpDirection::Request => Head::Request(RequestLine::parse(&line).ok_or_else(
                    || SessionError::HttpMessage(format!("bad request line: {}", line)),
                )?),
                HttpDirection::Response => Head::Response(StatusLine::parse(&line).ok_or_else(
                    || SessionError::HttpMessage(format!("bad status line: {}", line)),
                )?),
            });
            self.state = State::Header;
            // fall through into header parsing
        }

        match self.state {
            State::Initial => Ok(true),

            State::Header => {
                loop {
                    // the limit applies to the whole header block, not per
                    // line; each line shrinks the remaining budget
                    let budget = self.max_header.saturating_sub(self.header_total);
                    let line = match Self::get_limited_line(buf, budget, "http header")? {
                        Some(line) => line,
                        None => return Ok(true),
                    };
                    if line.is_empty() {
                        break;
                    }
                    self.header_total += line.len() + CRLF.len();
                    let (name, value) = Headers::parse_line(&line).ok_or_else(|| {
                        SessionError::HttpMessage(format!("bad header line: {}", line))
                    })?;
                    self.headers.set(name, value);
                }

                // header block complete: decide body framing, then hand the
                // head to the handler
                let chunked = self.headers.is_chunked();
                let length = if chunked { Some(0) } else { self.body_length()? };
                if let Some(length) = length {
                    self.check_content_limit(length)?;
                }

                if let Some(head) = self.take_head() {
                    if !sink(head) {
                        return Ok(false);
                    }
                }

                if chunked {
                    self.state = State::ChunkSize;
                } else {
                    match length {
                        Some(0) => {
                            self.state = State::Initial;
                            if !Self::emit_content(buf, sink, 0, true, false) {
                                return Ok(false);
                            }
                        }
                        Some(length) => {
                            self.remaining = length;
                            self.state = State::FixedContent;
                        }
                        None => {
                            self.state = State::VariableContent;
                        }
                    }
                }
                Ok(true)
            }

            State::FixedContent => {
                let take = buf.readable_bytes().min(self.remaining);
                if take == 0 {
                    return Ok(true);
                }
                self.remaining -= take;
                let is_last = self.remaining == 0;
                if is_last {
                    self.state = State::Initial;
                }
                if !Self::emit_content(buf, sink, take, is_last, false) {
                    return Ok(false);
                }
                Ok(true)
            }

            State::VariableContent => {
                let take = buf.readable_bytes();
                if take == 0 && !peer_closed {
                    return Ok(true);
                }
                self.content_total += take;
                self.check_content_limit(self.content_total)?;
                if peer_closed {
                    self.state = State::Initial;
                }
                if !Self::emit_content(buf, sink, take, peer_closed, false) {
                    return Ok(false);
                }
                Ok(true)
            }

            State::ChunkSize => {
                let line = match Self::get_limited_line(buf, self.max_first_line, "chunk size")? {
                    Some(line) => line,
                    None => return Ok(true),
                };
                let digits = line.split(';').next().unwrap_or("").trim();
                let size = usize::from_str_radix(digits, 16).map_err(|_| {
                    SessionError::HttpMessage(format!("bad chunk size: {}", line))
                })?;
                if size == 0 {
                    self.header_total = 0;
                    self.state = State::ChunkFooter;
                } else {
                    self.content_total += size;
                    self.check_content_limit(self.content_total)?;
                    self.remaining = size;
                    self.state = State::ChunkedContent;
                }
                Ok(true)
            }

            State::ChunkedContent => {
                let take = buf.readable_bytes().min(self.remaining);
                if take == 0 {
                    return Ok(true);
                }
                self.remaining -= take;
                if self.remaining == 0 {
                    self.state = State::ChunkDelimiter;
                }
                if !Self::emit_content(buf, sink, take, false, true) {
                    return Ok(false);
                }
                Ok(true)
            }

            State::ChunkDelimiter => {
                let line = match Self::get_limited_line(buf, self.max_first_line, "chunk delimiter")?
                {
                    Some(line) => line,
                    None => return Ok(true),
                };
                if !line.is_empty() {
                    return Err(SessionError::HttpMessage(
                        "missing chunk delimiter".to_string(),
                    ));
                }
                self.state = State::ChunkSize;
                Ok(true)
            }

            State::ChunkFooter => {
                loop {
                    let budget = self.max_header.saturating_sub(self.header_total);
                    let line = match Self::get_limited_line(buf, budget, "http trailer")? {
                        Some(line) => line,
                        None => return Ok(true),
                    };
                    if line.is_empty() {
                        break;
                    }
                    self.header_total += line.len() + CRLF.len();
                    let (name, value) = Headers::parse_line(&line).ok_or_else(|| {
                        SessionError::HttpMessage(format!("bad trailer line: {}", line))
                    })?;
                    self.trailing.set(name, value);
                }
                let content = HttpContent {
                    is_last: true,
                    is_chunked: true,
                    trailing: std::mem::take(&mut self.trailing),
                    ..HttpContent::new()
                };
                self.state = State::Initial;
                if !sink(Message::Content(content)) {
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }
}

/// Buffers the streaming decoder's output and delivers whole messages.
pub struct HttpFullDecoder {
    inner: HttpDecoder,
    assembled: Option<Message>,
}

impl HttpFullDecoder {
    pub fn new(direction: HttpDirection, options: &HttpOptions) -> HttpFullDecoder {
        HttpFullDecoder {
            inner: HttpDecoder::new(direction, options),
            assembled: None,
        }
    }

    pub fn request(options: &HttpOptions) -> HttpFullDecoder {
        Self::new(HttpDirection::Request, options)
    }

    pub fn response(options: &HttpOptions) -> HttpFullDecoder {
        Self::new(HttpDirection::Response, options)
    }
}

impl Decoder for HttpFullDecoder {
    fn reset(&mut self) {
        self.inner.reset();
        self.assembled = None;
    }

    fn decode(
        &mut self,
        buf: &ByteBuf,
        sink: &mut MessageSink<'_>,
        peer_closed: bool,
    ) -> Result<bool, SessionError> {
        let assembled = &mut self.assembled;
        self.inner.decode(
            buf,
            &mut |message: Message| match message {
                Message::Request(_) | Message::Response(_) => {
                    *assembled = Some(message);
                    true
                }
                Message::Content(piece) => {
                    let slot = match assembled.as_mut() {
                        Some(Message::Request(request)) => &mut request.content,
                        Some(Message::Response(response)) => &mut response.content,
                        _ => return true,
                    };
                    let body = slot.get_or_insert_with(HttpContent::new);
                    body.data.write_from(&piece.data, None);
                    for (name, value) in piece.trailing.iter() {
                        body.trailing.set(name, value);
                    }
                    if piece.is_last {
                        body.is_last = true;
                        if let Some(message) = assembled.take() {
                            return sink(message);
                        }
                    }
                    true
                }
                other => sink(other),
            },
            peer_closed,
        )
    }
}
