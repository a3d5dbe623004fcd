//! HTTP session logic: server-side request routing and client response
//! handling, in streaming or full-message mode.

use crate::config::HttpOptions;
use crate::protocols::http::decoder::{HttpDecoder, HttpFullDecoder};
use crate::protocols::http::message::{HttpRequest, HttpResponse};
use crate::protocols::{Decoder, Message};
use crate::runtime::session::{SessionControl, SessionLogic, SessionWriter, WriteCallback};
use std::collections::HashMap;

/// Handles a decoded message on its session's worker thread.
pub type MessageHandler = Box<dyn FnMut(&SessionWriter, &mut Message) -> bool + Send>;

/// Queue `response` for sending, injecting the Server header.
pub fn write_http_response(
    writer: &SessionWriter,
    options: &HttpOptions,
    response: &mut HttpResponse,
    callback: Option<WriteCallback>,
) {
    if !response.headers.contains("Server") {
        response.headers.set("Server", &options.server_name);
    }
    writer.write_message(response, callback);
}

/// Queue `request` for sending, injecting User-Agent and Host.
pub fn write_http_request(
    writer: &SessionWriter,
    options: &HttpOptions,
    request: &mut HttpRequest,
    callback: Option<WriteCallback>,
) {
    if !request.headers.contains("User-Agent") {
        request.headers.set("User-Agent", &options.user_agent);
    }
    if !request.headers.contains("Host") {
        if let Some(host) = writer.channel().remote_host() {
            let value = format!("{}:{}", host, writer.channel().remote_port());
            request.headers.set("Host", &value);
        }
    }
    writer.write_message(request, callback);
}

/// Server-side HTTP logic dispatching requests to registered routes.
///
/// In full mode each route handler sees one assembled `Message::Request`.
/// In streaming mode it sees the head first, then the body as
/// `Message::Content` pieces ending with `is_last`. Requests matching no
/// route get a 404 and the connection is closed once it flushes.
pub struct HttpServerLogic {
    options: HttpOptions,
    full: bool,
    routes: HashMap<String, (String, MessageHandler)>,
    active: Option<String>,
}

impl HttpServerLogic {
    pub fn streaming(options: HttpOptions) -> HttpServerLogic {
        HttpServerLogic {
            options,
            full: false,
            routes: HashMap::new(),
            active: None,
        }
    }

    pub fn full(options: HttpOptions) -> HttpServerLogic {
        HttpServerLogic {
            options,
            full: true,
            routes: HashMap::new(),
            active: None,
        }
    }

    /// Register a handler for `method` on the exact path `path`.
    pub fn route(mut self, method: &str, path: &str, handler: MessageHandler) -> Self {
        self.routes
            .insert(path.to_string(), (method.to_string(), handler));
        self
    }

    fn reject(&self, control: &mut SessionControl<'_>, request: &HttpRequest) -> bool {
        (self.options.session.logger)(
            crate::config::LogLevel::Info,
            &format!(
                "no route for {} {}",
                request.line.method,
                request.line.uri_path()
            ),
        );
        let mut response = HttpResponse::with_body(404, "Not Found", b"");
        let writer = control.writer().clone();
        write_http_response(
            control.writer(),
            &self.options,
            &mut response,
            Some(Box::new(move || writer.kill())),
        );
        true
    }
}

impl SessionLogic for HttpServerLogic {
    fn create_decoder(&mut self) -> Box<dyn Decoder> {
        if self.full {
            Box::new(HttpFullDecoder::request(&self.options))
        } else {
            Box::new(HttpDecoder::request(&self.options))
        }
    }

    fn handle_message(&mut self, control: &mut SessionControl<'_>, message: Message) -> bool {
        match message {
            Message::Request(request) => {
                let path = request.line.uri_path().to_string();
                match self.routes.get_mut(&path) {
                    Some((method, handler))
                        if method.eq_ignore_ascii_case(&request.line.method) =>
                    {
                        if !self.full {
                            self.active = Some(path);
                        }
                        let mut message = Message::Request(request);
                        handler(control.writer(), &mut message)
                    }
                    _ => {
                        self.active = None;
                        self.reject(control, &request)
                    }
                }
            }
            Message::Content(content) => {
                let path = match self.active.clone() {
                    Some(path) => path,
                    None => return true, // body of an unrouted request
                };
                if content.is_last {
                    self.active = None;
                }
                let (_, handler) = match self.routes.get_mut(&path) {
                    Some(route) => route,
                    None => return true,
                };
                let mut message = Message::Content(content);
                handler(control.writer(), &mut message)
            }
            _ => true,
        }
    }
}

/// Client-side HTTP logic feeding decoded responses to one handler.
///
/// Requests are sent by the embedder through the session writer, usually
/// via `write_http_request`.
pub struct HttpClientLogic {
    options: HttpOptions,
    full: bool,
    handler: MessageHandler,
}

impl HttpClientLogic {
    pub fn streaming(options: HttpOptions, handler: MessageHandler) -> HttpClientLogic {
        HttpClientLogic {
            options,
            full: false,
            handler,
        }
    }

    pub fn full(options: HttpOptions, handler: MessageHandler) -> HttpClientLogic {
        HttpClientLogic {
            options,
            full: true,
            handler,
        }
    }
}

impl SessionLogic for HttpClientLogic {
    fn create_decoder(&mut self) -> Box<dyn Decoder> {
        if self.full {
            Box::new(HttpFullDecoder::response(&self.options))
        } else {
            Box::new(HttpDecoder::response(&self.options))
        }
    }

    fn handle_message(&mut self, control: &mut SessionControl<'_>, message: Message) -> bool {
        let mut message = message;
        (self.handler)(control.writer(), &mut message)
    }
}
