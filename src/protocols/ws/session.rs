//! WebSocket session logic: HTTP upgrade handshakes on both sides, then
//! frame dispatch with automatic ping and close replies.

use crate::config::{LogLevel, WsOptions};
use crate::protocols::http::decoder::HttpFullDecoder;
use crate::protocols::http::message::{Headers, HttpRequest, HttpResponse};
use crate::protocols::http::session::{write_http_request, write_http_response};
use crate::protocols::ws::decoder::{WsFrameDecoder, WsFullFrameDecoder};
use crate::protocols::ws::frame::{Opcode, WsFrame};
use crate::protocols::ws::{accept_key, handshake_key};
use crate::protocols::{Decoder, Message};
use crate::runtime::session::{SessionControl, SessionLogic, SessionWriter, WriteCallback};
use std::collections::HashMap;

/// Handles one WebSocket frame on the session's worker thread.
pub type FrameHandler = Box<dyn FnMut(&SessionWriter, WsFrame) -> bool + Send>;

/// Queue a frame for sending. Servers send unmasked, clients masked.
pub fn write_ws_frame(
    writer: &SessionWriter,
    frame: WsFrame,
    masked: bool,
    callback: Option<WriteCallback>,
) {
    let frame = WsFrame { masked, ..frame };
    writer.write_message(&frame, callback);
}

fn connection_has_upgrade(value: &str) -> bool {
    value
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Server-side logic: accepts upgrade requests on registered paths, then
/// routes frames to the path's handler.
///
/// Pings are answered with pongs and a peer close is mirrored before
/// teardown; those frames never reach the handler.
pub struct WsServerLogic {
    options: WsOptions,
    full: bool,
    routes: HashMap<String, FrameHandler>,
    active: Option<String>,
}

impl WsServerLogic {
    /// Handlers see each frame as it arrives, fragments included.
    pub fn streaming(options: WsOptions) -> WsServerLogic {
        WsServerLogic {
            options,
            full: false,
            routes: HashMap::new(),
            active: None,
        }
    }

    /// Handlers see whole messages, fragments reassembled.
    pub fn full(options: WsOptions) -> WsServerLogic {
        WsServerLogic {
            options,
            full: true,
            routes: HashMap::new(),
            active: None,
        }
    }

    pub fn route(mut self, path: &str, handler: FrameHandler) -> Self {
        self.routes.insert(path.to_string(), handler);
        self
    }

    fn frame_decoder(&self, expect_masked: bool) -> Box<dyn Decoder> {
        if self.full {
            Box::new(WsFullFrameDecoder::new(&self.options, expect_masked))
        } else {
            Box::new(WsFrameDecoder::new(&self.options, expect_masked))
        }
    }

    fn reject(&self, control: &mut SessionControl<'_>, code: u16, reason: &str) -> bool {
        (self.options.http.session.logger)(
            LogLevel::Info,
            &format!("rejecting websocket handshake: {} {}", code, reason),
        );
        let mut response = HttpResponse::with_body(code, reason, b"");
        let writer = control.writer().clone();
        write_http_response(
            control.writer(),
            &self.options.http,
            &mut response,
            Some(Box::new(move || writer.kill())),
        );
        true
    }

    fn upgrade(&mut self, control: &mut SessionControl<'_>, request: &HttpRequest) -> bool {
        if !request.line.method.eq_ignore_ascii_case("GET") {
            return self.reject(control, 403, "Forbidden");
        }
        let path = request.line.uri_path().to_string();
        if !self.routes.contains_key(&path) {
            return self.reject(control, 404, "Not Found");
        }

        let connection_ok = request
            .headers
            .get("Connection")
            .map(connection_has_upgrade)
            .unwrap_or(false);
        let upgrade_ok = request
            .headers
            .get("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let key = match request.headers.get("Sec-WebSocket-Key") {
            Some(key) if connection_ok && upgrade_ok => key,
            _ => return self.reject(control, 400, "Bad Request"),
        };

        let mut response = HttpResponse::new(101, "Switching Protocols");
        response.headers.set("Upgrade", "websocket");
        response.headers.set("Connection", "Upgrade");
        response
            .headers
            .set("Sec-WebSocket-Accept", &accept_key(key));
        write_http_response(control.writer(), &self.options.http, &mut response, None);

        self.active = Some(path);
        control.swap_decoder(self.frame_decoder(true));
        true
    }
}

impl SessionLogic for WsServerLogic {
    fn create_decoder(&mut self) -> Box<dyn Decoder> {
        Box::new(HttpFullDecoder::request(&self.options.http))
    }

    fn handle_message(&mut self, control: &mut SessionControl<'_>, message: Message) -> bool {
        match message {
            Message::Request(request) => self.upgrade(control, &request),
            Message::Frame(frame) => match frame.opcode {
                Opcode::Ping => {
                    let pong = WsFrame::pong(&frame.payload.to_vec());
                    write_ws_frame(control.writer(), pong, false, None);
                    true
                }
                Opcode::Close => {
                    let writer = control.writer().clone();
                    write_ws_frame(
                        control.writer(),
                        WsFrame::close(),
                        false,
                        Some(Box::new(move || writer.kill())),
                    );
                    true
                }
                _ => {
                    let path = match &self.active {
                        Some(path) => path.clone(),
                        None => return true,
                    };
                    match self.routes.get_mut(&path) {
                        Some(handler) => handler(control.writer(), frame),
                        None => true,
                    }
                }
            },
            _ => true,
        }
    }
}

/// Client-side logic: sends the upgrade request on start, verifies the
/// 101 response and hands frames to one handler.
pub struct WsClientLogic {
    options: WsOptions,
    full: bool,
    path: String,
    extra_headers: Headers,
    expected_accept: Option<String>,
    handler: FrameHandler,
    on_connected: Option<Box<dyn FnOnce(&SessionWriter) + Send>>,
}

impl WsClientLogic {
    pub fn streaming(options: WsOptions, path: &str, handler: FrameHandler) -> WsClientLogic {
        WsClientLogic {
            options,
            full: false,
            path: path.to_string(),
            extra_headers: Headers::new(),
            expected_accept: None,
            handler,
            on_connected: None,
        }
    }

    pub fn full(options: WsOptions, path: &str, handler: FrameHandler) -> WsClientLogic {
        WsClientLogic {
            full: true,
            ..WsClientLogic::streaming(options, path, handler)
        }
    }

    /// Add a header to the upgrade request.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.set(name, value);
        self
    }

    /// Runs once after the upgrade completes; the usual place to send the
    /// first frame.
    pub fn on_connected(mut self, callback: impl FnOnce(&SessionWriter) + Send + 'static) -> Self {
        self.on_connected = Some(Box::new(callback));
        self
    }

    fn fail_handshake(&self, reason: &str) -> bool {
        let error = crate::error::SessionError::WebSocketHandshake(reason.to_string());
        (self.options.http.session.logger)(LogLevel::Error, &error.to_string());
        false
    }
}

impl SessionLogic for WsClientLogic {
    fn create_decoder(&mut self) -> Box<dyn Decoder> {
        Box::new(HttpFullDecoder::response(&self.options.http))
    }

    fn on_start(&mut self, writer: &SessionWriter) {
        let key = handshake_key();
        self.expected_accept = Some(accept_key(&key));

        let mut request = HttpRequest::new("GET", &self.path);
        request.headers.set("Connection", "Upgrade");
        request.headers.set("Upgrade", "websocket");
        request.headers.set("Sec-WebSocket-Key", &key);
        request.headers.set("Sec-WebSocket-Version", "13");
        for (name, value) in self.extra_headers.iter() {
            request.headers.set(name, value);
        }
        write_http_request(writer, &self.options.http, &mut request, None);
    }

    fn handle_message(&mut self, control: &mut SessionControl<'_>, message: Message) -> bool {
        match message {
            Message::Response(response) => {
                if response.status.code != 101 {
                    return self.fail_handshake(&format!(
                        "unexpected status {} {}",
                        response.status.code, response.status.reason
                    ));
                }
                let connection_ok = response
                    .headers
                    .get("Connection")
                    .map(connection_has_upgrade)
                    .unwrap_or(false);
                if !connection_ok {
                    return self.fail_handshake("missing Connection upgrade token");
                }
                let upgrade_ok = response
                    .headers
                    .get("Upgrade")
                    .map(|v| v.eq_ignore_ascii_case("websocket"))
                    .unwrap_or(false);
                if !upgrade_ok {
                    return self.fail_handshake("missing Upgrade header");
                }
                let accept = response.headers.get("Sec-WebSocket-Accept");
                if accept != self.expected_accept.as_deref() {
                    return self.fail_handshake("Sec-WebSocket-Accept mismatch");
                }

                let decoder: Box<dyn Decoder> = if self.full {
                    Box::new(WsFullFrameDecoder::new(&self.options, false))
                } else {
                    Box::new(WsFrameDecoder::new(&self.options, false))
                };
                control.swap_decoder(decoder);
                if let Some(callback) = self.on_connected.take() {
                    callback(control.writer());
                }
                true
            }
            Message::Frame(frame) => match frame.opcode {
                Opcode::Ping => {
                    let pong = WsFrame::pong(&frame.payload.to_vec());
                    write_ws_frame(control.writer(), pong, true, None);
                    true
                }
                Opcode::Close => {
                    let writer = control.writer().clone();
                    write_ws_frame(
                        control.writer(),
                        WsFrame::close(),
                        true,
                        Some(Box::new(move || writer.kill())),
                    );
                    true
                }
                _ => (self.handler)(control.writer(), frame),
            },
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuf;
    use crate::protocols::Encode as _;
    use crate::runtime::session::{bind, connect, ConnectedSession};
    use crate::runtime::worker::spawn_task;
    use crate::runtime::Runtime;
    use std::io::{Read as _, Write as _};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn ws_echo_server() -> (Runtime, SocketAddr) {
        let runtime = Runtime::with_threads(2, 1).unwrap();
        let worker = runtime.workers.next();
        let event_loop = runtime.event_loops.next();
        let addr = bind(&runtime, "127.0.0.1", 0, move |channel| {
            let options = WsOptions::default();
            let logic = WsServerLogic::full(options.clone()).route(
                "/echo",
                Box::new(|writer, frame| {
                    write_ws_frame(writer, frame, false, None);
                    true
                }),
            );
            let session = ConnectedSession::new(
                channel,
                event_loop.clone(),
                options.http.session.clone(),
                logic,
            );
            spawn_task(&worker, session);
        })
        .unwrap();
        (runtime, addr)
    }

    fn read_until(client: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut seen = Vec::new();
        let mut chunk = [0u8; 512];
        while !seen.windows(needle.len()).any(|window| window == needle) {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed early");
            seen.extend_from_slice(&chunk[..n]);
        }
        seen
    }

    #[test]
    fn test_handshake_and_masked_echo() {
        let (_runtime, addr) = ws_echo_server();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(
                b"GET /echo HTTP/1.1\r\nHost: h\r\nConnection: keep-alive, Upgrade\r\n\
                  Upgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .unwrap();
        let reply = read_until(&mut client, b"\r\n\r\n");
        let text = String::from_utf8_lossy(&reply);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", text);
        assert!(
            text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
            "{}",
            text
        );

        // masked text frame "ping!" echoed back unmasked
        let frame = WsFrame {
            masked: true,
            ..WsFrame::text("ping!")
        };
        let wire = ByteBuf::new();
        frame.encode(&wire);
        client.write_all(&wire.to_vec()).unwrap();

        let echoed = read_until(&mut client, b"ping!");
        let tail = &echoed[echoed.len() - 7..];
        assert_eq!(tail, [&[0x81, 0x05][..], b"ping!"].concat().as_slice());
    }

    fn read_head(sock: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut chunk = [0u8; 256];
        while !head.windows(4).any(|window| window == b"\r\n\r\n") {
            let n = sock.read(&mut chunk).unwrap();
            assert!(n > 0, "peer closed during head");
            head.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    #[test]
    fn test_client_upgrade_and_echo() {
        let (_server, addr) = ws_echo_server();

        let runtime = Runtime::with_threads(1, 1).unwrap();
        let options = WsOptions::default();
        let (tx, rx) = mpsc::channel::<String>();
        let logic = WsClientLogic::full(
            options.clone(),
            "/echo",
            Box::new(move |_writer, frame| {
                let _ = tx.send(frame.payload_text());
                true
            }),
        )
        .on_connected(|writer| {
            write_ws_frame(writer, WsFrame::text("hello there"), true, None);
        });

        connect(
            &runtime,
            "127.0.0.1",
            addr.port(),
            options.http.session.clone(),
            logic,
        )
        .unwrap();

        let echoed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(echoed, "hello there");
    }

    #[test]
    fn test_client_rejects_response_without_connection_header() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let head = read_head(&mut sock);
            let key = head
                .lines()
                .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
                .expect("key header")
                .trim()
                .to_string();
            // a 101 with the right accept key but no Connection header
            let reply = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                accept_key(&key)
            );
            sock.write_all(reply.as_bytes()).unwrap();
            // the client must drop the connection instead of upgrading
            let mut chunk = [0u8; 16];
            match sock.read(&mut chunk) {
                Ok(0) | Err(_) => {}
                Ok(n) => panic!("client sent {} bytes after a bad upgrade", n),
            }
        });

        let runtime = Runtime::with_threads(1, 1).unwrap();
        let options = WsOptions::default();
        let (tx, rx) = mpsc::channel::<String>();
        let logic = WsClientLogic::full(
            options.clone(),
            "/echo",
            Box::new(move |_writer, frame| {
                let _ = tx.send(frame.payload_text());
                true
            }),
        )
        .on_connected(|writer| {
            write_ws_frame(writer, WsFrame::text("hello"), true, None);
        });
        connect(
            &runtime,
            "127.0.0.1",
            addr.port(),
            options.http.session.clone(),
            logic,
        )
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_err());
        server.join().unwrap();
    }

    #[test]
    fn test_client_upgrade_sends_extra_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let head = read_head(&mut sock);
            assert!(
                head.contains("\r\nAuthorization: Bearer token-123\r\n"),
                "{}",
                head
            );
        });

        let runtime = Runtime::with_threads(1, 1).unwrap();
        let options = WsOptions::default();
        let logic = WsClientLogic::full(options.clone(), "/echo", Box::new(|_writer, _frame| true))
            .header("Authorization", "Bearer token-123");
        connect(
            &runtime,
            "127.0.0.1",
            addr.port(),
            options.http.session.clone(),
            logic,
        )
        .unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_non_get_upgrade_is_forbidden() {
        let (_runtime, addr) = ws_echo_server();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(b"POST /echo HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        let reply = read_until(&mut client, b"\r\n\r\n");
        assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn test_missing_upgrade_headers_are_rejected() {
        let (_runtime, addr) = ws_echo_server();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(b"GET /echo HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        let reply = read_until(&mut client, b"\r\n\r\n");
        assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
