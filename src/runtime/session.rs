//! Connected-channel sessions: the glue between channels, decoders and
//! application logic.
//!
//! A `ConnectedSession` is a `Task` bound to one socket. READ events pump
//! the socket into the receive buffer and drive the decoder; WRITE events
//! drain the outbound FIFO. TLS handshaking, idle timeouts and the
//! connection-fatal error funnel all live here, so protocol logic only
//! deals in messages.

use crate::buffer::ByteBuf;
use crate::config::{LogLevel, SessionOptions};
use crate::error::SessionError;
use crate::protocols::{Decoder, Encode, Message};
use crate::runtime::channel::SocketChannel;
use crate::runtime::event_loop::EventLoop;
use crate::runtime::worker::{events, now_millis, spawn_task, Task, TaskHandle, Timer};
use crate::runtime::Runtime;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Runs after a queued write unit has been fully flushed to the socket.
pub type WriteCallback = Box<dyn FnOnce() + Send>;

struct WriteUnit {
    buffer: ByteBuf,
    callback: Option<WriteCallback>,
}

struct WriterShared {
    channel: SocketChannel,
    event_loop: EventLoop,
    queue: Mutex<VecDeque<WriteUnit>>,
    task: OnceLock<TaskHandle>,
}

/// Outbound surface of a session, usable from any thread.
///
/// Writes append to a FIFO and request write interest; the session's
/// worker drains the queue in order. Clones stay valid after the session
/// dies; their writes are dropped with the queue.
#[derive(Clone)]
pub struct SessionWriter {
    shared: Arc<WriterShared>,
}

impl SessionWriter {
    pub fn channel(&self) -> &SocketChannel {
        &self.shared.channel
    }

    /// Serialize `message` into a fresh buffer and queue it.
    pub fn write_message(&self, message: &dyn Encode, callback: Option<WriteCallback>) {
        let buffer = ByteBuf::new();
        message.encode(&buffer);
        self.write_data(buffer, callback);
    }

    /// Queue raw bytes for sending.
    pub fn write_data(&self, buffer: ByteBuf, callback: Option<WriteCallback>) {
        self.shared
            .queue
            .lock()
            .unwrap()
            .push_back(WriteUnit { buffer, callback });
        if let Some(task) = self.shared.task.get() {
            if self
                .shared
                .event_loop
                .add_channel(&self.shared.channel, task, true)
                .is_err()
            {
                task.signal(events::KILL);
            }
        }
    }

    /// Request session teardown.
    pub fn kill(&self) {
        if let Some(task) = self.shared.task.get() {
            task.signal(events::KILL);
        }
    }

    fn bind(&self, handle: TaskHandle) {
        let _ = self.shared.task.set(handle);
    }
}

/// Deferred session mutations available to message handlers.
pub struct SessionControl<'a> {
    writer: &'a SessionWriter,
    next_decoder: Option<Box<dyn Decoder>>,
}

impl SessionControl<'_> {
    pub fn writer(&self) -> &SessionWriter {
        self.writer
    }

    /// Replace the session decoder once the current decode call returns.
    /// Used by protocol upgrades; the running decoder is never dropped out
    /// from under itself.
    pub fn swap_decoder(&mut self, decoder: Box<dyn Decoder>) {
        self.next_decoder = Some(decoder);
    }
}

/// Protocol behaviour plugged into a `ConnectedSession`.
pub trait SessionLogic: Send + 'static {
    fn create_decoder(&mut self) -> Box<dyn Decoder>;

    /// One decoded message. Returning false tears the session down.
    fn handle_message(&mut self, control: &mut SessionControl<'_>, message: Message) -> bool;

    /// Called once after the session is registered; client logics that
    /// must speak first send from here.
    fn on_start(&mut self, _writer: &SessionWriter) {}

    /// TLS handshake completed and the peer verified.
    fn handle_tls_handshaked(&mut self, _writer: &SessionWriter) -> bool {
        true
    }

    /// A connection-fatal error, observed just before teardown.
    fn handle_error(&mut self, _writer: &SessionWriter, _error: &SessionError) {}
}

/// One connection: channel, receive buffer, decoder and logic.
pub struct ConnectedSession<L: SessionLogic> {
    channel: SocketChannel,
    event_loop: EventLoop,
    options: SessionOptions,
    recv_buffer: ByteBuf,
    decoder: Option<Box<dyn Decoder>>,
    writer: SessionWriter,
    logic: L,
    task: Option<TaskHandle>,
    idle_timer: Option<Timer>,
    last_read: Arc<AtomicI64>,
    last_write: Arc<AtomicI64>,
    read_wants_write: bool,
    write_wants_read: bool,
}

impl<L: SessionLogic> ConnectedSession<L> {
    pub fn new(
        channel: SocketChannel,
        event_loop: EventLoop,
        options: SessionOptions,
        logic: L,
    ) -> Self {
        let writer = SessionWriter {
            shared: Arc::new(WriterShared {
                channel: channel.clone(),
                event_loop: event_loop.clone(),
                queue: Mutex::new(VecDeque::new()),
                task: OnceLock::new(),
            }),
        };
        let now = now_millis();
        ConnectedSession {
            recv_buffer: ByteBuf::with_limit(options.max_buffer_size),
            channel,
            event_loop,
            options,
            decoder: None,
            writer,
            logic,
            task: None,
            idle_timer: None,
            last_read: Arc::new(AtomicI64::new(now)),
            last_write: Arc::new(AtomicI64::new(now)),
            read_wants_write: false,
            write_wants_read: false,
        }
    }

    /// Connection-fatal error funnel: final decoder drain on close, then
    /// the logic's error hook, then teardown via the false return.
    fn fail(&mut self, error: SessionError) -> bool {
        if matches!(error, SessionError::ChannelClosed(_)) {
            let _ = self.decode_once(true);
        }
        let level = match error {
            SessionError::ChannelClosed(_) => LogLevel::Debug,
            _ => LogLevel::Error,
        };
        (self.options.logger)(level, &format!("{}: {}", self.channel, error));
        self.logic.handle_error(&self.writer, &error);
        false
    }

    /// Run the decoder against the receive buffer once, applying any
    /// decoder swap the handlers requested.
    fn decode_once(&mut self, peer_closed: bool) -> Result<bool, SessionError> {
        let mut decoder = match self.decoder.take() {
            Some(decoder) => decoder,
            None => return Ok(true),
        };
        let mut control = SessionControl {
            writer: &self.writer,
            next_decoder: None,
        };
        let logic = &mut self.logic;
        let mut sink = |message: Message| logic.handle_message(&mut control, message);
        let result = decoder.decode(&self.recv_buffer, &mut sink, peer_closed);
        self.decoder = Some(match control.next_decoder.take() {
            Some(next) => next,
            None => decoder,
        });
        result
    }

    /// Step an unfinished TLS handshake. `Ok(true)` when complete,
    /// `Ok(false)` while still in flight.
    fn drive_tls_handshake(&mut self) -> Result<bool, SessionError> {
        use crate::runtime::tls::TlsProgress;
        let mut want_write = false;
        let completed = self
            .channel
            .with_tls(|tls| {
                if tls.is_handshaked() {
                    return Ok(true);
                }
                match tls.do_handshake() {
                    Ok(TlsProgress::Complete) => Ok(true),
                    Ok(TlsProgress::WantRead) => Ok(false),
                    Ok(TlsProgress::WantWrite) => {
                        want_write = true;
                        Ok(false)
                    }
                    Err(e) => Err(SessionError::SslHandshake(e.to_string())),
                }
            })
            .unwrap_or(Ok(true))?;
        if want_write {
            if let Some(task) = &self.task {
                let _ = self.event_loop.add_channel(&self.channel, task, true);
            }
        }
        Ok(completed)
    }

    /// Hostname verification for client sessions; fails closed.
    fn verify_tls_peer(&self) -> bool {
        let host = match self.channel.remote_host() {
            Some(host) => host.to_string(),
            None => return true,
        };
        self.channel
            .with_tls(|tls| !tls.is_client() || tls.verify_peer_hostname(&host))
            .unwrap_or(true)
    }

    /// Shared post-handshake step for both readiness paths.
    fn finish_tls_handshake(&mut self) -> Result<(), SessionError> {
        if !self.verify_tls_peer() {
            return Err(SessionError::SslHandshake(
                "peer hostname verification failed".to_string(),
            ));
        }
        if !self.logic.handle_tls_handshaked(&self.writer) {
            return Err(SessionError::SslHandshake(
                "handshake rejected by session logic".to_string(),
            ));
        }
        Ok(())
    }
}

impl<L: SessionLogic> Task for ConnectedSession<L> {
    fn bind(&mut self, handle: TaskHandle) {
        self.writer.bind(handle.clone());
        self.task = Some(handle);
    }

    fn handle_init(&mut self) -> bool {
        self.decoder = Some(self.logic.create_decoder());
        let task = match &self.task {
            Some(task) => task.clone(),
            None => return false,
        };

        if self.options.timeout_millis > 0 {
            let timer = Timer::new(task.worker(), {
                let last_read = Arc::clone(&self.last_read);
                let last_write = Arc::clone(&self.last_write);
                let timeout = self.options.timeout_millis;
                let task = task.clone();
                let logger = Arc::clone(&self.options.logger);
                let peer = self.channel.to_string();
                move |timer| {
                    let idle_since = last_read
                        .load(Ordering::SeqCst)
                        .min(last_write.load(Ordering::SeqCst));
                    let idle = now_millis() - idle_since;
                    if idle >= timeout {
                        logger(
                            LogLevel::Info,
                            &format!("{}: idle for {}ms, closing", peer, idle),
                        );
                        task.signal(events::KILL);
                    } else {
                        timer.start(timeout - idle);
                    }
                }
            });
            timer.start(self.options.timeout_millis);
            self.idle_timer = Some(timer);
        }

        // TLS clients register write-first so the hello flushes as soon as
        // the socket is writable.
        let tls_client_hello = self
            .channel
            .with_tls(|tls| tls.is_client() && !tls.is_handshaked())
            .unwrap_or(false);
        // registration is ordered against concurrent write_data calls by
        // the queue lock; a writer may have queued data before this ran
        let registered = {
            let queue = self.writer.shared.queue.lock().unwrap();
            let wants_write = tls_client_hello || !queue.is_empty();
            self.event_loop.add_channel(&self.channel, &task, wants_write)
        };
        if let Err(e) = registered {
            return self.fail(SessionError::ChannelClosed(format!(
                "channel registration failed: {}",
                e
            )));
        }
        self.logic.on_start(&self.writer);
        true
    }

    fn handle_read(&mut self) -> bool {
        if self.channel.is_tls() {
            let handshaked = self
                .channel
                .with_tls(|tls| tls.is_handshaked())
                .unwrap_or(true);
            if !handshaked {
                match self.drive_tls_handshake() {
                    Err(e) => return self.fail(e),
                    Ok(false) => return true,
                    Ok(true) => {
                        if let Err(e) = self.finish_tls_handshake() {
                            return self.fail(e);
                        }
                    }
                }
            }
            if self.write_wants_read {
                self.write_wants_read = false;
                if let Some(task) = &self.task {
                    task.signal(events::WRITE);
                }
            }
        }

        // Fill until the socket drains or the buffer fills; a full buffer
        // gets one decode attempt to make room before it counts as
        // overflow.
        loop {
            let buffer = self.recv_buffer.clone();
            let result = match self.channel.with_tls(|tls| tls.read_bytes(&buffer)) {
                Some(result) => result,
                None => self.channel.read_bytes(&buffer),
            };
            match result {
                Ok(n) => {
                    if n > 0 {
                        self.last_read.store(now_millis(), Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    return self.fail(SessionError::ChannelClosed(e.to_string()));
                }
            }

            if self.recv_buffer.writable_bytes() > 0 {
                if self
                    .channel
                    .with_tls(|tls| tls.read_wants_write())
                    .unwrap_or(false)
                {
                    self.read_wants_write = true;
                    if let Some(task) = &self.task {
                        let _ = self.event_loop.add_channel(&self.channel, task, true);
                    }
                }
                break;
            }

            let before = self.recv_buffer.readable_bytes();
            match self.decode_once(false) {
                Err(e) => return self.fail(e),
                Ok(false) => return false,
                Ok(true) => {}
            }
            if self.recv_buffer.readable_bytes() == 0 {
                // fully drained: reclaim the cursor space and keep filling
                self.recv_buffer.clear();
                continue;
            }
            if self.recv_buffer.writable_bytes() == 0
                && self.recv_buffer.readable_bytes() == before
            {
                return self.fail(SessionError::ReadBufferOverflow(format!(
                    "decoder stalled with {} buffered bytes",
                    before
                )));
            }
        }

        // Decode everything buffered; stop when a pass consumes nothing.
        while self.recv_buffer.readable_bytes() > 0 {
            let before = self.recv_buffer.readable_bytes();
            match self.decode_once(false) {
                Err(e) => return self.fail(e),
                Ok(false) => return false,
                Ok(true) => {}
            }
            if self.recv_buffer.readable_bytes() == before {
                break;
            }
        }
        if self.recv_buffer.readable_bytes() == 0 {
            // makes the whole capacity writable again
            self.recv_buffer.clear();
        }
        true
    }

    fn handle_write(&mut self) -> bool {
        let task = match &self.task {
            Some(task) => task.clone(),
            None => return false,
        };

        if self.channel.is_tls() {
            let handshaked = self
                .channel
                .with_tls(|tls| tls.is_handshaked())
                .unwrap_or(true);
            if !handshaked {
                match self.drive_tls_handshake() {
                    Err(e) => return self.fail(e),
                    Ok(false) => return true,
                    Ok(true) => {
                        if let Err(e) = self.finish_tls_handshake() {
                            return self.fail(e);
                        }
                    }
                }
            }
            if self.read_wants_write {
                self.read_wants_write = false;
                task.signal(events::READ);
                return true;
            }
        }

        loop {
            let buffer = {
                let queue = self.writer.shared.queue.lock().unwrap();
                match queue.front() {
                    Some(unit) => unit.buffer.clone(),
                    None => break,
                }
            };

            let result = match self.channel.with_tls(|tls| tls.write_bytes(&buffer)) {
                Some(result) => result,
                None => self.channel.write_bytes(&buffer),
            };
            match result {
                Ok(n) => {
                    if n > 0 {
                        self.last_write.store(now_millis(), Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    return self.fail(SessionError::ChannelClosed(e.to_string()));
                }
            }

            if buffer.readable_bytes() > 0 {
                // partial send: stay write-registered, keep the unit at the
                // queue head
                if self
                    .channel
                    .with_tls(|tls| tls.write_wants_read())
                    .unwrap_or(false)
                {
                    self.write_wants_read = true;
                }
                return true;
            }

            let (callback, registered) = {
                let mut queue = self.writer.shared.queue.lock().unwrap();
                let unit = queue.pop_front();
                // dropping write interest must stay ordered against
                // concurrent write_data calls, hence under the queue lock
                let registered = if queue.is_empty() {
                    Some(self.event_loop.add_channel(&self.channel, &task, false))
                } else {
                    None
                };
                (unit.and_then(|unit| unit.callback), registered)
            };
            if let Some(Err(e)) = registered {
                return self.fail(SessionError::ChannelClosed(format!(
                    "channel registration failed: {}",
                    e
                )));
            }
            if let Some(callback) = callback {
                callback();
            }
        }
        true
    }
}

impl<L: SessionLogic> Drop for ConnectedSession<L> {
    fn drop(&mut self) {
        if let Some(timer) = &self.idle_timer {
            timer.cancel();
        }
        self.event_loop.remove_channel(&self.channel);
        self.channel.shutdown();
    }
}

/// Accept loop on a listening channel; new connections go to the factory.
pub struct ListenerSession<F>
where
    F: FnMut(SocketChannel) + Send + 'static,
{
    channel: SocketChannel,
    event_loop: EventLoop,
    task: Option<TaskHandle>,
    on_accept: F,
}

impl<F> ListenerSession<F>
where
    F: FnMut(SocketChannel) + Send + 'static,
{
    pub fn new(channel: SocketChannel, event_loop: EventLoop, on_accept: F) -> Self {
        ListenerSession {
            channel,
            event_loop,
            task: None,
            on_accept,
        }
    }
}

impl<F> Task for ListenerSession<F>
where
    F: FnMut(SocketChannel) + Send + 'static,
{
    fn bind(&mut self, handle: TaskHandle) {
        self.task = Some(handle);
    }

    fn handle_init(&mut self) -> bool {
        let task = match &self.task {
            Some(task) => task.clone(),
            None => return false,
        };
        if let Err(e) = self.event_loop.add_channel(&self.channel, &task, false) {
            tracing::error!("listener registration failed: {}", e);
            return false;
        }
        if let Ok(addr) = self.channel.local_addr() {
            tracing::info!("listening on {}", addr);
        }
        true
    }

    fn handle_read(&mut self) -> bool {
        for channel in self.channel.accept() {
            tracing::debug!("accepted {}", channel);
            (self.on_accept)(channel);
        }
        true
    }
}

impl<F> Drop for ListenerSession<F>
where
    F: FnMut(SocketChannel) + Send + 'static,
{
    fn drop(&mut self) {
        self.event_loop.remove_channel(&self.channel);
        self.channel.shutdown();
    }
}

/// Bind a listener and start its accept loop. Returns the bound address,
/// which carries the chosen port when binding port 0.
pub fn bind<F>(runtime: &Runtime, host: &str, port: u16, on_accept: F) -> io::Result<SocketAddr>
where
    F: FnMut(SocketChannel) + Send + 'static,
{
    let channel = SocketChannel::bind(host, port)?;
    let addr = channel.local_addr()?;
    let session = ListenerSession::new(channel, runtime.event_loops.next(), on_accept);
    spawn_task(&runtime.workers.next(), session);
    Ok(addr)
}

/// Start a session over an established channel. The returned writer is
/// usable from any thread.
pub fn start_session<L: SessionLogic>(
    runtime: &Runtime,
    channel: SocketChannel,
    options: SessionOptions,
    logic: L,
) -> SessionWriter {
    let session = ConnectedSession::new(channel, runtime.event_loops.next(), options, logic);
    let writer = session.writer.clone();
    spawn_task(&runtime.workers.next(), session);
    writer
}

/// Connect to a remote peer and start a session over the new channel.
pub fn connect<L: SessionLogic>(
    runtime: &Runtime,
    host: &str,
    port: u16,
    options: SessionOptions,
    logic: L,
) -> io::Result<SessionWriter> {
    let channel = SocketChannel::connect(host, port)?;
    Ok(start_session(runtime, channel, options, logic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::message::HttpContent;
    use crate::protocols::MessageSink;
    use std::io::{Read as _, Write as _};
    use std::thread;
    use std::time::Duration;

    struct LineDecoder;

    impl Decoder for LineDecoder {
        fn decode(
            &mut self,
            buf: &ByteBuf,
            sink: &mut MessageSink<'_>,
            _peer_closed: bool,
        ) -> Result<bool, SessionError> {
            while let Some(line) = buf.get_line("\n") {
                if !sink(Message::Content(HttpContent::from_slice(line.as_bytes()))) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }

    struct EchoLogic;

    impl SessionLogic for EchoLogic {
        fn create_decoder(&mut self) -> Box<dyn Decoder> {
            Box::new(LineDecoder)
        }

        fn handle_message(
            &mut self,
            control: &mut SessionControl<'_>,
            message: Message,
        ) -> bool {
            if let Message::Content(content) = message {
                let reply = ByteBuf::new();
                reply.write_bytes(&content.data.to_vec());
                reply.write_bytes(b"\n");
                control.writer().write_data(reply, None);
            }
            true
        }
    }

    fn init_logging() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        });
    }

    fn echo_runtime() -> (Runtime, SocketAddr) {
        init_logging();
        let runtime = Runtime::with_threads(2, 1).unwrap();
        let options = SessionOptions::default();
        let worker = runtime.workers.next();
        let event_loop = runtime.event_loops.next();
        let addr = bind(&runtime, "127.0.0.1", 0, move |channel| {
            let session =
                ConnectedSession::new(channel, event_loop.clone(), options.clone(), EchoLogic);
            spawn_task(&worker, session);
        })
        .unwrap();
        (runtime, addr)
    }

    #[test]
    fn test_echo_round_trip() {
        let (_runtime, addr) = echo_runtime();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"hello session\n").unwrap();

        let mut reply = Vec::new();
        let mut chunk = [0u8; 64];
        while !reply.ends_with(b"\n") {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed before echo");
            reply.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(reply, b"hello session\n");
    }

    #[test]
    fn test_multiple_lines_one_burst() {
        let (_runtime, addr) = echo_runtime();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"one\ntwo\nthree\n").unwrap();

        let mut reply = Vec::new();
        let mut chunk = [0u8; 64];
        while reply.iter().filter(|b| **b == b'\n').count() < 3 {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed early");
            reply.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(reply, b"one\ntwo\nthree\n");
    }

    #[test]
    fn test_exact_buffer_fill_is_not_overflow() {
        init_logging();
        let runtime = Runtime::with_threads(1, 1).unwrap();
        let options = SessionOptions {
            max_buffer_size: 16,
            ..SessionOptions::default()
        };

        let addr = {
            let event_loop = runtime.event_loops.next();
            let worker = runtime.workers.next();
            bind(&runtime, "127.0.0.1", 0, move |channel| {
                let session =
                    ConnectedSession::new(channel, event_loop.clone(), options.clone(), EchoLogic);
                spawn_task(&worker, session);
            })
            .unwrap()
        };

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // exactly fills the receive buffer and parses completely
        client.write_all(b"0123456789abcde\n").unwrap();

        let mut reply = Vec::new();
        let mut chunk = [0u8; 64];
        while !reply.ends_with(b"\n") {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed instead of echoing");
            reply.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(reply, b"0123456789abcde\n");
    }

    struct ForwardLogic {
        tx: std::sync::mpsc::Sender<String>,
    }

    impl SessionLogic for ForwardLogic {
        fn create_decoder(&mut self) -> Box<dyn Decoder> {
            Box::new(LineDecoder)
        }

        fn handle_message(&mut self, _control: &mut SessionControl<'_>, message: Message) -> bool {
            if let Message::Content(content) = message {
                let _ = self.tx.send(content.data.to_string_lossy());
            }
            true
        }
    }

    #[test]
    fn test_write_queued_before_init_is_flushed() {
        let (_runtime, addr) = echo_runtime();
        let client_runtime = Runtime::with_threads(1, 1).unwrap();

        // writes issued right after connect race the session's first
        // registration; none may be lost
        for i in 0..10 {
            let (tx, rx) = std::sync::mpsc::channel();
            let writer = connect(
                &client_runtime,
                "127.0.0.1",
                addr.port(),
                SessionOptions::default(),
                ForwardLogic { tx },
            )
            .unwrap();
            let line = ByteBuf::from_slice(format!("burst {}\n", i).as_bytes());
            writer.write_data(line, None);
            let echoed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(echoed, format!("burst {}", i));
        }
    }

    struct StallingDecoder;

    impl Decoder for StallingDecoder {
        fn decode(
            &mut self,
            _buf: &ByteBuf,
            _sink: &mut MessageSink<'_>,
            _peer_closed: bool,
        ) -> Result<bool, SessionError> {
            Ok(true) // never consumes
        }
    }

    struct StallingLogic {
        seen: Arc<Mutex<Option<String>>>,
    }

    impl SessionLogic for StallingLogic {
        fn create_decoder(&mut self) -> Box<dyn Decoder> {
            Box::new(StallingDecoder)
        }

        fn handle_message(&mut self, _control: &mut SessionControl<'_>, _message: Message) -> bool {
            true
        }

        fn handle_error(&mut self, _writer: &SessionWriter, error: &SessionError) {
            *self.seen.lock().unwrap() = Some(error.to_string());
        }
    }

    #[test]
    fn test_overflow_on_stalled_decoder() {
        init_logging();
        let runtime = Runtime::with_threads(1, 1).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let options = SessionOptions {
            max_buffer_size: 16,
            ..SessionOptions::default()
        };

        let addr = {
            let seen = seen.clone();
            let event_loop = runtime.event_loops.next();
            let worker = runtime.workers.next();
            let options = options.clone();
            bind(&runtime, "127.0.0.1", 0, move |channel| {
                let session = ConnectedSession::new(
                    channel,
                    event_loop.clone(),
                    options.clone(),
                    StallingLogic { seen: seen.clone() },
                );
                spawn_task(&worker, session);
            })
            .unwrap()
        };

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(&[0u8; 64]).unwrap();

        // server must close the connection after the overflow
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut chunk = [0u8; 16];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => panic!("expected close, got {}", e),
            }
        }

        for _ in 0..100 {
            if seen.lock().unwrap().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let recorded = seen.lock().unwrap().clone().expect("error hook not called");
        assert!(recorded.contains("read buffer overflow"), "{}", recorded);
    }

    #[test]
    fn test_idle_timeout_closes_connection() {
        init_logging();
        let runtime = Runtime::with_threads(1, 1).unwrap();
        let options = SessionOptions {
            timeout_millis: 200,
            ..SessionOptions::default()
        };

        let addr = {
            let event_loop = runtime.event_loops.next();
            let worker = runtime.workers.next();
            bind(&runtime, "127.0.0.1", 0, move |channel| {
                let session =
                    ConnectedSession::new(channel, event_loop.clone(), options.clone(), EchoLogic);
                spawn_task(&worker, session);
            })
            .unwrap()
        };

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // idle well past the timeout; the server must close
        let start = std::time::Instant::now();
        let mut chunk = [0u8; 16];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => panic!("expected close, got {}", e),
            }
        }
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_activity_defers_idle_timeout() {
        init_logging();
        let runtime = Runtime::with_threads(1, 1).unwrap();
        let options = SessionOptions {
            timeout_millis: 400,
            ..SessionOptions::default()
        };

        let addr = {
            let event_loop = runtime.event_loops.next();
            let worker = runtime.workers.next();
            bind(&runtime, "127.0.0.1", 0, move |channel| {
                let session =
                    ConnectedSession::new(channel, event_loop.clone(), options.clone(), EchoLogic);
                spawn_task(&worker, session);
            })
            .unwrap()
        };

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // keep the session busy for longer than the timeout window
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(150));
            client.write_all(b"tick\n").unwrap();
            let mut reply = Vec::new();
            let mut chunk = [0u8; 16];
            while !reply.ends_with(b"\n") {
                let n = client.read(&mut chunk).unwrap();
                assert!(n > 0, "closed despite activity");
                reply.extend_from_slice(&chunk[..n]);
            }
        }
    }
}
