//! Protocol codecs.
//!
//! Decoders are incremental: fed the session receive buffer, they consume
//! complete units and deliver them to a sink, leaving partial data in
//! place for the next pass. Encoders serialize messages into a `ByteBuf`
//! for the session write queue.

pub mod http;
pub mod ws;

use crate::buffer::ByteBuf;
use crate::error::SessionError;
use http::message::{HttpContent, HttpRequest, HttpResponse};
use ws::frame::WsFrame;

/// One decoded protocol unit.
pub enum Message {
    Request(HttpRequest),
    Response(HttpResponse),
    Content(HttpContent),
    Frame(WsFrame),
}

/// Serialization into a session write buffer.
pub trait Encode {
    fn encode(&self, buf: &ByteBuf);
}

impl Encode for Message {
    fn encode(&self, buf: &ByteBuf) {
        match self {
            Message::Request(m) => m.encode(buf),
            Message::Response(m) => m.encode(buf),
            Message::Content(m) => m.encode(buf),
            Message::Frame(m) => m.encode(buf),
        }
    }
}

/// Receives decoded messages; returning false aborts the session.
pub type MessageSink<'a> = dyn FnMut(Message) -> bool + 'a;

/// An incremental protocol decoder.
///
/// `decode` consumes from `buf` and delivers completed units to `sink`.
/// `Ok(true)` means keep going (possibly needing more data), `Ok(false)`
/// propagates a sink abort, `Err` is a fatal protocol error.
/// `peer_closed` is set on the final drain after the transport closed, so
/// decoders can finalize units whose end is the connection close.
pub trait Decoder: Send {
    fn reset(&mut self) {}

    fn decode(
        &mut self,
        buf: &ByteBuf,
        sink: &mut MessageSink<'_>,
        peer_closed: bool,
    ) -> Result<bool, SessionError>;
}
