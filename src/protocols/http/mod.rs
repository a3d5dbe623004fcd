//! HTTP/1.1 messages, streaming decoder and routing sessions.

pub mod decoder;
pub mod message;
pub mod session;
