//! Session error taxonomy.
//!
//! Every variant is connection-fatal: once a session reports one of these
//! the decoder gets a final drain, the logic's error hook runs, and the
//! connection is torn down.

use std::fmt;

/// Errors surfaced by sessions and protocol decoders.
#[derive(Debug)]
pub enum SessionError {
    /// Peer closed the connection or a transport error occurred.
    ChannelClosed(String),
    /// Receive buffer is full and the decoder cannot make progress.
    ReadBufferOverflow(String),
    /// TLS handshake or hostname verification failed.
    SslHandshake(String),
    /// Malformed or over-limit HTTP data.
    HttpMessage(String),
    /// WebSocket upgrade negotiation failed.
    WebSocketHandshake(String),
    /// Malformed or over-limit WebSocket frame data.
    WebSocketMessage(String),
}

impl SessionError {
    /// The human-readable detail attached to the error.
    pub fn message(&self) -> &str {
        match self {
            SessionError::ChannelClosed(m)
            | SessionError::ReadBufferOverflow(m)
            | SessionError::SslHandshake(m)
            | SessionError::HttpMessage(m)
            | SessionError::WebSocketHandshake(m)
            | SessionError::WebSocketMessage(m) => m,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ChannelClosed(m) => write!(f, "channel closed: {}", m),
            SessionError::ReadBufferOverflow(m) => write!(f, "read buffer overflow: {}", m),
            SessionError::SslHandshake(m) => write!(f, "ssl handshake failed: {}", m),
            SessionError::HttpMessage(m) => write!(f, "http message error: {}", m),
            SessionError::WebSocketHandshake(m) => {
                write!(f, "websocket handshake failed: {}", m)
            }
            SessionError::WebSocketMessage(m) => write!(f, "websocket message error: {}", m),
        }
    }
}

impl std::error::Error for SessionError {}
