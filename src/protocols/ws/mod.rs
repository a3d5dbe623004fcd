//! RFC 6455 WebSocket frames, decoders and upgrade sessions.

pub mod decoder;
pub mod frame;
pub mod session;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Sec-WebSocket-Accept value for a handshake key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// A fresh random Sec-WebSocket-Key.
pub fn handshake_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}
