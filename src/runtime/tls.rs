//! TLS capability surface consumed by sessions.
//!
//! No TLS implementation ships in this crate. Embedders attach a
//! `TlsSession` to a channel before starting the session; the session
//! drives the handshake from readiness events and moves ciphertext through
//! the implementation, interleaving WantRead/WantWrite with its own
//! read/write interest.

use crate::buffer::ByteBuf;
use std::io;

/// Handshake stepping outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProgress {
    /// Handshake finished.
    Complete,
    /// More peer data is needed; stay read-registered.
    WantRead,
    /// The implementation has data to flush; register write interest.
    WantWrite,
}

/// One TLS connection's state, supplied by the embedder.
///
/// `read_bytes` and `write_bytes` follow the channel contract: drain as
/// much as possible, return `Ok(written)` on partial progress and `Err`
/// only when nothing was transferred and the connection is gone.
pub trait TlsSession: Send {
    /// Client-side sessions are registered write-first so the hello can
    /// flush immediately.
    fn is_client(&self) -> bool;

    fn is_handshaked(&self) -> bool;

    /// Advance the handshake by one step.
    fn do_handshake(&mut self) -> io::Result<TlsProgress>;

    /// Verify the peer certificate against the expected hostname.
    /// Sessions fail closed when this returns false.
    fn verify_peer_hostname(&self, hostname: &str) -> bool;

    /// Decrypt available data into `buf`.
    fn read_bytes(&mut self, buf: &ByteBuf) -> io::Result<usize>;

    /// Encrypt and send readable bytes from `buf`.
    fn write_bytes(&mut self, buf: &ByteBuf) -> io::Result<usize>;

    /// True when the last `read_bytes` stalled on a renegotiation write.
    /// The session registers write interest and retries the read on the
    /// next WRITE event.
    fn read_wants_write(&self) -> bool {
        false
    }

    /// True when the last `write_bytes` stalled on a renegotiation read.
    /// The session retries the write on the next READ event.
    fn write_wants_read(&self) -> bool {
        false
    }
}
