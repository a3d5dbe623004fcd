//! Non-blocking TCP channel over socket2.
//!
//! `SocketChannel` is a cheap clone handle; the descriptor closes when the
//! last handle drops. Reads and writes drain in chunks until WouldBlock or
//! a buffer boundary, and report an error only when nothing at all was
//! transferred, so callers can always account for partial progress first.

use crate::buffer::ByteBuf;
use crate::runtime::tls::TlsSession;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

const LISTEN_BACKLOG: i32 = 1024;
const IO_CHUNK: usize = 4096;

struct ChannelCore {
    socket: Socket,
    remote_host: Option<String>,
    remote_port: u16,
    tls: Mutex<Option<Box<dyn TlsSession>>>,
}

/// Shared handle to one non-blocking TCP socket.
#[derive(Clone)]
pub struct SocketChannel {
    core: Arc<ChannelCore>,
}

impl SocketChannel {
    fn from_parts(socket: Socket, remote_host: Option<String>, remote_port: u16) -> Self {
        SocketChannel {
            core: Arc::new(ChannelCore {
                socket,
                remote_host,
                remote_port,
                tls: Mutex::new(None),
            }),
        }
    }

    /// Create a listening socket with address reuse and a 1024 backlog.
    pub fn bind(host: &str, port: u16) -> io::Result<SocketChannel> {
        let addr = resolve(host, port)?;
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(Self::from_parts(socket, None, 0))
    }

    /// Connect to `host:port`, then switch the socket non-blocking.
    /// The host name is remembered for Host headers and TLS verification.
    pub fn connect(host: &str, port: u16) -> io::Result<SocketChannel> {
        let addr = resolve(host, port)?;
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.connect(&addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(Self::from_parts(socket, Some(host.to_string()), port))
    }

    /// Accept every pending connection on a listening socket.
    pub fn accept(&self) -> Vec<SocketChannel> {
        let mut accepted = Vec::new();
        loop {
            match self.core.socket.accept() {
                Ok((socket, addr)) => {
                    if let Err(e) = socket.set_nonblocking(true) {
                        tracing::warn!("set_nonblocking on accepted socket failed: {}", e);
                        continue;
                    }
                    let peer = addr.as_socket();
                    accepted.push(Self::from_parts(
                        socket,
                        peer.map(|a| a.ip().to_string()),
                        peer.map(|a| a.port()).unwrap_or(0),
                    ));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    break;
                }
            }
        }
        accepted
    }

    pub fn raw_fd(&self) -> RawFd {
        self.core.socket.as_raw_fd()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.socket.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "non-IP local address")
        })
    }

    /// Remote host name for connected channels, peer IP for accepted ones.
    pub fn remote_host(&self) -> Option<&str> {
        self.core.remote_host.as_deref()
    }

    pub fn remote_port(&self) -> u16 {
        self.core.remote_port
    }

    /// Attach a TLS session. Must happen before the channel is handed to a
    /// session.
    pub fn set_tls(&self, tls: Box<dyn TlsSession>) {
        *self.core.tls.lock().unwrap() = Some(tls);
    }

    pub fn is_tls(&self) -> bool {
        self.core.tls.lock().unwrap().is_some()
    }

    /// Run `f` against the attached TLS session, if any.
    pub fn with_tls<R>(&self, f: impl FnOnce(&mut dyn TlsSession) -> R) -> Option<R> {
        self.core.tls.lock().unwrap().as_mut().map(|tls| f(tls.as_mut()))
    }

    /// Fill `buf` from the socket until WouldBlock or the buffer is full.
    ///
    /// Returns the bytes transferred; `Err` only when the peer closed or a
    /// fatal error occurred before anything was read.
    pub fn read_bytes(&self, buf: &ByteBuf) -> io::Result<usize> {
        let mut socket = &self.core.socket;
        let mut chunk = [0u8; IO_CHUNK];
        let mut total = 0;
        loop {
            let want = buf.writable_bytes().min(chunk.len());
            if want == 0 {
                break;
            }
            match socket.read(&mut chunk[..want]) {
                Ok(0) => {
                    if total == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "connection closed by peer",
                        ));
                    }
                    break;
                }
                Ok(n) => {
                    buf.write_bytes(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(total)
    }

    /// Drain readable bytes from `buf` into the socket until WouldBlock or
    /// the buffer is empty. Unsent bytes stay in the buffer.
    pub fn write_bytes(&self, buf: &ByteBuf) -> io::Result<usize> {
        let mut socket = &self.core.socket;
        let mut chunk = [0u8; IO_CHUNK];
        let mut total = 0;
        loop {
            let n = buf.peek_bytes(&mut chunk);
            if n == 0 {
                break;
            }
            match socket.write(&chunk[..n]) {
                Ok(0) => {
                    if total == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "connection closed by peer",
                        ));
                    }
                    break;
                }
                Ok(sent) => {
                    buf.skip_bytes(sent);
                    total += sent;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(total)
    }

    pub fn shutdown(&self) {
        let _ = self.core.socket.shutdown(Shutdown::Both);
    }
}

impl fmt::Display for SocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.core.remote_host, self.core.remote_port) {
            (Some(host), port) => write!(f, "fd={} peer={}:{}", self.raw_fd(), host, port),
            (None, _) => write!(f, "fd={}", self.raw_fd()),
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address for host"))
}
