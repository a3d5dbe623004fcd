//! Shared growable byte buffer with independent read and write cursors.
//!
//! `ByteBuf` is the unit of data exchange across the crate: channels fill
//! it from sockets, decoders consume it, encoders serialize messages into
//! it, and the session write queue holds one per pending write. Cloning is
//! cheap and aliases both storage and cursors, so a decoder and the channel
//! that feeds it observe the same positions. Storage is freed when the last
//! handle drops.
//!
//! The invariant `0 <= read <= write <= allocated <= limit` always holds.
//! Writes saturate at the capacity limit and report how many bytes were
//! actually stored; storage grows by 1.5x steps, capped at the limit.

use bytes::BytesMut;
use std::sync::{Arc, Mutex, MutexGuard};

const INITIAL_ALLOCATION: usize = 1024;

/// Effectively unbounded capacity for buffers built without a limit.
const UNLIMITED: usize = usize::MAX >> 1;

struct Inner {
    data: BytesMut,
    read: usize,
    write: usize,
    limit: usize,
}

/// Growable byte buffer shared between clones.
#[derive(Clone)]
pub struct ByteBuf {
    inner: Arc<Mutex<Inner>>,
}

impl Inner {
    fn readable(&self) -> usize {
        self.write - self.read
    }

    fn writable(&self) -> usize {
        self.limit - self.write
    }

    /// Grow allocated storage until it covers `needed` bytes.
    ///
    /// Returns false when the capacity limit is reached first. Callers clamp
    /// lengths against `writable()` beforehand, so failure means a
    /// zero-capacity buffer.
    fn grow(&mut self, needed: usize) -> bool {
        let mut size = self.data.len();
        while size < needed {
            let next = (size.saturating_mul(3) / 2).max(size + 1).min(self.limit);
            if next == size {
                return false;
            }
            size = next;
        }
        self.data.resize(size, 0);
        true
    }

    fn write_slice(&mut self, bytes: &[u8]) -> usize {
        let length = bytes.len().min(self.writable());
        if length == 0 {
            return 0;
        }
        if self.write + length > self.data.len() && !self.grow(self.write + length) {
            return 0;
        }
        self.data[self.write..self.write + length].copy_from_slice(&bytes[..length]);
        self.write += length;
        length
    }

    fn read_slice(&mut self, dst: &mut [u8]) -> usize {
        let length = dst.len().min(self.readable());
        dst[..length].copy_from_slice(&self.data[self.read..self.read + length]);
        self.read += length;
        length
    }
}

impl ByteBuf {
    /// A buffer without a practical capacity limit.
    pub fn new() -> Self {
        Self::with_limit(UNLIMITED)
    }

    /// A buffer that will never hold more than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self::with_capacity(INITIAL_ALLOCATION.min(limit), limit)
    }

    /// A buffer with an explicit initial allocation and capacity limit.
    pub fn with_capacity(initial: usize, limit: usize) -> Self {
        let initial = initial.min(limit);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: BytesMut::zeroed(initial),
                read: 0,
                write: 0,
                limit,
            })),
        }
    }

    /// A buffer pre-filled with `bytes`, without a capacity limit.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let buf = Self::new();
        buf.write_bytes(bytes);
        buf
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Lock two distinct buffers in address order so concurrent transfers
    /// in opposite directions cannot deadlock.
    fn lock_pair<'a>(
        &'a self,
        other: &'a ByteBuf,
    ) -> (MutexGuard<'a, Inner>, MutexGuard<'a, Inner>) {
        let a = Arc::as_ptr(&self.inner) as usize;
        let b = Arc::as_ptr(&other.inner) as usize;
        if a < b {
            let first = self.lock();
            let second = other.lock();
            (first, second)
        } else {
            let second = other.lock();
            let first = self.lock();
            (first, second)
        }
    }

    /// Reset both cursors, making the whole capacity writable again.
    /// Allocated storage is kept.
    pub fn clear(&self) {
        let mut g = self.lock();
        g.read = 0;
        g.write = 0;
    }

    /// The capacity limit.
    pub fn capacity(&self) -> usize {
        self.lock().limit
    }

    /// Currently allocated storage, which may be below the limit.
    pub fn allocated(&self) -> usize {
        self.lock().data.len()
    }

    /// Bytes available for reading.
    pub fn readable_bytes(&self) -> usize {
        self.lock().readable()
    }

    /// Bytes that can still be written before the limit is hit.
    pub fn writable_bytes(&self) -> usize {
        self.lock().writable()
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Advance the read cursor by up to `size` bytes. Returns the number
    /// actually skipped.
    pub fn skip_bytes(&self, size: usize) -> usize {
        let mut g = self.lock();
        let length = size.min(g.readable());
        g.read += length;
        length
    }

    /// Copy readable bytes into `dst`, consuming them. Returns the number
    /// copied.
    pub fn read_bytes(&self, dst: &mut [u8]) -> usize {
        self.lock().read_slice(dst)
    }

    /// Copy readable bytes into `dst` without consuming them.
    pub fn peek_bytes(&self, dst: &mut [u8]) -> usize {
        let g = self.lock();
        let length = dst.len().min(g.readable());
        dst[..length].copy_from_slice(&g.data[g.read..g.read + length]);
        length
    }

    /// Append `bytes`, truncating at the capacity limit. Returns the number
    /// actually written.
    pub fn write_bytes(&self, bytes: &[u8]) -> usize {
        self.lock().write_slice(bytes)
    }

    /// Move up to `size` bytes (all readable bytes when `None`) from this
    /// buffer into `other`. Transfers between handles of the same buffer
    /// are no-ops.
    pub fn read_into(&self, other: &ByteBuf, size: Option<usize>) -> usize {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return 0;
        }
        let (mut src, mut dst) = self.lock_pair(other);
        transfer(&mut src, &mut dst, size)
    }

    /// Move up to `size` bytes (all readable bytes when `None`) from
    /// `other` into this buffer. Transfers between handles of the same
    /// buffer are no-ops.
    pub fn write_from(&self, other: &ByteBuf, size: Option<usize>) -> usize {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return 0;
        }
        let (mut dst, mut src) = self.lock_pair(other);
        transfer(&mut src, &mut dst, size)
    }

    /// Splice `bytes` into the readable region, `position` bytes past the
    /// read cursor. Existing data from that point shifts right. Fails when
    /// the position is out of range or the bytes do not fit.
    pub fn insert_write_bytes(&self, position: usize, bytes: &[u8]) -> bool {
        let mut g = self.lock();
        let size = bytes.len();
        if position > g.readable() || size == 0 || g.writable() < size {
            return false;
        }
        let needed = g.write + size;
        if needed > g.data.len() && !g.grow(needed) {
            return false;
        }
        let at = g.read + position;
        let write = g.write;
        g.data.copy_within(at..write, at + size);
        g.data[at..at + size].copy_from_slice(bytes);
        g.write += size;
        true
    }

    /// Consume and return one delimited line, without the delimiter.
    /// Nothing is consumed when the delimiter is absent.
    pub fn get_line(&self, delim: &str) -> Option<String> {
        let delim = delim.as_bytes();
        if delim.is_empty() {
            return None;
        }
        let mut g = self.lock();
        let region = &g.data[g.read..g.write];
        let at = region
            .windows(delim.len())
            .position(|window| window == delim)?;
        let line = String::from_utf8_lossy(&region[..at]).into_owned();
        g.read += at + delim.len();
        Some(line)
    }

    /// Fixed-width big-endian reads. `None` when not enough bytes are
    /// readable; the cursor is untouched in that case.
    pub fn read_u8(&self) -> Option<u8> {
        self.read_value(1).map(|v| v as u8)
    }

    pub fn read_u16(&self) -> Option<u16> {
        self.read_value(2).map(|v| v as u16)
    }

    pub fn read_u32(&self) -> Option<u32> {
        self.read_value(4).map(|v| v as u32)
    }

    pub fn read_u64(&self) -> Option<u64> {
        self.read_value(8)
    }

    /// Fixed-width big-endian writes. All-or-nothing: when the value does
    /// not fit within the limit, nothing is written.
    pub fn write_u8(&self, value: u8) {
        self.write_value(u64::from(value), 1);
    }

    pub fn write_u16(&self, value: u16) {
        self.write_value(u64::from(value), 2);
    }

    pub fn write_u32(&self, value: u32) {
        self.write_value(u64::from(value), 4);
    }

    pub fn write_u64(&self, value: u64) {
        self.write_value(value, 8);
    }

    fn read_value(&self, size: usize) -> Option<u64> {
        let mut g = self.lock();
        if g.readable() < size {
            return None;
        }
        let mut value = 0u64;
        for i in 0..size {
            value = (value << 8) | u64::from(g.data[g.read + i]);
        }
        g.read += size;
        Some(value)
    }

    fn write_value(&self, value: u64, size: usize) {
        let mut g = self.lock();
        if g.writable() < size {
            return;
        }
        let needed = g.write + size;
        if needed > g.data.len() && !g.grow(needed) {
            return;
        }
        for i in (0..size).rev() {
            let write = g.write;
            g.data[write] = ((value >> (i * 8)) & 0xff) as u8;
            g.write += 1;
        }
    }

    /// Copy of the readable region.
    pub fn to_vec(&self) -> Vec<u8> {
        let g = self.lock();
        g.data[g.read..g.write].to_vec()
    }

    /// Readable region as text, with invalid UTF-8 replaced.
    pub fn to_string_lossy(&self) -> String {
        let g = self.lock();
        String::from_utf8_lossy(&g.data[g.read..g.write]).into_owned()
    }
}

impl Default for ByteBuf {
    fn default() -> Self {
        Self::new()
    }
}

fn transfer(src: &mut Inner, dst: &mut Inner, size: Option<usize>) -> usize {
    let mut length = src.readable().min(dst.writable());
    if let Some(size) = size {
        length = length.min(size);
    }
    if length == 0 {
        return 0;
    }
    if dst.write + length > dst.data.len() && !dst.grow(dst.write + length) {
        return 0;
    }
    dst.data[dst.write..dst.write + length]
        .copy_from_slice(&src.data[src.read..src.read + length]);
    dst.write += length;
    src.read += length;
    length
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let buf = ByteBuf::new();
        assert_eq!(buf.write_bytes(b"hello world"), 11);
        assert_eq!(buf.readable_bytes(), 11);

        let mut out = [0u8; 5];
        assert_eq!(buf.read_bytes(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(buf.readable_bytes(), 6);
        assert_eq!(buf.to_vec(), b" world");
    }

    #[test]
    fn test_saturating_write_at_limit() {
        let buf = ByteBuf::with_limit(8);
        assert_eq!(buf.write_bytes(b"0123456789"), 8);
        assert_eq!(buf.writable_bytes(), 0);
        assert_eq!(buf.write_bytes(b"x"), 0);
        assert_eq!(buf.to_vec(), b"01234567");
    }

    #[test]
    fn test_growth_capped_at_limit() {
        let buf = ByteBuf::with_capacity(4, 10);
        assert_eq!(buf.allocated(), 4);

        // 1.5x steps: 4 -> 6 -> 9, then capped at 10
        buf.write_bytes(b"01234");
        assert_eq!(buf.allocated(), 6);
        buf.write_bytes(b"56789");
        assert_eq!(buf.allocated(), 10);
        assert_eq!(buf.readable_bytes(), 10);
    }

    #[test]
    fn test_clones_share_cursors() {
        let a = ByteBuf::new();
        let b = a.clone();

        a.write_bytes(b"abc");
        assert_eq!(b.readable_bytes(), 3);

        let mut out = [0u8; 1];
        b.read_bytes(&mut out);
        assert_eq!(a.readable_bytes(), 2);

        b.clear();
        assert_eq!(a.readable_bytes(), 0);
    }

    #[test]
    fn test_self_transfer_is_noop() {
        let a = ByteBuf::new();
        let b = a.clone();
        a.write_bytes(b"data");
        assert_eq!(a.read_into(&b, None), 0);
        assert_eq!(a.readable_bytes(), 4);
    }

    #[test]
    fn test_transfer_consumes_source() {
        let src = ByteBuf::new();
        let dst = ByteBuf::with_limit(3);
        src.write_bytes(b"abcdef");

        assert_eq!(dst.write_from(&src, None), 3);
        assert_eq!(dst.to_vec(), b"abc");
        assert_eq!(src.to_vec(), b"def");

        assert_eq!(src.read_into(&dst, Some(2)), 0); // dst full
        dst.clear();
        assert_eq!(src.read_into(&dst, Some(2)), 2);
        assert_eq!(dst.to_vec(), b"de");
        assert_eq!(src.to_vec(), b"f");
    }

    #[test]
    fn test_network_byte_order() {
        let buf = ByteBuf::new();
        buf.write_u8(0x12);
        buf.write_u16(0x3456);
        buf.write_u32(0x789abcde);
        buf.write_u64(0x0102030405060708);

        assert_eq!(
            buf.to_vec(),
            vec![
                0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06,
                0x07, 0x08
            ]
        );

        assert_eq!(buf.read_u8(), Some(0x12));
        assert_eq!(buf.read_u16(), Some(0x3456));
        assert_eq!(buf.read_u32(), Some(0x789abcde));
        assert_eq!(buf.read_u64(), Some(0x0102030405060708));
        assert_eq!(buf.read_u8(), None);
    }

    #[test]
    fn test_fixed_width_reads_need_full_value() {
        let buf = ByteBuf::new();
        buf.write_u8(0xab);
        assert_eq!(buf.read_u16(), None);
        assert_eq!(buf.readable_bytes(), 1); // cursor untouched
        assert_eq!(buf.read_u8(), Some(0xab));
    }

    #[test]
    fn test_fixed_width_write_all_or_nothing() {
        let buf = ByteBuf::with_limit(3);
        buf.write_u32(0xdeadbeef);
        assert_eq!(buf.readable_bytes(), 0);
        buf.write_u16(0xbeef);
        assert_eq!(buf.to_vec(), vec![0xbe, 0xef]);
    }

    #[test]
    fn test_get_line() {
        let buf = ByteBuf::new();
        buf.write_bytes(b"GET / HTTP/1.1\r\nHost: example");

        assert_eq!(buf.get_line("\r\n").as_deref(), Some("GET / HTTP/1.1"));
        // partial line stays put
        assert_eq!(buf.get_line("\r\n"), None);
        assert_eq!(buf.to_vec(), b"Host: example");

        buf.write_bytes(b"\r\n");
        assert_eq!(buf.get_line("\r\n").as_deref(), Some("Host: example"));
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_insert_write_bytes() {
        let buf = ByteBuf::new();
        buf.write_bytes(b"hd");
        let mut out = [0u8; 1];
        buf.read_bytes(&mut out); // read cursor now past 'h'

        assert!(buf.insert_write_bytes(0, b"abc"));
        assert_eq!(buf.to_vec(), b"abcd");

        assert!(buf.insert_write_bytes(4, b"!"));
        assert_eq!(buf.to_vec(), b"abcd!");

        // out of range position
        assert!(!buf.insert_write_bytes(9, b"x"));
        // no room
        let tight = ByteBuf::with_limit(2);
        tight.write_bytes(b"ab");
        assert!(!tight.insert_write_bytes(0, b"c"));
    }

    #[test]
    fn test_insert_and_fixed_width_writes_grow_storage() {
        let buf = ByteBuf::with_capacity(2, 64);
        buf.write_bytes(b"ab");
        assert!(buf.insert_write_bytes(1, b"xyz"));
        assert_eq!(buf.to_vec(), b"axyzb");

        let buf = ByteBuf::with_capacity(2, 64);
        buf.write_u64(0x0102030405060708);
        assert_eq!(buf.readable_bytes(), 8);
        assert!(buf.allocated() >= 8);
    }

    #[test]
    fn test_skip_and_peek() {
        let buf = ByteBuf::from_slice(b"abcdef");
        assert_eq!(buf.skip_bytes(2), 2);

        let mut out = [0u8; 8];
        assert_eq!(buf.peek_bytes(&mut out), 4);
        assert_eq!(&out[..4], b"cdef");
        assert_eq!(buf.readable_bytes(), 4); // peek does not consume

        assert_eq!(buf.skip_bytes(100), 4);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_clear_resets_cursors() {
        let buf = ByteBuf::with_limit(4);
        buf.write_bytes(b"abcd");
        buf.skip_bytes(4);
        assert_eq!(buf.writable_bytes(), 0);

        buf.clear();
        assert_eq!(buf.writable_bytes(), 4);
        assert_eq!(buf.write_bytes(b"ef"), 2);
        assert_eq!(buf.to_vec(), b"ef");
    }
}
