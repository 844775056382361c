//! Growable byte buffer used for connection input/output and message bodies.

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::BufferError;

/// A growable byte sequence with append, consume-from-front and line reading.
///
/// Each buffer has exactly one owner: the input or output side of a
/// connection, or the body of a message.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self { inner: BytesMut::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { inner: BytesMut::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.inner.extend_from_slice(bytes);
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Discards `n` bytes from the front.
    pub fn consume(&mut self, n: usize) -> Result<(), BufferError> {
        self.check(n)?;
        self.inner.advance(n);
        Ok(())
    }

    /// Removes and returns the first `n` bytes.
    pub fn split_to(&mut self, n: usize) -> Result<Bytes, BufferError> {
        self.check(n)?;
        Ok(self.inner.split_to(n).freeze())
    }

    /// Pops one line off the front of the buffer.
    ///
    /// Lines end in LF or CRLF; the terminator is consumed but not returned.
    /// Returns `None` without consuming anything when no terminator has
    /// arrived yet.
    pub fn read_line(&mut self) -> Option<Bytes> {
        let lf = self.inner.iter().position(|&b| b == b'\n')?;
        let mut line = self.inner.split_to(lf + 1);
        line.truncate(lf);
        if line.last() == Some(&b'\r') {
            line.truncate(lf - 1);
        }
        Some(line.freeze())
    }

    /// Moves bytes from the front of `self` to the back of `other`.
    ///
    /// `None` moves everything. Returns the number of bytes moved.
    pub fn drain_into(&mut self, other: &mut Buffer, n: Option<usize>) -> Result<usize, BufferError> {
        let n = n.unwrap_or(self.len());
        self.check(n)?;
        Ok(self.move_into(other, n))
    }

    /// Takes the whole content, leaving the buffer empty.
    pub fn take(&mut self) -> Bytes {
        self.inner.split().freeze()
    }

    pub fn reset(&mut self) {
        self.inner.clear();
    }

    /// Discards up to `n` bytes from the front.
    pub(crate) fn advance(&mut self, n: usize) {
        let n = n.min(self.inner.len());
        self.inner.advance(n);
    }

    /// Moves up to `n` bytes to the back of `other`; returns how many moved.
    pub(crate) fn move_into(&mut self, other: &mut Buffer, n: usize) -> usize {
        let n = n.min(self.inner.len());
        if other.is_empty() && n == self.len() {
            std::mem::swap(&mut self.inner, &mut other.inner);
        } else {
            other.inner.extend_from_slice(&self.inner[..n]);
            self.inner.advance(n);
        }
        n
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.inner
    }

    fn check(&self, requested: usize) -> Result<(), BufferError> {
        if requested > self.inner.len() {
            return Err(BufferError::Underflow { requested, available: self.inner.len() });
        }
        Ok(())
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self { inner: BytesMut::from(bytes) }
    }
}

impl From<&str> for Buffer {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl From<String> for Buffer {
    fn from(s: String) -> Self {
        Self::from(s.as_bytes())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self { inner: BytesMut::from(&bytes[..]) }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_line_crlf_and_lf() {
        let mut buf = Buffer::from("GET / HTTP/1.1\r\nHost: a\nrest");

        assert_eq!(&buf.read_line().unwrap()[..], b"GET / HTTP/1.1");
        assert_eq!(&buf.read_line().unwrap()[..], b"Host: a");
        assert!(buf.read_line().is_none());
        assert_eq!(buf.as_bytes(), b"rest");
    }

    #[test]
    fn test_read_line_waits_for_terminator() {
        let mut buf = Buffer::from("partial\r");
        assert!(buf.read_line().is_none());
        assert_eq!(buf.len(), 8);

        buf.append(b"\n");
        assert_eq!(&buf.read_line().unwrap()[..], b"partial");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_line() {
        let mut buf = Buffer::from("\r\n\n");
        assert!(buf.read_line().unwrap().is_empty());
        assert!(buf.read_line().unwrap().is_empty());
        assert!(buf.read_line().is_none());
    }

    #[test]
    fn test_consume_more_than_available_is_an_error() {
        let mut buf = Buffer::from("abc");

        assert_eq!(buf.consume(4), Err(BufferError::Underflow { requested: 4, available: 3 }));
        assert_eq!(buf.len(), 3);
        assert!(buf.consume(2).is_ok());
        assert_eq!(buf.as_bytes(), b"c");
    }

    #[test]
    fn test_drain_into() {
        let mut src = Buffer::from("hello world");
        let mut dst = Buffer::from(">");

        assert_eq!(src.drain_into(&mut dst, Some(5)).unwrap(), 5);
        assert_eq!(dst.as_bytes(), b">hello");
        assert_eq!(src.as_bytes(), b" world");

        assert_eq!(src.drain_into(&mut dst, None).unwrap(), 6);
        assert_eq!(dst.as_bytes(), b">hello world");
        assert!(src.is_empty());

        assert!(src.drain_into(&mut dst, Some(1)).is_err());
    }

    #[test]
    fn test_drain_all_into_empty_buffer() {
        let mut src = Buffer::from("payload");
        let mut dst = Buffer::new();

        src.drain_into(&mut dst, None).unwrap();
        assert!(src.is_empty());
        assert_eq!(dst.as_bytes(), b"payload");
    }

    #[test]
    fn test_advance_and_move_clamp_to_length() {
        let mut src = Buffer::from("abcdef");
        let mut dst = Buffer::from("_");

        src.advance(2);
        assert_eq!(src.as_bytes(), b"cdef");
        assert_eq!(src.move_into(&mut dst, 3), 3);
        assert_eq!(dst.as_bytes(), b"_cde");

        assert_eq!(src.move_into(&mut dst, 10), 1);
        src.advance(5);
        assert!(src.is_empty());
        assert_eq!(dst.as_bytes(), b"_cdef");
    }
}
