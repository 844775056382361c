//! Socket wrapper pairing an input and an output [`Buffer`] with readiness
//! translation.

use std::io::{self, Read, Write};

use mio::Token;

use crate::buffer::Buffer;
use crate::net::{Direction, EventBase};

const READ_CHUNK: usize = 16 * 1024;

/// Upper bound on bytes pulled off one socket per readiness notification,
/// so one busy peer cannot starve the rest of the reactor.
const MAX_READ_PER_EVENT: usize = 256 * 1024;

/// What a [`BufferEvent::fill`] call observed.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Bytes appended to the input buffer
    pub read: usize,
    /// The peer closed its write side
    pub eof: bool,
    pub error: Option<io::Error>,
}

/// What a [`BufferEvent::flush`] call observed.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The output buffer is empty
    Drained,
    /// The socket stopped accepting bytes; wait for the next writable edge
    Pending,
    Failed(io::Error),
}

/// A buffered connection: one stream, its input buffer and its output buffer.
///
/// Not `Clone`; exactly one owner drives it. Dropping the stream closes the
/// fd, which also removes it from the OS poller.
#[derive(Debug)]
pub struct BufferEvent<S> {
    token: Token,
    stream: Option<S>,
    input: Buffer,
    output: Buffer,
}

impl<S: Read + Write> BufferEvent<S> {
    pub fn new(token: Token, stream: S) -> Self {
        Self {
            token,
            stream: Some(stream),
            input: Buffer::with_capacity(READ_CHUNK),
            output: Buffer::new(),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn input(&self) -> &Buffer {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Buffer {
        &mut self.input
    }

    pub fn output(&self) -> &Buffer {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut Buffer {
        &mut self.output
    }

    pub fn ibuf_len(&self) -> usize {
        self.input.len()
    }

    pub fn obuf_len(&self) -> usize {
        self.output.len()
    }

    pub fn add_read_event<B: EventBase>(&self, base: &mut B) {
        base.add_event(self.token, Direction::Read);
    }

    pub fn remove_read_event<B: EventBase>(&self, base: &mut B) {
        base.remove_event(self.token, Direction::Read);
    }

    pub fn add_write_event<B: EventBase>(&self, base: &mut B) {
        base.add_event(self.token, Direction::Write);
    }

    pub fn remove_write_event<B: EventBase>(&self, base: &mut B) {
        base.remove_event(self.token, Direction::Write);
    }

    /// Reads everything currently available into the input buffer.
    ///
    /// Stops at `WouldBlock`, EOF, an error, or after
    /// `MAX_READ_PER_EVENT` bytes; in the last case readiness stays set and
    /// the reactor delivers it again on its next turn. Read interest is
    /// dropped on EOF and on error.
    pub fn fill<B: EventBase>(&mut self, base: &mut B) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return outcome,
        };

        let mut chunk = [0u8; READ_CHUNK];
        while outcome.read < MAX_READ_PER_EVENT {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    outcome.eof = true;
                    base.remove_event(self.token, Direction::Read);
                    break;
                }
                Ok(n) => {
                    self.input.append(&chunk[..n]);
                    outcome.read += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    base.clear_readiness(self.token, Direction::Read);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    base.remove_event(self.token, Direction::Read);
                    outcome.error = Some(e);
                    break;
                }
            }
        }

        log::trace!("fd {:?}: read {} bytes (eof={})", self.token, outcome.read, outcome.eof);
        outcome
    }

    /// Writes as much of the output buffer as the socket accepts.
    pub fn flush<B: EventBase>(&mut self, base: &mut B) -> WriteOutcome {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return WriteOutcome::Failed(io::Error::from(io::ErrorKind::NotConnected)),
        };

        while !self.output.is_empty() {
            match stream.write(self.output.as_bytes()) {
                Ok(0) => return WriteOutcome::Failed(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    log::trace!("fd {:?}: wrote {} bytes", self.token, n);
                    self.output.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    base.clear_readiness(self.token, Direction::Write);
                    return WriteOutcome::Pending;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return WriteOutcome::Failed(e),
            }
        }
        WriteOutcome::Drained
    }

    /// Deregisters both directions and closes the stream.
    pub fn close<B: EventBase>(&mut self, base: &mut B) {
        base.clean_rw_event(self.token);
        self.stream = None;
    }

    /// Attaches a fresh stream under a new token, e.g. after [`reset`](Self::reset).
    pub fn attach(&mut self, token: Token, stream: S) {
        self.token = token;
        self.stream = Some(stream);
    }

    /// Clears both buffers.
    pub fn reset(&mut self) {
        self.input.reset();
        self.output.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBase, MockStream};

    #[test]
    fn test_fill_reads_until_would_block() {
        let stream = MockStream::default();
        let mut bev = BufferEvent::new(Token(1), stream.clone());
        let mut base = MockBase::default();

        stream.feed(b"abc");
        stream.feed(b"def");
        let outcome = bev.fill(&mut base);

        assert_eq!(outcome.read, 6);
        assert!(!outcome.eof);
        assert_eq!(bev.input().as_bytes(), b"abcdef");
        assert_eq!(base.cleared, vec![(Token(1), Direction::Read)]);
    }

    #[test]
    fn test_fill_reports_eof_and_drops_read_interest() {
        let stream = MockStream::default();
        let mut bev = BufferEvent::new(Token(1), stream.clone());
        let mut base = MockBase::default();
        bev.add_read_event(&mut base);

        stream.feed(b"tail");
        stream.close();
        let outcome = bev.fill(&mut base);

        assert_eq!(outcome.read, 4);
        assert!(outcome.eof);
        assert!(!base.has_event(Token(1), Direction::Read));
    }

    #[test]
    fn test_fill_surfaces_errors() {
        let stream = MockStream::default();
        let mut bev = BufferEvent::new(Token(1), stream.clone());
        let mut base = MockBase::default();

        stream.fail_read(io::ErrorKind::ConnectionReset);
        let outcome = bev.fill(&mut base);
        assert_eq!(outcome.error.unwrap().kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_flush_stops_on_backpressure() {
        let stream = MockStream::default();
        let mut bev = BufferEvent::new(Token(4), stream.clone());
        let mut base = MockBase::default();

        stream.set_write_capacity(Some(3));
        bev.output_mut().append(b"hello");
        assert!(matches!(bev.flush(&mut base), WriteOutcome::Pending));
        assert_eq!(stream.written(), b"hel");
        assert_eq!(bev.obuf_len(), 2);

        stream.set_write_capacity(None);
        assert!(matches!(bev.flush(&mut base), WriteOutcome::Drained));
        assert_eq!(stream.written(), b"hello");
    }

    #[test]
    fn test_close_deregisters_and_drops_stream() {
        let mut bev = BufferEvent::new(Token(2), MockStream::default());
        let mut base = MockBase::default();
        bev.add_read_event(&mut base);
        bev.add_write_event(&mut base);

        bev.close(&mut base);
        assert!(!bev.is_open());
        assert!(base.interest.is_empty());
        assert!(matches!(bev.flush(&mut base), WriteOutcome::Failed(_)));
    }
}
