//! In-memory event base and stream used to drive connections in unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Duration;

use mio::Token;

use crate::net::{Direction, EventBase, TimerKey};

/// Event base with a virtual clock that records every registration.
#[derive(Debug, Default)]
pub(crate) struct MockBase {
    pub now: Duration,
    /// Armed timers and their absolute virtual deadlines
    pub timers: HashMap<TimerKey, Duration>,
    pub interest: HashSet<(Token, Direction)>,
    pub cleared: Vec<(Token, Direction)>,
}

impl MockBase {
    pub fn deadline(&self, key: TimerKey) -> Option<Duration> {
        self.timers.get(&key).copied()
    }

    pub fn has_event(&self, token: Token, direction: Direction) -> bool {
        self.interest.contains(&(token, direction))
    }

    /// Moves the clock forward and returns the timers that expired, in
    /// deadline order.
    pub fn advance(&mut self, by: Duration) -> Vec<TimerKey> {
        self.now += by;
        let now = self.now;
        let mut expired: Vec<(Duration, TimerKey)> = self
            .timers
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(&key, &deadline)| (deadline, key))
            .collect();
        expired.sort();
        for (_, key) in &expired {
            self.timers.remove(key);
        }
        expired.into_iter().map(|(_, key)| key).collect()
    }
}

impl EventBase for MockBase {
    fn add_event(&mut self, token: Token, direction: Direction) {
        self.interest.insert((token, direction));
    }

    fn remove_event(&mut self, token: Token, direction: Direction) {
        self.interest.remove(&(token, direction));
    }

    fn add_timer(&mut self, key: TimerKey, after: Duration) {
        self.timers.insert(key, self.now + after);
    }

    fn remove_timer(&mut self, key: TimerKey) {
        self.timers.remove(&key);
    }

    fn clear_readiness(&mut self, token: Token, direction: Direction) {
        self.cleared.push((token, direction));
    }
}

#[derive(Debug, Default)]
struct StreamState {
    incoming: VecDeque<Vec<u8>>,
    eof: bool,
    read_error: Option<io::ErrorKind>,
    written: Vec<u8>,
    write_capacity: Option<usize>,
    write_error: Option<io::ErrorKind>,
}

/// A scripted non-blocking stream. Clones share state, so a test keeps one
/// handle while the connection owns another.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockStream {
    state: Rc<RefCell<StreamState>>,
}

impl MockStream {
    /// Queues bytes that become readable as one delivery.
    pub fn feed(&self, bytes: &[u8]) {
        self.state.borrow_mut().incoming.push_back(bytes.to_vec());
    }

    /// Signals that the peer closed its write side.
    pub fn close(&self) {
        self.state.borrow_mut().eof = true;
    }

    pub fn fail_read(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().read_error = Some(kind);
    }

    pub fn fail_write(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().write_error = Some(kind);
    }

    /// Limits how many more bytes are accepted before writes block.
    /// `None` accepts everything.
    pub fn set_write_capacity(&self, capacity: Option<usize>) {
        self.state.borrow_mut().write_capacity = capacity;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.state.borrow().written).into_owned()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().written)
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.read_error.take() {
            return Err(io::Error::from(kind));
        }
        match state.incoming.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    state.incoming.push_front(chunk.split_off(n));
                }
                Ok(n)
            }
            None if state.eof => Ok(0),
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.write_error.take() {
            return Err(io::Error::from(kind));
        }
        let n = match state.write_capacity {
            Some(0) => return Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Some(capacity) => capacity.min(buf.len()),
            None => buf.len(),
        };
        if let Some(capacity) = state.write_capacity.as_mut() {
            *capacity -= n;
        }
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
