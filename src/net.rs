/// A reactor-based event base that provides readiness and timer notifications.
/// This module implements a single-threaded event loop using mio for handling non-blocking TCP connections.
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Token};

use crate::error::{ReactorError, ReactorResult};

/// Token reserved for the cross-thread waker of every reactor.
pub const WAKE_TOKEN: Token = Token(0);

/// The I/O direction an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

/// Which phase timer of a connection a [`TimerKey`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    Read,
    Write,
}

/// Identifies a one-shot timer registered with an event base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey {
    pub token: Token,
    pub kind: TimerKind,
}

impl TimerKey {
    pub fn new(token: Token, kind: TimerKind) -> Self {
        Self { token, kind }
    }
}

/// The registration contract a connection needs from its event loop.
///
/// Registrations are non-owning: the event base only remembers tokens and
/// keys, and every removal is idempotent.
pub trait EventBase {
    /// Starts delivering readiness in `direction` for `token`.
    fn add_event(&mut self, token: Token, direction: Direction);

    /// Stops delivering readiness in `direction` for `token`. Removing an
    /// event that is not registered is a no-op.
    fn remove_event(&mut self, token: Token, direction: Direction);

    /// Arms a one-shot timer that fires once after `after`. Adding a key that
    /// is already armed replaces its deadline.
    fn add_timer(&mut self, key: TimerKey, after: Duration);

    /// Disarms a timer. Disarming an unarmed timer is a no-op.
    fn remove_timer(&mut self, key: TimerKey);

    /// Records that I/O in `direction` hit `WouldBlock`, so readiness must
    /// be re-reported by the OS before it is delivered again.
    fn clear_readiness(&mut self, token: Token, direction: Direction);

    /// Deregisters both directions of `token`.
    fn clean_rw_event(&mut self, token: Token) {
        self.remove_event(token, Direction::Read);
        self.remove_event(token, Direction::Write);
    }
}

/// What a call to [`Reactor::turn`] produced for the owner to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// `token` is ready in `direction` and interest is registered
    Ready { token: Token, direction: Direction },
    /// The timer named by the key expired
    Timer(TimerKey),
    /// Another thread signalled the reactor's waker
    Wake,
}

/// Per-socket interest and edge state.
///
/// Sockets are registered edge-triggered for both directions, so the
/// reactor remembers which edges have been seen (`triggered`) until the
/// owner reports `WouldBlock`, and only reports them while `interest` is set.
#[derive(Debug, Default)]
struct Source {
    interest: [bool; 2],
    triggered: [bool; 2],
}

/// The main reactor type that manages non-blocking I/O readiness and timers.
///
/// One reactor is driven by exactly one thread, so every notification for a
/// token is dispatched sequentially.
pub struct Reactor {
    poll: mio::Poll,
    events: Events,
    waker: Arc<mio::Waker>,
    /// Map of active I/O sources indexed by their tokens
    sources: HashMap<Token, Source>,
    /// Deadline queue; the sequence number breaks ties between equal instants
    timers: BTreeMap<(Instant, u64), TimerKey>,
    deadlines: HashMap<TimerKey, (Instant, u64)>,
    seq: u64,
    next_token: usize,
}

impl Reactor {
    /// Creates a new reactor instance.
    ///
    /// # Errors
    /// - Returns `ReactorError::Init` if the poller or its waker cannot be created
    pub fn new() -> ReactorResult<Self> {
        let poll = mio::Poll::new().map_err(ReactorError::Init)?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN).map_err(ReactorError::Init)?;

        Ok(Reactor {
            poll,
            events: Events::with_capacity(256),
            waker: Arc::new(waker),
            sources: HashMap::with_capacity(64),
            timers: BTreeMap::new(),
            deadlines: HashMap::new(),
            seq: 0,
            next_token: WAKE_TOKEN.0 + 1,
        })
    }

    /// A handle other threads use to interrupt [`turn`](Self::turn).
    pub fn waker(&self) -> Arc<mio::Waker> {
        self.waker.clone()
    }

    /// Registers a socket for edge-triggered readiness in both directions.
    ///
    /// No readiness is delivered until interest is added with
    /// [`EventBase::add_event`]. The first turn after registration re-checks
    /// both directions, so data that arrived before registration is not lost.
    ///
    /// # Errors
    /// - Returns `ReactorError::Registration` if the socket cannot be registered
    pub fn register<S>(&mut self, source: &mut S) -> ReactorResult<Token>
    where
        S: mio::event::Source + ?Sized,
    {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(source, token, Interest::READABLE | Interest::WRITABLE)
            .map_err(ReactorError::Registration)?;

        self.sources.insert(
            token,
            Source {
                interest: [false, false],
                triggered: [true, true],
            },
        );
        Ok(token)
    }

    /// Registers a listening socket; accept readiness is reported as `Read`.
    pub fn register_listener(&mut self, listener: &mut mio::net::TcpListener) -> ReactorResult<Token> {
        let token = self.register(listener)?;
        self.add_event(token, Direction::Read);
        Ok(token)
    }

    /// Forgets a token entirely. The socket itself is deregistered by the OS
    /// when its fd is closed.
    pub fn forget(&mut self, token: Token) {
        self.sources.remove(&token);
    }

    /// Number of registered sockets.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Number of armed timers.
    pub fn timer_count(&self) -> usize {
        self.deadlines.len()
    }

    /// Runs one iteration of the event loop.
    ///
    /// Blocks until a socket becomes ready, the nearest timer expires, the
    /// waker is signalled, or `max_wait` elapses. Notifications are appended
    /// to `out` in the order: wakes, timer expiries, readiness.
    ///
    /// # Errors
    /// - Returns `ReactorError::Polling` if the poller fails; interrupted
    ///   system calls are not errors
    pub fn turn(&mut self, max_wait: Option<Duration>, out: &mut Vec<Notification>) -> ReactorResult<()> {
        let timeout = self.poll_timeout(max_wait);

        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() != io::ErrorKind::Interrupted {
                log::error!("Polling error: {}", err);
                return Err(ReactorError::Polling(err));
            }
        }

        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                out.push(Notification::Wake);
                continue;
            }

            let source = match self.sources.get_mut(&event.token()) {
                Some(source) => source,
                None => continue,
            };

            // errors and hang-ups surface through the next read/write attempt
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                source.triggered[Direction::Read.index()] = true;
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                source.triggered[Direction::Write.index()] = true;
            }
        }
        self.events.clear();

        self.expire_timers(Instant::now(), out);

        for (&token, source) in &self.sources {
            for direction in [Direction::Read, Direction::Write] {
                let i = direction.index();
                if source.interest[i] && source.triggered[i] {
                    out.push(Notification::Ready { token, direction });
                }
            }
        }

        Ok(())
    }

    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        let pending = self
            .sources
            .values()
            .any(|s| (s.interest[0] && s.triggered[0]) || (s.interest[1] && s.triggered[1]));
        if pending {
            return Some(Duration::ZERO);
        }

        let next_timer = self
            .timers
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()));

        match (next_timer, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn expire_timers(&mut self, now: Instant, out: &mut Vec<Notification>) {
        while let Some((&(deadline, seq), &key)) = self.timers.iter().next() {
            if deadline > now {
                break;
            }
            self.timers.remove(&(deadline, seq));
            self.deadlines.remove(&key);
            out.push(Notification::Timer(key));
        }
    }
}

impl EventBase for Reactor {
    fn add_event(&mut self, token: Token, direction: Direction) {
        match self.sources.get_mut(&token) {
            Some(source) => source.interest[direction.index()] = true,
            None => log::warn!("add_event on unregistered token {:?}", token),
        }
    }

    fn remove_event(&mut self, token: Token, direction: Direction) {
        if let Some(source) = self.sources.get_mut(&token) {
            source.interest[direction.index()] = false;
        }
    }

    fn add_timer(&mut self, key: TimerKey, after: Duration) {
        self.remove_timer(key);
        let deadline = Instant::now() + after;
        self.seq += 1;
        self.timers.insert((deadline, self.seq), key);
        self.deadlines.insert(key, (deadline, self.seq));
    }

    fn remove_timer(&mut self, key: TimerKey) {
        if let Some(slot) = self.deadlines.remove(&key) {
            self.timers.remove(&slot);
        }
    }

    fn clear_readiness(&mut self, token: Token, direction: Direction) {
        if let Some(source) = self.sources.get_mut(&token) {
            source.triggered[direction.index()] = false;
        }
    }
}
