//! The per-connection HTTP/1.x state machine.
//!
//! A connection is driven entirely by the notifications its owner forwards:
//! readiness in either direction and expiry of its read or write timer. Each
//! handler runs the machine until it has to wait for the socket again, so
//! nothing ever blocks and no step recurses into another.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use mio::Token;

use crate::buffer_event::{BufferEvent, WriteOutcome};
use crate::config::ServerConfig;
use crate::error::HttpError;
use crate::http::chunked::ChunkStatus;
use crate::http::message::{Message, MessageKind, ReadStatus, TransferMode, Version};
use crate::http::reply::{write_bad_request, Deferred, Exchange, Reply, ReplyQueue};
use crate::net::{EventBase, TimerKey, TimerKind};
use crate::server::{ConnectionInfo, Service};
use crate::timer::Timer;

const CONTINUE_REPLY: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket attached, or reset for reuse
    Disconnected,
    /// Outgoing connect in progress
    Connecting,
    /// Connected with nothing in flight
    Idle,
    ReadingFirstLine,
    ReadingHeaders,
    ReadingBody,
    ReadingTrailer,
    /// Flushing a request (client), or a reply that may still be
    /// producing output (server)
    Writing,
    Closed,
}

impl ConnectionState {
    fn is_reading(self) -> bool {
        matches!(
            self,
            ConnectionState::ReadingFirstLine
                | ConnectionState::ReadingHeaders
                | ConnectionState::ReadingBody
                | ConnectionState::ReadingTrailer
        )
    }
}

/// Limits and policies applied to every message on a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Inactivity timeout for each read and write phase; zero disables it
    pub timeout: Duration,
    /// Bound on the first line and on each header or trailer block
    pub max_header_size: usize,
    pub max_body_size: u64,
    /// Whether the server may keep connections open between requests
    pub keep_alive: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_header_size: 8192,
            max_body_size: 16 * 1024 * 1024,
            keep_alive: true,
        }
    }
}

impl From<&ServerConfig> for ConnectionOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_header_size: config.max_header_size,
            max_body_size: config.max_body_size,
            keep_alive: config.keep_alive,
        }
    }
}

enum Role {
    /// Accepted socket; complete requests are handed to the service
    Server(Arc<dyn Service>),
    /// Outgoing socket; complete responses are queued for the owner
    Client,
}

/// Whether the machine can keep going or must wait for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Suspend,
}

/// One HTTP/1.x connection over a non-blocking stream.
///
/// Messages are handled strictly in order: the message at the head of the
/// queue is the only one being read or written.
pub struct HttpConnection<S> {
    bev: BufferEvent<S>,
    state: ConnectionState,
    role: Role,
    info: ConnectionInfo,
    options: ConnectionOptions,
    read_timer: Timer,
    write_timer: Timer,
    requests: VecDeque<Message>,
    /// Client requests waiting for the previous exchange to finish
    outgoing: VecDeque<Message>,
    /// Client responses ready for the owner
    completed: VecDeque<Message>,
    /// Reply to the request at the head of `requests`
    reply: Reply,
    close_after_write: bool,
    /// The peer closed its side; buffered requests are still answered
    peer_closed: bool,
    error: Option<HttpError>,
}

impl<S: Read + Write> HttpConnection<S> {
    /// Wraps an accepted socket. Call [`serve`](Self::serve) to start reading.
    pub fn server(
        token: Token,
        stream: S,
        info: ConnectionInfo,
        service: Arc<dyn Service>,
        options: ConnectionOptions,
    ) -> Self {
        Self::with_role(token, stream, info, Role::Server(service), options)
    }

    /// Wraps a socket with a connect in flight. Call
    /// [`connect`](Self::connect) to wait for it.
    pub fn client(token: Token, stream: S, info: ConnectionInfo, options: ConnectionOptions) -> Self {
        Self::with_role(token, stream, info, Role::Client, options)
    }

    fn with_role(token: Token, stream: S, info: ConnectionInfo, role: Role, options: ConnectionOptions) -> Self {
        Self {
            bev: BufferEvent::new(token, stream),
            state: ConnectionState::Disconnected,
            role,
            info,
            options,
            read_timer: Timer::new(TimerKey::new(token, TimerKind::Read)),
            write_timer: Timer::new(TimerKey::new(token, TimerKind::Write)),
            requests: VecDeque::new(),
            outgoing: VecDeque::new(),
            completed: VecDeque::new(),
            reply: Reply::new(token, Arc::new(ReplyQueue::new())),
            close_after_write: false,
            peer_closed: false,
            error: None,
        }
    }

    /// Routes commands from deferred replies through `queue`, normally one
    /// shared by every connection of a worker.
    pub fn with_reply_queue(mut self, queue: Arc<ReplyQueue>) -> Self {
        self.reply.set_queue(queue);
        self
    }

    pub fn token(&self) -> Token {
        self.bev.token()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// The error that closed the connection, if any.
    pub fn error(&self) -> Option<&HttpError> {
        self.error.as_ref()
    }

    pub fn ibuf_len(&self) -> usize {
        self.bev.ibuf_len()
    }

    pub fn obuf_len(&self) -> usize {
        self.bev.obuf_len()
    }

    /// Number of messages queued on the connection.
    pub fn pending_messages(&self) -> usize {
        self.requests.len() + self.outgoing.len()
    }

    /// The message currently being read, e.g. to [`cancel`](Message::cancel) it.
    pub fn current_message_mut(&mut self) -> Option<&mut Message> {
        self.requests.front_mut()
    }

    /// Responses received so far, oldest first.
    pub fn take_completed(&mut self) -> Vec<Message> {
        self.completed.drain(..).collect()
    }

    fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    /// Starts reading the first request off an accepted socket.
    pub fn serve<B: EventBase>(&mut self, base: &mut B) {
        if self.state != ConnectionState::Disconnected || !self.is_server() {
            log::warn!("serve() on {:?} connection in state {:?}", self.token(), self.state);
            return;
        }
        log::debug!("serving {}:{} on {:?}", self.info.host, self.info.port, self.token());
        self.requests.push_back(Message::incoming_request());
        self.start_read(base);
    }

    /// Waits for an outgoing connect; the first writable edge completes it.
    pub fn connect<B: EventBase>(&mut self, base: &mut B) {
        if self.state != ConnectionState::Disconnected {
            log::warn!("connect() on {:?} in state {:?}", self.token(), self.state);
            return;
        }
        self.state = ConnectionState::Connecting;
        self.bev.add_write_event(base);
        self.write_timer.arm(base, self.options.timeout);
    }

    /// Queues an outgoing request. It is written once the connection is
    /// established and every earlier exchange has completed.
    pub fn make_request<B: EventBase>(&mut self, base: &mut B, request: Message) {
        if self.is_closed() || self.is_server() {
            log::warn!("cannot send {} {} on {:?}", request.method(), request.uri(), self.token());
            return;
        }
        self.outgoing.push_back(request);
        if self.send_next_request(base) == Step::Continue {
            self.run(base);
        }
    }

    /// Enters `ReadingFirstLine`, parsing right away if input is buffered.
    pub fn start_read<B: EventBase>(&mut self, base: &mut B) {
        if self.is_closed() {
            return;
        }
        if self.begin_read(base) == Step::Continue {
            self.run(base);
        }
    }

    /// Arms write readiness and the write timer if there is output to send.
    pub fn start_write<B: EventBase>(&mut self, base: &mut B) {
        if self.bev.obuf_len() == 0 {
            return;
        }
        self.bev.add_write_event(base);
        self.write_timer.arm(base, self.options.timeout);
    }

    pub fn handle_readable<B: EventBase>(&mut self, base: &mut B) {
        if self.is_closed() {
            return;
        }
        let outcome = self.bev.fill(base);
        if outcome.eof {
            self.peer_closed = true;
        }
        if outcome.read > 0 {
            self.read_timer.disarm(base);
            self.run(base);
        }
        if self.is_closed() {
            return;
        }
        if let Some(err) = outcome.error {
            self.fail(base, HttpError::from_io(err));
        } else if outcome.eof {
            self.on_peer_close(base);
        }
    }

    pub fn handle_writable<B: EventBase>(&mut self, base: &mut B) {
        if self.is_closed() {
            return;
        }
        self.write_timer.disarm(base);

        if self.state == ConnectionState::Connecting {
            log::debug!("connected to {}:{}", self.info.host, self.info.port);
            self.bev.remove_write_event(base);
            self.state = ConnectionState::Idle;
            if self.send_next_request(base) == Step::Continue {
                self.run(base);
            }
            return;
        }

        match self.bev.flush(base) {
            WriteOutcome::Drained if self.state == ConnectionState::Writing => {
                if self.write_done(base) == Step::Continue {
                    self.run(base);
                }
            }
            // an interim reply such as 100 Continue went out mid-read
            WriteOutcome::Drained => self.bev.remove_write_event(base),
            WriteOutcome::Pending => self.start_write(base),
            WriteOutcome::Failed(err) => self.fail(base, HttpError::from_io(err)),
        }
    }

    /// Handles expiry of one of this connection's timers.
    pub fn handle_timeout<B: EventBase>(&mut self, base: &mut B, kind: TimerKind) {
        let fired = match kind {
            TimerKind::Read => self.read_timer.fire(),
            TimerKind::Write => self.write_timer.fire(),
        };
        if !fired || self.is_closed() {
            return;
        }

        let idle = kind == TimerKind::Read
            && self.state == ConnectionState::ReadingFirstLine
            && self.bev.ibuf_len() == 0
            && self.is_server();
        if idle {
            log::debug!("closing idle connection from {}:{}", self.info.host, self.info.port);
            self.close(base, true);
            return;
        }
        self.fail(base, HttpError::Timeout);
    }

    /// Closes the connection. A graceful close first flushes pending output,
    /// bounded by the write timer.
    pub fn close<B: EventBase>(&mut self, base: &mut B, graceful: bool) {
        if self.is_closed() {
            return;
        }
        if graceful && self.bev.obuf_len() > 0 {
            self.close_after_write = true;
            self.read_timer.disarm(base);
            self.bev.remove_read_event(base);
            self.state = ConnectionState::Writing;
            self.start_write(base);
            return;
        }

        self.read_timer.disarm(base);
        self.write_timer.disarm(base);
        self.bev.close(base);
        self.requests.clear();
        self.state = ConnectionState::Closed;
        log::debug!("closed connection {}:{} ({:?})", self.info.host, self.info.port, self.token());
    }

    /// Drops the stream and every buffered byte and message, returning to
    /// `Disconnected` so a new stream can be [`attach`](Self::attach)ed.
    pub fn reset<B: EventBase>(&mut self, base: &mut B) {
        self.read_timer.disarm(base);
        self.write_timer.disarm(base);
        if self.bev.is_open() {
            self.bev.close(base);
        }
        self.bev.reset();
        self.requests.clear();
        self.reply.begin(false);
        self.close_after_write = false;
        self.peer_closed = false;
        self.error = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Attaches a new stream after [`reset`](Self::reset). Queued outgoing
    /// requests are kept.
    pub fn attach(&mut self, token: Token, stream: S, info: ConnectionInfo) {
        self.bev.attach(token, stream);
        self.read_timer = Timer::new(TimerKey::new(token, TimerKind::Read));
        self.write_timer = Timer::new(TimerKey::new(token, TimerKind::Write));
        self.reply.token = token;
        self.info = info;
    }

    /// Applies a command from a deferred reply and writes what it produced.
    ///
    /// Commands for a request that is no longer in flight are dropped.
    pub fn resume<B: EventBase>(&mut self, base: &mut B, deferred: Deferred) {
        let current = self.state == ConnectionState::Writing
            && self.reply.deferred
            && !self.reply.is_complete()
            && deferred.serial == self.reply.serial;
        if !current {
            log::debug!("dropping {:?} for {:?}: reply is over", deferred.command, self.token());
            return;
        }
        let request = match self.requests.front_mut() {
            Some(request) => request,
            None => return,
        };

        let mut exchange = Exchange::new(request, self.bev.output_mut(), &mut self.reply, &self.info);
        exchange.apply(deferred.command);
        if self.reply.is_complete() && self.reply.close {
            self.close_after_write = true;
        }
        if self.bev.obuf_len() > 0 || self.reply.is_complete() {
            if self.try_write(base) == Step::Continue {
                self.run(base);
            }
        }
    }

    fn run<B: EventBase>(&mut self, base: &mut B) {
        loop {
            let step = match self.state {
                ConnectionState::ReadingFirstLine => self.read_firstline(base),
                ConnectionState::ReadingHeaders => self.read_header(base),
                ConnectionState::ReadingBody => self.read_body(base),
                ConnectionState::ReadingTrailer => self.read_trailer(base),
                // input arriving in other states stays buffered
                _ => Step::Suspend,
            };
            if step == Step::Suspend {
                break;
            }
        }
    }

    fn begin_read<B: EventBase>(&mut self, base: &mut B) -> Step {
        self.state = ConnectionState::ReadingFirstLine;
        if self.bev.ibuf_len() > 0 {
            Step::Continue
        } else {
            self.wait_for_input(base)
        }
    }

    fn wait_for_input<B: EventBase>(&mut self, base: &mut B) -> Step {
        if self.peer_closed {
            return self.input_ended(base);
        }
        self.bev.add_read_event(base);
        self.read_timer.arm(base, self.options.timeout);
        Step::Suspend
    }

    fn read_firstline<B: EventBase>(&mut self, base: &mut B) -> Step {
        let max = self.options.max_header_size;
        let result = match self.requests.front_mut() {
            Some(msg) => msg.parse_first_line(self.bev.input_mut(), max),
            None => return Step::Suspend,
        };
        match result {
            Ok(ReadStatus::AllDataRead) => {
                self.state = ConnectionState::ReadingHeaders;
                Step::Continue
            }
            Ok(ReadStatus::MoreDataExpected) => self.wait_for_input(base),
            Err(err) => {
                self.fail(base, err);
                Step::Suspend
            }
        }
    }

    fn read_header<B: EventBase>(&mut self, base: &mut B) -> Step {
        let max = self.options.max_header_size;
        let result = match self.requests.front_mut() {
            Some(msg) => msg.parse_headers(self.bev.input_mut(), max),
            None => return Step::Suspend,
        };
        match result {
            Ok(ReadStatus::AllDataRead) => self.get_body(base),
            Ok(ReadStatus::MoreDataExpected) => self.wait_for_input(base),
            Err(err) => {
                self.fail(base, err);
                Step::Suspend
            }
        }
    }

    /// Decides how the body of a fully parsed head is read, if at all.
    fn get_body<B: EventBase>(&mut self, base: &mut B) -> Step {
        let msg = match self.requests.front_mut() {
            Some(msg) => msg,
            None => return Step::Suspend,
        };
        let skip = match msg.kind() {
            MessageKind::Request => !msg.method().has_body(),
            MessageKind::Response => !msg.response_has_body(),
        };
        if skip {
            return self.read_done(base);
        }

        let expects_continue = msg.kind() == MessageKind::Request
            && msg.version() >= Version::HTTP_11
            && msg.input_headers().has_token("Expect", "100-continue");
        let mode = match msg.prepare_body() {
            Ok(mode) => mode,
            Err(err) => {
                self.fail(base, err);
                return Step::Suspend;
            }
        };

        match mode {
            TransferMode::ContentLength(len) if len > self.options.max_body_size => {
                let limit = self.options.max_body_size;
                self.fail(base, HttpError::invalid_header(format!("body of {} bytes exceeds {}", len, limit)));
                return Step::Suspend;
            }
            TransferMode::ContentLength(0) => {}
            _ if expects_continue && self.bev.ibuf_len() == 0 => {
                self.bev.output_mut().append(CONTINUE_REPLY);
                self.start_write(base);
            }
            _ => {}
        }

        self.state = ConnectionState::ReadingBody;
        Step::Continue
    }

    fn read_body<B: EventBase>(&mut self, base: &mut B) -> Step {
        let limit = self.options.max_body_size;
        let input = self.bev.input_mut();
        let msg = match self.requests.front_mut() {
            Some(msg) => msg,
            None => return Step::Suspend,
        };

        match msg.transfer_mode() {
            TransferMode::Chunked => {
                let (decoder, body, canceled) = msg.chunk_parts();
                match decoder.decode(input, body, limit, canceled) {
                    ChunkStatus::AllDataRead => {
                        self.state = ConnectionState::ReadingTrailer;
                        Step::Continue
                    }
                    ChunkStatus::MoreDataExpected => self.wait_for_input(base),
                    ChunkStatus::DataCorrupted => {
                        self.fail(base, HttpError::invalid_header("corrupted chunked body"));
                        Step::Suspend
                    }
                    ChunkStatus::RequestCanceled => {
                        log::debug!("message on {:?} canceled mid-body", self.token());
                        self.error = Some(HttpError::Canceled);
                        self.close(base, false);
                        Step::Suspend
                    }
                }
            }
            TransferMode::ContentLength(_) => match msg.read_fixed_body(input) {
                ReadStatus::AllDataRead => self.read_done(base),
                ReadStatus::MoreDataExpected => self.wait_for_input(base),
            },
            TransferMode::ReadUntilClose => {
                msg.read_to_close(input);
                if msg.body().len() as u64 > limit {
                    self.fail(base, HttpError::invalid_header("body exceeds limit"));
                    return Step::Suspend;
                }
                self.wait_for_input(base)
            }
        }
    }

    fn read_trailer<B: EventBase>(&mut self, base: &mut B) -> Step {
        let max = self.options.max_header_size;
        let result = match self.requests.front_mut() {
            Some(msg) => msg.parse_trailers(self.bev.input_mut(), max),
            None => return Step::Suspend,
        };
        match result {
            Ok(ReadStatus::AllDataRead) => self.read_done(base),
            Ok(ReadStatus::MoreDataExpected) => self.wait_for_input(base),
            Err(err) => {
                self.fail(base, err);
                Step::Suspend
            }
        }
    }

    fn read_done<B: EventBase>(&mut self, base: &mut B) -> Step {
        self.read_timer.disarm(base);
        self.bev.remove_read_event(base);
        if self.is_server() {
            self.dispatch(base)
        } else {
            self.response_done(base)
        }
    }

    /// Runs the service on a complete request and starts writing its reply.
    fn dispatch<B: EventBase>(&mut self, base: &mut B) -> Step {
        let service = match &self.role {
            Role::Server(service) => service.clone(),
            Role::Client => return Step::Suspend,
        };
        let request = match self.requests.front_mut() {
            Some(request) => request,
            None => return Step::Suspend,
        };
        log::debug!(
            "{} {} from {}:{}",
            request.method(),
            request.uri(),
            self.info.host,
            self.info.port
        );

        self.reply.begin(!(self.options.keep_alive && request.is_keep_alive()));
        let mut exchange = Exchange::new(request, self.bev.output_mut(), &mut self.reply, &self.info);
        service.call(&mut exchange);
        exchange.finish();
        if self.reply.is_complete() && self.reply.close {
            self.close_after_write = true;
        }

        self.state = ConnectionState::Writing;
        self.try_write(base)
    }

    fn response_done<B: EventBase>(&mut self, base: &mut B) -> Step {
        let response = match self.requests.pop_front() {
            Some(response) => response,
            None => return Step::Suspend,
        };
        let keep_alive = response.is_keep_alive() && response.transfer_mode() != TransferMode::ReadUntilClose;
        log::debug!("{} {} from {}", response.response_code(), response.status_text(), self.info.host);
        self.completed.push_back(response);

        if !keep_alive {
            self.close(base, false);
            return Step::Suspend;
        }
        self.state = ConnectionState::Idle;
        self.send_next_request(base)
    }

    fn send_next_request<B: EventBase>(&mut self, base: &mut B) -> Step {
        if self.state != ConnectionState::Idle {
            return Step::Suspend;
        }
        let mut request = match self.outgoing.pop_front() {
            Some(request) => request,
            None => return Step::Suspend,
        };
        request.write_request(self.bev.output_mut());
        self.requests.push_back(Message::incoming_response(request.method().clone()));
        self.state = ConnectionState::Writing;
        self.try_write(base)
    }

    /// Writes what the socket takes now; the rest waits for writability.
    fn try_write<B: EventBase>(&mut self, base: &mut B) -> Step {
        match self.bev.flush(base) {
            WriteOutcome::Drained => self.write_done(base),
            WriteOutcome::Pending => {
                self.start_write(base);
                Step::Suspend
            }
            WriteOutcome::Failed(err) => {
                self.fail(base, HttpError::from_io(err));
                Step::Suspend
            }
        }
    }

    fn write_done<B: EventBase>(&mut self, base: &mut B) -> Step {
        self.write_timer.disarm(base);
        self.bev.remove_write_event(base);
        if self.close_after_write {
            self.close(base, false);
            return Step::Suspend;
        }
        if self.is_server() {
            if !self.reply.is_complete() {
                // a deferred reply resumes through `resume`
                return Step::Suspend;
            }
            // the answered request is done; the next one may already be buffered
            self.requests.pop_front();
            self.requests.push_back(Message::incoming_request());
        }
        self.begin_read(base)
    }

    fn on_peer_close<B: EventBase>(&mut self, base: &mut B) {
        log::debug!("{}:{} closed its side of {:?}", self.info.host, self.info.port, self.token());
        self.peer_closed = true;
        match self.state {
            // input already buffered is answered once the reply drains
            ConnectionState::Writing | ConnectionState::Closed => {}
            ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::Disconnected => {
                self.close(base, true)
            }
            _ => {
                if self.input_ended(base) == Step::Continue {
                    self.run(base);
                }
            }
        }
    }

    /// Handles a reading phase that needs bytes the closed peer will never send.
    fn input_ended<B: EventBase>(&mut self, base: &mut B) -> Step {
        let until_close = self
            .requests
            .front()
            .map_or(false, |msg| msg.transfer_mode() == TransferMode::ReadUntilClose);

        match self.state {
            ConnectionState::ReadingBody if until_close => self.read_done(base),
            ConnectionState::ReadingFirstLine if self.bev.ibuf_len() == 0 && self.is_server() => {
                self.close(base, true);
                Step::Suspend
            }
            _ => {
                self.fail(
                    base,
                    HttpError::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-message")),
                );
                Step::Suspend
            }
        }
    }

    /// Records `err` and tears the connection down. A malformed request is
    /// answered with 400 before closing.
    fn fail<B: EventBase>(&mut self, base: &mut B, err: HttpError) {
        if self.is_closed() {
            return;
        }
        if err.is_quiet() {
            log::debug!("connection {}:{} ended: {}", self.info.host, self.info.port, err);
        } else {
            log::warn!("connection {}:{} failed: {}", self.info.host, self.info.port, err);
        }

        let bad_request =
            matches!(err, HttpError::InvalidHeader { .. }) && self.state.is_reading() && self.is_server();
        self.error = Some(err);

        if bad_request {
            self.requests.clear();
            self.bev.input_mut().reset();
            write_bad_request(self.bev.output_mut());
            self.close(base, true);
        } else {
            self.close(base, false);
        }
    }
}

impl<S> fmt::Debug for HttpConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("peer", &self.info)
            .field("state", &self.state)
            .field("messages", &self.requests.len())
            .finish()
    }
}
