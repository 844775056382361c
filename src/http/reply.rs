//! Reply serialization for server connections, including replies finished
//! after the handler returned.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use mio::Token;

use crate::buffer::Buffer;
use crate::http::chunked::{encode_chunk, encode_last_chunk};
use crate::http::message::{status_has_body, Message, Method, Version};
use crate::server::ConnectionInfo;

/// Progress of the reply to the request currently being handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyState {
    #[default]
    NotStarted,
    /// Headers written; `chunked` selects the body framing and `body`
    /// whether body bytes go on the wire at all
    Streaming { chunked: bool, body: bool },
    Complete,
}

/// Reply bookkeeping a connection keeps across handler invocations.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) state: ReplyState,
    pub(crate) close: bool,
    /// A [`ReplyHandle`] owns the rest of this reply
    pub(crate) deferred: bool,
    /// Identifies the request being answered; bumped on every dispatch
    pub(crate) serial: u64,
    pub(crate) token: Token,
    queue: Arc<ReplyQueue>,
}

impl Reply {
    pub(crate) fn new(token: Token, queue: Arc<ReplyQueue>) -> Self {
        Self { state: ReplyState::NotStarted, close: false, deferred: false, serial: 0, token, queue }
    }

    /// Starts over for a newly dispatched request.
    pub(crate) fn begin(&mut self, close: bool) {
        self.state = ReplyState::NotStarted;
        self.close = close;
        self.deferred = false;
        self.serial += 1;
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state == ReplyState::Complete
    }

    pub(crate) fn set_queue(&mut self, queue: Arc<ReplyQueue>) {
        self.queue = queue;
    }
}

/// One step of a reply issued through a [`ReplyHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyCommand {
    Header(String, String),
    Reply { status: u16, reason: String, body: Vec<u8> },
    Error { status: u16, reason: String },
    Start { status: u16, reason: String },
    Chunk(Vec<u8>),
    End,
    /// The handle went away with the reply unfinished
    Abandon,
}

/// A [`ReplyCommand`] addressed to one request of one connection.
#[derive(Debug)]
pub struct Deferred {
    pub(crate) token: Token,
    pub(crate) serial: u64,
    pub(crate) command: ReplyCommand,
}

impl Deferred {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn command(&self) -> &ReplyCommand {
        &self.command
    }
}

/// Commands posted by [`ReplyHandle`]s for the thread owning the
/// connections. Posting wakes that thread's reactor when a waker is set.
#[derive(Debug, Default)]
pub struct ReplyQueue {
    pending: Mutex<VecDeque<Deferred>>,
    waker: Option<Arc<mio::Waker>>,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_waker(waker: Arc<mio::Waker>) -> Self {
        Self { pending: Mutex::default(), waker: Some(waker) }
    }

    fn post(&self, deferred: Deferred) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(deferred);
        if let Some(waker) = &self.waker {
            if let Err(err) = waker.wake() {
                log::error!("Failed to wake worker for a deferred reply: {}", err);
            }
        }
    }

    /// Takes every queued command, oldest first.
    pub fn drain(&self) -> Vec<Deferred> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

/// Finishes a reply after the handler returned, from any thread.
///
/// Obtained from [`Exchange::defer`]. Every call is queued for the worker
/// owning the connection and written on its next turn; the connection keeps
/// the request in flight until the reply completes. Dropping the handle
/// early completes the reply: an unanswered request gets a 500 and a
/// streamed reply its last chunk.
#[derive(Debug)]
pub struct ReplyHandle {
    queue: Arc<ReplyQueue>,
    token: Token,
    serial: u64,
    done: bool,
}

impl ReplyHandle {
    /// Sets an output header; only effective before the reply starts.
    pub fn insert_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.post(ReplyCommand::Header(name.into(), value.into()));
    }

    pub fn send_reply(mut self, status: u16, reason: &str, body: impl Into<Vec<u8>>) {
        self.post(ReplyCommand::Reply { status, reason: reason.to_owned(), body: body.into() });
        self.done = true;
    }

    pub fn send_error(mut self, status: u16, reason: &str) {
        self.post(ReplyCommand::Error { status, reason: reason.to_owned() });
        self.done = true;
    }

    pub fn send_reply_start(&mut self, status: u16, reason: &str) {
        self.post(ReplyCommand::Start { status, reason: reason.to_owned() });
    }

    pub fn send_reply_chunk(&mut self, data: &[u8]) {
        self.post(ReplyCommand::Chunk(data.to_vec()));
    }

    pub fn send_reply_end(mut self) {
        self.post(ReplyCommand::End);
        self.done = true;
    }

    fn post(&self, command: ReplyCommand) {
        self.queue.post(Deferred { token: self.token, serial: self.serial, command });
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if !self.done {
            self.post(ReplyCommand::Abandon);
        }
    }
}

/// A request paired with the output side of its connection.
///
/// Handlers receive an `Exchange`, inspect the request, and answer with
/// either [`send_reply`](Self::send_reply) or the streaming trio
/// [`send_reply_start`](Self::send_reply_start),
/// [`send_reply_chunk`](Self::send_reply_chunk) and
/// [`send_reply_end`](Self::send_reply_end). Everything is appended to the
/// connection's output buffer and flushed once the handler returns.
///
/// A handler that cannot answer right away calls [`defer`](Self::defer)
/// and finishes through the returned [`ReplyHandle`]. Otherwise, whatever
/// is unfinished when the handler returns is completed for it.
pub struct Exchange<'a> {
    request: &'a mut Message,
    output: &'a mut Buffer,
    reply: &'a mut Reply,
    info: &'a ConnectionInfo,
}

impl<'a> Exchange<'a> {
    pub(crate) fn new(
        request: &'a mut Message,
        output: &'a mut Buffer,
        reply: &'a mut Reply,
        info: &'a ConnectionInfo,
    ) -> Self {
        Self { request, output, reply, info }
    }

    pub fn request(&self) -> &Message {
        self.request
    }

    pub fn request_mut(&mut self) -> &mut Message {
        self.request
    }

    /// Peer host and port.
    pub fn info(&self) -> &ConnectionInfo {
        self.info
    }

    pub fn state(&self) -> ReplyState {
        self.reply.state
    }

    /// Whether the connection closes once this reply is written.
    pub fn will_close(&self) -> bool {
        self.reply.close
    }

    /// Asks for the connection to be closed after this reply.
    pub fn set_close(&mut self) {
        self.reply.close = true;
    }

    /// Hands the rest of the reply to a [`ReplyHandle`]. Anything already
    /// sent through the exchange stays in place. Call at most once.
    pub fn defer(&mut self) -> ReplyHandle {
        if self.reply.deferred {
            log::warn!("reply to {} deferred twice", self.request.uri());
        }
        self.reply.deferred = true;
        ReplyHandle {
            queue: self.reply.queue.clone(),
            token: self.reply.token,
            serial: self.reply.serial,
            done: false,
        }
    }

    /// Sends a complete reply. A `Content-Length` header is added unless the
    /// handler set one.
    pub fn send_reply(&mut self, status: u16, reason: &str, body: Option<&[u8]>) {
        if self.reply.state != ReplyState::NotStarted {
            log::warn!("reply to {} already started, ignoring send_reply", self.request.uri());
            return;
        }
        let body = body.unwrap_or(&[]);
        let has_body = self.write_head(status, reason, Some(body.len()), false);
        if has_body {
            self.output.append(body);
        }
        self.reply.state = ReplyState::Complete;
    }

    /// Sends an HTML error page.
    pub fn send_error(&mut self, status: u16, reason: &str) {
        let page = format!(
            "<HTML><HEAD>\n<TITLE>{0} {1}</TITLE>\n</HEAD><BODY>\n<H1>{1}</H1>\n</BODY></HTML>\n",
            status, reason
        );
        self.request.output_headers_mut().insert("Content-Type", "text/html; charset=ISO-8859-1");
        self.send_reply(status, reason, Some(page.as_bytes()));
    }

    /// Starts a streamed reply.
    ///
    /// HTTP/1.1 peers get `Transfer-Encoding: chunked` unless the handler set
    /// a `Content-Length`; HTTP/1.0 peers get the raw body delimited by
    /// closing the connection.
    pub fn send_reply_start(&mut self, status: u16, reason: &str) {
        if self.reply.state != ReplyState::NotStarted {
            log::warn!("reply to {} already started, ignoring send_reply_start", self.request.uri());
            return;
        }
        let has_length = self.request.output_headers().contains("Content-Length");
        let chunked = !has_length && self.request.version() >= Version::HTTP_11 && status_has_body(status);
        if !has_length && !chunked {
            self.reply.close = true;
        }
        let body = self.write_head(status, reason, None, chunked);
        self.reply.state = ReplyState::Streaming { chunked, body };
    }

    pub fn send_reply_chunk(&mut self, data: &[u8]) {
        match self.reply.state {
            ReplyState::Streaming { body: false, .. } => {}
            ReplyState::Streaming { chunked: true, .. } => encode_chunk(self.output, data),
            ReplyState::Streaming { chunked: false, .. } => self.output.append(data),
            _ => log::warn!("send_reply_chunk outside of a streamed reply to {}", self.request.uri()),
        }
    }

    pub fn send_reply_end(&mut self) {
        match self.reply.state {
            ReplyState::Streaming { chunked, body } => {
                if chunked && body {
                    encode_last_chunk(self.output);
                }
                self.reply.state = ReplyState::Complete;
            }
            _ => log::warn!("send_reply_end outside of a streamed reply to {}", self.request.uri()),
        }
    }

    /// Applies a command posted by this request's [`ReplyHandle`].
    pub(crate) fn apply(&mut self, command: ReplyCommand) {
        match command {
            ReplyCommand::Header(name, value) => self.request.output_headers_mut().insert(name, value),
            ReplyCommand::Reply { status, reason, body } => self.send_reply(status, &reason, Some(&body)),
            ReplyCommand::Error { status, reason } => self.send_error(status, &reason),
            ReplyCommand::Start { status, reason } => self.send_reply_start(status, &reason),
            ReplyCommand::Chunk(data) => self.send_reply_chunk(&data),
            ReplyCommand::End => self.send_reply_end(),
            ReplyCommand::Abandon => self.complete(),
        }
    }

    /// Called once the handler returned. A deferred reply stays open.
    pub(crate) fn finish(mut self) {
        if !self.reply.deferred {
            self.complete();
        }
    }

    fn complete(&mut self) {
        match self.reply.state {
            ReplyState::NotStarted => {
                log::warn!("request {} was never answered", self.request.uri());
                self.send_error(500, "Internal Server Error");
            }
            ReplyState::Streaming { .. } => self.send_reply_end(),
            ReplyState::Complete => {}
        }
    }

    /// Writes the status line and headers; returns whether a body may follow.
    fn write_head(&mut self, status: u16, reason: &str, length: Option<usize>, chunked: bool) -> bool {
        let version = self.request.version();
        let body = status_has_body(status) && self.request.method() != &Method::Head;
        let headers = self.request.output_headers_mut();

        if self.reply.close {
            headers.insert("Connection", "close");
        } else if version == Version::HTTP_10 {
            headers.insert("Connection", "keep-alive");
        }
        if status_has_body(status) {
            if let Some(length) = length {
                if !headers.contains("Content-Length") {
                    headers.insert("Content-Length", length.to_string());
                }
            }
            if !headers.contains("Content-Type") {
                headers.insert("Content-Type", "text/html; charset=ISO-8859-1");
            }
        }
        if chunked {
            headers.remove("Content-Length");
            headers.insert("Transfer-Encoding", "chunked");
        }

        let mut head = format!("{} {} {}\r\n", version, status, reason);
        headers.write_to(&mut head);
        head.push_str("\r\n");
        self.output.append_str(&head);
        body
    }
}

/// Writes a header-only reply that closes the connection, for requests that
/// never reached a handler.
pub(crate) fn write_bad_request(output: &mut Buffer) {
    output.append(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(head: &str) -> Message {
        let mut msg = Message::incoming_request();
        let mut input = Buffer::from(head);
        msg.parse_first_line(&mut input, 8192).unwrap();
        msg.parse_headers(&mut input, 8192).unwrap();
        msg
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo { host: "127.0.0.1".into(), port: 4000 }
    }

    fn reply(close: bool) -> Reply {
        let mut reply = Reply::new(Token(3), Arc::new(ReplyQueue::new()));
        reply.begin(close);
        reply
    }

    fn text(out: &Buffer) -> String {
        String::from_utf8(out.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn test_send_reply_adds_length() {
        let mut req = request("GET /test HTTP/1.1\r\n\r\n");
        let (mut out, mut state, info) = (Buffer::new(), reply(false), info());
        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        exchange.send_reply(200, "Everything is fine", Some(b"This is funny"));
        exchange.finish();
        assert!(state.is_complete());
        assert!(!state.close);

        let text = text(&out);
        assert!(text.starts_with("HTTP/1.1 200 Everything is fine\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.ends_with("\r\n\r\nThis is funny"));
    }

    #[test]
    fn test_head_reply_has_no_body() {
        let mut req = request("HEAD / HTTP/1.1\r\n\r\n");
        let (mut out, mut state, info) = (Buffer::new(), reply(false), info());
        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        exchange.send_reply(200, "OK", Some(b"hidden"));
        exchange.finish();

        let text = text(&out);
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_no_content_reply_omits_body_headers() {
        let mut req = request("GET / HTTP/1.1\r\n\r\n");
        let (mut out, mut state, info) = (Buffer::new(), reply(false), info());
        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        exchange.send_reply(204, "No Content", Some(b"ignored"));
        exchange.finish();
        assert_eq!(out.as_bytes(), b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[test]
    fn test_streamed_reply_is_chunked_for_http11() {
        let mut req = request("GET /chunked HTTP/1.1\r\n\r\n");
        let (mut out, mut state, info) = (Buffer::new(), reply(false), info());
        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        exchange.send_reply_start(200, "Everything is fine");
        exchange.send_reply_chunk(b"This is funny");
        exchange.send_reply_chunk(b"");
        exchange.send_reply_chunk(b"bwv 1052");
        exchange.send_reply_end();
        exchange.finish();
        assert!(!state.close);

        let text = text(&out);
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\nd\r\nThis is funny\r\n8\r\nbwv 1052\r\n0\r\n\r\n"));
    }

    #[test]
    fn test_streamed_reply_to_http10_closes() {
        let mut req = request("GET /chunked HTTP/1.0\r\n\r\n");
        let (mut out, mut state, info) = (Buffer::new(), reply(false), info());
        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        exchange.send_reply_start(200, "OK");
        exchange.send_reply_chunk(b"raw");
        exchange.finish();
        assert!(state.close);

        let text = text(&out);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.ends_with("\r\n\r\nraw"));
    }

    #[test]
    fn test_unanswered_request_gets_500() {
        let mut req = request("GET / HTTP/1.1\r\n\r\n");
        let (mut out, mut state, info) = (Buffer::new(), reply(false), info());
        let exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        exchange.finish();
        assert!(out.as_bytes().starts_with(b"HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[test]
    fn test_close_is_announced() {
        let mut req = request("GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        let (mut out, mut state, info) = (Buffer::new(), reply(true), info());
        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        exchange.send_reply(200, "OK", None);
        exchange.finish();
        assert!(state.close);
        assert!(text(&out).contains("Connection: close\r\n"));
    }

    #[test]
    fn test_deferred_stream_stays_open() {
        let mut req = request("GET /slow HTTP/1.1\r\n\r\n");
        let (mut out, mut state, info) = (Buffer::new(), reply(false), info());
        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        exchange.send_reply_start(200, "OK");
        exchange.send_reply_chunk(b"first");
        let handle = exchange.defer();
        exchange.finish();

        assert!(state.deferred);
        assert_eq!(state.state, ReplyState::Streaming { chunked: true, body: true });
        assert!(text(&out).ends_with("5\r\nfirst\r\n"));
        drop(handle);
    }

    #[test]
    fn test_handle_posts_commands_in_order() {
        let queue = Arc::new(ReplyQueue::new());
        let mut state = Reply::new(Token(3), queue.clone());
        state.begin(false);
        let mut req = request("GET /slow HTTP/1.1\r\n\r\n");
        let (mut out, info) = (Buffer::new(), info());
        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        let mut handle = exchange.defer();
        handle.insert_header("X-Later", "yes");
        handle.send_reply_start(200, "OK");
        handle.send_reply_chunk(b"late");
        handle.send_reply_end();

        let posted = queue.drain();
        assert!(posted.iter().all(|d| d.token() == Token(3) && d.serial == 1));
        let commands: Vec<_> = posted.into_iter().map(|d| d.command).collect();
        assert_eq!(
            commands,
            vec![
                ReplyCommand::Header("X-Later".into(), "yes".into()),
                ReplyCommand::Start { status: 200, reason: "OK".into() },
                ReplyCommand::Chunk(b"late".to_vec()),
                ReplyCommand::End,
            ]
        );
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_dropped_handle_abandons_reply() {
        let queue = Arc::new(ReplyQueue::new());
        let mut state = Reply::new(Token(3), queue.clone());
        state.begin(false);
        let mut req = request("GET / HTTP/1.1\r\n\r\n");
        let (mut out, info) = (Buffer::new(), info());
        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);

        drop(exchange.defer());
        exchange.finish();
        assert!(out.is_empty());

        let posted = queue.drain();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].command(), &ReplyCommand::Abandon);

        let mut exchange = Exchange::new(&mut req, &mut out, &mut state, &info);
        exchange.apply(ReplyCommand::Abandon);
        assert!(state.is_complete());
        assert!(out.as_bytes().starts_with(b"HTTP/1.1 500 Internal Server Error\r\n"));
    }
}
