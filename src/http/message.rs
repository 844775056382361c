//! HTTP request/response values and their incremental parsers.

use std::fmt;
use std::str::FromStr;

use httparse::Status;

use crate::buffer::Buffer;
use crate::error::HttpError;
use crate::http::chunked::ChunkDecoder;
use crate::http::headers::Headers;

/// Maximum number of header (or trailer) fields in one block
pub const MAX_HEADERS: usize = 64;

/// Outcome of a parsing step that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    AllDataRead,
    MoreDataExpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
    Patch,
    /// Any other syntactically valid method token
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
            Method::Other(s) => s,
        }
    }

    /// Whether requests with this method carry a body. Every other method is
    /// read as bodiless.
    pub fn has_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl FromStr for Method {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            "PATCH" => Method::Patch,
            other if !other.is_empty() && other.bytes().all(is_token_byte) => Method::Other(other.to_owned()),
            other => return Err(HttpError::invalid_header(format!("bad method {:?}", other))),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// HTTP/1.x protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };
}

impl FromStr for Version {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HTTP/1.1" => Ok(Version::HTTP_11),
            "HTTP/1.0" => Ok(Version::HTTP_10),
            other => Err(HttpError::invalid_header(format!("unsupported version {:?}", other))),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// How the body of a message is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    ContentLength(u64),
    Chunked,
    ReadUntilClose,
}

/// Whether a response with this status code may carry a body.
pub fn status_has_body(code: u16) -> bool {
    !((100..200).contains(&code) || code == 204 || code == 304)
}

/// A request or response, either being read off the wire or built to be
/// sent.
///
/// Messages live in their connection's queue and never outlive it.
#[derive(Debug)]
pub struct Message {
    kind: MessageKind,
    method: Method,
    uri: String,
    version: Version,
    status: u16,
    reason: String,
    input_headers: Headers,
    output_headers: Headers,
    body: Buffer,
    transfer: TransferMode,
    /// Bytes still to read for `ContentLength`; -1 while unbounded or chunked
    remaining: i64,
    chunk: ChunkDecoder,
    canceled: bool,
    /// Method of the request a response answers; HEAD replies have no body
    request_method: Option<Method>,
}

impl Message {
    fn with_kind(kind: MessageKind) -> Self {
        Self {
            kind,
            method: Method::Get,
            uri: String::new(),
            version: Version::HTTP_11,
            status: 0,
            reason: String::new(),
            input_headers: Headers::new(),
            output_headers: Headers::new(),
            body: Buffer::new(),
            transfer: TransferMode::ContentLength(0),
            remaining: 0,
            chunk: ChunkDecoder::new(),
            canceled: false,
            request_method: None,
        }
    }

    /// An empty request awaiting its first line.
    pub fn incoming_request() -> Self {
        Self::with_kind(MessageKind::Request)
    }

    /// An empty response awaiting its status line, answering `method`.
    pub fn incoming_response(method: Method) -> Self {
        let mut msg = Self::with_kind(MessageKind::Response);
        msg.request_method = Some(method);
        msg
    }

    /// An outgoing request.
    pub fn request(method: Method, uri: impl Into<String>) -> Self {
        let mut msg = Self::with_kind(MessageKind::Request);
        msg.method = method;
        msg.uri = uri.into();
        msg
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The URI without its query string.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or("")
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn response_code(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.reason
    }

    pub fn input_headers(&self) -> &Headers {
        &self.input_headers
    }

    pub fn output_headers(&self) -> &Headers {
        &self.output_headers
    }

    pub fn output_headers_mut(&mut self) -> &mut Headers {
        &mut self.output_headers
    }

    pub fn body(&self) -> &Buffer {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Buffer {
        &mut self.body
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.transfer
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// Discards the message; an in-progress chunked read stops quietly.
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Whether the peer wants the connection kept open after this exchange.
    pub fn is_keep_alive(&self) -> bool {
        if self.version >= Version::HTTP_11 {
            !self.input_headers.has_token("Connection", "close")
        } else {
            self.input_headers.has_token("Connection", "keep-alive")
        }
    }

    /// Whether a response body follows the headers.
    pub(crate) fn response_has_body(&self) -> bool {
        status_has_body(self.status) && self.request_method != Some(Method::Head)
    }

    /// Parses the request or status line.
    ///
    /// Empty lines before a request line are skipped.
    pub fn parse_first_line(&mut self, input: &mut Buffer, max_len: usize) -> Result<ReadStatus, HttpError> {
        loop {
            let line = match input.read_line() {
                Some(line) => line,
                None if input.len() > max_len => {
                    return Err(HttpError::invalid_header("first line too long"));
                }
                None => return Ok(ReadStatus::MoreDataExpected),
            };
            if line.len() > max_len {
                return Err(HttpError::invalid_header("first line too long"));
            }
            if line.is_empty() && self.kind == MessageKind::Request {
                continue;
            }

            let line = std::str::from_utf8(&line).map_err(|_| HttpError::invalid_header("first line is not utf-8"))?;
            match self.kind {
                MessageKind::Request => self.parse_request_line(line)?,
                MessageKind::Response => self.parse_status_line(line)?,
            }
            return Ok(ReadStatus::AllDataRead);
        }
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), HttpError> {
        let mut parts = line.split(' ');
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v), None) if !u.is_empty() => (m, u, v),
            _ => return Err(HttpError::invalid_header(format!("bad request line {:?}", line))),
        };

        self.method = method.parse()?;
        self.version = version.parse()?;
        self.uri = uri.to_owned();
        Ok(())
    }

    fn parse_status_line(&mut self, line: &str) -> Result<(), HttpError> {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        let code = parts.next().unwrap_or("");

        self.version = version.parse()?;
        self.status = match code.parse::<u16>() {
            Ok(status) if code.len() == 3 && status >= 100 => status,
            _ => return Err(HttpError::invalid_header(format!("bad status line {:?}", line))),
        };
        self.reason = parts.next().unwrap_or("").to_owned();
        Ok(())
    }

    /// Parses the header block up to and including the blank line.
    pub fn parse_headers(&mut self, input: &mut Buffer, max_size: usize) -> Result<ReadStatus, HttpError> {
        parse_header_block(input, &mut self.input_headers, max_size)
    }

    /// Trailers are appended to the input headers.
    pub fn parse_trailers(&mut self, input: &mut Buffer, max_size: usize) -> Result<ReadStatus, HttpError> {
        parse_header_block(input, &mut self.input_headers, max_size)
    }

    /// Works out the body framing from the headers and resets the counters.
    pub fn prepare_body(&mut self) -> Result<TransferMode, HttpError> {
        let headers = &self.input_headers;

        let transfer = if headers.contains("Transfer-Encoding") {
            if headers.has_token("Transfer-Encoding", "chunked") {
                TransferMode::Chunked
            } else if self.kind == MessageKind::Request {
                return Err(HttpError::invalid_header("unsupported transfer-encoding"));
            } else {
                TransferMode::ReadUntilClose
            }
        } else if let Some(length) = self.content_length()? {
            TransferMode::ContentLength(length)
        } else if self.kind == MessageKind::Request {
            TransferMode::ContentLength(0)
        } else {
            TransferMode::ReadUntilClose
        };

        self.transfer = transfer;
        self.remaining = match transfer {
            TransferMode::ContentLength(n) => i64::try_from(n).map_err(|_| HttpError::invalid_header("content-length too large"))?,
            _ => -1,
        };
        self.chunk = ChunkDecoder::new();
        Ok(transfer)
    }

    fn content_length(&self) -> Result<Option<u64>, HttpError> {
        let mut length = None;
        for value in self.input_headers.get_all("Content-Length") {
            let value = value.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(HttpError::invalid_header(format!("bad content-length {:?}", value)));
            }
            let parsed: u64 = value.parse().map_err(|_| HttpError::invalid_header("content-length overflow"))?;
            match length {
                Some(prev) if prev != parsed => return Err(HttpError::invalid_header("conflicting content-length")),
                _ => length = Some(parsed),
            }
        }
        Ok(length)
    }

    /// Moves up to `remaining` bytes of a fixed-length body out of `input`.
    pub(crate) fn read_fixed_body(&mut self, input: &mut Buffer) -> ReadStatus {
        let n = (self.remaining.max(0) as u64).min(input.len() as u64) as usize;
        if n > 0 {
            input.move_into(&mut self.body, n);
            self.remaining -= n as i64;
        }
        if self.remaining == 0 {
            ReadStatus::AllDataRead
        } else {
            ReadStatus::MoreDataExpected
        }
    }

    /// Moves everything in `input` into the body.
    pub(crate) fn read_to_close(&mut self, input: &mut Buffer) {
        let len = input.len();
        input.move_into(&mut self.body, len);
    }

    pub(crate) fn chunk_parts(&mut self) -> (&mut ChunkDecoder, &mut Buffer, bool) {
        (&mut self.chunk, &mut self.body, self.canceled)
    }

    /// Serializes an outgoing request: request line, output headers, body.
    ///
    /// A `Content-Length` is added when the method carries a body and the
    /// caller did not set one.
    pub fn write_request(&mut self, out: &mut Buffer) {
        if !self.output_headers.contains("Content-Length") && (self.method.has_body() || !self.body.is_empty()) {
            self.output_headers.insert("Content-Length", self.body.len().to_string());
        }

        let mut head = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        self.output_headers.write_to(&mut head);
        head.push_str("\r\n");
        out.append_str(&head);
        out.append(self.body.as_bytes());
    }
}

/// Parses a complete header block off the front of `input`.
///
/// Nothing is consumed until the terminating blank line is present, so a
/// partial block is simply re-parsed when more bytes arrive.
fn parse_header_block(input: &mut Buffer, headers: &mut Headers, max_size: usize) -> Result<ReadStatus, HttpError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];

    let (consumed, fields) = match httparse::parse_headers(input.as_bytes(), &mut slots) {
        Ok(Status::Complete((consumed, parsed))) => {
            if consumed > max_size {
                return Err(HttpError::invalid_header(format!("header block of {} bytes exceeds {}", consumed, max_size)));
            }
            let mut fields = Vec::with_capacity(parsed.len());
            for header in parsed {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| HttpError::invalid_header(format!("non utf-8 value for {}", header.name)))?;
                fields.push((header.name.to_owned(), value.trim().to_owned()));
            }
            (consumed, fields)
        }
        Ok(Status::Partial) if input.len() > max_size => {
            return Err(HttpError::invalid_header(format!("header block exceeds {} bytes", max_size)));
        }
        Ok(Status::Partial) => return Ok(ReadStatus::MoreDataExpected),
        Err(httparse::Error::TooManyHeaders) => {
            return Err(HttpError::invalid_header(format!("more than {} headers", MAX_HEADERS)));
        }
        Err(e) => return Err(HttpError::invalid_header(e)),
    };

    for (name, value) in fields {
        headers.append(name, value);
    }
    input.advance(consumed);
    Ok(ReadStatus::AllDataRead)
}
