use std::io;
use thiserror::Error;

/// Reasons an HTTP connection is torn down.
///
/// Every variant terminates the connection. `PeerReset` and `Canceled` are
/// the expected ones and are closed without being reported as failures.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Malformed request/status line, header line or chunk framing
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// A phase timer expired before the phase completed
    #[error("connection timed out")]
    Timeout,

    /// Unexpected OS-level I/O failure, including a premature EOF
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer reset the connection or the pipe broke
    #[error("connection reset by peer")]
    PeerReset,

    /// The application discarded the message while its body was being read
    #[error("request canceled")]
    Canceled,
}

impl HttpError {
    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    /// Errors that close the connection without being surfaced.
    pub fn is_quiet(&self) -> bool {
        matches!(self, HttpError::PeerReset | HttpError::Canceled)
    }

    /// Classifies an OS error coming off a socket.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => HttpError::PeerReset,
            _ => HttpError::Transport(err),
        }
    }
}

/// Errors raised by [`Buffer`](crate::Buffer) operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("cannot consume {requested} bytes, only {available} available")]
    Underflow { requested: usize, available: usize },
}

/// Represents errors that can occur in the reactor system responsible for I/O events.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Error during reactor initialization
    #[error("reactor initialization failed: {0}")]
    Init(io::Error),

    /// Error when registering resources with the reactor
    #[error("registration failed: {0}")]
    Registration(io::Error),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(io::Error),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced while starting or running the server and its workers.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    #[error("thread {0} panicked")]
    ThreadPanicked(String),

    /// A mutex lock became poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Results using ReactorError as the error type
pub type ReactorResult<T> = std::result::Result<T, ReactorError>;

/// Type alias for Results using ServerError as the error type
pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_and_broken_pipe_are_quiet() {
        let reset = HttpError::from_io(io::Error::from(io::ErrorKind::ConnectionReset));
        let pipe = HttpError::from_io(io::Error::from(io::ErrorKind::BrokenPipe));

        assert!(matches!(reset, HttpError::PeerReset));
        assert!(matches!(pipe, HttpError::PeerReset));
        assert!(reset.is_quiet());
        assert!(HttpError::Canceled.is_quiet());
    }

    #[test]
    fn test_other_io_errors_are_transport_failures() {
        let err = HttpError::from_io(io::Error::new(io::ErrorKind::Other, "boom"));

        assert!(matches!(err, HttpError::Transport(_)));
        assert!(!err.is_quiet());
        assert_eq!(err.to_string(), "transport error: boom");
    }

    /// Tests the automatic conversion from io::Error to ReactorError
    #[test]
    fn test_reactor_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test error");
        let reactor_err = ReactorError::from(io_err);

        assert!(matches!(reactor_err, ReactorError::Io(_)));
    }

    #[test]
    fn test_underflow_message() {
        let err = BufferError::Underflow { requested: 4, available: 1 };
        assert_eq!(err.to_string(), "cannot consume 4 bytes, only 1 available");
    }
}
