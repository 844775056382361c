#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! ## Architecture
//! The server is built on several key components:
//!
//! - `Server`: entry point that binds the listener, starts the workers and
//!   accepts connections
//! - `Reactor`: edge-triggered readiness and timer loop on top of `mio`, one
//!   per thread
//! - `WorkerPool`: fixed set of threads, each owning the connections it adopted
//! - `HttpConnection`: the per-connection HTTP/1.x state machine
//! - `Service`: trait for implementing request handlers
//!
//! ## Configuration
//! Server settings can be configured via:
//! - Environment variables (prefixed with `EVHTTP_`)
//! - Configuration file (`evhttp.toml` or any format the `config` crate reads)
//! - Builder pattern API

pub use crate::buffer::Buffer;
pub use crate::buffer_event::{BufferEvent, ReadOutcome, WriteOutcome};
pub use crate::config::ServerConfig;
pub use crate::error::{BufferError, HttpError, ReactorError, ServerError};
pub use crate::executor::{ClientInfo, WorkerPool};
pub use crate::http::{
    ConnectionOptions, ConnectionState, Exchange, Headers, HttpConnection, Message, MessageKind, Method, ReplyHandle,
    Version,
};
pub use crate::net::{Direction, EventBase, Notification, Reactor, TimerKey, TimerKind};
pub use crate::server::{ConnectionInfo, Router, Server, ServerHandle, Service};
pub use crate::timer::Timer;

mod buffer;
mod buffer_event;
mod config;
mod error;
mod executor;
pub mod http;
#[cfg(test)]
mod mock;
mod net;
mod server;
mod timer;
