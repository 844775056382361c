//! HTTP/1.x messages, their wire codecs and the connection state machine.

pub mod chunked;
pub mod connection;
pub mod headers;
pub mod message;
pub mod reply;

pub use chunked::{ChunkDecoder, ChunkStatus};
pub use connection::{ConnectionOptions, ConnectionState, HttpConnection};
pub use headers::Headers;
pub use message::{Message, MessageKind, Method, ReadStatus, TransferMode, Version};
pub use reply::{Deferred, Exchange, ReplyCommand, ReplyHandle, ReplyQueue, ReplyState};
