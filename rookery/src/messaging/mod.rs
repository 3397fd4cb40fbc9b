//! Message variants, headers, query correlation, and streaming.

pub mod headers;
pub mod message;
pub mod query;
pub mod stream;

// Re-exports
pub use headers::Headers;
pub use message::{ControlMessage, Message, QueryErrorMessage, QueryReplyMessage, SendMessage};
pub use query::{QueryMessage, QueryResult, QueryState};
pub use stream::{
    StreamCallMessage, StreamCancelMessage, StreamFork, StreamJoin, StreamResult,
    StreamResultMessage, StreamSink, STREAM_BATCH_CAPACITY,
};
