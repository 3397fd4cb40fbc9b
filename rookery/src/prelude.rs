//! Convenience re-exports for common usage.

pub use crate::error::ServiceError;
pub use crate::mailbox::Outbox;
pub use crate::messaging::{Headers, QueryResult, StreamResult, StreamSink};
pub use crate::query::{QueryId, ReplySink};
pub use crate::runtime::{QueryFuture, Runtime, RuntimeBuilder, ServiceRef};
pub use crate::stub::{Completion, ShutdownMode, Stub};
