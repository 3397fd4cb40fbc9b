//! The business-logic boundary invoked by delivered messages.
//!
//! The core never decides what a service does with a message — it only
//! decides how the message reaches the stub, how replies are correlated, and
//! how streaming fan-out is aggregated. Everything behind [`Stub`] is an
//! external collaborator.
//!
//! Stub methods are synchronous: a handler that needs to finish later moves
//! its [`QueryResult`](crate::messaging::QueryResult) or
//! [`StreamResult`](crate::messaging::StreamResult) handle somewhere else and
//! completes it when ready. The worker never parks on business logic.

use crate::error::ServiceError;
use crate::mailbox::outbox::Outbox;
use crate::messaging::headers::Headers;
use crate::messaging::query::QueryResult;
use crate::messaging::stream::StreamResult;
use crate::query::QueryId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a shutdown drains the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownMode {
    /// Process everything already queued, then stop.
    Graceful,
    /// Fail everything still queued with `Closed`, then stop.
    Immediate,
}

/// One-shot completion callback handed to lifecycle hooks (checkpoint save,
/// replay).
///
/// Dropping a `Completion` without calling [`ok`](Self::ok) or
/// [`fail`](Self::fail) is logged at debug level and counts as no completion.
pub struct Completion {
    inner: Option<Box<dyn FnOnce(Result<(), ServiceError>) + Send>>,
}

impl Completion {
    /// Wrap a continuation.
    pub fn new(f: impl FnOnce(Result<(), ServiceError>) + Send + 'static) -> Self {
        Self {
            inner: Some(Box::new(f)),
        }
    }

    /// A completion that ignores its result.
    pub fn ignore() -> Self {
        Self::new(|_| {})
    }

    /// Signal success.
    pub fn ok(mut self) {
        self.finish(Ok(()));
    }

    /// Signal failure.
    pub fn fail(mut self, error: ServiceError) {
        self.finish(Err(error));
    }

    fn finish(&mut self, result: Result<(), ServiceError>) {
        if let Some(f) = self.inner.take() {
            f(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.inner.is_some() {
            tracing::debug!("completion dropped without a result");
        }
    }
}

/// Business-logic target of a mailbox.
///
/// A stub is owned by exactly one mailbox worker and is invoked for at most
/// one message at a time, so methods take `&mut self` and need no internal
/// synchronization.
///
/// The worker's `outbox` is passed to every business invocation: messages the
/// stub sends from a handler batch there and flush when the invocation ends,
/// and queries constructed on it resume in this mailbox when their replies
/// arrive. There is no ambient context to reach for.
///
/// Handler errors returned from `send`/`query`/`stream` are caught by the
/// worker and turned into the message's failure path; they never unwind the
/// worker task.
pub trait Stub: Send + 'static {
    /// Handle a fire-and-forget message. Errors are logged, never surfaced to
    /// the caller.
    fn send(
        &mut self,
        outbox: &mut Outbox,
        method: &str,
        headers: &Headers,
        args: Vec<Value>,
    ) -> Result<(), ServiceError> {
        let _ = (outbox, headers, args);
        Err(ServiceError::Execution(format!("no send handler for {method}")))
    }

    /// Handle a query. The stub completes `result` with `ok`/`fail`, now or
    /// later; returning `Err` fails the query immediately.
    fn query(
        &mut self,
        outbox: &mut Outbox,
        method: &str,
        headers: &Headers,
        result: QueryResult,
        args: Vec<Value>,
    ) -> Result<(), ServiceError> {
        let _ = (outbox, headers, args);
        result.fail(ServiceError::Execution(format!("no query handler for {method}")));
        Ok(())
    }

    /// Handle a streaming call. The stub pushes values into `sink` and
    /// finishes it with `ok`/`fail`; returning `Err` fails the stream
    /// immediately.
    fn stream(
        &mut self,
        outbox: &mut Outbox,
        method: &str,
        headers: &Headers,
        sink: StreamResult,
        args: Vec<Value>,
    ) -> Result<(), ServiceError> {
        let _ = (outbox, headers, args);
        sink.fail(ServiceError::Execution(format!("no stream handler for {method}")));
        Ok(())
    }

    /// Observe a reply the correlation table no longer matches (late or
    /// duplicate). Matched replies complete their caller inside the core and
    /// never reach this hook.
    fn query_reply(&mut self, headers: &Headers, id: QueryId, value: Value) {
        let _ = (headers, value);
        tracing::debug!(%id, "unmatched query reply dropped");
    }

    /// Observe an error reply the correlation table no longer matches.
    fn query_error(&mut self, headers: &Headers, id: QueryId, error: ServiceError) {
        let _ = headers;
        tracing::debug!(%id, %error, "unmatched query error dropped");
    }

    /// The mailbox became active.
    fn on_active(&mut self) {}

    /// The mailbox is shutting down; called before the queue drains.
    fn on_shutdown(&mut self, mode: ShutdownMode) {
        let _ = mode;
    }

    /// A checkpoint save was requested; complete `result` when the state is
    /// captured.
    fn on_save_request(&mut self, result: Completion) {
        result.ok();
    }

    /// The checkpoint completed downstream.
    fn on_save_end(&mut self) {}

    /// Replay journaled state; complete `result` when caught up. Activation
    /// waits for this completion.
    fn replay(&mut self, result: Completion) {
        result.ok();
    }
}
