//! The closed set of message variants a mailbox can carry.
//!
//! Every variant knows its next-hop mailbox, so the [`Outbox`] can route a
//! batch without inspecting payloads. Dispatch happens by pattern match in
//! [`Message::invoke`]; there is no inheritance and no open extension point.

use crate::error::ServiceError;
use crate::mailbox::inbox::Inbox;
use crate::mailbox::outbox::Outbox;
use crate::messaging::headers::Headers;
use crate::messaging::query::QueryMessage;
use crate::messaging::stream::{StreamCallMessage, StreamCancelMessage, StreamResultMessage};
use crate::query::table::QueryTable;
use crate::query::QueryId;
use crate::stub::{Completion, ShutdownMode, Stub};
use serde_json::Value;
use std::sync::Arc;

/// One unit of work queued on a mailbox.
pub enum Message {
    /// Fire-and-forget invocation; delivery failure is only logged.
    Send(SendMessage),

    /// Correlated request/reply; the same value travels out to the target and
    /// back to the caller, dispatching by its state.
    Query(Arc<QueryMessage>),

    /// Correlated multi-value streaming call toward a producer stub.
    StreamCall(Arc<StreamCallMessage>),

    /// A batch of stream values on its way back to the caller.
    StreamResult(StreamResultMessage),

    /// Best-effort cancellation note toward a stream producer.
    StreamCancel(StreamCancelMessage),

    /// System-generated reply routing a captured value back by query id.
    QueryReply(QueryReplyMessage),

    /// System-generated error reply routing a failure back by query id.
    QueryError(QueryErrorMessage),
}

impl Message {
    /// The mailbox this message routes to next.
    pub(crate) fn target(&self) -> Arc<Inbox> {
        match self {
            Message::Send(message) => message.target.clone(),
            Message::Query(query) => query.route_target(),
            Message::StreamCall(call) => call.target(),
            Message::StreamResult(message) => message.target(),
            Message::StreamCancel(message) => message.target(),
            Message::QueryReply(message) => message.target.clone(),
            Message::QueryError(message) => message.target.clone(),
        }
    }

    /// Invoke against the owning mailbox's stub. Called by the worker, one
    /// message at a time.
    pub(crate) fn invoke(self, stub: &mut dyn Stub, outbox: &mut Outbox) {
        match self {
            Message::Send(message) => message.invoke(stub, outbox),
            Message::Query(query) => QueryMessage::invoke(&query, stub, outbox),
            Message::StreamCall(call) => StreamCallMessage::invoke(&call, stub, outbox),
            Message::StreamResult(message) => message.invoke(),
            Message::StreamCancel(message) => message.invoke(),
            Message::QueryReply(message) => message.invoke(stub),
            Message::QueryError(message) => message.invoke(stub),
        }
    }

    /// Delivery failure: the message never reached a worker.
    pub(crate) fn fail(self, error: ServiceError) {
        match self {
            Message::Send(message) => message.fail(error),
            Message::Query(query) => QueryMessage::fail(&query, error),
            Message::StreamCall(call) => StreamCallMessage::fail(&call, error),
            Message::StreamResult(message) => message.fail(error),
            Message::StreamCancel(message) => message.fail(error),
            Message::QueryReply(message) => message.fail(error),
            Message::QueryError(message) => message.fail(error),
        }
    }
}

/// Lifecycle and checkpoint traffic, carried on the mailbox's priority lane
/// so it stays deliverable while the queue is busy or closing.
pub enum ControlMessage {
    /// The mailbox became active; invokes the stub's activation hook.
    OnActive,

    /// Shut the mailbox down, draining per the mode.
    OnShutdown(ShutdownMode),

    /// Request a checkpoint save; the stub completes the callback when its
    /// state is captured.
    OnSaveRequest(Completion),

    /// The checkpoint completed downstream.
    OnSaveEnd,

    /// Replay journaled state before activation; the stub completes the
    /// callback when caught up.
    Replay(Completion),
}

/// Fire-and-forget invocation of a stub method.
pub struct SendMessage {
    method: String,
    headers: Headers,
    args: Vec<Value>,
    target: Arc<Inbox>,
}

impl SendMessage {
    pub(crate) fn new(
        target: Arc<Inbox>,
        headers: Headers,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            method: method.into(),
            headers,
            args,
            target,
        }
    }

    /// The method being invoked.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn invoke(self, stub: &mut dyn Stub, outbox: &mut Outbox) {
        if let Err(error) = stub.send(outbox, &self.method, &self.headers, self.args) {
            tracing::warn!(method = %self.method, %error, "send handler failed");
        }
    }

    pub(crate) fn fail(self, error: ServiceError) {
        // Sends have no caller to notify; delivery failure is only logged.
        tracing::debug!(method = %self.method, %error, "dropping undeliverable send");
    }
}

/// System-generated reply carrying a query's captured value back by id.
pub struct QueryReplyMessage {
    id: QueryId,
    headers: Headers,
    value: Value,
    target: Arc<Inbox>,
    table: Arc<QueryTable>,
}

impl QueryReplyMessage {
    pub(crate) fn new(
        target: Arc<Inbox>,
        table: Arc<QueryTable>,
        headers: Headers,
        id: QueryId,
        value: Value,
    ) -> Self {
        Self {
            id,
            headers,
            value,
            target,
            table,
        }
    }

    pub(crate) fn invoke(self, stub: &mut dyn Stub) {
        match self.table.extract(self.id) {
            Some(entry) => entry.complete(Ok(self.value)),
            // Late or duplicate: the table no longer matches, hand the reply
            // to the stub's observation hook.
            None => stub.query_reply(&self.headers, self.id, self.value),
        }
    }

    pub(crate) fn fail(self, error: ServiceError) {
        tracing::debug!(id = %self.id, %error, "query reply undeliverable");
    }
}

/// System-generated error reply routed back by query id.
pub struct QueryErrorMessage {
    id: QueryId,
    headers: Headers,
    error: ServiceError,
    target: Arc<Inbox>,
    table: Arc<QueryTable>,
}

impl QueryErrorMessage {
    pub(crate) fn new(
        target: Arc<Inbox>,
        table: Arc<QueryTable>,
        headers: Headers,
        id: QueryId,
        error: ServiceError,
    ) -> Self {
        Self {
            id,
            headers,
            error,
            target,
            table,
        }
    }

    pub(crate) fn invoke(self, stub: &mut dyn Stub) {
        match self.table.extract(self.id) {
            Some(entry) => entry.complete(Err(self.error)),
            None => stub.query_error(&self.headers, self.id, self.error),
        }
    }

    pub(crate) fn fail(self, error: ServiceError) {
        tracing::debug!(id = %self.id, %error, "query error reply undeliverable");
    }
}
