//! Caller facade for one service: message construction and sending.

use crate::error::ServiceError;
use crate::mailbox::inbox::Inbox;
use crate::mailbox::outbox::Outbox;
use crate::messaging::headers::Headers;
use crate::messaging::message::{
    ControlMessage, Message, QueryErrorMessage, QueryReplyMessage, SendMessage,
};
use crate::messaging::query::QueryMessage;
use crate::messaging::stream::{StreamCallMessage, StreamJoin, StreamSink};
use crate::query::table::ReplySink;
use crate::query::QueryId;
use crate::runtime::RuntimeInner;
use crate::stub::{Completion, ShutdownMode};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Handle to one service's mailbox.
///
/// Cloneable; all senders funnel into the same sequential worker. The plain
/// methods (`send`, `query`, `stream`) acquire a transient scoped outbox; the
/// `_with` variants take the caller's own outbox so completions resume inside
/// the caller's mailbox.
pub struct ServiceRef {
    inbox: Arc<Inbox>,
    runtime: Arc<RuntimeInner>,
}

impl Clone for ServiceRef {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl ServiceRef {
    pub(crate) fn new(inbox: Arc<Inbox>, runtime: Arc<RuntimeInner>) -> Self {
        Self { inbox, runtime }
    }

    /// The service address.
    pub fn address(&self) -> &str {
        self.inbox.address()
    }

    /// True once the mailbox started closing.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Close this service's mailbox, draining per the mode.
    pub fn close(&self, mode: ShutdownMode) {
        self.inbox.close(mode);
    }

    /// Fire-and-forget from outside any mailbox.
    pub fn send(&self, method: &str, args: Vec<Value>) {
        Outbox::scoped(|outbox| self.send_with(outbox, Headers::new(), method, args));
    }

    /// Fire-and-forget batched on the caller's outbox.
    pub fn send_with(&self, outbox: &mut Outbox, headers: Headers, method: &str, args: Vec<Value>) {
        let headers = self.inbox.trace_headers(&headers, method);
        outbox.offer(Message::Send(SendMessage::new(
            self.inbox.clone(),
            headers,
            method,
            args,
        )));
    }

    /// Query from outside any mailbox; await the returned future for the
    /// reply.
    pub fn query(&self, method: &str, args: Vec<Value>) -> QueryFuture {
        let (tx, rx) = oneshot::channel();
        Outbox::scoped(|outbox| {
            self.query_with(outbox, Headers::new(), method, args, ReplySink::Direct(tx));
        });
        QueryFuture { receiver: rx }
    }

    /// Query with an explicit reply sink, batched on the caller's outbox.
    ///
    /// The continuation is registered in the correlation table before the
    /// message is offered; a `Direct` sink (or a caller with no mailbox) is
    /// completed in place, skipping the reply hop.
    pub fn query_with(
        &self,
        outbox: &mut Outbox,
        headers: Headers,
        method: &str,
        args: Vec<Value>,
        sink: ReplySink,
    ) -> QueryId {
        let timeout = self.runtime.default_query_timeout;
        self.query_with_timeout(outbox, headers, method, args, sink, timeout)
    }

    /// Query with a per-call-site deadline instead of the runtime default.
    pub fn query_with_timeout(
        &self,
        outbox: &mut Outbox,
        headers: Headers,
        method: &str,
        args: Vec<Value>,
        sink: ReplySink,
        timeout: Duration,
    ) -> QueryId {
        let headers = self.inbox.trace_headers(&headers, method);
        let caller = outbox.current_inbox().cloned();
        let direct = sink.is_direct() || caller.is_none();
        let caller_id = caller.as_ref().map(|inbox| inbox.id()).unwrap_or(0);
        let label = format!("{}.{}", self.inbox.address(), method);
        let expires = Instant::now() + timeout;

        let id = self
            .runtime
            .table
            .add(caller_id, Some(expires), label.clone(), sink);
        if let Some(sweeper) = &self.runtime.sweeper {
            sweeper.record(id, &label);
        }

        let query = QueryMessage::new(
            id,
            method.to_string(),
            headers,
            args,
            self.inbox.clone(),
            caller,
            self.runtime.table.clone(),
            direct,
        );
        QueryMessage::offer(&query, outbox);
        id
    }

    /// Streaming call from outside any mailbox; values and the terminal land
    /// in `downstream`.
    pub fn stream(&self, method: &str, args: Vec<Value>, downstream: Arc<dyn StreamSink>) -> QueryId {
        Outbox::scoped(|outbox| self.stream_with(outbox, Headers::new(), method, args, downstream))
    }

    /// Streaming call batched on the caller's outbox.
    pub fn stream_with(
        &self,
        outbox: &mut Outbox,
        headers: Headers,
        method: &str,
        args: Vec<Value>,
        downstream: Arc<dyn StreamSink>,
    ) -> QueryId {
        downstream.start();
        let join = StreamJoin::new(downstream);
        self.stream_leg(outbox, headers, method, args, &join)
    }

    /// One fan-out leg against this service, forked from a shared join.
    pub(crate) fn stream_leg(
        &self,
        outbox: &mut Outbox,
        headers: Headers,
        method: &str,
        args: Vec<Value>,
        join: &Arc<StreamJoin>,
    ) -> QueryId {
        let headers = self.inbox.trace_headers(&headers, method);
        let caller = outbox.current_inbox().cloned();
        let caller_id = caller.as_ref().map(|inbox| inbox.id()).unwrap_or(0);
        let label = format!("{}.{}", self.inbox.address(), method);

        // The table entry only ever fires on timeout/close; normal terminals
        // travel the stream result path and drop the entry unused.
        let guard = join.clone();
        let sink = ReplySink::callback(move |result| {
            if let Err(error) = result {
                guard.fail(error);
            } else {
                tracing::debug!("unexpected value completion for stream entry");
            }
        });

        let id = self.runtime.table.add(caller_id, None, label, sink);
        let fork = Arc::new(StreamJoin::fork(join));
        let call = StreamCallMessage::new(
            id,
            method.to_string(),
            headers,
            args,
            self.inbox.clone(),
            caller,
            fork,
            self.runtime.table.clone(),
        );
        outbox.offer(Message::StreamCall(call));
        id
    }

    /// Route a captured value back to whichever query this service's mailbox
    /// holds under `id`.
    pub fn query_reply(&self, headers: Headers, id: QueryId, value: Value) {
        Outbox::scoped(|outbox| self.query_reply_with(outbox, headers, id, value));
    }

    /// Reply routing batched on the caller's outbox.
    pub fn query_reply_with(&self, outbox: &mut Outbox, headers: Headers, id: QueryId, value: Value) {
        outbox.offer(Message::QueryReply(QueryReplyMessage::new(
            self.inbox.clone(),
            self.runtime.table.clone(),
            headers,
            id,
            value,
        )));
    }

    /// Route an error reply back by query id.
    pub fn query_error(&self, headers: Headers, id: QueryId, error: ServiceError) {
        Outbox::scoped(|outbox| self.query_error_with(outbox, headers, id, error));
    }

    /// Error-reply routing batched on the caller's outbox.
    pub fn query_error_with(
        &self,
        outbox: &mut Outbox,
        headers: Headers,
        id: QueryId,
        error: ServiceError,
    ) {
        outbox.offer(Message::QueryError(QueryErrorMessage::new(
            self.inbox.clone(),
            self.runtime.table.clone(),
            headers,
            id,
            error,
        )));
    }

    /// Request a checkpoint save; the stub completes `result` once its state
    /// is captured. Deliverable while the mailbox is busy or closing.
    pub fn checkpoint(&self, result: Completion) {
        self.inbox.offer_control(ControlMessage::OnSaveRequest(result));
    }

    /// Signal that the checkpoint completed downstream.
    pub fn checkpoint_end(&self) {
        self.inbox.offer_control(ControlMessage::OnSaveEnd);
    }
}

/// Future resolving to a query's terminal result.
pub struct QueryFuture {
    receiver: oneshot::Receiver<Result<Value, ServiceError>>,
}

impl Future for QueryFuture {
    type Output = Result<Value, ServiceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Closed("reply channel dropped".into())),
        })
    }
}
