//! Streaming calls: multi-value results, bounded batching, fork/join fan-out.
//!
//! A streaming call delivers any number of values to a caller-side sink
//! before finishing exactly once with `ok` or `fail`. Fan-out runs the same
//! call against several targets and aggregates their terminals through a
//! [`StreamJoin`]: every leg forwards values downstream immediately, and the
//! downstream `ok()` fires only when the last leg finished.
//!
//! # Value path
//!
//! ```text
//! producer stub ── accept(v) ──► StreamBatch ── StreamResultMessage ──► caller inbox
//!                                                                          │
//!                                       StreamFork::accept(v) ◄── invoke ──┘
//!                                                │
//!                                          downstream sink
//! ```
//!
//! Values are batched opportunistically: a result message still sitting in
//! the caller's queue keeps accepting values up to [`STREAM_BATCH_CAPACITY`];
//! once the worker claims it (or it fills up), the next value opens a fresh
//! message. Cancellation is cooperative — an in-memory flag checked before
//! each forward, plus a best-effort cancel message sent back to the producer
//! mailbox.

use crate::error::ServiceError;
use crate::mailbox::inbox::Inbox;
use crate::mailbox::outbox::Outbox;
use crate::messaging::headers::Headers;
use crate::messaging::message::Message;
use crate::query::table::QueryTable;
use crate::query::QueryId;
use crate::stub::Stub;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Maximum values one stream result message carries before the next value
/// opens a fresh message.
pub const STREAM_BATCH_CAPACITY: usize = 64;

/// Caller-side receiver for a streaming call.
///
/// `accept` may be called any number of times; the sink finishes exactly once
/// with `ok` or `fail`. `is_cancelled` is polled cooperatively by producers
/// before forwarding, so cancellation is best-effort, not immediate.
pub trait StreamSink: Send + Sync + 'static {
    /// The stream is about to produce values.
    fn start(&self) {}

    /// One streamed value.
    fn accept(&self, value: Value);

    /// Terminal success. Called at most once, after the last value.
    fn ok(&self);

    /// Terminal failure. Called at most once.
    fn fail(&self, error: ServiceError);

    /// True once the consumer lost interest; producers should stop.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Fan-in aggregation for a group of stream forks.
///
/// Each fork created from the join increments a pending counter; each fork's
/// terminal `ok()` decrements it, and the downstream sink's `ok()` fires
/// exactly once when the counter reaches zero. Values accepted by any fork
/// are forwarded downstream immediately, with no ordering across forks.
///
/// A single fork's failure is forwarded downstream immediately and latches
/// the join finished; sibling forks keep running and their late terminals are
/// swallowed. Failure does not cancel siblings.
pub struct StreamJoin {
    pending: AtomicUsize,
    finished: AtomicBool,
    downstream: Arc<dyn StreamSink>,
}

impl StreamJoin {
    /// Create a join delivering into `downstream`.
    pub fn new(downstream: Arc<dyn StreamSink>) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            downstream,
        })
    }

    /// Create a new fork, incrementing the pending counter.
    pub fn fork(join: &Arc<StreamJoin>) -> StreamFork {
        join.pending.fetch_add(1, Ordering::AcqRel);
        StreamFork {
            join: join.clone(),
            done: AtomicBool::new(false),
        }
    }

    /// One fork finished; fires the downstream `ok()` when it was the last.
    pub fn ok(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "join completed more often than forked");

        if previous == 1 && !self.finished.swap(true, Ordering::AcqRel) {
            self.downstream.ok();
        }
    }

    /// Forward a failure downstream immediately, latching the join finished.
    pub fn fail(&self, error: ServiceError) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.downstream.fail(error);
        } else {
            tracing::debug!(%error, "stream failure after join finished, ignoring");
        }
    }

    /// Forks still pending.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Cancellation state of the downstream sink.
    pub fn is_cancelled(&self) -> bool {
        self.downstream.is_cancelled()
    }

    fn accept(&self, value: Value) {
        self.downstream.accept(value);
    }
}

/// One leg of a fan-out, wrapping the shared [`StreamJoin`].
///
/// Forwards values downstream immediately and defers the downstream `ok()`
/// to the join's counter. A cancelled fork stops accepting.
pub struct StreamFork {
    join: Arc<StreamJoin>,
    done: AtomicBool,
}

impl StreamSink for StreamFork {
    fn accept(&self, value: Value) {
        if self.done.load(Ordering::Acquire) {
            tracing::debug!("value after fork terminal, dropping");
            return;
        }
        if self.is_cancelled() {
            tracing::debug!("fork cancelled, dropping value");
            return;
        }
        self.join.accept(value);
    }

    fn ok(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.join.ok();
        } else {
            tracing::debug!("duplicate fork ok, ignoring");
        }
    }

    fn fail(&self, error: ServiceError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.join.fail(error);
        } else {
            tracing::debug!(%error, "duplicate fork terminal, ignoring");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.join.is_cancelled()
    }
}

pub(crate) enum StreamEnd {
    Ok,
    Fail(ServiceError),
}

/// One batch of values (plus an optional terminal) in flight to the caller.
///
/// The batch stays open while its carrier message sits in the caller's queue:
/// the producer keeps appending until the worker claims it with
/// [`take`](Self::take) or the capacity bound is hit, whichever comes first.
pub(crate) struct StreamBatch {
    state: Mutex<BatchState>,
}

struct BatchState {
    values: Vec<Value>,
    end: Option<StreamEnd>,
    open: bool,
}

impl StreamBatch {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BatchState {
                values: Vec::new(),
                end: None,
                open: true,
            }),
        }
    }

    /// Append a value, or give it back when the batch is closed, terminal, or
    /// full.
    pub(crate) fn push(&self, value: Value) -> Result<(), Value> {
        let mut state = self.state.lock().unwrap();
        if !state.open || state.end.is_some() || state.values.len() >= STREAM_BATCH_CAPACITY {
            return Err(value);
        }
        state.values.push(value);
        Ok(())
    }

    /// Attach the terminal, or give it back when the batch is closed.
    pub(crate) fn push_end(&self, end: StreamEnd) -> Result<(), StreamEnd> {
        let mut state = self.state.lock().unwrap();
        if !state.open || state.end.is_some() {
            return Err(end);
        }
        state.end = Some(end);
        Ok(())
    }

    /// Claim the batch for delivery, closing it against further appends.
    pub(crate) fn take(&self) -> (Vec<Value>, Option<StreamEnd>) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        (std::mem::take(&mut state.values), state.end.take())
    }
}

/// Correlated streaming call from one caller to one target mailbox.
///
/// Carries the caller-side delivery leg (a fork of the shared join) and the
/// producer-side batching state. Fan-out sends one of these per target, each
/// with its own fork.
pub struct StreamCallMessage {
    id: QueryId,
    method: String,
    headers: Headers,
    args: Mutex<Option<Vec<Value>>>,
    target: Arc<Inbox>,
    caller: Option<Arc<Inbox>>,
    fork: Arc<StreamFork>,
    table: Arc<QueryTable>,
    current: Mutex<Option<Arc<StreamBatch>>>,
    ended: AtomicBool,
    cancelled: AtomicBool,
    cancel_sent: AtomicBool,
}

impl StreamCallMessage {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: QueryId,
        method: String,
        headers: Headers,
        args: Vec<Value>,
        target: Arc<Inbox>,
        caller: Option<Arc<Inbox>>,
        fork: Arc<StreamFork>,
        table: Arc<QueryTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            method,
            headers,
            args: Mutex::new(Some(args)),
            target,
            caller,
            fork,
            table,
            current: Mutex::new(None),
            ended: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_sent: AtomicBool::new(false),
        })
    }

    /// The call's correlation id.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// The method being streamed.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn target(&self) -> Arc<Inbox> {
        self.target.clone()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.fork.is_cancelled()
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Best-effort cancellation note back to the producer mailbox. Sent at
    /// most once.
    pub(crate) fn send_cancel(this: &Arc<Self>) {
        if this.cancel_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        this.mark_cancelled();
        let message = Message::StreamCancel(StreamCancelMessage { call: this.clone() });
        this.target.offer_and_wake(message);
    }

    /// Target-side delivery: hand the producer stub its result sink.
    pub(crate) fn invoke(this: &Arc<Self>, stub: &mut dyn Stub, outbox: &mut Outbox) {
        let args = this.args.lock().unwrap().take().unwrap_or_default();
        let sink = StreamResult { call: this.clone() };

        if let Err(error) = stub.stream(outbox, &this.method, &this.headers, sink, args) {
            Self::finish(this, StreamEnd::Fail(error));
        }
    }

    /// Delivery failure: the call never reached the target stub.
    pub(crate) fn fail(this: &Arc<Self>, error: ServiceError) {
        Self::finish(this, StreamEnd::Fail(error));
    }

    fn push_value(this: &Arc<Self>, value: Value) {
        // Detached caller: no mailbox hop, forward straight into the fork.
        if this.caller.is_none() {
            this.fork.accept(value);
            return;
        }

        let mut current = this.current.lock().unwrap();
        let value = match current.as_ref() {
            Some(batch) => match batch.push(value) {
                Ok(()) => return,
                Err(value) => value,
            },
            None => value,
        };

        let batch = Arc::new(StreamBatch::new());
        let _ = batch.push(value);
        *current = Some(batch.clone());
        drop(current);

        Self::deliver_batch(this, batch);
    }

    fn finish(this: &Arc<Self>, end: StreamEnd) {
        if this.ended.swap(true, Ordering::AcqRel) {
            tracing::debug!(id = %this.id, "late stream terminal, ignoring");
            return;
        }

        if this.caller.is_none() {
            // Detached caller: complete in place.
            let _ = this.table.extract(this.id);
            match end {
                StreamEnd::Ok => this.fork.ok(),
                StreamEnd::Fail(error) => this.fork.fail(error),
            }
            return;
        }

        let mut current = this.current.lock().unwrap();
        let end = match current.take() {
            Some(batch) => match batch.push_end(end) {
                Ok(()) => return,
                Err(end) => end,
            },
            None => end,
        };

        let batch = Arc::new(StreamBatch::new());
        let _ = batch.push_end(end);
        drop(current);

        Self::deliver_batch(this, batch);
    }

    fn deliver_batch(this: &Arc<Self>, batch: Arc<StreamBatch>) {
        let caller = match &this.caller {
            Some(caller) => caller.clone(),
            None => return,
        };

        let message = Message::StreamResult(StreamResultMessage {
            call: this.clone(),
            batch,
            caller: caller.clone(),
        });

        if !caller.offer_result(message) {
            tracing::debug!(id = %this.id, "caller mailbox closed, cancelling stream");
            this.mark_cancelled();
        }
    }
}

/// Producer-side sink handed to [`Stub::stream`].
///
/// Cheap to clone; values are forwarded toward the caller's mailbox in
/// bounded batches, and the terminal is delivered exactly once.
#[derive(Clone)]
pub struct StreamResult {
    call: Arc<StreamCallMessage>,
}

impl StreamResult {
    /// Push one value toward the caller. Dropped silently after the terminal
    /// or once the stream is cancelled.
    pub fn accept(&self, value: Value) {
        if self.call.ended.load(Ordering::Acquire) {
            tracing::debug!(id = %self.call.id, "value after stream terminal, dropping");
            return;
        }
        if self.call.is_cancelled() {
            tracing::debug!(id = %self.call.id, "stream cancelled, dropping value");
            return;
        }
        StreamCallMessage::push_value(&self.call, value);
    }

    /// Finish the stream successfully.
    pub fn ok(&self) {
        StreamCallMessage::finish(&self.call, StreamEnd::Ok);
    }

    /// Finish the stream with an error, forwarded downstream immediately.
    pub fn fail(&self, error: ServiceError) {
        StreamCallMessage::finish(&self.call, StreamEnd::Fail(error));
    }

    /// Cooperative cancellation check for the producer loop.
    pub fn is_cancelled(&self) -> bool {
        self.call.is_cancelled()
    }
}

/// One batch of stream values on its way back to the caller's mailbox.
pub struct StreamResultMessage {
    call: Arc<StreamCallMessage>,
    batch: Arc<StreamBatch>,
    caller: Arc<Inbox>,
}

impl StreamResultMessage {
    pub(crate) fn target(&self) -> Arc<Inbox> {
        self.caller.clone()
    }

    /// Caller-side delivery: drain the batch into the fork.
    pub(crate) fn invoke(self) {
        if self.call.fork.is_cancelled() {
            StreamCallMessage::send_cancel(&self.call);
        }

        let (values, end) = self.batch.take();
        for value in values {
            self.call.fork.accept(value);
        }

        match end {
            Some(StreamEnd::Ok) => {
                let _ = self.call.table.extract(self.call.id);
                self.call.fork.ok();
            }
            Some(StreamEnd::Fail(error)) => {
                let _ = self.call.table.extract(self.call.id);
                self.call.fork.fail(error);
            }
            None => {}
        }
    }

    /// Delivery failure: the caller mailbox is gone; its pending queries are
    /// failed by the mailbox close path, so only note it here.
    pub(crate) fn fail(self, error: ServiceError) {
        tracing::debug!(id = %self.call.id, %error, "stream result undeliverable");
        self.call.mark_cancelled();
    }
}

/// Best-effort cancellation note toward the producer mailbox.
pub struct StreamCancelMessage {
    call: Arc<StreamCallMessage>,
}

impl StreamCancelMessage {
    pub(crate) fn target(&self) -> Arc<Inbox> {
        self.call.target()
    }

    pub(crate) fn invoke(self) {
        tracing::debug!(id = %self.call.id, method = %self.call.method, "stream cancelled by consumer");
        self.call.mark_cancelled();
    }

    pub(crate) fn fail(self, error: ServiceError) {
        tracing::debug!(id = %self.call.id, %error, "stream cancel undeliverable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct TestSink {
        values: Mutex<Vec<Value>>,
        oks: AtomicUsize,
        fails: AtomicUsize,
        cancelled: AtomicBool,
    }

    impl StreamSink for TestSink {
        fn accept(&self, value: Value) {
            self.values.lock().unwrap().push(value);
        }

        fn ok(&self) {
            self.oks.fetch_add(1, Ordering::SeqCst);
        }

        fn fail(&self, _error: ServiceError) {
            self.fails.fetch_add(1, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_join_fires_ok_once_after_all_forks() {
        let sink = Arc::new(TestSink::default());
        let join = StreamJoin::new(sink.clone());

        let forks: Vec<StreamFork> = (0..3).map(|_| StreamJoin::fork(&join)).collect();
        assert_eq!(join.pending(), 3);

        forks[0].ok();
        assert_eq!(sink.oks.load(Ordering::SeqCst), 0);
        forks[2].ok();
        assert_eq!(sink.oks.load(Ordering::SeqCst), 0);
        forks[1].ok();
        assert_eq!(sink.oks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_values_forward_immediately_across_forks() {
        let sink = Arc::new(TestSink::default());
        let join = StreamJoin::new(sink.clone());

        let a = StreamJoin::fork(&join);
        let b = StreamJoin::fork(&join);

        a.accept(serde_json::json!(1));
        b.accept(serde_json::json!(2));
        a.accept(serde_json::json!(3));

        assert_eq!(sink.values.lock().unwrap().len(), 3);
        assert_eq!(sink.oks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fork_fail_forwards_without_waiting_for_siblings() {
        let sink = Arc::new(TestSink::default());
        let join = StreamJoin::new(sink.clone());

        let a = StreamJoin::fork(&join);
        let b = StreamJoin::fork(&join);

        a.fail(ServiceError::Execution("boom".into()));
        assert_eq!(sink.fails.load(Ordering::SeqCst), 1);

        // The sibling's late terminal is swallowed by the finished latch.
        b.ok();
        assert_eq!(sink.oks.load(Ordering::SeqCst), 0);
        assert_eq!(sink.fails.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_fork_terminals_ignored() {
        let sink = Arc::new(TestSink::default());
        let join = StreamJoin::new(sink.clone());

        let fork = StreamJoin::fork(&join);
        fork.ok();
        fork.ok();
        fork.fail(ServiceError::Timeout);

        assert_eq!(sink.oks.load(Ordering::SeqCst), 1);
        assert_eq!(sink.fails.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancelled_fork_stops_accepting() {
        let sink = Arc::new(TestSink::default());
        let join = StreamJoin::new(sink.clone());
        let fork = StreamJoin::fork(&join);

        fork.accept(serde_json::json!("kept"));
        sink.cancelled.store(true, Ordering::SeqCst);
        fork.accept(serde_json::json!("dropped"));

        assert_eq!(sink.values.lock().unwrap().len(), 1);
        assert!(fork.is_cancelled());
    }

    #[test]
    fn test_batch_is_bounded() {
        let batch = StreamBatch::new();
        for i in 0..STREAM_BATCH_CAPACITY {
            assert!(batch.push(serde_json::json!(i)).is_ok());
        }
        assert!(batch.push(serde_json::json!("overflow")).is_err());

        let (values, end) = batch.take();
        assert_eq!(values.len(), STREAM_BATCH_CAPACITY);
        assert!(end.is_none());

        // Closed after take: appends bounce.
        assert!(batch.push(serde_json::json!("late")).is_err());
        assert!(batch.push_end(StreamEnd::Ok).is_err());
    }

    #[test]
    fn test_batch_carries_terminal() {
        let batch = StreamBatch::new();
        assert!(batch.push(serde_json::json!(1)).is_ok());
        assert!(batch.push_end(StreamEnd::Ok).is_ok());

        // A terminal batch accepts no further values or terminals.
        assert!(batch.push(serde_json::json!(2)).is_err());
        assert!(batch.push_end(StreamEnd::Fail(ServiceError::Timeout)).is_err());

        let (values, end) = batch.take();
        assert_eq!(values.len(), 1);
        assert!(matches!(end, Some(StreamEnd::Ok)));
    }
}
