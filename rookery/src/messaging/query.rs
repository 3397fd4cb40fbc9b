//! Correlated request/reply messages and their state machine.
//!
//! A query travels as one message value through two hops: first to the target
//! mailbox where the stub produces a value or an error, then back to the
//! caller's mailbox as its own reply. The state machine decides what `invoke`
//! means at each hop.
//!
//! # States
//!
//! ```text
//! Query ──offer──► Sent ──complete──► Complete ──invoke──► Closed
//!   │                │                                        ▲
//!   └───fail───────► Failed ──────────invoke─────────────────┘
//! ```
//!
//! Two outcomes are deliberately distinct:
//! - **benign double completion** — `complete`/`fail` on a terminal query is a
//!   logged no-op, because timeout and reply legitimately race;
//! - **fatal invalid transition** — any other unmodeled transition panics
//!   loudly, because it is a protocol bug, not a race.
//!
//! The caller's continuation lives in the [`QueryTable`]; extraction there is
//! the single winner path, so the caller observes exactly one terminal among
//! reply, timeout, and shutdown-close.

use crate::error::ServiceError;
use crate::mailbox::inbox::Inbox;
use crate::mailbox::outbox::Outbox;
use crate::messaging::headers::Headers;
use crate::messaging::message::Message;
use crate::query::table::QueryTable;
use crate::query::QueryId;
use crate::stub::Stub;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Lifecycle state of a query message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Constructed, not yet delivered.
    Query,
    /// Delivery attempted; awaiting the stub.
    Sent,
    /// The stub produced a value; result delivery scheduled.
    Complete,
    /// The stub or the delivery path produced an error.
    Failed,
    /// Terminal; the result reached the caller's continuation.
    Closed,
}

struct QueryCore {
    state: QueryState,
    value: Option<Value>,
    error: Option<ServiceError>,
}

/// A correlated request awaiting exactly one reply or failure.
///
/// The message is shared behind `Arc` because it crosses mailbox boundaries:
/// the target worker drives it to `Complete`/`Failed`, the caller worker (or
/// the direct fast path) drives it to `Closed`.
pub struct QueryMessage {
    id: QueryId,
    method: String,
    headers: Headers,
    args: Mutex<Option<Vec<Value>>>,
    target: Arc<Inbox>,
    caller: Option<Arc<Inbox>>,
    table: Arc<QueryTable>,
    direct: bool,
    core: Mutex<QueryCore>,
}

impl QueryMessage {
    /// Build a query in the initial `Query` state.
    ///
    /// `direct` is the fast-path flag checked once at send time: a caller
    /// already parked on a future (or with no mailbox at all) receives its
    /// result in place instead of through a reply hop.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: QueryId,
        method: String,
        headers: Headers,
        args: Vec<Value>,
        target: Arc<Inbox>,
        caller: Option<Arc<Inbox>>,
        table: Arc<QueryTable>,
        direct: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            method,
            headers,
            args: Mutex::new(Some(args)),
            target,
            caller,
            table,
            direct,
            core: Mutex::new(QueryCore {
                state: QueryState::Query,
                value: None,
                error: None,
            }),
        })
    }

    /// The query's correlation id.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// The method being queried.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Current state.
    pub fn state(&self) -> QueryState {
        self.core.lock().unwrap().state
    }

    /// Header chain carried to the target.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mailbox this message routes to next: the target while outbound, the
    /// caller once it carries a result.
    pub(crate) fn route_target(&self) -> Arc<Inbox> {
        let state = self.core.lock().unwrap().state;
        match state {
            QueryState::Complete | QueryState::Failed => self
                .caller
                .clone()
                .unwrap_or_else(|| self.target.clone()),
            _ => self.target.clone(),
        }
    }

    /// Attempt delivery toward the target mailbox.
    ///
    /// # Panics
    ///
    /// Panics when the query was already sent or closed — offering twice is a
    /// protocol bug.
    pub(crate) fn offer(this: &Arc<Self>, outbox: &mut Outbox) {
        let state = this.state();
        match state {
            QueryState::Query => outbox.offer(Message::Query(this.clone())),
            QueryState::Complete | QueryState::Failed => Self::offer_result(this),
            QueryState::Sent | QueryState::Closed => {
                panic!("invalid transition: offer on query {} in state {state:?}", this.id)
            }
        }
    }

    /// Dispatch by state: forward to the stub on the target hop, deliver the
    /// captured result on the caller hop.
    ///
    /// # Panics
    ///
    /// Panics when invoked after `Closed` — a closed query can never be
    /// queued again without a protocol bug.
    pub(crate) fn invoke(this: &Arc<Self>, stub: &mut dyn Stub, outbox: &mut Outbox) {
        let state = this.state();
        match state {
            QueryState::Query | QueryState::Sent => {
                this.core.lock().unwrap().state = QueryState::Sent;

                let args = this.args.lock().unwrap().take().unwrap_or_default();
                let result = QueryResult {
                    query: this.clone(),
                };

                if let Err(error) = stub.query(outbox, &this.method, &this.headers, result, args) {
                    Self::fail(this, error);
                }
            }
            QueryState::Complete | QueryState::Failed => Self::deliver(this),
            QueryState::Closed => {
                panic!("invalid transition: invoke on closed query {}", this.id)
            }
        }
    }

    /// Record a value and schedule result delivery.
    ///
    /// Benign after `Closed` (timeout/reply race); fatal in any other
    /// unmodeled state.
    pub(crate) fn complete(this: &Arc<Self>, value: Value) {
        {
            let mut core = this.core.lock().unwrap();
            match core.state {
                QueryState::Sent => {
                    core.value = Some(value);
                    core.state = QueryState::Complete;
                }
                QueryState::Closed => {
                    tracing::debug!(id = %this.id, "complete on closed query, ignoring");
                    return;
                }
                state @ (QueryState::Query | QueryState::Complete | QueryState::Failed) => {
                    panic!(
                        "invalid transition: complete on query {} in state {state:?}",
                        this.id
                    )
                }
            }
        }

        Self::offer_result(this);
    }

    /// Record an error and schedule result delivery.
    ///
    /// Benign once a result was already captured or delivered — a query may
    /// fail twice only because timeout, shutdown, and reply race.
    pub(crate) fn fail(this: &Arc<Self>, error: ServiceError) {
        {
            let mut core = this.core.lock().unwrap();
            match core.state {
                QueryState::Query | QueryState::Sent => {
                    core.error = Some(error);
                    core.state = QueryState::Failed;
                }
                QueryState::Complete | QueryState::Failed | QueryState::Closed => {
                    if error.is_closed() {
                        tracing::debug!(id = %this.id, %error, "late failure on terminal query, ignoring");
                    } else {
                        tracing::debug!(id = %this.id, %error, "duplicate failure on terminal query, ignoring");
                    }
                    return;
                }
            }
        }

        Self::offer_result(this);
    }

    /// Route the captured result toward the caller.
    ///
    /// Direct queries skip the mailbox hop. When the caller's mailbox refuses
    /// the reply (already closed), the continuation is completed in place so
    /// the caller still observes exactly one terminal.
    fn offer_result(this: &Arc<Self>) {
        if this.direct {
            Self::deliver(this);
            return;
        }

        let caller = match &this.caller {
            Some(caller) => caller.clone(),
            None => {
                Self::deliver(this);
                return;
            }
        };

        if !caller.offer_result(Message::Query(this.clone())) {
            tracing::debug!(id = %this.id, "caller mailbox closed, delivering reply in place");
            Self::deliver(this);
        }
    }

    /// Caller-side terminal: hand the captured result to the continuation and
    /// close the query.
    fn deliver(this: &Arc<Self>) {
        let result = {
            let mut core = this.core.lock().unwrap();
            match core.state {
                QueryState::Complete => {
                    core.state = QueryState::Closed;
                    Ok(core.value.take().unwrap_or(Value::Null))
                }
                QueryState::Failed => {
                    core.state = QueryState::Closed;
                    Err(core
                        .error
                        .clone()
                        .unwrap_or_else(|| ServiceError::Execution("query failed without error".into())))
                }
                QueryState::Closed => {
                    tracing::debug!(id = %this.id, "result already delivered, ignoring");
                    return;
                }
                state @ (QueryState::Query | QueryState::Sent) => {
                    panic!(
                        "invalid transition: deliver on query {} in state {state:?}",
                        this.id
                    )
                }
            }
        };

        match this.table.extract(this.id) {
            Some(entry) => entry.complete(result),
            None => {
                tracing::debug!(
                    id = %this.id,
                    "reply lost the race, query already timed out or closed"
                );
            }
        }
    }
}

/// Reply handle handed to [`Stub::query`].
///
/// The stub completes it with `ok` or `fail`, immediately or after moving it
/// somewhere else. Consuming `self` keeps the happy path single-use; the
/// benign double-completion race is still tolerated underneath.
pub struct QueryResult {
    query: Arc<QueryMessage>,
}

impl QueryResult {
    /// The query being answered.
    pub fn id(&self) -> QueryId {
        self.query.id()
    }

    /// Complete the query with a value.
    pub fn ok(self, value: Value) {
        QueryMessage::complete(&self.query, value);
    }

    /// Fail the query.
    pub fn fail(self, error: ServiceError) {
        QueryMessage::fail(&self.query, error);
    }

    /// Complete from a combined result.
    pub fn handle(self, result: Result<Value, ServiceError>) {
        match result {
            Ok(value) => self.ok(value),
            Err(error) => self.fail(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::table::ReplySink;
    use serde_json::json;
    use tokio::sync::oneshot;

    struct EchoStub;

    impl Stub for EchoStub {
        fn query(
            &mut self,
            _outbox: &mut Outbox,
            method: &str,
            _headers: &Headers,
            result: QueryResult,
            mut args: Vec<Value>,
        ) -> Result<(), ServiceError> {
            match method {
                "echo" => {
                    result.ok(args.pop().unwrap_or(Value::Null));
                    Ok(())
                }
                "explode" => Err(ServiceError::Execution("explode".into())),
                _ => {
                    result.fail(ServiceError::Execution(format!("unknown method {method}")));
                    Ok(())
                }
            }
        }
    }

    fn direct_query(
        table: &Arc<QueryTable>,
        inbox: &Arc<Inbox>,
        method: &str,
        args: Vec<Value>,
    ) -> (Arc<QueryMessage>, oneshot::Receiver<Result<Value, ServiceError>>) {
        let (tx, rx) = oneshot::channel();
        let id = table.add(0, None, format!("test.{method}"), ReplySink::Direct(tx));
        let query = QueryMessage::new(
            id,
            method.to_string(),
            Headers::new(),
            args,
            inbox.clone(),
            None,
            table.clone(),
            true,
        );
        (query, rx)
    }

    fn test_inbox(table: &Arc<QueryTable>) -> Arc<Inbox> {
        Inbox::new("local://test".to_string(), table.clone())
    }

    #[test]
    fn test_query_completes_and_closes() {
        let table = Arc::new(QueryTable::new(8));
        let inbox = test_inbox(&table);
        let (query, mut rx) = direct_query(&table, &inbox, "echo", vec![json!(42)]);

        assert_eq!(query.state(), QueryState::Query);

        let mut stub = EchoStub;
        let mut outbox = Outbox::detached();
        QueryMessage::invoke(&query, &mut stub, &mut outbox);

        assert_eq!(query.state(), QueryState::Closed);
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!(42));
        assert!(table.get(query.id()).is_none());
    }

    #[test]
    fn test_terminal_query_swallows_late_completions() {
        let table = Arc::new(QueryTable::new(8));
        let inbox = test_inbox(&table);
        let (query, mut rx) = direct_query(&table, &inbox, "echo", vec![json!("first")]);

        let mut stub = EchoStub;
        let mut outbox = Outbox::detached();
        QueryMessage::invoke(&query, &mut stub, &mut outbox);

        // Late completions on the terminal state are no-ops.
        QueryMessage::complete(&query, json!("second"));
        QueryMessage::fail(&query, ServiceError::Timeout);

        assert_eq!(query.state(), QueryState::Closed);
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!("first"));
    }

    #[test]
    fn test_handler_error_fails_query() {
        let table = Arc::new(QueryTable::new(8));
        let inbox = test_inbox(&table);
        let (query, mut rx) = direct_query(&table, &inbox, "explode", vec![]);

        let mut stub = EchoStub;
        let mut outbox = Outbox::detached();
        QueryMessage::invoke(&query, &mut stub, &mut outbox);

        assert_eq!(query.state(), QueryState::Closed);
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(ServiceError::Execution(_))));
    }

    #[test]
    fn test_delivery_failure_fails_query() {
        let table = Arc::new(QueryTable::new(8));
        let inbox = test_inbox(&table);
        let (query, mut rx) = direct_query(&table, &inbox, "echo", vec![json!(1)]);

        QueryMessage::fail(&query, ServiceError::closed("local://test"));

        assert_eq!(query.state(), QueryState::Closed);
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(ServiceError::Closed(_))));
    }

    #[test]
    fn test_timeout_race_delivers_exactly_once() {
        let table = Arc::new(QueryTable::new(8));
        let inbox = test_inbox(&table);
        let (query, mut rx) = direct_query(&table, &inbox, "echo", vec![json!("slow")]);

        // The sweeper wins the race: it extracts and fails the entry first.
        table
            .extract(query.id())
            .expect("entry should be pending")
            .complete(Err(ServiceError::Timeout));

        // The stub's reply arrives afterwards and finds the table empty.
        let mut stub = EchoStub;
        let mut outbox = Outbox::detached();
        QueryMessage::invoke(&query, &mut stub, &mut outbox);

        assert_eq!(query.state(), QueryState::Closed);
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(ServiceError::Timeout)));
    }

    #[test]
    #[should_panic(expected = "invalid transition")]
    fn test_complete_before_send_is_fatal() {
        let table = Arc::new(QueryTable::new(8));
        let inbox = test_inbox(&table);
        let (query, _rx) = direct_query(&table, &inbox, "echo", vec![]);

        // Completing a query that was never sent is a protocol bug.
        QueryMessage::complete(&query, json!("early"));
    }

    #[test]
    #[should_panic(expected = "invalid transition")]
    fn test_invoke_after_close_is_fatal() {
        let table = Arc::new(QueryTable::new(8));
        let inbox = test_inbox(&table);
        let (query, _rx) = direct_query(&table, &inbox, "echo", vec![json!(1)]);

        let mut stub = EchoStub;
        let mut outbox = Outbox::detached();
        QueryMessage::invoke(&query, &mut stub, &mut outbox);
        assert_eq!(query.state(), QueryState::Closed);

        QueryMessage::invoke(&query, &mut stub, &mut outbox);
    }
}
