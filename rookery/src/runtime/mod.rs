//! Runtime root: service spawning, fan-out, and shutdown.
//!
//! A [`Runtime`] owns the shared pieces every service uses — the query
//! correlation table, the optional timeout sweeper, and the registry of live
//! mailboxes. Services run in parallel on the surrounding tokio runtime while
//! each individual mailbox stays strictly sequential.

pub mod builder;
pub mod service;

pub use builder::RuntimeBuilder;
pub use service::{QueryFuture, ServiceRef};

use crate::mailbox::inbox::Inbox;
use crate::mailbox::outbox::Outbox;
use crate::messaging::headers::Headers;
use crate::messaging::message::ControlMessage;
use crate::messaging::stream::{StreamJoin, StreamSink};
use crate::query::sweeper::QuerySweeper;
use crate::query::table::QueryTable;
use crate::stub::{Completion, ShutdownMode, Stub};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) struct RuntimeInner {
    pub(crate) table: Arc<QueryTable>,
    pub(crate) sweeper: Option<Arc<QuerySweeper>>,
    pub(crate) default_query_timeout: Duration,
    pub(crate) services: Mutex<Vec<Arc<Inbox>>>,
    pub(crate) closed: AtomicBool,
}

/// The message runtime: spawns services, correlates queries, aggregates
/// streams, and shuts everything down in order.
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Start configuring a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Build a runtime with default configuration.
    pub fn new() -> Self {
        RuntimeBuilder::new().build()
    }

    /// Spawn a service: a mailbox, its sequential worker, and an activation
    /// message. Must run inside a tokio runtime.
    pub fn service(&self, address: impl Into<String>, stub: Box<dyn Stub>) -> ServiceRef {
        let inbox = Inbox::new(address.into(), self.inner.table.clone());
        Inbox::start(&inbox, stub);
        inbox.offer_control(ControlMessage::OnActive);
        self.inner.services.lock().unwrap().push(inbox.clone());
        ServiceRef::new(inbox, self.inner.clone())
    }

    /// Spawn a journaled service: replay runs first, activation follows once
    /// the stub's replay completion fires.
    pub fn service_journaled(&self, address: impl Into<String>, stub: Box<dyn Stub>) -> ServiceRef {
        let inbox = Inbox::new(address.into(), self.inner.table.clone());
        Inbox::start(&inbox, stub);

        let activate = inbox.clone();
        inbox.offer_control(ControlMessage::Replay(Completion::new(move |result| {
            if let Err(error) = &result {
                tracing::warn!(%error, "replay failed, activating anyway");
            }
            activate.offer_control(ControlMessage::OnActive);
        })));

        self.inner.services.lock().unwrap().push(inbox.clone());
        ServiceRef::new(inbox, self.inner.clone())
    }

    /// The shared query correlation table.
    pub fn query_table(&self) -> &Arc<QueryTable> {
        &self.inner.table
    }

    /// True when the diagnostic timeout sweeper is running.
    pub fn has_sweeper(&self) -> bool {
        self.inner.sweeper.is_some()
    }

    /// Run one streaming call against several targets, aggregating their
    /// terminals through a shared join: every leg's values reach `downstream`
    /// immediately, and `downstream.ok()` fires once after the last leg
    /// finished.
    pub fn stream_fanout(
        &self,
        targets: &[ServiceRef],
        method: &str,
        args: Vec<Value>,
        downstream: Arc<dyn StreamSink>,
    ) {
        Outbox::scoped(|outbox| {
            self.stream_fanout_with(outbox, Headers::new(), targets, method, args, downstream)
        });
    }

    /// Fan-out batched on the caller's outbox.
    pub fn stream_fanout_with(
        &self,
        outbox: &mut Outbox,
        headers: Headers,
        targets: &[ServiceRef],
        method: &str,
        args: Vec<Value>,
        downstream: Arc<dyn StreamSink>,
    ) {
        downstream.start();
        let join = StreamJoin::new(downstream);

        // Holding a setup fork keeps the join from completing while legs are
        // still being created, and completes an empty fan-out immediately.
        let setup = StreamJoin::fork(&join);
        for target in targets {
            target.stream_leg(outbox, headers.clone(), method, args.clone(), &join);
        }
        setup.ok();
    }

    /// Shut down: stop the sweeper, close every mailbox, fail everything
    /// still pending with `Closed`.
    ///
    /// Returns without waiting for workers to finish draining; use
    /// [`shutdown_and_wait`](Self::shutdown_and_wait) when the drain must be
    /// observed.
    pub fn shutdown(&self, mode: ShutdownMode) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(sweeper) = &self.inner.sweeper {
            sweeper.shutdown();
        }

        let services = self.inner.services.lock().unwrap().clone();
        for inbox in &services {
            inbox.close(mode);
        }

        self.inner.table.close();
    }

    /// Shut down and await every worker's drain before failing the remaining
    /// table entries.
    pub async fn shutdown_and_wait(&self, mode: ShutdownMode) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(sweeper) = &self.inner.sweeper {
            sweeper.shutdown();
        }

        let services = self.inner.services.lock().unwrap().clone();
        for inbox in &services {
            inbox.close(mode);
        }
        for inbox in &services {
            inbox.join_worker().await;
        }

        self.inner.table.close();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
