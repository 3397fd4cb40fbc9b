//! Per-service mailbox and its sequential worker.
//!
//! An inbox owns a FIFO queue of [`Message`]s plus a priority lane for
//! [`ControlMessage`]s, drained by exactly one spawned worker task. At most
//! one message is invoked against the stub at a time, which gives per-service
//! sequential consistency while different services run in parallel on the
//! shared tokio runtime.
//!
//! # Queues
//!
//! ```text
//! offer / offer_and_wake ──► queue ────┐
//!                                      ├──► worker ──► stub
//! offer_control ──────► control ───────┘   (control drained first,
//!                                           accepted even while closing)
//! ```
//!
//! `offer` only enqueues; `offer_and_wake` also schedules the worker. The
//! plain variant is the batching path: [`Outbox::flush`] offers a whole batch
//! and wakes each touched mailbox once at the end.
//!
//! On close, every message still queued and every query still pending for
//! this mailbox is failed with a `Closed` error exactly once.

use crate::error::ServiceError;
use crate::mailbox::outbox::Outbox;
use crate::messaging::headers::Headers;
use crate::messaging::message::{ControlMessage, Message};
use crate::query::table::QueryTable;
use crate::stub::{ShutdownMode, Stub};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

static NEXT_INBOX_ID: AtomicU64 = AtomicU64::new(1);

/// A service's mailbox: message queue, control lane, and worker handle.
pub struct Inbox {
    id: u64,
    address: String,
    queue: Mutex<VecDeque<Message>>,
    control: Mutex<VecDeque<ControlMessage>>,
    notify: Notify,
    closed: AtomicBool,
    table: Arc<QueryTable>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inbox {
    pub(crate) fn new(address: String, table: Arc<QueryTable>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_INBOX_ID.fetch_add(1, Ordering::Relaxed),
            address,
            queue: Mutex::new(VecDeque::new()),
            control: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            table,
            worker: Mutex::new(None),
        })
    }

    /// Process-unique mailbox id; tags table entries for per-mailbox drains.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The service address, used in logs and `Closed` errors.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// True once the mailbox started closing; new offers fail immediately.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Messages currently queued (excluding the control lane).
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Enqueue without scheduling the worker. Returns immediately; admission
    /// never blocks. Offers to a closed mailbox fail the message with
    /// `Closed`.
    pub fn offer(&self, message: Message) {
        if self.is_closed() {
            message.fail(ServiceError::closed(&self.address));
            return;
        }
        self.queue.lock().unwrap().push_back(message);
    }

    /// Enqueue and make sure the worker is scheduled if idle.
    pub fn offer_and_wake(&self, message: Message) {
        self.offer(message);
        self.wake();
    }

    /// Reply-path enqueue: returns `false` on a closed mailbox instead of
    /// failing the message, so the sender can complete the continuation in
    /// place.
    pub(crate) fn offer_result(&self, message: Message) -> bool {
        if self.is_closed() {
            return false;
        }
        self.queue.lock().unwrap().push_back(message);
        self.wake();
        true
    }

    /// Enqueue on the priority lane; accepted even while closing.
    pub(crate) fn offer_control(&self, control: ControlMessage) {
        self.control.lock().unwrap().push_back(control);
        self.wake();
    }

    /// Schedule the worker if it is parked.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Begin shutdown: new offers fail from here on, and the worker drains
    /// per the mode before stopping.
    pub(crate) fn close(&self, mode: ShutdownMode) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(address = %self.address, ?mode, "closing mailbox");
        self.offer_control(ControlMessage::OnShutdown(mode));
    }

    /// Decorate an outgoing header chain with routing breadcrumbs.
    ///
    /// Breadcrumbs are added when debug tracing is enabled or the chain is
    /// already non-empty; a chain length in `100..120` logs a possible
    /// message cycle.
    pub(crate) fn trace_headers(&self, headers: &Headers, method: &str) -> Headers {
        if headers.is_empty() && !tracing::enabled!(tracing::Level::DEBUG) {
            return headers.clone();
        }

        let size = headers.size();
        if (100..120).contains(&size) {
            tracing::warn!(
                address = %self.address,
                %method,
                size,
                "possible message cycle in header chain"
            );
        }

        let index = size / 2 + 1;
        headers
            .add(format!("service.{index}"), self.address.clone())
            .add(format!("method.{index}"), method)
    }

    /// Spawn the sequential worker owning `stub`. Must run inside a tokio
    /// runtime.
    pub(crate) fn start(inbox: &Arc<Inbox>, mut stub: Box<dyn Stub>) {
        let worker_inbox = inbox.clone();
        let handle = tokio::spawn(async move {
            let mut outbox = Outbox::for_worker(worker_inbox.clone());
            loop {
                if let Some(control) = worker_inbox.pop_control() {
                    let keep_running =
                        worker_inbox.handle_control(control, stub.as_mut(), &mut outbox);
                    outbox.flush();
                    if !keep_running {
                        break;
                    }
                    continue;
                }

                if let Some(message) = worker_inbox.pop_message() {
                    message.invoke(stub.as_mut(), &mut outbox);
                    outbox.flush();
                    continue;
                }

                worker_inbox.notify.notified().await;
            }
            tracing::debug!(address = %worker_inbox.address, "mailbox worker stopped");
        });

        *inbox.worker.lock().unwrap() = Some(handle);
    }

    /// Await the worker task, if it is still running.
    pub(crate) async fn join_worker(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn pop_control(&self) -> Option<ControlMessage> {
        self.control.lock().unwrap().pop_front()
    }

    fn pop_message(&self) -> Option<Message> {
        self.queue.lock().unwrap().pop_front()
    }

    fn handle_control(
        &self,
        control: ControlMessage,
        stub: &mut dyn Stub,
        outbox: &mut Outbox,
    ) -> bool {
        match control {
            ControlMessage::OnActive => {
                tracing::debug!(address = %self.address, "mailbox active");
                stub.on_active();
                true
            }
            ControlMessage::OnSaveRequest(result) => {
                stub.on_save_request(result);
                true
            }
            ControlMessage::OnSaveEnd => {
                stub.on_save_end();
                true
            }
            ControlMessage::Replay(result) => {
                stub.replay(result);
                true
            }
            ControlMessage::OnShutdown(mode) => {
                stub.on_shutdown(mode);
                self.drain_on_shutdown(mode, stub, outbox);
                self.table.close_caller(self.id, &self.address);
                false
            }
        }
    }

    fn drain_on_shutdown(&self, mode: ShutdownMode, stub: &mut dyn Stub, outbox: &mut Outbox) {
        match mode {
            ShutdownMode::Graceful => {
                while let Some(message) = self.pop_message() {
                    message.invoke(stub, outbox);
                    outbox.flush();
                }
            }
            ShutdownMode::Immediate => {
                let mut dropped = 0usize;
                while let Some(message) = self.pop_message() {
                    message.fail(ServiceError::closed(&self.address));
                    dropped += 1;
                }
                if dropped > 0 {
                    tracing::debug!(address = %self.address, dropped, "failed queued messages on close");
                }
            }
        }
    }
}
