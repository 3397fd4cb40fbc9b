//! # Rookery
//!
//! An in-process actor-style message-passing runtime.
//!
//! Services ("stubs") communicate exclusively by enqueuing typed messages
//! onto per-service mailboxes, each drained sequentially by one worker. The
//! runtime correlates request/reply pairs across mailbox boundaries with
//! unique 64-bit ids, aggregates streaming fan-out through fork/join, and
//! threads an immutable header chain through every hop.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Runtime                              │
//! │  ServiceRef ──► Outbox ──offer/flush──► Inbox ──► worker     │
//! │                                            │          │      │
//! │        QueryTable ◄──add/extract───────────┘        Stub     │
//! │            │                                                 │
//! │       QuerySweeper (periodic timeout scan, diagnostic)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`mailbox`] — per-service FIFO queues and the sequential workers that
//!   drain them; the caller-side [`Outbox`](mailbox::Outbox) batching context.
//! - [`messaging`] — the closed set of message variants (send, query, stream,
//!   control, replies), the query state machine, fork/join aggregation, and
//!   the immutable [`Headers`](messaging::Headers) chain.
//! - [`query`] — the sharded correlation table and the diagnostic timeout
//!   sweeper.
//! - [`runtime`] — the root object tying it together, plus the
//!   [`ServiceRef`](runtime::ServiceRef) caller facade.
//! - [`stub`] — the boundary trait where business logic plugs in.
//!
//! ## Guarantees
//!
//! - One mailbox, one worker: at most one message is invoked against a stub
//!   at a time, FIFO per mailbox, nothing ordered across mailboxes.
//! - A query's caller observes exactly one terminal among reply, timeout, and
//!   shutdown-close, enforced by single-winner extraction from the
//!   correlation table.
//! - Nothing in the core blocks a thread on I/O; continuation is by explicit
//!   callback values, not suspended coroutines.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rookery::prelude::*;
//!
//! let runtime = Runtime::new();
//! let counter = runtime.service("local://counter", Box::new(CounterStub::default()));
//!
//! let value = counter.query("increment", vec![]).await?;
//! runtime.shutdown(ShutdownMode::Graceful);
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod mailbox;
pub mod messaging;
pub mod prelude;
pub mod query;
pub mod runtime;
pub mod stub;

// Re-exports of the main entry points
pub use error::ServiceError;
pub use runtime::{Runtime, RuntimeBuilder, ServiceRef};
pub use stub::{ShutdownMode, Stub};
