//! Sharded correlation table for pending queries.
//!
//! The table maps a 64-bit query id to the continuation that completes the
//! caller. Ids are allocated monotonically, seeded from wall-clock time so a
//! restarted process does not reuse ids still in flight somewhere else.
//!
//! # Architecture
//!
//! ```text
//! QueryTable
//!   buckets[0] ── Mutex<Vec<QueryEntry>>
//!   buckets[1] ── Mutex<Vec<QueryEntry>>
//!   ...
//!   buckets[N-1] (N a power of two; bucket = id & (N - 1))
//! ```
//!
//! Each bucket has its own lock; different ids in different buckets proceed
//! independently and there is no global lock. `extract` is the only way an
//! entry completes: at most one caller wins the removal per id, which is what
//! enforces exactly-once completion under timeout/reply/shutdown races.

use crate::error::ServiceError;
use crate::query::QueryId;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

/// Default number of buckets when none is configured.
pub const DEFAULT_BUCKET_COUNT: usize = 256;

/// Continuation completing a pending query's caller.
///
/// The two arms are the fast-path split checked once at send time: a `Direct`
/// sink has a caller already parked on a oneshot future and can be completed
/// from any thread without routing through the caller's mailbox; a `Callback`
/// sink runs an arbitrary continuation on whichever worker completes it.
pub enum ReplySink {
    /// Caller is awaiting a oneshot future; complete it in place.
    Direct(oneshot::Sender<Result<Value, ServiceError>>),

    /// Arbitrary continuation run by the completing worker.
    Callback(Box<dyn FnOnce(Result<Value, ServiceError>) + Send>),
}

impl ReplySink {
    /// Build a callback sink from a closure.
    pub fn callback(f: impl FnOnce(Result<Value, ServiceError>) + Send + 'static) -> Self {
        ReplySink::Callback(Box::new(f))
    }

    /// True when completion can bypass the caller's mailbox.
    pub fn is_direct(&self) -> bool {
        matches!(self, ReplySink::Direct(_))
    }

    /// Deliver the terminal result to the caller.
    pub fn complete(self, result: Result<Value, ServiceError>) {
        match self {
            ReplySink::Direct(sender) => {
                if sender.send(result).is_err() {
                    tracing::debug!("reply receiver dropped before completion");
                }
            }
            ReplySink::Callback(f) => f(result),
        }
    }
}

/// One pending query owned by the table.
pub struct QueryEntry {
    id: QueryId,
    caller: u64,
    expires: Option<Instant>,
    label: String,
    sink: ReplySink,
}

impl QueryEntry {
    /// The query id this entry answers.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Mailbox id of the caller awaiting the reply (0 for detached callers).
    pub fn caller(&self) -> u64 {
        self.caller
    }

    /// Absolute deadline carried for observability; enforcement belongs to
    /// the diagnostic sweeper.
    pub fn expires(&self) -> Option<Instant> {
        self.expires
    }

    /// Human-readable call-site label (`address.method`).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Complete the caller with the terminal result, consuming the entry.
    pub fn complete(self, result: Result<Value, ServiceError>) {
        self.sink.complete(result);
    }
}

/// Read-only snapshot of a pending entry, returned by [`QueryTable::get`].
#[derive(Debug, Clone)]
pub struct PendingQuery {
    /// The pending query's id.
    pub id: QueryId,
    /// Mailbox id of the caller (0 for detached callers).
    pub caller: u64,
    /// Absolute deadline, when the call site configured one.
    pub expires: Option<Instant>,
    /// Call-site label.
    pub label: String,
}

/// Sharded map from query id to pending continuation.
pub struct QueryTable {
    buckets: Box<[Mutex<Vec<QueryEntry>>]>,
    mask: u64,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl QueryTable {
    /// Create a table with `bucket_count` buckets.
    ///
    /// # Panics
    ///
    /// Panics unless `bucket_count` is a non-zero power of two.
    pub fn new(bucket_count: usize) -> Self {
        assert!(
            bucket_count.is_power_of_two(),
            "bucket count must be a power of two, got {bucket_count}"
        );

        let buckets = (0..bucket_count)
            .map(|_| Mutex::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        // Seed from wall-clock millis, shifted to leave id headroom per
        // millisecond, so a restarted process starts above any id the previous
        // incarnation handed out.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| (elapsed.as_millis() as u64) << 20)
            .unwrap_or(1);

        Self {
            buckets,
            mask: (bucket_count - 1) as u64,
            next_id: AtomicU64::new(seed),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket index for an id: `id & (bucket_count - 1)`.
    pub fn bucket_index(&self, id: QueryId) -> usize {
        (id.value() & self.mask) as usize
    }

    /// Allocate the next id and store the continuation under it.
    ///
    /// Never blocks longer than the owning bucket's lock hold. If the table
    /// already closed, the sink is failed `Closed` immediately instead of
    /// being stored (a racing `add` during `close` may still land in a bucket;
    /// see [`close`](Self::close)).
    pub fn add(
        &self,
        caller: u64,
        expires: Option<Instant>,
        label: impl Into<String>,
        sink: ReplySink,
    ) -> QueryId {
        let id = QueryId::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(%id, "query table closed, failing new query");
            sink.complete(Err(ServiceError::Closed("query table closed".into())));
            return id;
        }

        let entry = QueryEntry {
            id,
            caller,
            expires,
            label: label.into(),
            sink,
        };

        self.buckets[self.bucket_index(id)]
            .lock()
            .unwrap()
            .push(entry);
        id
    }

    /// Non-destructive lookup.
    ///
    /// Absence is expected (duplicate replies, already-swept queries) and is
    /// reported as `None`, not an error.
    pub fn get(&self, id: QueryId) -> Option<PendingQuery> {
        let bucket = self.buckets[self.bucket_index(id)].lock().unwrap();
        bucket.iter().find(|entry| entry.id == id).map(|entry| PendingQuery {
            id: entry.id,
            caller: entry.caller,
            expires: entry.expires,
            label: entry.label.clone(),
        })
    }

    /// Destructive lookup; the only way a query leaves the table.
    ///
    /// Idempotent: extracting an absent id is a logged no-op returning `None`.
    /// Removal compacts the bucket with `swap_remove`, so bucket ordering is
    /// not preserved.
    pub fn extract(&self, id: QueryId) -> Option<QueryEntry> {
        let mut bucket = self.buckets[self.bucket_index(id)].lock().unwrap();
        match bucket.iter().position(|entry| entry.id == id) {
            Some(index) => Some(bucket.swap_remove(index)),
            None => {
                tracing::debug!(%id, "extract miss, query already completed");
                None
            }
        }
    }

    /// Total entries currently pending, summed across buckets.
    pub fn pending_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().unwrap().len())
            .sum()
    }

    /// Fail every remaining entry with `Closed` and empty the table.
    ///
    /// Buckets are drained one at a time under their own locks; there is no
    /// global lock, so this is a point-in-time best-effort drain, not a strict
    /// barrier — an `add` racing with `close` may or may not observe it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);

        for bucket in self.buckets.iter() {
            let drained = std::mem::take(&mut *bucket.lock().unwrap());
            for entry in drained {
                tracing::debug!(id = %entry.id, label = %entry.label, "failing query on close");
                entry.complete(Err(ServiceError::Closed("query table closed".into())));
            }
        }
    }

    /// Fail every entry whose caller is the given mailbox.
    ///
    /// Used when a single mailbox closes: its callers can no longer receive
    /// replies, so their queries terminate `Closed` here, exactly once each.
    pub fn close_caller(&self, caller: u64, address: &str) {
        for bucket in self.buckets.iter() {
            let mut drained = Vec::new();
            {
                let mut bucket = bucket.lock().unwrap();
                let mut index = 0;
                while index < bucket.len() {
                    if bucket[index].caller == caller {
                        drained.push(bucket.swap_remove(index));
                    } else {
                        index += 1;
                    }
                }
            }
            for entry in drained {
                tracing::debug!(id = %entry.id, %address, "failing query for closed mailbox");
                entry.complete(Err(ServiceError::closed(address)));
            }
        }
    }
}

impl Default for QueryTable {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_COUNT)
    }
}
