//! Periodic timeout sweeper for pending queries (diagnostic path).
//!
//! The sweeper keeps a lightweight record per tracked query — id, expiry,
//! call-site label — in its own bucket array, mirroring the correlation
//! table's `id & (N - 1)` scheme. A periodic timer scans every bucket once per
//! cycle and fails queries whose expiry has passed, so timeout firing is
//! best-effort and may lag by up to one sweep interval.
//!
//! Completion authority stays with the [`QueryTable`]: a sweep that finds an
//! expired record extracts the entry from the table, and only the extraction
//! winner completes the caller. Records whose query already completed are
//! dropped silently on their next sweep, so nothing needs to unregister on the
//! reply path.
//!
//! Disabled unless a positive timeout is configured; the diagnostic default is
//! 120 seconds per entry.

use crate::error::ServiceError;
use crate::query::table::QueryTable;
use crate::query::QueryId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Diagnostic per-entry timeout applied when none is configured explicitly.
pub const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of sweeper buckets.
pub const DEFAULT_SWEEPER_BUCKETS: usize = 64;

/// Default scan interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Configuration for the timeout sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Bucket count; must be a non-zero power of two.
    pub bucket_count: usize,
    /// Per-entry timeout before a tracked query is failed.
    pub timeout: Duration,
    /// How often the scan runs.
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_SWEEPER_BUCKETS,
            timeout: DIAGNOSTIC_TIMEOUT,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

struct SweepRecord {
    expires: Instant,
    label: String,
}

/// Periodic deadline scanner over pending queries.
pub struct QuerySweeper {
    table: Arc<QueryTable>,
    buckets: Box<[Mutex<HashMap<u64, SweepRecord>>]>,
    mask: u64,
    timeout: Duration,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl QuerySweeper {
    /// Create a sweeper over the given correlation table.
    ///
    /// # Panics
    ///
    /// Panics unless `config.bucket_count` is a non-zero power of two.
    pub fn new(config: SweeperConfig, table: Arc<QueryTable>) -> Self {
        assert!(
            config.bucket_count.is_power_of_two(),
            "sweeper bucket count must be a power of two, got {}",
            config.bucket_count
        );

        let buckets = (0..config.bucket_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            table,
            buckets,
            mask: (config.bucket_count - 1) as u64,
            timeout: config.timeout,
            interval: config.interval,
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Spawn the periodic scan task. Must run inside a tokio runtime.
    pub fn start(self: Arc<Self>) {
        let mut slot = self.task.lock().unwrap();
        if slot.is_some() {
            return;
        }

        let sweeper = self.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh record is
            // never examined before one full interval elapsed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sweeper.closed.load(Ordering::Acquire) {
                    break;
                }
                sweeper.sweep();
            }
        });

        *slot = Some(handle);
    }

    /// Track a pending query for timeout enforcement.
    pub fn record(&self, id: QueryId, label: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let record = SweepRecord {
            expires: Instant::now() + self.timeout,
            label: label.to_string(),
        };
        self.bucket(id).lock().unwrap().insert(id.value(), record);
    }

    /// Number of records currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().unwrap().len())
            .sum()
    }

    /// Run one scan cycle over every bucket.
    ///
    /// Expired records are removed; the ones whose query is still pending in
    /// the table are failed with [`ServiceError::Timeout`]. Cost is O(total
    /// tracked records); unexpired records are left for the next cycle.
    pub fn sweep(&self) {
        let now = Instant::now();

        for bucket in self.buckets.iter() {
            let expired: Vec<(u64, SweepRecord)> = {
                let mut bucket = bucket.lock().unwrap();
                let keys: Vec<u64> = bucket
                    .iter()
                    .filter(|(_, record)| now >= record.expires)
                    .map(|(key, _)| *key)
                    .collect();
                keys.into_iter()
                    .filter_map(|key| bucket.remove(&key).map(|record| (key, record)))
                    .collect()
            };

            for (key, record) in expired {
                let id = QueryId::new(key);
                match self.table.extract(id) {
                    Some(entry) => {
                        tracing::warn!(%id, label = %record.label, "query timed out");
                        entry.complete(Err(ServiceError::Timeout));
                    }
                    None => {
                        tracing::debug!(%id, label = %record.label, "sweep record stale, query already completed");
                    }
                }
            }
        }
    }

    /// Fail every still-pending tracked query with `Closed` and cancel the
    /// timer.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }

        for bucket in self.buckets.iter() {
            let drained = std::mem::take(&mut *bucket.lock().unwrap());
            for (key, record) in drained {
                let id = QueryId::new(key);
                if let Some(entry) = self.table.extract(id) {
                    tracing::debug!(%id, label = %record.label, "failing tracked query on shutdown");
                    entry.complete(Err(ServiceError::Closed("sweeper shut down".into())));
                }
            }
        }
    }

    fn bucket(&self, id: QueryId) -> &Mutex<HashMap<u64, SweepRecord>> {
        &self.buckets[(id.value() & self.mask) as usize]
    }
}
