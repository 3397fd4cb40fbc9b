//! Runtime configuration builder.

use crate::query::sweeper::{
    QuerySweeper, SweeperConfig, DEFAULT_SWEEPER_BUCKETS, DEFAULT_SWEEP_INTERVAL,
    DIAGNOSTIC_TIMEOUT,
};
use crate::query::table::{QueryTable, DEFAULT_BUCKET_COUNT};
use crate::runtime::{Runtime, RuntimeInner};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default per-call query timeout carried as table-entry data.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for a [`Runtime`].
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::builder()
///     .query_buckets(512)
///     .diagnostics()
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    query_buckets: usize,
    default_query_timeout: Duration,
    sweeper_buckets: usize,
    sweep_interval: Duration,
    sweep_timeout: Option<Duration>,
}

impl RuntimeBuilder {
    /// Start from the defaults: 256 query buckets, 30 s default query
    /// timeout, sweeper disabled.
    pub fn new() -> Self {
        Self {
            query_buckets: DEFAULT_BUCKET_COUNT,
            default_query_timeout: DEFAULT_QUERY_TIMEOUT,
            sweeper_buckets: DEFAULT_SWEEPER_BUCKETS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweep_timeout: None,
        }
    }

    /// Number of correlation-table buckets. Must be a power of two.
    pub fn query_buckets(mut self, count: usize) -> Self {
        self.query_buckets = count;
        self
    }

    /// Default deadline recorded for queries without a per-call timeout.
    pub fn default_query_timeout(mut self, timeout: Duration) -> Self {
        self.default_query_timeout = timeout;
        self
    }

    /// Enable the timeout sweeper with the given per-entry timeout. A zero
    /// timeout leaves it disabled.
    pub fn sweep_timeout(mut self, timeout: Duration) -> Self {
        self.sweep_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Enable the sweeper with the diagnostic default timeout (120 s).
    pub fn diagnostics(self) -> Self {
        self.sweep_timeout(DIAGNOSTIC_TIMEOUT)
    }

    /// How often the sweeper scans. Only meaningful once a sweep timeout is
    /// configured.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Number of sweeper buckets. Must be a power of two.
    pub fn sweeper_buckets(mut self, count: usize) -> Self {
        self.sweeper_buckets = count;
        self
    }

    /// Build the runtime. When the sweeper is enabled this spawns its scan
    /// task and must run inside a tokio runtime.
    pub fn build(self) -> Runtime {
        let table = Arc::new(QueryTable::new(self.query_buckets));

        let sweeper = self.sweep_timeout.map(|timeout| {
            let sweeper = Arc::new(QuerySweeper::new(
                SweeperConfig {
                    bucket_count: self.sweeper_buckets,
                    timeout,
                    interval: self.sweep_interval,
                },
                table.clone(),
            ));
            sweeper.clone().start();
            sweeper
        });

        Runtime {
            inner: Arc::new(RuntimeInner {
                table,
                sweeper,
                default_query_timeout: self.default_query_timeout,
                services: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults() {
        let runtime = RuntimeBuilder::new().build();
        assert_eq!(runtime.query_table().bucket_count(), DEFAULT_BUCKET_COUNT);
        assert!(!runtime.has_sweeper());
    }

    #[tokio::test]
    async fn test_zero_sweep_timeout_disables_sweeper() {
        let runtime = RuntimeBuilder::new()
            .sweep_timeout(Duration::ZERO)
            .build();
        assert!(!runtime.has_sweeper());
    }

    #[tokio::test]
    async fn test_diagnostics_enables_sweeper() {
        let runtime = RuntimeBuilder::new().diagnostics().build();
        assert!(runtime.has_sweeper());
        runtime.shutdown(crate::stub::ShutdownMode::Immediate);
    }
}
