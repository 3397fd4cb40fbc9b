//! Query correlation: pending-reply table and diagnostic timeout sweeper.

pub mod sweeper;
pub mod table;

pub use sweeper::{QuerySweeper, SweeperConfig};
pub use table::{PendingQuery, QueryEntry, QueryTable, ReplySink};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier correlating a query with its pending reply.
///
/// Ids are allocated monotonically by a [`QueryTable`], seeded from wall-clock
/// time so ids do not collide across process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(u64);

impl QueryId {
    /// Wrap a raw 64-bit id.
    pub const fn new(id: u64) -> Self {
        QueryId(id)
    }

    /// The raw 64-bit value.
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
