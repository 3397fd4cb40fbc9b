//! Error types for the rookery message runtime.

use thiserror::Error;

/// Errors surfaced to callers, reply sinks, and stream sinks by the core.
///
/// A query's caller always observes exactly one of: a value, `Timeout`,
/// `Closed`, or `Execution` — never zero, never more than one. The enum is
/// `Clone` so a single captured error can reach both the caller sink and the
/// log without re-deriving it.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The mailbox or correlation table shut down while the request was
    /// outstanding.
    #[error("service closed: {0}")]
    Closed(String),

    /// The diagnostic sweeper expired the query before a reply arrived.
    #[error("query timed out")]
    Timeout,

    /// The stub handler failed while processing the message.
    #[error("invocation failed: {0}")]
    Execution(String),
}

impl ServiceError {
    /// Shorthand for a `Closed` error naming the service address it came from.
    pub fn closed(address: &str) -> Self {
        ServiceError::Closed(address.to_string())
    }

    /// True for the benign shutdown-race errors that are logged at low
    /// severity rather than warned about.
    pub fn is_closed(&self) -> bool {
        matches!(self, ServiceError::Closed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_helper() {
        let err = ServiceError::closed("local://cache");
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "service closed: local://cache");
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(ServiceError::Timeout.to_string(), "query timed out");
        assert!(!ServiceError::Timeout.is_closed());
    }
}
