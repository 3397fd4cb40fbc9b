//! Immutable per-message context headers.
//!
//! Headers travel with every message hop and are never mutated in place:
//! `add` returns a new chain head that shares every older node with the
//! original chain (structural sharing). Lookup scans from the newest node
//! backward, so the most recently added value for a duplicate key shadows
//! older ones.
//!
//! # Structure
//!
//! ```text
//! Headers ── head ──► [k3=v3] ──► [k2=v2] ──► [k1=v1] ──► (empty)
//!                        ▲
//! old chain ── head ─────┘ (shared nodes, no copying)
//! ```
//!
//! Every node records the chain length at its position, so `size()` is O(1).

use std::fmt;
use std::sync::Arc;

struct HeaderNode {
    key: String,
    value: String,
    size: usize,
    prev: Option<Arc<HeaderNode>>,
}

/// Immutable key/value context chain propagated with every message.
///
/// Cloning a `Headers` is cheap (one `Arc` bump); the chain itself is never
/// mutated.
///
/// # Example
///
/// ```rust,ignore
/// let base = Headers::new().add("tenant", "acme");
/// let hop = base.add("tenant", "other");
///
/// assert_eq!(hop.get("tenant"), Some("other"));   // newest shadows
/// assert_eq!(base.get("tenant"), Some("acme"));   // original untouched
/// ```
#[derive(Clone, Default)]
pub struct Headers {
    head: Option<Arc<HeaderNode>>,
}

impl Headers {
    /// Create an empty header chain.
    pub fn new() -> Self {
        Self { head: None }
    }

    /// Return a new chain with `key=value` prepended.
    ///
    /// The receiver is not modified; all existing nodes are shared between
    /// the old and new chains.
    pub fn add(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            head: Some(Arc::new(HeaderNode {
                key: key.into(),
                value: value.into(),
                size: self.size() + 1,
                prev: self.head.clone(),
            })),
        }
    }

    /// Look up the most recently added value for `key`.
    ///
    /// Scans newest to oldest, so duplicates shadow older entries. Returns
    /// `None` when the key was never added.
    pub fn get(&self, key: &str) -> Option<&str> {
        let mut node = self.head.as_deref();
        while let Some(current) = node {
            if current.key == key {
                return Some(&current.value);
            }
            node = current.prev.as_deref();
        }
        None
    }

    /// Number of entries in the chain, including shadowed ones. O(1).
    pub fn size(&self) -> usize {
        self.head.as_deref().map_or(0, |node| node.size)
    }

    /// True when no entry has ever been added.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Iterate entries newest-first, including shadowed duplicates.
    pub fn iter(&self) -> HeadersIter<'_> {
        HeadersIter {
            node: self.head.as_deref(),
        }
    }
}

/// Iterator over header entries, newest first.
pub struct HeadersIter<'a> {
    node: Option<&'a HeaderNode>,
}

impl<'a> Iterator for HeadersIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.node?;
        self.node = current.prev.as_deref();
        Some((&current.key, &current.value))
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_headers() {
        let headers = Headers::new();
        assert_eq!(headers.size(), 0);
        assert!(headers.is_empty());
        assert_eq!(headers.get("anything"), None);
    }

    #[test]
    fn test_shadowing() {
        let headers = Headers::new().add("a", "1").add("a", "2");
        assert_eq!(headers.get("a"), Some("2"));
        assert_eq!(headers.size(), 2);
    }

    #[test]
    fn test_add_does_not_mutate_original() {
        let first = Headers::new().add("a", "1");
        let second = first.add("a", "2");

        assert_eq!(second.get("a"), Some("2"));
        assert_eq!(first.get("a"), Some("1"));
        assert_eq!(first.size(), 1);
    }

    #[test]
    fn test_distinct_keys() {
        let headers = Headers::new().add("a", "1").add("b", "2").add("c", "3");
        assert_eq!(headers.get("a"), Some("1"));
        assert_eq!(headers.get("b"), Some("2"));
        assert_eq!(headers.get("c"), Some("3"));
        assert_eq!(headers.get("d"), None);
        assert_eq!(headers.size(), 3);
    }

    #[test]
    fn test_iter_newest_first() {
        let headers = Headers::new().add("a", "1").add("b", "2");
        let entries: Vec<_> = headers.iter().collect();
        assert_eq!(entries, vec![("b", "2"), ("a", "1")]);
    }

    #[test]
    fn test_structural_sharing_across_branches() {
        let base = Headers::new().add("shared", "x");
        let left = base.add("branch", "left");
        let right = base.add("branch", "right");

        assert_eq!(left.get("branch"), Some("left"));
        assert_eq!(right.get("branch"), Some("right"));
        assert_eq!(left.get("shared"), Some("x"));
        assert_eq!(right.get("shared"), Some("x"));
    }
}
