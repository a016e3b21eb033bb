//! Keys and half-open key ranges.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A keyspace key. Byte-ordered, cheap to clone.
pub type Key = Bytes;

/// Upper bound of the keyspace. User keys sort strictly below it.
pub fn max_key() -> Key {
    Bytes::from_static(&[0xff])
}

/// A half-open key range `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub begin: Key,
    /// Exclusive upper bound.
    pub end: Key,
}

impl KeyRange {
    /// Create a range from anything convertible to keys.
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// The whole keyspace.
    pub fn all() -> Self {
        Self {
            begin: Bytes::new(),
            end: max_key(),
        }
    }

    /// An empty range.
    pub fn empty() -> Self {
        Self {
            begin: Bytes::new(),
            end: Bytes::new(),
        }
    }

    /// True when the range covers no keys.
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// True when `key` falls inside the range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.begin.as_ref() <= key && key < self.end.as_ref()
    }

    /// True when `other` is entirely inside this range.
    pub fn contains(&self, other: &KeyRange) -> bool {
        !other.is_empty() && self.begin <= other.begin && other.end <= self.end
    }

    /// True when the two ranges share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.begin < other.end && other.begin < self.end
    }
}

impl std::fmt::Display for KeyRange {
    // Keys are usually printable in traces; fall back to lossy UTF-8.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            String::from_utf8_lossy(&self.begin),
            String::from_utf8_lossy(&self.end)
        )
    }
}
