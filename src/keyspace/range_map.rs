//! Coverage map from key ranges to values.
//!
//! Every key in the keyspace is covered by exactly one entry. Inserting a
//! range overwrites the intersected part of prior entries and truncates the
//! surviving neighbours. Boundaries are kept in a `BTreeMap`, so lookups and
//! k-entry scans are `O(log n + k)`.

use super::range::{max_key, Key, KeyRange};
use std::collections::BTreeMap;
use std::ops::Bound;

/// A map from key ranges to values covering the whole keyspace.
#[derive(Debug, Clone)]
pub struct RangeMap<T> {
    // Boundary key -> value covering [boundary, next boundary). The empty
    // key is always present; the last boundary runs to `max_key()`.
    boundaries: BTreeMap<Key, T>,
}

impl<T: Clone + Default> Default for RangeMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Default> RangeMap<T> {
    /// Create a map covering the keyspace with the default value.
    pub fn new() -> Self {
        let mut boundaries = BTreeMap::new();
        boundaries.insert(Key::new(), T::default());
        Self { boundaries }
    }

    /// Number of distinct ranges.
    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    /// Always false; the map covers the keyspace.
    pub fn is_empty(&self) -> bool {
        false
    }

    fn start_of(&self, key: &[u8]) -> Key {
        self.boundaries
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(k, _)| k.clone())
            .expect("range map always has a boundary at the empty key")
    }

    fn end_of(&self, start: &Key) -> Key {
        self.boundaries
            .range::<[u8], _>((Bound::Excluded(start.as_ref()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(max_key)
    }

    /// The range and value covering `key`.
    pub fn range_containing(&self, key: &[u8]) -> (KeyRange, &T) {
        let start = self.start_of(key);
        let end = self.end_of(&start);
        let value = &self.boundaries[&start];
        (KeyRange { begin: start, end }, value)
    }

    /// Mutable access to the value covering `key`, with its range.
    pub fn range_containing_mut(&mut self, key: &[u8]) -> (KeyRange, &mut T) {
        let start = self.start_of(key);
        let end = self.end_of(&start);
        let range = KeyRange {
            begin: start.clone(),
            end,
        };
        (range, self.boundaries.get_mut(&start).expect("boundary exists"))
    }

    /// All entries intersecting `range`, in key order.
    pub fn intersecting(&self, range: &KeyRange) -> Vec<(KeyRange, &T)> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }
        let first = self.start_of(&range.begin);
        for (start, value) in self
            .boundaries
            .range::<[u8], _>((Bound::Included(first.as_ref()), Bound::Excluded(range.end.as_ref())))
        {
            let end = self.end_of(start);
            out.push((
                KeyRange {
                    begin: start.clone(),
                    end,
                },
                value,
            ));
        }
        out
    }

    /// Entries fully contained in `range`, in key order.
    pub fn contained(&self, range: &KeyRange) -> Vec<(KeyRange, &T)> {
        self.intersecting(range)
            .into_iter()
            .filter(|(r, _)| range.contains(r))
            .collect()
    }

    /// The ranges that will exist, inside the affected span, after
    /// `insert(range, _)`: the truncated left fragment of the first
    /// intersected entry (if any), `range` itself, and the truncated right
    /// fragment of the last intersected entry (if any).
    pub fn affected_ranges_after_insert(&self, range: &KeyRange) -> Vec<KeyRange> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }
        let (left, _) = self.range_containing(&range.begin);
        if left.begin < range.begin {
            out.push(KeyRange {
                begin: left.begin,
                end: range.begin.clone(),
            });
        }
        out.push(range.clone());
        if range.end < max_key() {
            let (right, _) = self.range_containing(&range.end);
            if right.begin < range.end {
                out.push(KeyRange {
                    begin: range.end.clone(),
                    end: right.end,
                });
            }
        }
        out
    }

    /// Overwrite `range` with `value`, truncating intersected neighbours.
    pub fn insert(&mut self, range: KeyRange, value: T) {
        if range.is_empty() {
            return;
        }
        // Value that must keep covering [range.end, ...).
        let right_value = if range.end < max_key() {
            let start = self.start_of(&range.end);
            if self.boundaries.contains_key(&range.end) {
                None
            } else {
                Some(self.boundaries[&start].clone())
            }
        } else {
            None
        };

        let stale: Vec<Key> = self
            .boundaries
            .range::<[u8], _>((
                Bound::Included(range.begin.as_ref()),
                Bound::Excluded(range.end.as_ref()),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.boundaries.remove(&key);
        }

        if let Some(v) = right_value {
            self.boundaries.insert(range.end.clone(), v);
        }
        self.boundaries.insert(range.begin, value);
    }

    /// All entries, in key order.
    pub fn ranges(&self) -> Vec<(KeyRange, &T)> {
        self.boundaries
            .iter()
            .map(|(start, value)| {
                let end = self.end_of(start);
                (
                    KeyRange {
                        begin: start.clone(),
                        end,
                    },
                    value,
                )
            })
            .collect()
    }
}
