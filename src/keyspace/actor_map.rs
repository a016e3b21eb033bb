//! Coverage map of cancellable background tasks.
//!
//! Each in-flight key range owns the task driving it. Overwriting a range
//! cancels the tasks it displaces: handles are reference counted, and a task
//! is aborted when the last map fragment referencing it is removed.

use super::range::{max_key, KeyRange};
use super::range_map::RangeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Join handle that aborts its task when dropped.
#[derive(Debug)]
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The task (if any) owning a range. Truncation clones the slot, so a task
/// stays alive while any fragment of its original range still references it.
#[derive(Debug, Clone, Default)]
pub struct TaskSlot(Option<Arc<AbortOnDrop>>);

impl TaskSlot {
    fn is_live(&self) -> bool {
        self.0.as_ref().is_some_and(|h| !h.0.is_finished())
    }
}

/// A range map whose values own cancellable tasks.
#[derive(Debug, Default)]
pub struct ActorMap {
    map: RangeMap<TaskSlot>,
}

impl ActorMap {
    /// Create an empty actor map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the owner of `range`, cancelling whatever it
    /// displaces.
    pub fn insert(&mut self, range: KeyRange, handle: JoinHandle<()>) {
        self.map
            .insert(range, TaskSlot(Some(Arc::new(AbortOnDrop(handle)))));
    }

    /// Cancel every task whose last fragment lies inside `range`.
    pub fn cancel(&mut self, range: KeyRange) {
        self.map.insert(range, TaskSlot::default());
    }

    /// True when a live task owns the range containing `key`.
    pub fn live_at(&self, key: &[u8]) -> bool {
        self.map.range_containing(key).1.is_live()
    }

    /// The post-truncation pieces an insert over `range` would produce.
    /// Unlike the plain range map, boundary fragments are reported only when
    /// a live task owns them: those are the in-flight moves whose surviving
    /// fragments must be relaunched.
    pub fn affected_ranges_after_insert(&self, range: &KeyRange) -> Vec<KeyRange> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }
        let (left, slot) = self.map.range_containing(&range.begin);
        if left.begin < range.begin && slot.is_live() {
            out.push(KeyRange {
                begin: left.begin,
                end: range.begin.clone(),
            });
        }
        out.push(range.clone());
        if range.end < max_key() {
            let (right, slot) = self.map.range_containing(&range.end);
            if right.begin < range.end && slot.is_live() {
                out.push(KeyRange {
                    begin: range.end.clone(),
                    end: right.end,
                });
            }
        }
        out
    }
}
