//! Core identifier and metadata types shared across the queue.

use crate::keyspace::KeyRange;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a storage server.
pub type ServerId = u64;

/// Identity of a physical data move, stable across retries of `move_keys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MoveId(pub Uuid);

impl MoveId {
    /// The sentinel identity used when location-metadata encoding is
    /// disabled and moves are not individually addressable.
    pub const ANONYMOUS: MoveId = MoveId(Uuid::nil());

    /// Create a fresh unique move identity.
    pub fn random() -> Self {
        MoveId(Uuid::new_v4())
    }

    /// True unless this is the anonymous sentinel.
    pub fn is_valid(&self) -> bool {
        !self.0.is_nil()
    }
}

impl Default for MoveId {
    fn default() -> Self {
        MoveId::ANONYMOUS
    }
}

impl std::fmt::Display for MoveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "anonymous")
        }
    }
}

/// Ownership token for the cluster's move-keys metadata.
///
/// The distributor that holds the current lock is the only one allowed to
/// mutate shard assignments; a stale token makes `move_keys` fail with
/// a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MoveKeysLock {
    /// Lock owner at the time the previous distributor died.
    pub prev_owner: Uuid,
    /// Current lock owner (this distributor).
    pub owner: Uuid,
}

impl MoveKeysLock {
    /// Create a lock token owned by `owner`.
    pub fn new(owner: Uuid) -> Self {
        Self {
            prev_owner: Uuid::nil(),
            owner,
        }
    }
}

/// Persisted record of a physical data move, recovered after a distributor
/// restart. A relocation carrying one of these is a restore move: its
/// destinations are pinned to the recorded teams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMove {
    /// Identity of the move, reused across all retries.
    pub id: MoveId,
    /// Key range being moved.
    pub keys: KeyRange,
    /// Source servers recorded when the move started.
    pub src: Vec<ServerId>,
    /// Destination team in the primary region.
    pub primary_dest: Vec<ServerId>,
    /// Destination team in the remote region, if any.
    pub remote_dest: Vec<ServerId>,
}

impl DataMove {
    /// Pinned destination team for the given region index.
    pub fn dest_for_region(&self, region_index: usize) -> &[ServerId] {
        if region_index == 0 {
            &self.primary_dest
        } else {
            &self.remote_dest
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_move_id() {
        assert!(!MoveId::ANONYMOUS.is_valid());
        assert_eq!(MoveId::default(), MoveId::ANONYMOUS);
        assert_eq!(MoveId::ANONYMOUS.to_string(), "anonymous");
    }

    #[test]
    fn test_random_move_id_is_valid() {
        let id = MoveId::random();
        assert!(id.is_valid());
        assert_ne!(id, MoveId::random());
    }

    #[test]
    fn test_dest_for_region() {
        let dm = DataMove {
            id: MoveId::random(),
            keys: KeyRange::new("a", "b"),
            src: vec![1, 2],
            primary_dest: vec![3, 4],
            remote_dest: vec![5, 6],
        };
        assert_eq!(dm.dest_for_region(0), &[3, 4]);
        assert_eq!(dm.dest_for_region(1), &[5, 6]);
    }
}
