//! Relocation requests and queue entries.

use crate::config::PriorityTable;
use crate::keyspace::KeyRange;
use crate::types::{DataMove, MoveId, ServerId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

/// Why a shard is being moved. Determines the move's priority through the
/// configured [`PriorityTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementReason {
    Invalid,
    RecoverMove,
    RebalanceUnderutilizedTeam,
    RebalanceOverutilizedTeam,
    RebalanceReadUnderutilTeam,
    RebalanceReadOverutilTeam,
    PerpetualStorageWiggle,
    TeamHealthy,
    TeamContainsUndesiredServer,
    TeamRedundant,
    MergeShard,
    PopulateRegion,
    TeamUnhealthy,
    Team2Left,
    Team1Left,
    TeamFailed,
    Team0Left,
    SplitShard,
}

impl MovementReason {
    /// Every reason, for table-driven tests and logging.
    pub const ALL: [MovementReason; 18] = [
        MovementReason::Invalid,
        MovementReason::RecoverMove,
        MovementReason::RebalanceUnderutilizedTeam,
        MovementReason::RebalanceOverutilizedTeam,
        MovementReason::RebalanceReadUnderutilTeam,
        MovementReason::RebalanceReadOverutilTeam,
        MovementReason::PerpetualStorageWiggle,
        MovementReason::TeamHealthy,
        MovementReason::TeamContainsUndesiredServer,
        MovementReason::TeamRedundant,
        MovementReason::MergeShard,
        MovementReason::PopulateRegion,
        MovementReason::TeamUnhealthy,
        MovementReason::Team2Left,
        MovementReason::Team1Left,
        MovementReason::TeamFailed,
        MovementReason::Team0Left,
        MovementReason::SplitShard,
    ];

    /// Disk-utilization rebalancing (either direction).
    pub fn is_disk_rebalance(self) -> bool {
        matches!(
            self,
            MovementReason::RebalanceUnderutilizedTeam | MovementReason::RebalanceOverutilizedTeam
        )
    }

    /// Read-load rebalancing (either direction).
    pub fn is_read_rebalance(self) -> bool {
        matches!(
            self,
            MovementReason::RebalanceReadUnderutilTeam
                | MovementReason::RebalanceReadOverutilTeam
        )
    }

    /// Moves away from an over-utilized source.
    pub fn is_mountain_chopper(self) -> bool {
        matches!(
            self,
            MovementReason::RebalanceOverutilizedTeam | MovementReason::RebalanceReadOverutilTeam
        )
    }

    /// Moves toward an under-utilized destination.
    pub fn is_valley_filler(self) -> bool {
        matches!(
            self,
            MovementReason::RebalanceUnderutilizedTeam
                | MovementReason::RebalanceReadUnderutilTeam
        )
    }
}

/// Broad category of a relocation, retained on the queue entry for
/// destination-selection decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelocateReason {
    Invalid,
    Other,
    RebalanceDisk,
    RebalanceRead,
    MergeShard,
    SplitShard,
}

/// A relocation request arriving on the queue input.
#[derive(Debug, Clone)]
pub struct RelocateShard {
    /// Key range to move.
    pub keys: KeyRange,
    /// Priority, normally derived from `move_reason`.
    pub priority: i32,
    /// Why the movement was requested.
    pub move_reason: MovementReason,
    /// Category of the relocation.
    pub reason: RelocateReason,
    /// Identity of the physical move.
    pub data_move_id: MoveId,
    /// Restored move metadata; present only for restores.
    pub data_move: Option<Arc<DataMove>>,
    /// True to cancel the identified data move instead of queueing work.
    pub cancelled: bool,
}

impl RelocateShard {
    /// Build a request whose priority comes from the table.
    pub fn new(
        keys: KeyRange,
        move_reason: MovementReason,
        reason: RelocateReason,
        priorities: &PriorityTable,
    ) -> Self {
        Self {
            keys,
            priority: priorities.priority_for(move_reason),
            move_reason,
            reason,
            data_move_id: MoveId::ANONYMOUS,
            data_move: None,
            cancelled: false,
        }
    }

    /// Build a restore request from persisted data-move metadata.
    pub fn restore(data_move: Arc<DataMove>, priorities: &PriorityTable) -> Self {
        Self {
            keys: data_move.keys.clone(),
            priority: priorities.recover_move,
            move_reason: MovementReason::RecoverMove,
            reason: RelocateReason::Other,
            data_move_id: data_move.id,
            data_move: Some(data_move),
            cancelled: false,
        }
    }

    /// Build an external cancellation of a data move.
    pub fn cancellation(keys: KeyRange, data_move_id: MoveId) -> Self {
        Self {
            keys,
            priority: -1,
            move_reason: MovementReason::Invalid,
            reason: RelocateReason::Invalid,
            data_move_id,
            data_move: None,
            cancelled: true,
        }
    }

    /// True when this request resumes a persisted data move.
    pub fn is_restore(&self) -> bool {
        self.data_move.is_some()
    }
}

/// One pending or in-flight move.
///
/// Equality and ordering use only the queue identity triple (priority
/// descending, start time ascending, random id descending), so a clone with
/// rewritten keys still matches its original inside the ordered queues.
#[derive(Debug, Clone)]
pub struct RelocateData {
    /// Key range being moved.
    pub keys: KeyRange,
    /// Effective priority: max of the base, boundary and health priorities.
    pub priority: i32,
    /// Split/merge priority, -1 when the move is not boundary-driven.
    pub boundary_priority: i32,
    /// Team-health priority, -1 when the move is not health-driven.
    pub health_priority: i32,
    /// Category of the relocation.
    pub reason: RelocateReason,
    /// Milliseconds since the queue epoch when the request was issued;
    /// -1 until issued.
    pub start_time: i64,
    /// Unique identity of this queue entry.
    pub random_id: Uuid,
    /// Identity of the underlying physical move.
    pub data_move_id: MoveId,
    /// Source-ledger charge per server; zero until launched.
    pub work_factor: i32,
    /// Source servers, empty until resolved.
    pub src: Vec<ServerId>,
    /// Servers holding the entire range.
    pub complete_sources: Vec<ServerId>,
    /// Destination servers currently charged on the destination ledger.
    pub complete_dests: Vec<ServerId>,
    /// True for rebalancing, splits and redundancy moves.
    pub wants_new_servers: bool,
    /// True until the relocator commits to a destination team.
    pub cancellable: bool,
    /// Restored move metadata; present iff this is a restore.
    pub data_move: Option<Arc<DataMove>>,
}

impl Default for RelocateData {
    fn default() -> Self {
        Self {
            keys: KeyRange::empty(),
            priority: -1,
            boundary_priority: -1,
            health_priority: -1,
            reason: RelocateReason::Invalid,
            start_time: -1,
            random_id: Uuid::nil(),
            data_move_id: MoveId::ANONYMOUS,
            work_factor: 0,
            src: Vec::new(),
            complete_sources: Vec::new(),
            complete_dests: Vec::new(),
            wants_new_servers: false,
            cancellable: false,
            data_move: None,
        }
    }
}

impl RelocateData {
    /// Materialize a queue entry from an incoming request.
    pub fn from_shard(rs: &RelocateShard, now_ms: i64, priorities: &PriorityTable) -> Self {
        let mut rd = Self {
            keys: rs.keys.clone(),
            priority: rs.priority,
            boundary_priority: if priorities.is_boundary_priority(rs.priority) {
                rs.priority
            } else {
                -1
            },
            health_priority: if priorities.is_health_priority(rs.priority) {
                rs.priority
            } else {
                -1
            },
            reason: rs.reason,
            start_time: now_ms,
            random_id: Uuid::new_v4(),
            data_move_id: rs.data_move_id,
            work_factor: 0,
            src: Vec::new(),
            complete_sources: Vec::new(),
            complete_dests: Vec::new(),
            wants_new_servers: rs.move_reason.is_mountain_chopper()
                || rs.move_reason.is_valley_filler()
                || rs.move_reason == MovementReason::SplitShard
                || rs.move_reason == MovementReason::TeamRedundant,
            cancellable: true,
            data_move: rs.data_move.clone(),
        };
        if let Some(dm) = &rd.data_move {
            rd.src.extend_from_slice(&dm.src);
        }
        rd
    }

    /// True when this entry resumes a persisted data move.
    pub fn is_restore(&self) -> bool {
        self.data_move.is_some()
    }

    /// True once the request has been issued into the queue.
    pub fn is_issued(&self) -> bool {
        self.start_time != -1
    }

    fn order_key(&self) -> (i32, i64, Uuid) {
        (self.priority, self.start_time, self.random_id)
    }
}

impl PartialEq for RelocateData {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}

impl Eq for RelocateData {}

impl PartialOrd for RelocateData {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RelocateData {
    // Highest priority first; ties go to the earlier start, then the
    // larger random id.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.start_time.cmp(&other.start_time))
            .then(other.random_id.cmp(&self.random_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn entry(priority: i32, start_time: i64) -> RelocateData {
        RelocateData {
            priority,
            start_time,
            random_id: Uuid::new_v4(),
            ..RelocateData::default()
        }
    }

    #[test]
    fn test_ordering_highest_priority_first() {
        let mut queue = BTreeSet::new();
        queue.insert(entry(100, 5));
        queue.insert(entry(900, 9));
        queue.insert(entry(500, 1));

        let priorities: Vec<i32> = queue.iter().map(|rd| rd.priority).collect();
        assert_eq!(priorities, vec![900, 500, 100]);
    }

    #[test]
    fn test_ordering_ties_break_on_start_time() {
        let mut queue = BTreeSet::new();
        queue.insert(entry(100, 7));
        queue.insert(entry(100, 3));

        let starts: Vec<i64> = queue.iter().map(|rd| rd.start_time).collect();
        assert_eq!(starts, vec![3, 7]);
    }

    #[test]
    fn test_clone_with_new_keys_still_erases() {
        let mut queue = BTreeSet::new();
        let rd = entry(100, 3);
        queue.insert(rd.clone());

        let mut truncated = rd.clone();
        truncated.keys = KeyRange::new("a", "m");
        assert!(queue.remove(&truncated));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_from_shard_categories() {
        let table = PriorityTable::default();

        let split = RelocateShard::new(
            KeyRange::new("a", "b"),
            MovementReason::SplitShard,
            RelocateReason::SplitShard,
            &table,
        );
        let rd = RelocateData::from_shard(&split, 10, &table);
        assert_eq!(rd.boundary_priority, table.split_shard);
        assert_eq!(rd.health_priority, -1);
        assert!(rd.wants_new_servers);
        assert!(rd.cancellable);
        assert_eq!(rd.work_factor, 0);

        let unhealthy = RelocateShard::new(
            KeyRange::new("a", "b"),
            MovementReason::TeamUnhealthy,
            RelocateReason::Other,
            &table,
        );
        let rd = RelocateData::from_shard(&unhealthy, 10, &table);
        assert_eq!(rd.health_priority, table.team_unhealthy);
        assert_eq!(rd.boundary_priority, -1);
        assert!(!rd.wants_new_servers);
    }

    #[test]
    fn test_restore_carries_sources() {
        let table = PriorityTable::default();
        let dm = Arc::new(DataMove {
            id: MoveId::random(),
            keys: KeyRange::new("a", "m"),
            src: vec![11, 12],
            primary_dest: vec![21, 22],
            remote_dest: vec![],
        });
        let rs = RelocateShard::restore(dm.clone(), &table);
        assert!(rs.is_restore());
        let rd = RelocateData::from_shard(&rs, 0, &table);
        assert!(rd.is_restore());
        assert_eq!(rd.src, vec![11, 12]);
        assert_eq!(rd.data_move_id, dm.id);
    }

    #[test]
    fn test_default_is_unissued() {
        let rd = RelocateData::default();
        assert!(!rd.is_issued());
        assert_eq!(rd.work_factor, 0);
        assert!(rd.src.is_empty());
    }
}
