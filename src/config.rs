//! Configuration for the distribution queue.

use crate::queue::relocation::MovementReason;
use std::time::Duration;

/// Fixed-point denominator for per-server utilization. A server is fully
/// busy at 10000; work factors are integer fractions of this. Not a tunable.
pub const WORK_FULL_UTILIZATION: i32 = 10_000;

/// Operator toggle bit disabling read rebalancing.
pub const TOGGLE_IGNORE_REBALANCE_READ: u8 = 0b01;
/// Operator toggle bit disabling disk rebalancing.
pub const TOGGLE_IGNORE_REBALANCE_DISK: u8 = 0b10;

/// Priority assigned to each movement reason. Values must stay inside
/// `(0, 1000)`; the busyness ledger band for priority `p` is `p / 100`.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    pub recover_move: i32,
    pub rebalance_underutilized_team: i32,
    pub rebalance_overutilized_team: i32,
    pub rebalance_read_underutil_team: i32,
    pub rebalance_read_overutil_team: i32,
    pub perpetual_storage_wiggle: i32,
    pub team_healthy: i32,
    pub team_contains_undesired_server: i32,
    pub team_redundant: i32,
    pub merge_shard: i32,
    pub populate_region: i32,
    pub team_unhealthy: i32,
    pub team_2_left: i32,
    pub team_1_left: i32,
    pub team_failed: i32,
    pub team_0_left: i32,
    pub split_shard: i32,
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self {
            recover_move: 110,
            rebalance_underutilized_team: 120,
            rebalance_overutilized_team: 121,
            rebalance_read_underutil_team: 122,
            rebalance_read_overutil_team: 123,
            perpetual_storage_wiggle: 139,
            team_healthy: 140,
            team_contains_undesired_server: 150,
            team_redundant: 200,
            merge_shard: 340,
            populate_region: 600,
            team_unhealthy: 700,
            team_2_left: 709,
            team_1_left: 800,
            team_failed: 805,
            team_0_left: 809,
            split_shard: 950,
        }
    }
}

impl PriorityTable {
    /// Priority for a movement reason. `Invalid` maps to -1.
    pub fn priority_for(&self, reason: MovementReason) -> i32 {
        match reason {
            MovementReason::Invalid => -1,
            MovementReason::RecoverMove => self.recover_move,
            MovementReason::RebalanceUnderutilizedTeam => self.rebalance_underutilized_team,
            MovementReason::RebalanceOverutilizedTeam => self.rebalance_overutilized_team,
            MovementReason::RebalanceReadUnderutilTeam => self.rebalance_read_underutil_team,
            MovementReason::RebalanceReadOverutilTeam => self.rebalance_read_overutil_team,
            MovementReason::PerpetualStorageWiggle => self.perpetual_storage_wiggle,
            MovementReason::TeamHealthy => self.team_healthy,
            MovementReason::TeamContainsUndesiredServer => self.team_contains_undesired_server,
            MovementReason::TeamRedundant => self.team_redundant,
            MovementReason::MergeShard => self.merge_shard,
            MovementReason::PopulateRegion => self.populate_region,
            MovementReason::TeamUnhealthy => self.team_unhealthy,
            MovementReason::Team2Left => self.team_2_left,
            MovementReason::Team1Left => self.team_1_left,
            MovementReason::TeamFailed => self.team_failed,
            MovementReason::Team0Left => self.team_0_left,
            MovementReason::SplitShard => self.split_shard,
        }
    }

    /// Team-health category priorities. Kept on requeue so reclassification
    /// stays idempotent.
    pub fn is_health_priority(&self, priority: i32) -> bool {
        priority == self.populate_region
            || priority == self.team_unhealthy
            || priority == self.team_2_left
            || priority == self.team_1_left
            || priority == self.team_0_left
            || priority == self.team_redundant
            || priority == self.team_healthy
            || priority == self.team_contains_undesired_server
            || priority == self.perpetual_storage_wiggle
    }

    /// Shard boundary category priorities (split/merge).
    pub fn is_boundary_priority(&self, priority: i32) -> bool {
        priority == self.split_shard || priority == self.merge_shard
    }

    /// Priorities whose moves fill under-utilized destinations; the team
    /// picker is asked for the true best team for these.
    pub fn is_valley_filler_priority(&self, priority: i32) -> bool {
        priority == self.rebalance_underutilized_team
            || priority == self.rebalance_read_underutil_team
    }

    /// Health priorities that count toward the unhealthy-relocation gauge.
    /// Team-redundant is included even though it ranks below split/merge:
    /// team removal waits on this gauge, and split/merge must not be blocked
    /// behind it.
    pub fn counts_as_unhealthy(&self, health_priority: i32) -> bool {
        health_priority == self.populate_region
            || health_priority == self.team_unhealthy
            || health_priority == self.team_2_left
            || health_priority == self.team_1_left
            || health_priority == self.team_0_left
            || health_priority == self.team_redundant
    }
}

/// Tunables for the distribution queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Priority assigned to each movement reason.
    pub priorities: PriorityTable,

    /// Concurrent relocations a single source server will serve at the
    /// lowest health priorities.
    pub relocation_parallelism_per_source: i32,

    /// Concurrent relocations a single destination server will absorb.
    /// Zero or negative disables destination throttling.
    pub relocation_parallelism_per_dest: i32,

    /// Concurrent `move_keys` start phases.
    pub move_keys_parallelism: usize,

    /// Concurrent `clean_up_data_move` invocations.
    pub clean_up_data_move_parallelism: usize,

    /// Concurrent source-server fetches.
    pub fetch_source_parallelism: usize,

    /// Delay before retrying when no region produced a usable team.
    pub best_team_stuck_delay: Duration,

    /// Delay before retrying when a destination server's ledger is full.
    pub dest_overloaded_delay: Duration,

    /// Delay before restarting team choice after a destination was removed.
    pub retry_relocate_shard_delay: Duration,

    /// Interval between destination-health polls while keys move.
    pub health_poll_time: Duration,

    /// Storage metrics sampling interval; read load charged to a
    /// destination is released this long after the move finishes.
    pub storage_metrics_interval: Duration,

    /// Pause between background rebalance attempts.
    pub bg_rebalance_polling_interval: Duration,

    /// How often the operator toggle key is re-read.
    pub bg_rebalance_switch_check_interval: Duration,

    /// Queued moves allowed per rebalance priority before a rebalancer
    /// skips its tick.
    pub rebalance_parallelism: i64,

    /// Random shards sampled when picking a disk-rebalance candidate.
    pub rebalance_max_retries: usize,

    /// Floor on the byte difference required between source and destination
    /// teams for a disk rebalance.
    pub min_shard_bytes: i64,

    /// Worst source CPU (percent) below which read rebalancing is skipped.
    pub read_rebalance_cpu_threshold: f64,

    /// Read-rebalance moves allowed per source server per sampling interval.
    pub read_rebalance_src_parallelism: u32,

    /// Cap on the top-K read-dense shards requested from the oracle.
    pub read_rebalance_shard_topk: usize,

    /// Required relative read-bandwidth gap between source and destination.
    pub read_rebalance_diff_frac: f64,

    /// Fraction of the bandwidth gap one moved shard may account for.
    pub read_rebalance_max_shard_frac: f64,

    /// Whether read sampling (and thus read rebalancing) is enabled.
    pub read_sampling_enabled: bool,

    /// Whether physical moves carry unique location-metadata identities.
    /// When disabled, moves use the anonymous identity.
    pub shard_location_metadata: bool,

    /// Interval between "moving data" summary log lines.
    pub queue_logging_interval: Duration,

    /// Warn when a single relocation has been running longer than this.
    pub relocation_warn_after: Duration,

    /// Run the expensive invariant sweep after every launcher pass.
    pub expensive_validation: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priorities: PriorityTable::default(),
            relocation_parallelism_per_source: 2,
            relocation_parallelism_per_dest: 10,
            move_keys_parallelism: 15,
            clean_up_data_move_parallelism: 15,
            fetch_source_parallelism: 1000,
            best_team_stuck_delay: Duration::from_secs(1),
            dest_overloaded_delay: Duration::from_millis(200),
            retry_relocate_shard_delay: Duration::from_millis(100),
            health_poll_time: Duration::from_secs(1),
            storage_metrics_interval: Duration::from_secs(120),
            bg_rebalance_polling_interval: Duration::from_secs(10),
            bg_rebalance_switch_check_interval: Duration::from_secs(5),
            rebalance_parallelism: 50,
            rebalance_max_retries: 100,
            min_shard_bytes: 200_000,
            read_rebalance_cpu_threshold: 15.0,
            read_rebalance_src_parallelism: 20,
            read_rebalance_shard_topk: 10,
            read_rebalance_diff_frac: 0.3,
            read_rebalance_max_shard_frac: 0.2,
            read_sampling_enabled: false,
            shard_location_metadata: false,
            queue_logging_interval: Duration::from_secs(5),
            relocation_warn_after: Duration::from_secs(600),
            expensive_validation: false,
        }
    }
}

impl QueueConfig {
    /// Enable location-metadata encoded data moves.
    pub fn with_shard_location_metadata(mut self, enabled: bool) -> Self {
        self.shard_location_metadata = enabled;
        self
    }

    /// Enable read sampling and the read-load rebalancer.
    pub fn with_read_sampling(mut self, enabled: bool) -> Self {
        self.read_sampling_enabled = enabled;
        self
    }

    /// Enable the invariant sweep after every launcher pass.
    pub fn with_expensive_validation(mut self, enabled: bool) -> Self {
        self.expensive_validation = enabled;
        self
    }

    /// Override the priority table.
    pub fn with_priorities(mut self, priorities: PriorityTable) -> Self {
        self.priorities = priorities;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priorities_in_range() {
        let table = PriorityTable::default();
        for reason in MovementReason::ALL {
            let p = table.priority_for(reason);
            if reason == MovementReason::Invalid {
                assert_eq!(p, -1);
            } else {
                assert!(p > 0 && p < 1000, "{reason:?} priority {p} out of range");
            }
        }
    }

    #[test]
    fn test_priority_categories() {
        let table = PriorityTable::default();
        assert!(table.is_health_priority(table.team_0_left));
        assert!(table.is_health_priority(table.perpetual_storage_wiggle));
        assert!(!table.is_health_priority(table.split_shard));
        assert!(table.is_boundary_priority(table.merge_shard));
        assert!(table.is_boundary_priority(table.split_shard));
        assert!(!table.is_boundary_priority(table.team_unhealthy));
        assert!(table.is_valley_filler_priority(table.rebalance_underutilized_team));
        assert!(!table.is_valley_filler_priority(table.rebalance_overutilized_team));
    }

    #[test]
    fn test_unhealthy_includes_redundant() {
        let table = PriorityTable::default();
        assert!(table.counts_as_unhealthy(table.team_redundant));
        assert!(table.counts_as_unhealthy(table.populate_region));
        assert!(!table.counts_as_unhealthy(table.team_healthy));
        assert!(!table.counts_as_unhealthy(table.merge_shard));
    }

    #[test]
    fn test_builder() {
        let cfg = QueueConfig::default()
            .with_read_sampling(true)
            .with_shard_location_metadata(true)
            .with_expensive_validation(true);
        assert!(cfg.read_sampling_enabled);
        assert!(cfg.shard_location_metadata);
        assert!(cfg.expensive_validation);
    }
}
