//! Per-server, priority-banded utilization accounting.
//!
//! Each server carries a ledger indexed by priority band (`priority / 100`);
//! `ledger[i]` sums the work factors of active moves at priority `>= i * 100`.
//! Full utilization is the fixed-point constant `WORK_FULL_UTILIZATION`.

use super::relocation::RelocateData;
use crate::config::{QueueConfig, WORK_FULL_UTILIZATION};
use crate::types::ServerId;
use std::collections::HashMap;

/// Priority-banded utilization ledger for one server.
#[derive(Debug, Clone, Default)]
pub struct Busyness {
    ledger: [i32; 10],
}

impl Busyness {
    /// True when a move at `priority` with `work` more utilization fits.
    pub fn can_launch(&self, priority: i32, work: i32) -> bool {
        debug_assert!(priority > 0 && priority < 1000);
        self.ledger[(priority / 100) as usize] <= WORK_FULL_UTILIZATION - work
    }

    /// Charge `work` against every band at or below `priority`'s.
    pub fn add_work(&mut self, priority: i32, work: i32) {
        debug_assert!(priority > 0 && priority < 1000);
        for band in 0..=(priority / 100) as usize {
            self.ledger[band] += work;
        }
    }

    /// Release a prior charge.
    pub fn remove_work(&mut self, priority: i32, work: i32) {
        self.add_work(priority, -work);
    }

    /// Raw ledger, for validation.
    pub fn ledger(&self) -> &[i32; 10] {
        &self.ledger
    }
}

impl std::fmt::Display for Busyness {
    // Compresses equal adjacent bands: "100/300=0.25 (2500/10000), ...".
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut i = 1;
        let mut first = true;
        while i < self.ledger.len() {
            let mut j = i + 1;
            while j < self.ledger.len() && self.ledger[i] == self.ledger[j] {
                j += 1;
            }
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            if j == i + 1 {
                write!(f, "{:03}", i * 100)?;
            } else {
                write!(f, "{:03}/{:03}", i * 100, (j - 1) * 100)?;
            }
            write!(
                f,
                "={:.2} ({}/{})",
                self.ledger[i] as f64 / WORK_FULL_UTILIZATION as f64,
                self.ledger[i],
                WORK_FULL_UTILIZATION
            )?;
            i = j;
        }
        Ok(())
    }
}

/// Work factor charged to each source server, were the move launched now.
pub fn src_work_factor(rd: &RelocateData, single_region_team_size: usize, cfg: &QueueConfig) -> i32 {
    let parallelism = cfg.relocation_parallelism_per_source;
    if rd.health_priority == cfg.priorities.team_1_left
        || rd.health_priority == cfg.priorities.team_0_left
    {
        WORK_FULL_UTILIZATION / parallelism
    } else if rd.health_priority == cfg.priorities.team_2_left {
        WORK_FULL_UTILIZATION / 2 / parallelism
    } else {
        // Lower priorities can assume a full team remains to share the work.
        WORK_FULL_UTILIZATION / single_region_team_size as i32 / parallelism
    }
}

/// Work factor charged to each destination server; uniform across servers.
pub fn dest_work_factor(cfg: &QueueConfig) -> i32 {
    WORK_FULL_UTILIZATION / cfg.relocation_parallelism_per_dest
}

/// Source admission: enough of the move's source servers must have ledger
/// room, after discounting work that launching this move would cancel.
pub fn can_launch_src(
    rd: &RelocateData,
    team_size: usize,
    single_region_team_size: usize,
    busymap: &HashMap<ServerId, Busyness>,
    cancellable: &[RelocateData],
    cfg: &QueueConfig,
) -> bool {
    debug_assert_eq!(rd.work_factor, 0);
    debug_assert!(!rd.src.is_empty());
    debug_assert!(team_size >= single_region_team_size);

    let work_factor = src_work_factor(rd, single_region_team_size, cfg);
    let mut needed = rd.src.len().min(team_size - single_region_team_size + 1);

    for server in &rd.src {
        let mut busy = busymap.get(server).cloned().unwrap_or_default();
        for prior in cancellable {
            if prior.src.contains(server) {
                busy.remove_work(prior.priority, prior.work_factor);
            }
        }
        if busy.can_launch(rd.priority, work_factor) {
            needed -= 1;
            if needed == 0 {
                return true;
            }
        }
    }
    false
}

/// Destination admission: every server of every candidate team must have
/// ledger room for the uniform destination work factor.
pub fn can_launch_dest(
    candidate_servers: &[Vec<ServerId>],
    priority: i32,
    dest_busymap: &HashMap<ServerId, Busyness>,
    cfg: &QueueConfig,
) -> bool {
    // Fail switch: non-positive parallelism disables destination throttling.
    if cfg.relocation_parallelism_per_dest <= 0 {
        return true;
    }
    let work_factor = dest_work_factor(cfg);
    for team in candidate_servers {
        for server in team {
            let fits = dest_busymap
                .get(server)
                .map_or(true, |b| b.can_launch(priority, work_factor));
            if !fits {
                return false;
            }
        }
    }
    true
}

/// Seal the move's work factor and charge each source server.
pub fn launch_src(
    rd: &mut RelocateData,
    busymap: &mut HashMap<ServerId, Busyness>,
    single_region_team_size: usize,
    cfg: &QueueConfig,
) {
    rd.work_factor = src_work_factor(rd, single_region_team_size, cfg);
    for server in &rd.src {
        busymap
            .entry(*server)
            .or_default()
            .add_work(rd.priority, rd.work_factor);
    }
}

/// Record and charge the chosen destination servers.
pub fn launch_dest(
    rd: &mut RelocateData,
    candidate_servers: &[Vec<ServerId>],
    dest_busymap: &mut HashMap<ServerId, Busyness>,
    cfg: &QueueConfig,
) {
    debug_assert!(rd.complete_dests.is_empty());
    let work_factor = dest_work_factor(cfg);
    for team in candidate_servers {
        for server in team {
            rd.complete_dests.push(*server);
            dest_busymap
                .entry(*server)
                .or_default()
                .add_work(rd.priority, work_factor);
        }
    }
}

/// Release the destination charges recorded on `rd`.
pub fn complete_dest(
    rd: &RelocateData,
    dest_busymap: &mut HashMap<ServerId, Busyness>,
    cfg: &QueueConfig,
) {
    let work_factor = dest_work_factor(cfg);
    for server in &rd.complete_dests {
        dest_busymap
            .entry(*server)
            .or_default()
            .remove_work(rd.priority, work_factor);
    }
}

/// Release every charge a finished (or preempted) move holds.
pub fn complete(
    rd: &RelocateData,
    busymap: &mut HashMap<ServerId, Busyness>,
    dest_busymap: &mut HashMap<ServerId, Busyness>,
    cfg: &QueueConfig,
) {
    debug_assert!(rd.work_factor > 0);
    for server in &rd.src {
        busymap
            .entry(*server)
            .or_default()
            .remove_work(rd.priority, rd.work_factor);
    }
    complete_dest(rd, dest_busymap, cfg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn config() -> QueueConfig {
        QueueConfig::default()
    }

    fn relocation(priority: i32, src: Vec<ServerId>) -> RelocateData {
        RelocateData {
            priority,
            src,
            random_id: Uuid::new_v4(),
            start_time: 0,
            ..RelocateData::default()
        }
    }

    #[test]
    fn test_ledger_bands() {
        let mut busy = Busyness::default();
        busy.add_work(350, 1000);

        // Charged at and below its band, untouched above.
        assert_eq!(busy.ledger()[0], 1000);
        assert_eq!(busy.ledger()[3], 1000);
        assert_eq!(busy.ledger()[4], 0);

        assert!(busy.can_launch(350, 9000));
        assert!(!busy.can_launch(350, 9001));
        // A higher-priority move only sees its own band.
        assert!(busy.can_launch(450, 10_000));

        busy.remove_work(350, 1000);
        assert_eq!(busy.ledger(), &[0; 10]);
    }

    #[test]
    fn test_ledger_non_increasing() {
        let mut busy = Busyness::default();
        busy.add_work(150, 500);
        busy.add_work(850, 200);
        let ledger = busy.ledger();
        for i in 0..ledger.len() - 1 {
            assert!(ledger[i] >= ledger[i + 1]);
        }
    }

    #[test]
    fn test_src_work_factor_by_health() {
        let cfg = config();
        let mut rd = relocation(800, vec![1]);

        rd.health_priority = cfg.priorities.team_1_left;
        assert_eq!(src_work_factor(&rd, 3, &cfg), WORK_FULL_UTILIZATION / 2);

        rd.health_priority = cfg.priorities.team_2_left;
        assert_eq!(src_work_factor(&rd, 3, &cfg), WORK_FULL_UTILIZATION / 2 / 2);

        rd.health_priority = -1;
        assert_eq!(src_work_factor(&rd, 3, &cfg), WORK_FULL_UTILIZATION / 3 / 2);
    }

    #[test]
    fn test_can_launch_src_needs_enough_servers() {
        let cfg = config();
        let rd = relocation(100, vec![1, 2, 3]);
        let mut busymap = HashMap::new();

        // Empty ledgers admit anything.
        assert!(can_launch_src(&rd, 3, 3, &busymap, &[], &cfg));

        // needed_servers = min(3, 3 - 3 + 1) = 1, so one idle server suffices.
        busymap.insert(1, {
            let mut b = Busyness::default();
            b.add_work(100, WORK_FULL_UTILIZATION);
            b
        });
        busymap.insert(2, {
            let mut b = Busyness::default();
            b.add_work(100, WORK_FULL_UTILIZATION);
            b
        });
        assert!(can_launch_src(&rd, 3, 3, &busymap, &[], &cfg));

        busymap.insert(3, {
            let mut b = Busyness::default();
            b.add_work(100, WORK_FULL_UTILIZATION);
            b
        });
        assert!(!can_launch_src(&rd, 3, 3, &busymap, &[], &cfg));
    }

    #[test]
    fn test_cancellable_work_is_discounted() {
        let cfg = config();
        let rd = relocation(100, vec![1]);
        let mut busymap: HashMap<ServerId, Busyness> = HashMap::new();

        let mut prior = relocation(100, vec![1]);
        prior.work_factor = WORK_FULL_UTILIZATION;
        busymap
            .entry(1)
            .or_default()
            .add_work(prior.priority, prior.work_factor);

        assert!(!can_launch_src(&rd, 3, 3, &busymap, &[], &cfg));
        assert!(can_launch_src(&rd, 3, 3, &busymap, &[prior], &cfg));
    }

    #[test]
    fn test_dest_admission_and_fail_switch() {
        let mut cfg = config();
        let mut dest_busymap: HashMap<ServerId, Busyness> = HashMap::new();
        dest_busymap.entry(7).or_default().add_work(100, WORK_FULL_UTILIZATION);

        let teams = vec![vec![7u64, 8]];
        assert!(!can_launch_dest(&teams, 100, &dest_busymap, &cfg));

        cfg.relocation_parallelism_per_dest = 0;
        assert!(can_launch_dest(&teams, 100, &dest_busymap, &cfg));
    }

    #[test]
    fn test_launch_and_complete_round_trip() {
        let cfg = config();
        let mut rd = relocation(100, vec![1, 2]);
        let mut busymap = HashMap::new();
        let mut dest_busymap = HashMap::new();

        launch_src(&mut rd, &mut busymap, 3, &cfg);
        assert!(rd.work_factor > 0);
        assert_eq!(
            busymap[&1].ledger()[1],
            WORK_FULL_UTILIZATION / 3 / cfg.relocation_parallelism_per_source
        );

        launch_dest(&mut rd, &[vec![5, 6]], &mut dest_busymap, &cfg);
        assert_eq!(rd.complete_dests, vec![5, 6]);
        assert_eq!(dest_busymap[&5].ledger()[1], dest_work_factor(&cfg));

        complete(&rd, &mut busymap, &mut dest_busymap, &cfg);
        assert_eq!(busymap[&1].ledger(), &[0; 10]);
        assert_eq!(busymap[&2].ledger(), &[0; 10]);
        assert_eq!(dest_busymap[&5].ledger(), &[0; 10]);
        assert_eq!(dest_busymap[&6].ledger(), &[0; 10]);
    }

    #[test]
    fn test_display_compresses_bands() {
        let mut busy = Busyness::default();
        busy.add_work(150, 2500);
        let s = busy.to_string();
        assert!(s.contains("100=0.25 (2500/10000)"));
        assert!(s.contains("200/900=0.00"));
    }
}
