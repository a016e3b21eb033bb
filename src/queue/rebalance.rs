//! Background rebalancers.
//!
//! Two periodic workers per region move data off over-utilized teams (the
//! mountain chopper) and onto under-utilized ones (the valley filler); two
//! more do the same for read load when read sampling is enabled. Each tick
//! re-reads the operator toggle, respects the per-priority queue gate, picks
//! a source/destination team pair and emits a synthetic relocation on the
//! queue input.

use super::relocation::{MovementReason, RelocateReason, RelocateShard};
use super::state::QueueCore;
use crate::config::{TOGGLE_IGNORE_REBALANCE_DISK, TOGGLE_IGNORE_REBALANCE_READ};
use crate::cluster::{
    GetTeamRequest, GetTopKMetricsRequest, InflightPenalty, RoutingTeam, ShardMetrics, StorageTeam,
};
use crate::error::Result;
use crate::keyspace::KeyRange;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawn every rebalance worker the configuration calls for.
pub(crate) fn spawn_workers(
    core: &Arc<QueueCore>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut workers = Vec::new();
    for region in 0..core.ctx.team_collections.len() {
        let mut reasons = vec![
            MovementReason::RebalanceOverutilizedTeam,
            MovementReason::RebalanceUnderutilizedTeam,
        ];
        if core.config.read_sampling_enabled {
            reasons.push(MovementReason::RebalanceReadOverutilTeam);
            reasons.push(MovementReason::RebalanceReadUnderutilTeam);
        }
        for reason in reasons {
            workers.push(tokio::spawn(rebalance_worker(
                Arc::clone(core),
                region,
                reason,
                shutdown.clone(),
            )));
        }
    }
    workers
}

async fn rebalance_worker(
    core: Arc<QueueCore>,
    region: usize,
    reason: MovementReason,
    shutdown: CancellationToken,
) {
    let read_rebalance = reason.is_read_rebalance();
    let priority = core.config.priorities.priority_for(reason);
    let mut polling_interval = core.config.bg_rebalance_polling_interval;
    let mut last_toggle_read: Option<Instant> = None;
    let mut skip_current_loop = false;

    loop {
        let toggle_stale = last_toggle_read
            .map_or(true, |t| t.elapsed() > core.config.bg_rebalance_switch_check_interval);
        if toggle_stale {
            match core.ctx.metadata.rebalance_toggle().await {
                Ok(value) => {
                    last_toggle_read = Some(Instant::now());
                    skip_current_loop = match value {
                        None => false,
                        // Legacy sentinels "" and "on" disable everything;
                        // otherwise byte 0 is a raw bitmask.
                        Some(v) if v.is_empty() || v.as_ref() == b"on" => true,
                        Some(v) => {
                            let mask = v[0];
                            if read_rebalance {
                                mask & TOGGLE_IGNORE_REBALANCE_READ != 0
                            } else {
                                mask & TOGGLE_IGNORE_REBALANCE_DISK != 0
                            }
                        }
                    };
                    if !skip_current_loop {
                        polling_interval = core.config.bg_rebalance_polling_interval;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "rebalance toggle read failed");
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(polling_interval) => {}
        }

        if skip_current_loop {
            // Stretch the loop to the toggle check cadence while disabled.
            polling_interval = polling_interval.max(core.config.bg_rebalance_switch_check_interval);
            continue;
        }

        let queued = core
            .state
            .lock()
            .priority_relocations
            .get(&priority)
            .copied()
            .unwrap_or(0);
        if queued >= core.config.rebalance_parallelism {
            debug!(
                region,
                ?reason,
                queued_relocations = queued,
                "rebalance tick skipped, queue full"
            );
            continue;
        }

        let moved = match rebalance_once(&core, region, reason).await {
            Ok(moved) => moved,
            Err(e) => {
                debug!(region, ?reason, error = %e, "rebalance attempt failed");
                false
            }
        };
        debug!(region, ?reason, moved, "rebalance tick");
    }
}

/// Pick the source/destination team pair for one tick and try a move.
async fn rebalance_once(
    core: &Arc<QueueCore>,
    region: usize,
    reason: MovementReason,
) -> Result<bool> {
    let read_rebalance = reason.is_read_rebalance();
    let mountain_chopper = reason.is_mountain_chopper();
    let collection = &core.ctx.team_collections[region];

    let dest_req = GetTeamRequest::new(
        true,
        !mountain_chopper,
        true,
        false,
        read_rebalance,
        true,
        InflightPenalty::Healthy,
    );
    let (dest_team, _) = collection.get_team(dest_req).await?;
    let Some(dest_team) = dest_team else {
        return Ok(false);
    };

    let src_req = GetTeamRequest::new(
        true,
        mountain_chopper,
        false,
        true,
        read_rebalance,
        false,
        InflightPenalty::Healthy,
    );
    let (source_team, _) = collection.get_team(src_req).await?;
    let Some(source_team) = source_team else {
        return Ok(false);
    };

    if read_rebalance {
        rebalance_read_load(core, reason, source_team, dest_team, region == 0).await
    } else {
        rebalance_disk(core, reason, source_team, dest_team, region == 0).await
    }
}

/// Move a large random shard off `source_team` when it holds much more data
/// than `dest_team`.
async fn rebalance_disk(
    core: &Arc<QueueCore>,
    reason: MovementReason,
    source_team: Arc<dyn StorageTeam>,
    dest_team: Arc<dyn StorageTeam>,
    primary: bool,
) -> Result<bool> {
    let average_shard_bytes = core.ctx.oracle.average_shard_bytes().await?;
    let team = RoutingTeam::new(source_team.server_ids(), primary);
    let shards = core.ctx.routing.get_shards_for(&team);
    debug!(
        average_shard_bytes,
        shards_in_source = shards.len(),
        "disk rebalance considering source team"
    );
    if shards.is_empty() {
        debug!(skip_reason = "NoShardOnSource", "disk rebalance skipped");
        return Ok(false);
    }

    // Sample random shards and keep the largest; settle early once one
    // exceeds the cluster average.
    let mut candidate = KeyRange::empty();
    let mut metrics = ShardMetrics::default();
    let mut retries = 0;
    while retries < core.config.rebalance_max_retries {
        let test_shard = {
            let mut rng = rand::thread_rng();
            shards[rng.gen_range(0..shards.len())].clone()
        };
        let test_metrics = core.ctx.oracle.get_metrics(&test_shard).await?;
        if test_metrics.bytes > metrics.bytes {
            candidate = test_shard;
            metrics = test_metrics;
            if metrics.bytes > average_shard_bytes {
                break;
            }
        }
        retries += 1;
    }

    let source_bytes = source_team.load_bytes(false, 1.0);
    let dest_bytes = dest_team.load_bytes(true, 1.0);
    let too_similar =
        source_bytes - dest_bytes <= 3 * core.config.min_shard_bytes.max(metrics.bytes);
    debug!(
        source_bytes,
        dest_bytes,
        shard_bytes = metrics.bytes,
        too_similar,
        "disk rebalance candidate"
    );
    if too_similar || metrics.bytes == 0 {
        debug!(
            skip_reason = if too_similar { "TeamTooSimilar" } else { "ShardZeroSize" },
            "disk rebalance skipped"
        );
        return Ok(false);
    }

    // The shard may have moved while we sampled.
    let shards = core.ctx.routing.get_shards_for(&team);
    if shards.contains(&candidate) {
        let rs = RelocateShard::new(
            candidate,
            reason,
            RelocateReason::RebalanceDisk,
            &core.config.priorities,
        );
        let _ = core.output.send(rs);
        core.metrics.rebalance_moves_emitted.inc();
        return Ok(true);
    }
    debug!(skip_reason = "ShardNotPresent", "disk rebalance skipped");
    Ok(false)
}

/// Move one of the hottest shards off `source_team` when it serves far more
/// reads than `dest_team` and is actually CPU-bound.
async fn rebalance_read_load(
    core: &Arc<QueueCore>,
    reason: MovementReason,
    source_team: Arc<dyn StorageTeam>,
    dest_team: Arc<dyn StorageTeam>,
    primary: bool,
) -> Result<bool> {
    let team = RoutingTeam::new(source_team.server_ids(), primary);
    let shards = core.ctx.routing.get_shards_for(&team);
    debug!(shards_in_source = shards.len(), "read rebalance considering source team");
    // With a single hot shard, moving it just moves the problem; that case
    // belongs to split/merge.
    if shards.len() <= 1 {
        debug!(skip_reason = "NoShardOnSource", "read rebalance skipped");
        return Ok(false);
    }

    // The read sample lags behind moves; cap per-source cadence so decisions
    // are not made from stale samples.
    if core.time_throttle(&source_team.server_ids()) {
        debug!(skip_reason = "SourceTeamThrottle", "read rebalance skipped");
        return Ok(false);
    }

    let src_load = source_team.read_bandwidth(false, 1.0);
    let dest_load = dest_team.read_bandwidth(true, 1.0);
    debug!(
        src_read_bandwidth = src_load,
        dest_read_bandwidth = dest_load,
        "read rebalance team loads"
    );
    if (1.0 - core.config.read_rebalance_diff_frac) * src_load <= dest_load {
        debug!(skip_reason = "TeamTooSimilar", "read rebalance skipped");
        return Ok(false);
    }

    let shard_count = shards.len();
    let top_k = ((0.1 * shard_count as f64) as usize).min(core.config.read_rebalance_shard_topk);
    let topk_req = GetTopKMetricsRequest {
        keys: shards,
        top_k,
        max_bytes_read_per_ksecond: (src_load - dest_load) * core.config.read_rebalance_max_shard_frac,
        min_bytes_read_per_ksecond: src_load / shard_count as f64,
    };
    let (health, reply) = tokio::join!(
        core.ctx.oracle.get_health_metrics(true),
        core.ctx.oracle.get_top_k_metrics(topk_req)
    );
    let reply = reply?;
    let health = health?;

    let worst_cpu = health.worst_cpu(&source_team.server_ids());
    if worst_cpu < core.config.read_rebalance_cpu_threshold {
        debug!(
            skip_reason = "LowReadLoad",
            worst_src_cpu = worst_cpu,
            "read rebalance skipped"
        );
        return Ok(false);
    }

    // Randomize so the same shard is not pushed every tick.
    let mut candidates = reply.shard_metrics;
    {
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
    }
    debug!(
        min_read_load = reply.min_read_load,
        max_read_load = reply.max_read_load,
        "read rebalance candidates"
    );
    let Some((shard, shard_metrics)) = candidates.first().cloned() else {
        debug!(skip_reason = "NoEligibleShards", "read rebalance skipped");
        return Ok(false);
    };
    debug!(
        shard_read_bandwidth = shard_metrics.bytes_read_per_ksecond,
        "read rebalance picked shard"
    );

    // The shard may have moved while we sampled.
    let shards = core.ctx.routing.get_shards_for(&team);
    if shards.contains(&shard) {
        let rs = RelocateShard::new(
            shard,
            reason,
            RelocateReason::RebalanceRead,
            &core.config.priorities,
        );
        let _ = core.output.send(rs);
        core.update_last_as_source(&source_team.server_ids());
        core.metrics.rebalance_moves_emitted.inc();
        return Ok(true);
    }
    debug!(skip_reason = "ShardNotPresent", "read rebalance skipped");
    Ok(false)
}
