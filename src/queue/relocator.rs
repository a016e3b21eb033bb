//! Per-move state machine: choose destination teams, drive `move_keys`,
//! poll destination health, finalize.
//!
//! A relocator can be aborted at any suspension point when a higher-priority
//! move preempts its range. The completion guard makes cancellation ordinary
//! control flow: whatever way the task ends, the transfer-complete and
//! relocation-complete events fire exactly once and any charged in-flight
//! metrics are released.

use super::busyness;
use super::relocation::{RelocateData, RelocateReason};
use super::state::{CleanupFuture, DataMoveSlot, QueueCore};
use crate::cluster::{
    GetTeamRequest, InflightPenalty, MoveKeysRequest, RoutingTeam, ShardMetrics, StorageTeam,
    TeamSet,
};
use crate::error::{Error, Result};
use crate::types::ServerId;
use futures::FutureExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// Restore moves give up on team selection after this many stuck rounds.
const RESTORE_STUCK_LIMIT: u32 = 50;

/// In-flight metrics charged against the chosen destination teams.
struct ChargedInFlight {
    teams: TeamSet,
    bytes: i64,
    read_load: f64,
}

/// Emits the completion events exactly once, however the relocator ends.
struct CompletionGuard {
    core: Arc<QueueCore>,
    rd: RelocateData,
    signalled_transfer: bool,
    charged: Option<ChargedInFlight>,
}

impl CompletionGuard {
    fn new(core: Arc<QueueCore>, rd: RelocateData) -> Self {
        Self {
            core,
            rd,
            signalled_transfer: false,
            charged: None,
        }
    }

    /// Unblock queued work behind this move. Idempotent.
    fn signal_transfer_complete(&mut self) {
        if !self.signalled_transfer {
            self.signalled_transfer = true;
            let _ = self.core.transfer_done_tx.send(self.rd.clone());
        }
    }

    /// Charge the shard's metrics against the healthy destinations.
    fn charge(&mut self, teams: TeamSet, metrics: &ShardMetrics) {
        teams.add_data_in_flight(metrics.bytes);
        teams.add_read_in_flight(metrics.bytes_read_per_ksecond);
        self.charged = Some(ChargedInFlight {
            teams,
            bytes: metrics.bytes,
            read_load: metrics.bytes_read_per_ksecond,
        });
    }

    /// Release charged bytes now; read load only after a full metrics
    /// interval, so the sampled read bandwidth has caught up with the move.
    fn release_charge(&mut self) {
        if let Some(charged) = self.charged.take() {
            charged.teams.add_data_in_flight(-charged.bytes);
            let interval = self.core.config.storage_metrics_interval;
            let read_load = charged.read_load;
            let teams = charged.teams;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    tokio::time::sleep(interval).await;
                    teams.add_read_in_flight(-read_load);
                });
            } else {
                teams.add_read_in_flight(-read_load);
            }
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.release_charge();
        self.signal_transfer_complete();
        let _ = self.core.relocation_done_tx.send(self.rd.clone());
    }
}

/// Spawn the relocator task for a launched move.
pub(crate) fn spawn(
    core: Arc<QueueCore>,
    rd: RelocateData,
    prev_cleanup: Option<CleanupFuture>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let keys = rd.keys.clone();
        let started = Instant::now();
        let mut guard = CompletionGuard::new(Arc::clone(&core), rd);
        match run(&core, &mut guard, prev_cleanup).await {
            Ok(()) => drop(guard),
            Err(e) => {
                drop(guard);
                if e == Error::DataMoveDestTeamNotFound {
                    let _ = core.cancel_data_move(keys.clone()).await;
                }
                if !e.is_cancellation() {
                    core.metrics.relocations_errored.inc();
                    warn!(
                        keys = %keys,
                        duration_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "relocation failed"
                    );
                    let _ = core.error_tx.send(e);
                }
            }
        }
    })
}

fn inflight_penalty_for(core: &QueueCore, rd: &RelocateData) -> InflightPenalty {
    let priorities = &core.config.priorities;
    if rd.health_priority == priorities.populate_region
        || rd.health_priority == priorities.team_1_left
        || rd.health_priority == priorities.team_0_left
    {
        InflightPenalty::OneLeft
    } else if rd.health_priority == priorities.team_unhealthy
        || rd.health_priority == priorities.team_2_left
    {
        InflightPenalty::Unhealthy
    } else {
        InflightPenalty::Healthy
    }
}

struct SelectedTeams {
    best_teams: Vec<(Arc<dyn StorageTeam>, bool)>,
    all_healthy: bool,
    any_with_source: bool,
}

async fn run(
    core: &Arc<QueueCore>,
    g: &mut CompletionGuard,
    prev_cleanup: Option<CleanupFuture>,
) -> Result<()> {
    let start_time = Instant::now();
    info!(
        keys = %g.rd.keys,
        priority = g.rd.priority,
        relocation_id = %g.rd.random_id,
        "relocating shard"
    );

    if core.config.shard_location_metadata {
        {
            let mut st = core.state.lock();
            let (range, entry) = st.in_flight.range_containing_mut(&g.rd.keys.begin);
            debug_assert_eq!(range, g.rd.keys);
            debug_assert_eq!(entry.random_id, g.rd.random_id);
            debug_assert_eq!(entry.data_move_id, g.rd.data_move_id);
            entry.cancellable = false;
        }
        if let Some(cleanup) = prev_cleanup {
            cleanup.await?;
        }
        {
            let mut st = core.state.lock();
            for (range, slot) in st.data_moves.intersecting(&g.rd.keys) {
                if slot.is_valid() && slot.id != g.rd.data_move_id {
                    warn!(
                        current_data_move_id = %g.rd.data_move_id,
                        data_move_id = %slot.id,
                        range = %range,
                        "relocator found conflicting data move"
                    );
                }
            }
            st.data_moves
                .insert(g.rd.keys.clone(), DataMoveSlot::new(g.rd.data_move_id));
        }
    }

    let metrics = core.ctx.oracle.get_metrics(&g.rd.keys).await?;
    debug_assert!(!g.rd.src.is_empty());

    'relocate: loop {
        let mut dest_overloaded_count: u32 = 0;
        let mut stuck_count: u32 = 0;

        let selected = loop {
            match choose_teams(core, &g.rd).await? {
                TeamChoice::Selected(selected) => break selected,
                TeamChoice::DestOverloaded => {
                    dest_overloaded_count += 1;
                    debug!(
                        stuck_count,
                        dest_overloaded_count,
                        regions = core.ctx.team_collections.len(),
                        "destination servers busy"
                    );
                    tokio::time::sleep(core.config.dest_overloaded_delay).await;
                }
                TeamChoice::NotFound => {
                    stuck_count += 1;
                    warn!(
                        stuck_count,
                        dest_overloaded_count,
                        regions = core.ctx.team_collections.len(),
                        "no usable destination team"
                    );
                    if g.rd.is_restore() && stuck_count > RESTORE_STUCK_LIMIT {
                        return Err(Error::DataMoveDestTeamNotFound);
                    }
                    tokio::time::sleep(core.config.best_team_stuck_delay).await;
                }
            }
        };

        // Commit. No suspension from here until the shard routing update and
        // destination charge are installed, so a team failure arriving
        // afterwards still sees this move's destinations.
        let mut dest_ids: Vec<ServerId> = Vec::new();
        let mut healthy_ids: Vec<ServerId> = Vec::new();
        let mut extra_ids: Vec<ServerId> = Vec::new();
        let mut destination_teams: Vec<RoutingTeam> = Vec::new();
        let mut healthy_destinations = TeamSet::new();
        {
            let mut guard_st = core.state.lock();
            let st = &mut *guard_st;
            {
                let (range, entry) = st.in_flight.range_containing_mut(&g.rd.keys.begin);
                debug_assert_eq!(range, g.rd.keys);
                debug_assert_eq!(entry.random_id, g.rd.random_id);
                entry.cancellable = false;
            }
            g.rd.cancellable = false;

            let mut rng = rand::thread_rng();
            for (i, (team, already_has_shard)) in selected.best_teams.iter().enumerate() {
                let server_ids = team.server_ids();
                destination_teams.push(RoutingTeam::new(server_ids.clone(), i == 0));

                if selected.all_healthy && selected.any_with_source && !already_has_shard {
                    // The team is in a region the data has not reached yet.
                    // Move to one random member first; the rest join after
                    // the initial copy lands, saving cross-region bandwidth.
                    let idx = rng.gen_range(0..server_ids.len());
                    dest_ids.push(server_ids[idx]);
                    healthy_ids.push(server_ids[idx]);
                    for (j, id) in server_ids.iter().enumerate() {
                        if j != idx {
                            extra_ids.push(*id);
                        }
                    }
                    healthy_destinations.add(Arc::clone(team));
                } else {
                    dest_ids.extend(server_ids.iter().copied());
                    if team.is_healthy() {
                        healthy_ids.extend(server_ids.iter().copied());
                        healthy_destinations.add(Arc::clone(team));
                    }
                }
            }

            let total_ids: usize = destination_teams.iter().map(|t| t.servers.len()).sum();
            if total_ids != core.ctx.team_size {
                warn!(
                    expected_team_size = core.ctx.team_size,
                    dest_team_size = total_ids,
                    "unexpected destination team size"
                );
            }

            if !g.rd.is_restore() {
                core.ctx
                    .routing
                    .move_shard(&g.rd.keys, destination_teams.clone());
            }

            let candidate_servers: Vec<Vec<ServerId>> = selected
                .best_teams
                .iter()
                .map(|(team, _)| team.server_ids())
                .collect();
            busyness::launch_dest(&mut g.rd, &candidate_servers, &mut st.dest_busymap, &core.config);
        }
        g.charge(healthy_destinations.clone(), &metrics);

        info!(
            relocation_id = %g.rd.random_id,
            priority = g.rd.priority,
            keys = %g.rd.keys,
            source_servers = ?g.rd.src,
            destination_team = ?dest_ids,
            extra_ids = ?extra_ids,
            "relocation has destination"
        );

        let (done_tx, mut done_rx) = oneshot::channel();
        let mut movement_done_seen = false;
        let mut move_fut = core.ctx.metadata.move_keys(move_keys_request(
            core,
            &g.rd,
            dest_ids.clone(),
            healthy_ids.clone(),
            Some(done_tx),
        ));

        let move_result: Result<()> = loop {
            tokio::select! {
                res = &mut move_fut => {
                    match res {
                        Err(e) => break Err(e),
                        Ok(()) => {
                            if !extra_ids.is_empty() {
                                // Second phase: expand to the full teams now
                                // that the initial copy is in place.
                                dest_ids.extend(extra_ids.iter().copied());
                                healthy_ids.extend(extra_ids.iter().copied());
                                extra_ids.clear();
                                move_fut = core.ctx.metadata.move_keys(move_keys_request(
                                    core,
                                    &g.rd,
                                    dest_ids.clone(),
                                    healthy_ids.clone(),
                                    None,
                                ));
                            } else {
                                let mut st = core.state.lock();
                                st.fetch_keys_complete.insert(g.rd.clone());
                                if core.config.shard_location_metadata {
                                    let affected =
                                        st.data_moves.affected_ranges_after_insert(&g.rd.keys);
                                    let owned_exactly = affected.len() == 1
                                        && affected[0] == g.rd.keys
                                        && {
                                            let (_, slot) =
                                                st.data_moves.range_containing(&g.rd.keys.begin);
                                            slot.id == g.rd.data_move_id && slot.cancel.is_none()
                                        };
                                    if owned_exactly {
                                        st.data_moves
                                            .insert(g.rd.keys.clone(), DataMoveSlot::default());
                                        debug!(
                                            data_move_id = %g.rd.data_move_id,
                                            "data move dequeued on success"
                                        );
                                    }
                                }
                                break Ok(());
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(core.config.health_poll_time), if !g.signalled_transfer => {
                    if !healthy_destinations.is_healthy() {
                        g.signal_transfer_complete();
                    }
                }
                res = &mut done_rx, if !g.signalled_transfer && !movement_done_seen => {
                    movement_done_seen = true;
                    if res.is_ok() {
                        core.state.lock().fetch_keys_complete.insert(g.rd.clone());
                        g.signal_transfer_complete();
                    }
                }
            }
        };

        match move_result {
            Ok(()) => {
                // Refresh destination metrics before releasing in-flight, so
                // the released load is already visible in the samples.
                let refreshed = healthy_destinations.refresh_storage_metrics().await;
                g.release_charge();
                refreshed?;

                let elapsed = start_time.elapsed();
                if elapsed > core.config.relocation_warn_after {
                    warn!(
                        duration_ms = elapsed.as_millis() as u64,
                        destination_team = ?dest_ids,
                        source_servers = ?g.rd.src,
                        "relocation ran long"
                    );
                }
                info!(
                    relocation_id = %g.rd.random_id,
                    duration_ms = elapsed.as_millis() as u64,
                    bytes = metrics.bytes,
                    "relocation succeeded"
                );

                g.signal_transfer_complete();
                core.state.lock().bytes_written += metrics.bytes;
                core.metrics.bytes_written.inc_by(metrics.bytes.max(0) as u64);
                core.metrics.relocations_completed.inc();
                core.ctx.routing.finish_move(&g.rd.keys);
                return Ok(());
            }
            Err(Error::MoveToRemovedServer) => {
                g.release_charge();
                {
                    let mut guard_st = core.state.lock();
                    let st = &mut *guard_st;
                    busyness::complete_dest(&g.rd, &mut st.dest_busymap, &core.config);
                }
                g.rd.complete_dests.clear();
                tokio::time::sleep(core.config.retry_relocate_shard_delay).await;
                continue 'relocate;
            }
            Err(e) => {
                g.release_charge();
                return Err(e);
            }
        }
    }
}

enum TeamChoice {
    Selected(SelectedTeams),
    DestOverloaded,
    NotFound,
}

/// One pass of multi-region team selection.
///
/// The first region's reply may suspend; every later region must answer
/// synchronously so the routing update can follow without an intervening
/// suspension. A pending later region forces a restart.
async fn choose_teams(core: &Arc<QueueCore>, rd: &RelocateData) -> Result<TeamChoice> {
    let priorities = &core.config.priorities;
    let mut best_teams: Vec<(Arc<dyn StorageTeam>, bool)> = Vec::new();
    let mut any_healthy = false;
    let mut all_healthy = true;
    let mut any_with_source = false;
    let mut found_teams = true;

    for (index, collection) in core.ctx.team_collections.iter().enumerate() {
        let req = if let Some(dm) = rd.data_move.as_ref() {
            GetTeamRequest::pinned(dm.dest_for_region(index).to_vec())
        } else {
            let mut req = GetTeamRequest::new(
                rd.wants_new_servers,
                priorities.is_valley_filler_priority(rd.priority),
                true,
                false,
                rd.reason == RelocateReason::RebalanceRead,
                true,
                inflight_penalty_for(core, rd),
            );
            req.src = rd.src.clone();
            req.complete_sources = rd.complete_sources.clone();
            req
        };

        let mut reply_fut = collection.get_team(req);
        let (ready, reply) = match (&mut reply_fut).now_or_never() {
            Some(reply) => (true, reply?),
            None => (false, reply_fut.await?),
        };
        if index > 0 && !ready {
            debug!(region = index, "best team not ready, restarting selection");
            found_teams = false;
            break;
        }

        match reply {
            (Some(team), already_has_shard) => {
                if rd.is_restore() {
                    if !team.is_healthy() {
                        found_teams = false;
                        break;
                    }
                    any_healthy = true;
                } else {
                    if team.is_healthy() {
                        any_healthy = true;
                    } else {
                        all_healthy = false;
                    }
                    if already_has_shard {
                        any_with_source = true;
                    }
                }
                best_teams.push((team, already_has_shard));
            }
            (None, _) => {
                // A region without a healthy team stalls selection until it
                // recovers or is excluded.
                found_teams = false;
                break;
            }
        }
    }

    let any_dest_overloaded = {
        let candidate_servers: Vec<Vec<ServerId>> = best_teams
            .iter()
            .map(|(team, _)| team.server_ids())
            .collect();
        let st = core.state.lock();
        !busyness::can_launch_dest(&candidate_servers, rd.priority, &st.dest_busymap, &core.config)
    };

    if found_teams && any_healthy && !any_dest_overloaded {
        debug_assert!(rd.complete_dests.is_empty());
        Ok(TeamChoice::Selected(SelectedTeams {
            best_teams,
            all_healthy,
            any_with_source,
        }))
    } else if any_dest_overloaded {
        Ok(TeamChoice::DestOverloaded)
    } else {
        Ok(TeamChoice::NotFound)
    }
}

fn move_keys_request(
    core: &Arc<QueueCore>,
    rd: &RelocateData,
    dest_ids: Vec<ServerId>,
    healthy_ids: Vec<ServerId>,
    data_movement_complete: Option<oneshot::Sender<()>>,
) -> MoveKeysRequest {
    MoveKeysRequest {
        data_move_id: rd.data_move_id,
        keys: rd.keys.clone(),
        dest_ids,
        healthy_ids,
        lock: core.ctx.lock,
        data_movement_complete,
        start_parallelism: Arc::clone(&core.start_move_parallelism),
        finish_parallelism: Arc::clone(&core.finish_move_parallelism),
        multi_region: core.ctx.team_collections.len() > 1,
        relocation_id: rd.random_id,
        cancel_conflicting: false,
    }
}
