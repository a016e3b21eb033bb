//! Queue state and the launcher.
//!
//! All mutable queue state lives behind one mutex and is only touched from
//! synchronous sections; nothing here holds the lock across an `.await`.

use super::busyness::{self, can_launch_src, Busyness};
use super::relocation::{RelocateData, RelocateShard};
use super::relocator;
use crate::config::QueueConfig;
use crate::cluster::{MetadataClient, MetricsOracle, ShardRouting, TeamCollection};
use crate::error::{Error, Result};
use crate::keyspace::{ActorMap, KeyRange, RangeMap};
use crate::metrics::QueueMetrics;
use crate::types::{MoveId, MoveKeysLock, ServerId};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A data-move cleanup future, shared between every party waiting on it.
pub(crate) type CleanupFuture = Shared<BoxFuture<'static, Result<()>>>;

/// One entry of the data-move registry: the identity of the move covering a
/// range and, once cancellation has started, the shared cleanup future.
#[derive(Clone, Default)]
pub struct DataMoveSlot {
    /// Identity of the tracked move; anonymous means "no move here".
    pub id: MoveId,
    /// Cleanup in progress, if any.
    pub(crate) cancel: Option<CleanupFuture>,
}

impl DataMoveSlot {
    pub(crate) fn new(id: MoveId) -> Self {
        Self { id, cancel: None }
    }

    /// True when this slot tracks a real move.
    pub fn is_valid(&self) -> bool {
        self.id.is_valid()
    }
}

impl std::fmt::Debug for DataMoveSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataMoveSlot")
            .field("id", &self.id)
            .field("cancelling", &self.cancel.is_some())
            .finish()
    }
}

/// External collaborators and cluster shape handed to the queue at startup.
#[derive(Debug, Clone)]
pub struct QueueContext {
    /// Identity of this distributor, for traces.
    pub distributor_id: Uuid,
    /// Ownership token for move-keys transactions.
    pub lock: MoveKeysLock,
    /// Cluster metadata writer.
    pub metadata: Arc<dyn MetadataClient>,
    /// Storage metrics oracle.
    pub oracle: Arc<dyn MetricsOracle>,
    /// One team collection per region, primary first.
    pub team_collections: Vec<Arc<dyn TeamCollection>>,
    /// Shard routing map.
    pub routing: Arc<dyn ShardRouting>,
    /// Total replicas across all regions.
    pub team_size: usize,
    /// Replicas within one region.
    pub single_region_team_size: usize,
}

/// Mutable queue state. One mutator at a time; see the module note.
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    /// Coverage map of queued relocations.
    pub queue_map: RangeMap<RelocateData>,
    /// Moves whose source servers are still being resolved.
    pub fetching_sources: BTreeSet<RelocateData>,
    /// In-flight moves whose data transfer has completed.
    pub fetch_keys_complete: BTreeSet<RelocateData>,
    /// Tasks resolving source servers, by range.
    pub fetch_actors: ActorMap,
    /// Per-source-server relocation queues, highest priority first.
    pub queue: HashMap<ServerId, BTreeSet<RelocateData>>,
    /// When each server was last used as a read-rebalance source.
    pub last_as_source: HashMap<ServerId, Instant>,
    /// Coverage map of in-flight moves.
    pub in_flight: RangeMap<RelocateData>,
    /// Tasks driving in-flight moves, by range.
    pub in_flight_actors: ActorMap,
    /// Data-move identity registry.
    pub data_moves: RangeMap<DataMoveSlot>,
    /// Source-server utilization ledgers.
    pub busymap: HashMap<ServerId, Busyness>,
    /// Destination-server utilization ledgers.
    pub dest_busymap: HashMap<ServerId, Busyness>,
    /// Moves currently in flight.
    pub active_relocations: i64,
    /// Moves queued (fetching sources or awaiting launch).
    pub queued_relocations: i64,
    /// Bytes moved by completed relocations.
    pub bytes_written: i64,
    /// Queued-or-active move count per priority.
    pub priority_relocations: BTreeMap<i32, i64>,
    /// Moves at an unhealthy-team priority, queued or in flight.
    pub unhealthy_relocations: i64,
}

impl QueueState {
    /// Highest priority with at least one queued or active move.
    pub fn highest_priority_relocation(&self) -> i32 {
        self.priority_relocations
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(priority, _)| *priority)
            .max()
            .unwrap_or(0)
    }
}

/// Shared core of the distribution queue: configuration, collaborators,
/// state, and the channels the event loop drains.
pub struct QueueCore {
    pub(crate) config: QueueConfig,
    pub(crate) ctx: QueueContext,
    pub(crate) metrics: QueueMetrics,
    pub(crate) state: Mutex<QueueState>,
    pub(crate) epoch: Instant,

    pub(crate) start_move_parallelism: Arc<Semaphore>,
    pub(crate) finish_move_parallelism: Arc<Semaphore>,
    pub(crate) cleanup_parallelism: Arc<Semaphore>,
    pub(crate) fetch_source_parallelism: Arc<Semaphore>,

    pub(crate) fetch_done_tx: mpsc::UnboundedSender<RelocateData>,
    pub(crate) transfer_done_tx: mpsc::UnboundedSender<RelocateData>,
    pub(crate) relocation_done_tx: mpsc::UnboundedSender<RelocateData>,
    pub(crate) error_tx: mpsc::UnboundedSender<Error>,
    pub(crate) output: mpsc::UnboundedSender<RelocateShard>,

    pub(crate) processing_unhealthy: watch::Sender<bool>,
    pub(crate) processing_wiggle: watch::Sender<bool>,
}

impl std::fmt::Debug for QueueCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCore")
            .field("distributor_id", &self.ctx.distributor_id)
            .field("team_size", &self.ctx.team_size)
            .finish()
    }
}

pub(crate) struct QueueChannels {
    pub fetch_done_tx: mpsc::UnboundedSender<RelocateData>,
    pub transfer_done_tx: mpsc::UnboundedSender<RelocateData>,
    pub relocation_done_tx: mpsc::UnboundedSender<RelocateData>,
    pub error_tx: mpsc::UnboundedSender<Error>,
    pub output: mpsc::UnboundedSender<RelocateShard>,
    pub processing_unhealthy: watch::Sender<bool>,
    pub processing_wiggle: watch::Sender<bool>,
}

impl QueueCore {
    pub(crate) fn new(config: QueueConfig, ctx: QueueContext, channels: QueueChannels) -> Self {
        Self {
            start_move_parallelism: Arc::new(Semaphore::new(config.move_keys_parallelism)),
            finish_move_parallelism: Arc::new(Semaphore::new(config.move_keys_parallelism)),
            cleanup_parallelism: Arc::new(Semaphore::new(config.clean_up_data_move_parallelism)),
            fetch_source_parallelism: Arc::new(Semaphore::new(config.fetch_source_parallelism)),
            config,
            ctx,
            metrics: QueueMetrics::new(),
            state: Mutex::new(QueueState::default()),
            epoch: Instant::now(),
            fetch_done_tx: channels.fetch_done_tx,
            transfer_done_tx: channels.transfer_done_tx,
            relocation_done_tx: channels.relocation_done_tx,
            error_tx: channels.error_tx,
            output: channels.output,
            processing_unhealthy: channels.processing_unhealthy,
            processing_wiggle: channels.processing_wiggle,
        }
    }

    /// Milliseconds since the queue epoch.
    pub(crate) fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Current count of moves at unhealthy-team priorities.
    pub fn unhealthy_relocations(&self) -> i64 {
        self.state.lock().unhealthy_relocations
    }

    fn start_relocation(&self, st: &mut QueueState, priority: i32, health_priority: i32) {
        let priorities = &self.config.priorities;
        if priorities.counts_as_unhealthy(health_priority) {
            st.unhealthy_relocations += 1;
            self.metrics
                .relocations_unhealthy
                .set(st.unhealthy_relocations);
            let _ = self.processing_unhealthy.send(true);
        }
        if health_priority == priorities.perpetual_storage_wiggle {
            let _ = self.processing_wiggle.send(true);
        }
        *st.priority_relocations.entry(priority).or_insert(0) += 1;
    }

    fn finish_relocation(&self, st: &mut QueueState, priority: i32, health_priority: i32) {
        let priorities = &self.config.priorities;
        if priorities.counts_as_unhealthy(health_priority) {
            st.unhealthy_relocations -= 1;
            debug_assert!(st.unhealthy_relocations >= 0);
            self.metrics
                .relocations_unhealthy
                .set(st.unhealthy_relocations);
            if st.unhealthy_relocations == 0 {
                let _ = self.processing_unhealthy.send(false);
            }
        }
        *st.priority_relocations.entry(priority).or_insert(0) -= 1;
        if st
            .priority_relocations
            .get(&priorities.perpetual_storage_wiggle)
            .copied()
            .unwrap_or(0)
            == 0
        {
            let _ = self.processing_wiggle.send(false);
        }
    }

    /// Record when servers last acted as a read-rebalance source.
    pub(crate) fn update_last_as_source(&self, ids: &[ServerId]) {
        let now = Instant::now();
        let mut st = self.state.lock();
        for id in ids {
            st.last_as_source.insert(*id, now);
        }
    }

    /// True when any of `ids` moved a shard as a read-rebalance source too
    /// recently for the sampled metrics to have caught up.
    pub(crate) fn time_throttle(&self, ids: &[ServerId]) -> bool {
        let st = self.state.lock();
        let interval = self.config.storage_metrics_interval.as_secs_f64();
        let parallelism = self.config.read_rebalance_src_parallelism as f64;
        ids.iter().any(|id| {
            st.last_as_source
                .get(id)
                .is_some_and(|t| t.elapsed().as_secs_f64() * parallelism < interval)
        })
    }

    fn spawn_fetch_sources(self: &Arc<Self>, rd: RelocateData) -> JoinHandle<()> {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            // Merges wait out pending split decisions before resolving.
            let delay = if rd.priority == core.config.priorities.merge_shard {
                Duration::from_millis(500)
            } else {
                Duration::from_micros(100)
            };
            tokio::time::sleep(delay).await;

            let _permit = match core.fetch_source_parallelism.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match core.ctx.metadata.get_source_servers(&rd.keys).await {
                Ok(sources) => {
                    let mut resolved = rd;
                    resolved.src = sources.src;
                    resolved.complete_sources = sources.complete_sources;
                    let _ = core.fetch_done_tx.send(resolved);
                }
                Err(e) => {
                    warn!(keys = %rd.keys, error = %e, "source server fetch failed");
                }
            }
        })
    }

    /// Absorb a new relocation request into the range index.
    ///
    /// Returns the source servers of any subsumed entries; the launcher
    /// retries launches from those servers.
    pub fn queue_relocation(self: &Arc<Self>, rs: &RelocateShard) -> HashSet<ServerId> {
        let mut servers_to_relaunch = HashSet::new();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let priorities = &self.config.priorities;

        let mut rd = RelocateData::from_shard(rs, self.now_ms(), priorities);
        let has_health_priority = priorities.is_health_priority(rd.priority);
        let has_boundary_priority = priorities.is_boundary_priority(rd.priority);

        // Absorb the intent of every queued entry the new request touches;
        // fully contained entries are dropped outright.
        let intersecting: Vec<RelocateData> = st
            .queue_map
            .intersecting(&rd.keys)
            .into_iter()
            .map(|(_, v)| v.clone())
            .collect();
        for rrs in intersecting {
            let found_fetching = st.fetching_sources.contains(&rrs);
            let found_queued = !found_fetching
                && !rrs.src.is_empty()
                && st.queue.get(&rrs.src[0]).is_some_and(|q| q.contains(&rrs));

            if found_fetching || found_queued {
                rd.wants_new_servers |= rrs.wants_new_servers;
                rd.start_time = rd.start_time.min(rrs.start_time);
                if !has_health_priority {
                    rd.health_priority = rd.health_priority.max(rrs.health_priority);
                }
                if !has_boundary_priority {
                    rd.boundary_priority = rd.boundary_priority.max(rrs.boundary_priority);
                }
                rd.priority = rd
                    .priority
                    .max(rd.boundary_priority.max(rd.health_priority));
            }

            if rd.keys.contains(&rrs.keys) {
                if found_fetching {
                    st.fetching_sources.remove(&rrs);
                } else if found_queued {
                    for s in &rrs.src {
                        if let Some(q) = st.queue.get_mut(s) {
                            q.remove(&rrs);
                        }
                    }
                }
            }

            if found_fetching || found_queued {
                servers_to_relaunch.extend(rrs.src.iter().copied());
                st.queued_relocations -= 1;
                self.metrics.relocations_queued.set(st.queued_relocations);
                debug!(
                    data_move_id = %rrs.data_move_id,
                    relocation_id = %rrs.random_id,
                    total = st.queued_relocations,
                    "queued relocation subsumed"
                );
                self.finish_relocation(st, rrs.priority, rrs.health_priority);
            }
        }

        // Final shape of the queue map around the new request.
        let affected = st.queue_map.affected_ranges_after_insert(&rd.keys);
        st.queue_map.insert(rd.keys.clone(), rd.clone());

        // Cancel source fetches across the whole affected span.
        if let (Some(first), Some(last)) = (affected.first(), affected.last()) {
            st.fetch_actors.cancel(KeyRange {
                begin: first.begin.clone(),
                end: last.end.clone(),
            });
        }

        for piece in &affected {
            let (occupant, was_fetching) = {
                let (_, rrs) = st.queue_map.range_containing_mut(&piece.begin);
                let fetched = st.fetching_sources.take(&*rrs);
                (rrs.clone(), fetched.is_some())
            };

            if occupant.src.is_empty() && (occupant.keys == rd.keys || was_fetching) {
                // (Re)start source resolution for this piece.
                let snapshot = {
                    let (_, rrs) = st.queue_map.range_containing_mut(&piece.begin);
                    rrs.keys = piece.clone();
                    rrs.clone()
                };
                st.queued_relocations += 1;
                self.metrics.relocations_queued.set(st.queued_relocations);
                self.start_relocation(st, snapshot.priority, snapshot.health_priority);
                st.fetching_sources.insert(snapshot.clone());
                let handle = self.spawn_fetch_sources(snapshot);
                st.fetch_actors.insert(piece.clone(), handle);
            } else {
                // A live queued entry survives with truncated keys; replace
                // its per-server copies with a clone carrying the new range.
                debug_assert!(!occupant.src.is_empty() || !occupant.is_issued());
                let mut new_data = occupant.clone();
                new_data.keys = piece.clone();

                let mut found_active_relocation = false;
                for s in &occupant.src {
                    let removed = st.queue.entry(*s).or_default().remove(&new_data);
                    if removed {
                        if !found_active_relocation {
                            st.queued_relocations += 1;
                            self.metrics.relocations_queued.set(st.queued_relocations);
                            self.start_relocation(
                                st,
                                new_data.priority,
                                new_data.health_priority,
                            );
                            found_active_relocation = true;
                        }
                        st.queue.entry(*s).or_default().insert(new_data.clone());
                    } else {
                        break;
                    }
                }

                // Keep the resident entry's keys in step even when dead.
                let (_, rrs) = st.queue_map.range_containing_mut(&piece.begin);
                rrs.keys = piece.clone();
            }
        }

        servers_to_relaunch
    }

    /// Move a resolved relocation from the fetching queue into the
    /// per-source-server queues. Returns false when the result is stale
    /// (its fetch was cancelled by a later overlapping request) and must
    /// not be launched.
    pub fn complete_source_fetch(&self, results: &RelocateData) -> bool {
        let mut st = self.state.lock();
        let fresh = st
            .fetching_sources
            .get(results)
            .is_some_and(|entry| entry.keys == results.keys);
        if !fresh {
            debug!(keys = %results.keys, "dropping stale source fetch result");
            return false;
        }

        st.fetching_sources.remove(results);
        st.queue_map.insert(results.keys.clone(), results.clone());
        for s in &results.src {
            st.queue.entry(*s).or_default().insert(results.clone());
        }
        let now = Instant::now();
        for s in &results.src {
            st.last_as_source.insert(*s, now);
        }
        true
    }

    /// Launch trigger: every queued occupant intersecting `keys`.
    pub fn launch_by_range(self: &Arc<Self>, keys: &KeyRange) {
        let combined = {
            let st = self.state.lock();
            let mut combined = BTreeSet::new();
            for (_, v) in st.queue_map.intersecting(keys) {
                if !v.src.is_empty() && st.queue.get(&v.src[0]).is_some_and(|q| q.contains(v)) {
                    combined.insert(v.clone());
                }
            }
            combined
        };
        self.launch_queued_work(combined);
    }

    /// Launch trigger: the top `team_size` queued moves of each server.
    pub fn launch_from_servers<'a>(
        self: &Arc<Self>,
        servers: impl IntoIterator<Item = &'a ServerId>,
    ) {
        let combined = {
            let st = self.state.lock();
            let mut combined = BTreeSet::new();
            for id in servers {
                if let Some(server_queue) = st.queue.get(id) {
                    for rd in server_queue.iter().take(self.ctx.team_size) {
                        combined.insert(rd.clone());
                    }
                }
            }
            combined
        };
        self.launch_queued_work(combined);
    }

    /// Launch trigger: retry a single candidate.
    pub fn launch_single(self: &Arc<Self>, rd: RelocateData) {
        let mut combined = BTreeSet::new();
        combined.insert(rd);
        self.launch_queued_work(combined);
    }

    /// Admit eligible candidates in descending priority: skip moves blocked
    /// by higher-priority in-flight work, check source admission against the
    /// cancellable-adjusted ledgers, preempt overlapped in-flight moves and
    /// spawn one relocator per post-truncation piece.
    pub fn launch_queued_work(self: &Arc<Self>, combined: BTreeSet<RelocateData>) {
        let started_at = Instant::now();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;

            for candidate in &combined {
                let mut rd = candidate.clone();

                // A live in-flight move on a strict sub-range whose transfer
                // already completed blocks lower-priority arrivals; strong
                // health moves always preempt.
                let mut overlapping_in_flight = false;
                for (range, v) in st.in_flight.intersecting(&rd.keys) {
                    if st.fetch_keys_complete.contains(v)
                        && st.in_flight_actors.live_at(&range.begin)
                        && !rd.keys.contains(&range)
                        && v.priority >= rd.priority
                        && rd.health_priority < self.config.priorities.team_unhealthy
                    {
                        overlapping_in_flight = true;
                        break;
                    }
                }
                if overlapping_in_flight {
                    debug_assert!(!rd.is_restore());
                    continue;
                }

                // Work that launching rd would cancel is discounted from the
                // source ledgers during admission.
                let cancellable: Vec<RelocateData> = st
                    .in_flight
                    .contained(&rd.keys)
                    .into_iter()
                    .filter(|(_, v)| v.cancellable)
                    .map(|(_, v)| v.clone())
                    .collect();

                if !rd.is_restore()
                    && !can_launch_src(
                        &rd,
                        self.ctx.team_size,
                        self.ctx.single_region_team_size,
                        &st.busymap,
                        &cancellable,
                        &self.config,
                    )
                {
                    continue;
                }

                if !rd.is_restore() {
                    st.queued_relocations -= 1;
                    self.metrics.relocations_queued.set(st.queued_relocations);
                    self.finish_relocation(st, rd.priority, rd.health_priority);
                    for s in &rd.src {
                        let removed = st.queue.entry(*s).or_default().remove(&rd);
                        debug_assert!(removed);
                    }
                }

                // Serialize cancellation of prior overlapping data moves
                // ahead of the new relocator.
                let prev_cleanup = if self.config.shard_location_metadata {
                    Some(self.start_cancel_data_move(st, rd.keys.clone()))
                } else {
                    None
                };

                // Keep the relocation intent of live in-flight work we are
                // about to displace.
                for (range, v) in st.in_flight.intersecting(&rd.keys) {
                    if st.in_flight_actors.live_at(&range.begin) {
                        rd.wants_new_servers |= v.wants_new_servers;
                    }
                }

                // Repartition the in-flight area and cancel displaced
                // relocators before charging the new move.
                let pieces = st.in_flight_actors.affected_ranges_after_insert(&rd.keys);
                if let (Some(first), Some(last)) = (pieces.first(), pieces.last()) {
                    st.in_flight_actors.cancel(KeyRange {
                        begin: first.begin.clone(),
                        end: last.end.clone(),
                    });
                }
                st.in_flight.insert(rd.keys.clone(), rd.clone());

                for piece in pieces {
                    let charged = {
                        let (_, rrs) = st.in_flight.range_containing_mut(&piece.begin);
                        rrs.keys = piece.clone();
                        if piece == rd.keys && rd.is_restore() {
                            if let Some(dm) = rd.data_move.as_ref() {
                                rrs.data_move_id = dm.id;
                            }
                        } else {
                            debug_assert!(!rd.is_restore());
                            rrs.data_move = None;
                            rrs.data_move_id = if self.config.shard_location_metadata {
                                MoveId::random()
                            } else {
                                MoveId::ANONYMOUS
                            };
                        }
                        busyness::launch_src(
                            rrs,
                            &mut st.busymap,
                            self.ctx.single_region_team_size,
                            &self.config,
                        );
                        rrs.clone()
                    };

                    st.active_relocations += 1;
                    self.metrics.relocations_active.set(st.active_relocations);
                    self.metrics.relocations_started.inc();
                    self.start_relocation(st, charged.priority, charged.health_priority);
                    debug!(
                        data_move_id = %charged.data_move_id,
                        keys = %charged.keys,
                        priority = charged.priority,
                        total = st.active_relocations,
                        "relocation launched"
                    );

                    let handle =
                        relocator::spawn(Arc::clone(self), charged, prev_cleanup.clone());
                    st.in_flight_actors.insert(piece, handle);
                }
            }
        }

        let elapsed = started_at.elapsed();
        if elapsed > Duration::from_millis(1) && rand::thread_rng().gen_bool(0.001) {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "slow launcher pass");
        }

        if self.config.expensive_validation {
            for problem in self.validate() {
                error!(problem = %problem, "queue invariant violated");
            }
        }
    }

    fn make_cleanup_future(&self, id: MoveId, keys: KeyRange) -> CleanupFuture {
        let metadata = Arc::clone(&self.ctx.metadata);
        let lock = self.ctx.lock;
        let parallelism = Arc::clone(&self.cleanup_parallelism);
        let fut: CleanupFuture = async move {
            metadata.clean_up_data_move(id, lock, parallelism, keys).await
        }
        .boxed()
        .shared();
        // Drive the cleanup even if nobody ever awaits the handle.
        tokio::spawn({
            let fut = fut.clone();
            async move {
                let _ = fut.await;
            }
        });
        fut
    }

    fn cancel_data_move_prepare(&self, st: &mut QueueState, range: &KeyRange) -> Vec<CleanupFuture> {
        let targets: Vec<(KeyRange, MoveId, Option<CleanupFuture>)> = st
            .data_moves
            .intersecting(range)
            .into_iter()
            .filter(|(_, slot)| slot.is_valid())
            .map(|(r, slot)| (r, slot.id, slot.cancel.clone()))
            .collect();

        let mut cleanups = Vec::with_capacity(targets.len());
        for (keys, id, existing) in targets {
            info!(
                data_move_id = %id,
                data_move_range = %keys,
                range = %range,
                "cancelling data move"
            );
            let fut = match existing {
                Some(fut) => fut,
                None => {
                    let fut = self.make_cleanup_future(id, keys.clone());
                    let (_, slot) = st.data_moves.range_containing_mut(&keys.begin);
                    slot.cancel = Some(fut.clone());
                    fut
                }
            };
            cleanups.push(fut);
        }
        cleanups
    }

    /// Begin cancelling every data move overlapping `range`. The returned
    /// future resolves once all cleanups finish and a placeholder covers the
    /// affected span.
    fn start_cancel_data_move(self: &Arc<Self>, st: &mut QueueState, range: KeyRange) -> CleanupFuture {
        let cleanups = self.cancel_data_move_prepare(st, &range);
        let core = Arc::clone(self);
        let fut: CleanupFuture = async move {
            for cleanup in cleanups {
                cleanup.await?;
            }
            let mut st = core.state.lock();
            let affected = st.data_moves.affected_ranges_after_insert(&range);
            if let (Some(first), Some(last)) = (affected.first(), affected.last()) {
                let span = KeyRange {
                    begin: first.begin.clone(),
                    end: last.end.clone(),
                };
                st.data_moves.insert(span, DataMoveSlot::default());
            }
            Ok(())
        }
        .boxed()
        .shared();
        tokio::spawn({
            let fut = fut.clone();
            async move {
                let _ = fut.await;
            }
        });
        fut
    }

    /// Cancel every data move overlapping `range` and wait for the cleanups.
    pub async fn cancel_data_move(self: &Arc<Self>, range: KeyRange) -> Result<()> {
        let fut = {
            let mut st = self.state.lock();
            self.start_cancel_data_move(&mut st, range)
        };
        fut.await
    }

    /// Entry point for external data-move cancellations. Refuses when an
    /// overlapping entry already tracks a different move.
    pub fn enqueue_cancelled_data_move(&self, data_move_id: MoveId, range: KeyRange) {
        let mut st = self.state.lock();
        for (r, slot) in st.data_moves.intersecting(&range) {
            if slot.is_valid() {
                error!(
                    data_move_id = %data_move_id,
                    cancelled_range = %range,
                    conflicting_data_move_id = %slot.id,
                    conflicting_range = %r,
                    "cancelled data move conflicts with a tracked move"
                );
                return;
            }
        }

        let mut slot = DataMoveSlot::new(data_move_id);
        slot.cancel = Some(self.make_cleanup_future(data_move_id, range.clone()));
        st.data_moves.insert(range.clone(), slot);
        self.metrics.data_moves_cancelled.inc();
        info!(data_move_id = %data_move_id, range = %range, "enqueued cancelled data move");
    }

    /// Release the ledger charges of a move whose data transfer finished
    /// (or whose relocator terminated).
    pub(crate) fn complete_transfer(&self, done: &RelocateData) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        busyness::complete(done, &mut st.busymap, &mut st.dest_busymap, &self.config);
    }

    /// Bookkeeping for a relocator that has fully terminated.
    pub(crate) fn on_relocation_complete(&self, done: &RelocateData) {
        let mut st = self.state.lock();
        st.active_relocations -= 1;
        self.metrics.relocations_active.set(st.active_relocations);
        self.finish_relocation(&mut st, done.priority, done.health_priority);
        st.fetch_keys_complete.remove(done);
        debug!(
            data_move_id = %done.data_move_id,
            is_restore = done.is_restore(),
            total = st.active_relocations,
            "relocation complete"
        );
    }

    /// Periodic queue summary.
    pub(crate) fn log_moving_data(&self) {
        let st = self.state.lock();
        info!(
            in_flight = st.active_relocations,
            in_queue = st.queued_relocations,
            unhealthy_relocations = st.unhealthy_relocations,
            highest_priority = st.highest_priority_relocation(),
            bytes_written = st.bytes_written,
            "moving data"
        );
    }

    /// The invariant sweep. Returns human-readable descriptions of every
    /// violation found; an empty vector means the state is consistent.
    pub fn validate(&self) -> Vec<String> {
        let st = self.state.lock();
        let mut problems = Vec::new();

        for rd in &st.fetching_sources {
            if !rd.src.is_empty() {
                problems.push(format!("fetching relocation {} already has sources", rd.keys));
            }
            if rd.work_factor != 0 {
                problems.push(format!("fetching relocation {} has a work factor", rd.keys));
            }
            let (range, resident) = st.queue_map.range_containing(&rd.keys.begin);
            if resident != rd || range != rd.keys {
                problems.push(format!(
                    "fetching relocation {} is not in the queue map exactly",
                    rd.keys
                ));
            }
        }

        let mut queued_union: BTreeSet<&RelocateData> = BTreeSet::new();
        for (server, server_queue) in &st.queue {
            for rd in server_queue {
                if !rd.src.contains(server) {
                    problems.push(format!(
                        "relocation {} filed under server {server} it does not source from",
                        rd.keys
                    ));
                }
                if rd.work_factor != 0 {
                    problems.push(format!("queued relocation {} has a work factor", rd.keys));
                }
                if rd.priority <= 0 {
                    problems.push(format!("queued relocation {} has no priority", rd.keys));
                }
                queued_union.insert(rd);
            }
        }

        for (range, rd) in st.in_flight.ranges() {
            if !rd.is_issued() {
                continue;
            }
            for s in &rd.src {
                if !st.busymap.contains_key(s) {
                    problems.push(format!("in-flight source {s} missing from busymap"));
                }
                if st.queue.get(s).is_some_and(|q| q.contains(rd)) {
                    problems.push(format!(
                        "in-flight relocation {} still queued under {s}",
                        rd.keys
                    ));
                }
            }
            for d in &rd.complete_dests {
                if !st.dest_busymap.contains_key(d) {
                    problems.push(format!("in-flight destination {d} missing from dest busymap"));
                }
            }
            if rd.src.is_empty() {
                problems.push(format!("in-flight relocation {} has no sources", range));
            }
            if st.in_flight_actors.live_at(&range.begin) {
                if rd.keys != range {
                    problems.push(format!(
                        "in-flight entry range {} disagrees with its keys {}",
                        range, rd.keys
                    ));
                }
            } else if rd.cancellable {
                problems.push(format!("range {range} is cancellable but not in flight"));
            }
        }

        for (name, map) in [("busymap", &st.busymap), ("dest busymap", &st.dest_busymap)] {
            for (server, busy) in map {
                let ledger = busy.ledger();
                for i in 0..ledger.len() - 1 {
                    if ledger[i] < ledger[i + 1] {
                        problems.push(format!("{name} ledger for {server} increases at band {i}"));
                    }
                }
                if ledger.iter().any(|v| *v < 0) {
                    problems.push(format!("{name} ledger for {server} went negative"));
                }
            }
        }

        let expected_queued = queued_union.len() + st.fetching_sources.len();
        if st.queued_relocations != expected_queued as i64 {
            problems.push(format!(
                "queued relocation count {} != {} queued entries",
                st.queued_relocations, expected_queued
            ));
        }

        let priority_total: i64 = st.priority_relocations.values().sum();
        if st.active_relocations + st.queued_relocations != priority_total {
            problems.push(format!(
                "active {} + queued {} != per-priority total {}",
                st.active_relocations, st.queued_relocations, priority_total
            ));
        }

        problems
    }
}
