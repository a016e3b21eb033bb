//! The data distribution queue.
//!
//! A single event loop owns the queue: relocation requests arrive on the
//! input channel, source servers are resolved, per-server queues fill, the
//! launcher admits eligible moves subject to the busyness ledgers, and one
//! relocator task drives each in-flight range. Background rebalancers feed
//! synthetic requests back through the output channel.

pub mod busyness;
pub mod relocation;

mod rebalance;
mod relocator;
mod state;

pub use state::{DataMoveSlot, QueueContext, QueueCore};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::keyspace::KeyRange;
use crate::metrics::QueueMetricsSnapshot;
use crate::types::ServerId;
use relocation::{RelocateData, RelocateShard};
use state::QueueChannels;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Observer handle onto a running queue.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    pub(crate) core: Arc<QueueCore>,
    processing_unhealthy: watch::Receiver<bool>,
    processing_wiggle: watch::Receiver<bool>,
}

impl QueueHandle {
    /// Snapshot of the queue metrics.
    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Count of queued-or-active moves at unhealthy-team priorities. Team
    /// removal must wait for this to reach zero.
    pub fn unhealthy_relocations(&self) -> i64 {
        self.core.unhealthy_relocations()
    }

    /// Observable flag: true while any unhealthy-priority move is tracked.
    pub fn processing_unhealthy(&self) -> watch::Receiver<bool> {
        self.processing_unhealthy.clone()
    }

    /// Observable flag: true while a storage-wiggle move is tracked.
    pub fn processing_wiggle(&self) -> watch::Receiver<bool> {
        self.processing_wiggle.clone()
    }

    /// Run the invariant sweep, returning descriptions of any violations.
    pub fn validate(&self) -> Vec<String> {
        self.core.validate()
    }
}

/// The data distribution queue. Construct it, keep a [`QueueHandle`], and
/// drive it with [`DistributionQueue::run`].
#[derive(Debug)]
pub struct DistributionQueue {
    core: Arc<QueueCore>,
    input: mpsc::UnboundedReceiver<RelocateShard>,
    fetch_done_rx: mpsc::UnboundedReceiver<RelocateData>,
    transfer_done_rx: mpsc::UnboundedReceiver<RelocateData>,
    relocation_done_rx: mpsc::UnboundedReceiver<RelocateData>,
    error_rx: mpsc::UnboundedReceiver<Error>,
    processing_unhealthy: watch::Receiver<bool>,
    processing_wiggle: watch::Receiver<bool>,
}

impl DistributionQueue {
    /// Build a queue over the given collaborators. `input` carries external
    /// relocation requests; self-injected background moves are emitted on
    /// `output` (the caller is expected to feed them back into `input`).
    pub fn new(
        config: QueueConfig,
        ctx: QueueContext,
        input: mpsc::UnboundedReceiver<RelocateShard>,
        output: mpsc::UnboundedSender<RelocateShard>,
    ) -> Self {
        let (fetch_done_tx, fetch_done_rx) = mpsc::unbounded_channel();
        let (transfer_done_tx, transfer_done_rx) = mpsc::unbounded_channel();
        let (relocation_done_tx, relocation_done_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (unhealthy_tx, unhealthy_rx) = watch::channel(false);
        let (wiggle_tx, wiggle_rx) = watch::channel(false);

        let core = Arc::new(QueueCore::new(
            config,
            ctx,
            QueueChannels {
                fetch_done_tx,
                transfer_done_tx,
                relocation_done_tx,
                error_tx,
                output,
                processing_unhealthy: unhealthy_tx,
                processing_wiggle: wiggle_tx,
            },
        ));

        Self {
            core,
            input,
            fetch_done_rx,
            transfer_done_rx,
            relocation_done_rx,
            error_rx,
            processing_unhealthy: unhealthy_rx,
            processing_wiggle: wiggle_rx,
        }
    }

    /// Observer handle; cheap to clone and usable while the queue runs.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            core: Arc::clone(&self.core),
            processing_unhealthy: self.processing_unhealthy.clone(),
            processing_wiggle: self.processing_wiggle.clone(),
        }
    }

    /// Drive the queue until the input channel closes (orderly shutdown) or
    /// a relocator surfaces a fatal error.
    pub async fn run(mut self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let rebalancers = rebalance::spawn_workers(&self.core, shutdown.clone());

        let mut servers_to_launch: HashSet<ServerId> = HashSet::new();
        let mut pending_ranges: VecDeque<KeyRange> = VecDeque::new();

        // Launch ticks batch same-instant triggers the way the launcher's
        // zero-delay timer does; the far deadline parks the timer between
        // bursts.
        let mut tick_armed = false;
        let launch_tick = tokio::time::sleep_until(far_future());
        tokio::pin!(launch_tick);

        let mut logging = tokio::time::interval(self.core.config.queue_logging_interval);
        logging.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            distributor_id = %self.core.ctx.distributor_id,
            regions = self.core.ctx.team_collections.len(),
            "distribution queue started"
        );

        let result = loop {
            tokio::select! {
                maybe_rs = self.input.recv() => {
                    match maybe_rs {
                        None => break Ok(()),
                        Some(rs) if rs.is_restore() => {
                            debug_assert!(rs.data_move_id.is_valid());
                            let rd = RelocateData::from_shard(
                                &rs,
                                self.core.now_ms(),
                                &self.core.config.priorities,
                            );
                            self.core.launch_single(rd);
                        }
                        Some(rs) if rs.cancelled => {
                            self.core
                                .enqueue_cancelled_data_move(rs.data_move_id, rs.keys.clone());
                        }
                        Some(rs) => {
                            let relaunch = self.core.queue_relocation(&rs);
                            servers_to_launch.extend(relaunch);
                            if !servers_to_launch.is_empty() && !tick_armed {
                                tick_armed = true;
                                launch_tick.as_mut().reset(tokio::time::Instant::now());
                            }
                        }
                    }
                }
                () = &mut launch_tick, if tick_armed => {
                    tick_armed = false;
                    launch_tick.as_mut().reset(far_future());
                    if !servers_to_launch.is_empty() {
                        self.core.launch_from_servers(servers_to_launch.iter());
                        servers_to_launch.clear();
                    }
                    while let Some(keys) = pending_ranges.pop_front() {
                        self.core.launch_by_range(&keys);
                    }
                }
                Some(resolved) = self.fetch_done_rx.recv() => {
                    if self.core.complete_source_fetch(&resolved) {
                        self.core.launch_single(resolved);
                    }
                }
                Some(done) = self.transfer_done_rx.recv() => {
                    self.core.complete_transfer(&done);
                    if !done.src.is_empty() {
                        servers_to_launch.extend(done.src.iter().copied());
                        if !tick_armed {
                            tick_armed = true;
                            launch_tick.as_mut().reset(tokio::time::Instant::now());
                        }
                    }
                }
                Some(done) = self.relocation_done_rx.recv() => {
                    self.core.on_relocation_complete(&done);
                    pending_ranges.push_back(done.keys.clone());
                    if !tick_armed {
                        tick_armed = true;
                        launch_tick.as_mut().reset(tokio::time::Instant::now());
                    }
                }
                Some(err) = self.error_rx.recv() => {
                    break Err(err);
                }
                _ = logging.tick() => {
                    self.core.log_moving_data();
                }
            }
        };

        shutdown.cancel();
        for worker in rebalancers {
            worker.abort();
        }
        {
            let mut st = self.core.state.lock();
            st.in_flight_actors.cancel(KeyRange::all());
            st.fetch_actors.cancel(KeyRange::all());
        }
        match &result {
            Ok(()) => info!("distribution queue stopped"),
            Err(e) => debug!(error = %e, "distribution queue aborting"),
        }
        result
    }
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86_400 * 365)
}
