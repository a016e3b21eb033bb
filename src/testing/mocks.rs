//! Mock collaborators for queue tests.

use crate::cluster::{
    GetTeamReply, GetTeamRequest, GetTopKMetricsReply, GetTopKMetricsRequest, HealthMetrics,
    MetadataClient, MetricsOracle, MoveKeysRequest, RoutingTeam, ShardMetrics, ShardRouting,
    SourceServers, StorageTeam,
};
use crate::error::{Error, Result};
use crate::keyspace::KeyRange;
use crate::types::{MoveId, MoveKeysLock, ServerId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// A storage team with scriptable health and load.
#[derive(Debug)]
pub struct MockTeam {
    servers: Vec<ServerId>,
    healthy: AtomicBool,
    load_bytes: AtomicI64,
    read_bandwidth: Mutex<f64>,
    data_in_flight: AtomicI64,
    read_in_flight: Mutex<f64>,
}

impl MockTeam {
    pub fn new(servers: Vec<ServerId>) -> Arc<Self> {
        Arc::new(Self {
            servers,
            healthy: AtomicBool::new(true),
            load_bytes: AtomicI64::new(0),
            read_bandwidth: Mutex::new(0.0),
            data_in_flight: AtomicI64::new(0),
            read_in_flight: Mutex::new(0.0),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_load_bytes(&self, bytes: i64) {
        self.load_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn set_read_bandwidth(&self, bandwidth: f64) {
        *self.read_bandwidth.lock() = bandwidth;
    }

    pub fn data_in_flight(&self) -> i64 {
        self.data_in_flight.load(Ordering::SeqCst)
    }

    pub fn read_in_flight(&self) -> f64 {
        *self.read_in_flight.lock()
    }
}

#[async_trait::async_trait]
impl StorageTeam for MockTeam {
    fn server_ids(&self) -> Vec<ServerId> {
        self.servers.clone()
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn add_data_in_flight(&self, delta: i64) {
        self.data_in_flight.fetch_add(delta, Ordering::SeqCst);
    }

    fn add_read_in_flight(&self, delta: f64) {
        *self.read_in_flight.lock() += delta;
    }

    fn load_bytes(&self, include_in_flight: bool, _inflight_penalty: f64) -> i64 {
        let base = self.load_bytes.load(Ordering::SeqCst);
        if include_in_flight {
            base + self.data_in_flight.load(Ordering::SeqCst)
        } else {
            base
        }
    }

    fn read_bandwidth(&self, include_in_flight: bool, _inflight_penalty: f64) -> f64 {
        let base = *self.read_bandwidth.lock();
        if include_in_flight {
            base + *self.read_in_flight.lock()
        } else {
            base
        }
    }

    async fn refresh_storage_metrics(&self) -> Result<()> {
        Ok(())
    }
}

/// A team collection answering from two scriptable slots: one for requests
/// that demand a team with shards (rebalance sources), one for the rest.
#[derive(Debug, Default)]
pub struct MockTeamCollection {
    default_reply: Mutex<Option<GetTeamReply>>,
    team_with_shards: Mutex<Option<GetTeamReply>>,
    scripted: Mutex<VecDeque<GetTeamReply>>,
    requests: Mutex<Vec<GetTeamRequest>>,
}

impl MockTeamCollection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply for ordinary destination requests.
    pub fn set_team(&self, team: Arc<dyn StorageTeam>, already_has_shard: bool) {
        *self.default_reply.lock() = Some((Some(team), already_has_shard));
    }

    /// Reply for requests with `team_must_have_shards`.
    pub fn set_team_with_shards(&self, team: Arc<dyn StorageTeam>) {
        *self.team_with_shards.lock() = Some((Some(team), true));
    }

    /// Push a one-shot scripted reply, served before the defaults.
    pub fn push_reply(&self, reply: GetTeamReply) {
        self.scripted.lock().push_back(reply);
    }

    /// Every request observed so far.
    pub fn requests(&self) -> Vec<GetTeamRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl crate::cluster::TeamCollection for MockTeamCollection {
    async fn get_team(&self, req: GetTeamRequest) -> Result<GetTeamReply> {
        let must_have_shards = req.team_must_have_shards;
        self.requests.lock().push(req);
        if let Some(reply) = self.scripted.lock().pop_front() {
            return Ok(reply);
        }
        if must_have_shards {
            if let Some(reply) = self.team_with_shards.lock().clone() {
                return Ok(reply);
            }
        }
        Ok(self.default_reply.lock().clone().unwrap_or((None, false)))
    }
}

/// What a scripted `move_keys` call should do.
#[derive(Debug, Clone)]
pub enum MoveKeysBehavior {
    /// Fire the data-movement signal and return success.
    Succeed,
    /// Sleep, then fire the signal and return success.
    SucceedAfter(Duration),
    /// Fire the data-movement signal, then never return.
    SignalThenHang,
    /// Never return.
    Hang,
    /// Fail with the given error.
    Fail(Error),
}

/// One recorded `move_keys` invocation.
#[derive(Debug, Clone)]
pub struct RecordedMoveKeys {
    pub data_move_id: MoveId,
    pub keys: KeyRange,
    pub dest_ids: Vec<ServerId>,
    pub healthy_ids: Vec<ServerId>,
}

/// Cluster metadata mock with scriptable move behavior.
#[derive(Debug)]
pub struct MockMetadataClient {
    sources: Mutex<SourceServers>,
    fetch_delay: Mutex<Duration>,
    default_behavior: Mutex<MoveKeysBehavior>,
    scripted: Mutex<VecDeque<MoveKeysBehavior>>,
    move_keys_calls: Mutex<Vec<RecordedMoveKeys>>,
    cleanup_calls: Mutex<Vec<(MoveId, KeyRange)>>,
    toggle: Mutex<Option<Bytes>>,
}

impl MockMetadataClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sources: Mutex::new(SourceServers::default()),
            fetch_delay: Mutex::new(Duration::ZERO),
            default_behavior: Mutex::new(MoveKeysBehavior::Succeed),
            scripted: Mutex::new(VecDeque::new()),
            move_keys_calls: Mutex::new(Vec::new()),
            cleanup_calls: Mutex::new(Vec::new()),
            toggle: Mutex::new(None),
        })
    }

    pub fn set_sources(&self, src: Vec<ServerId>, complete_sources: Vec<ServerId>) {
        *self.sources.lock() = SourceServers {
            src,
            complete_sources,
        };
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn set_move_keys_behavior(&self, behavior: MoveKeysBehavior) {
        *self.default_behavior.lock() = behavior;
    }

    pub fn push_move_keys_behavior(&self, behavior: MoveKeysBehavior) {
        self.scripted.lock().push_back(behavior);
    }

    pub fn set_toggle(&self, value: Option<Bytes>) {
        *self.toggle.lock() = value;
    }

    pub fn move_keys_calls(&self) -> Vec<RecordedMoveKeys> {
        self.move_keys_calls.lock().clone()
    }

    pub fn cleanup_calls(&self) -> Vec<(MoveId, KeyRange)> {
        self.cleanup_calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl MetadataClient for MockMetadataClient {
    async fn get_source_servers(&self, _keys: &KeyRange) -> Result<SourceServers> {
        let delay = *self.fetch_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        Ok(self.sources.lock().clone())
    }

    async fn move_keys(&self, req: MoveKeysRequest) -> Result<()> {
        self.move_keys_calls.lock().push(RecordedMoveKeys {
            data_move_id: req.data_move_id,
            keys: req.keys.clone(),
            dest_ids: req.dest_ids.clone(),
            healthy_ids: req.healthy_ids.clone(),
        });
        let behavior = self
            .scripted
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.lock().clone());
        match behavior {
            MoveKeysBehavior::Succeed => {
                if let Some(tx) = req.data_movement_complete {
                    let _ = tx.send(());
                }
                Ok(())
            }
            MoveKeysBehavior::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                if let Some(tx) = req.data_movement_complete {
                    let _ = tx.send(());
                }
                Ok(())
            }
            MoveKeysBehavior::SignalThenHang => {
                if let Some(tx) = req.data_movement_complete {
                    let _ = tx.send(());
                }
                futures::future::pending().await
            }
            MoveKeysBehavior::Hang => futures::future::pending().await,
            MoveKeysBehavior::Fail(e) => Err(e),
        }
    }

    async fn clean_up_data_move(
        &self,
        id: MoveId,
        _lock: MoveKeysLock,
        _parallelism: Arc<Semaphore>,
        keys: KeyRange,
    ) -> Result<()> {
        self.cleanup_calls.lock().push((id, keys));
        Ok(())
    }

    async fn rebalance_toggle(&self) -> Result<Option<Bytes>> {
        Ok(self.toggle.lock().clone())
    }
}

/// Metrics oracle mock.
#[derive(Debug)]
pub struct MockOracle {
    default_metrics: Mutex<ShardMetrics>,
    per_range: Mutex<HashMap<KeyRange, ShardMetrics>>,
    top_k: Mutex<GetTopKMetricsReply>,
    health: Mutex<HealthMetrics>,
    average_shard_bytes: AtomicI64,
}

impl MockOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            default_metrics: Mutex::new(ShardMetrics::default()),
            per_range: Mutex::new(HashMap::new()),
            top_k: Mutex::new(GetTopKMetricsReply::default()),
            health: Mutex::new(HealthMetrics::default()),
            average_shard_bytes: AtomicI64::new(0),
        })
    }

    pub fn set_default_metrics(&self, metrics: ShardMetrics) {
        *self.default_metrics.lock() = metrics;
    }

    pub fn set_metrics(&self, keys: KeyRange, metrics: ShardMetrics) {
        self.per_range.lock().insert(keys, metrics);
    }

    pub fn set_top_k(&self, reply: GetTopKMetricsReply) {
        *self.top_k.lock() = reply;
    }

    pub fn set_health(&self, health: HealthMetrics) {
        *self.health.lock() = health;
    }

    pub fn set_average_shard_bytes(&self, bytes: i64) {
        self.average_shard_bytes.store(bytes, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl MetricsOracle for MockOracle {
    async fn get_metrics(&self, keys: &KeyRange) -> Result<ShardMetrics> {
        Ok(self
            .per_range
            .lock()
            .get(keys)
            .copied()
            .unwrap_or(*self.default_metrics.lock()))
    }

    async fn get_top_k_metrics(&self, req: GetTopKMetricsRequest) -> Result<GetTopKMetricsReply> {
        let mut reply = self.top_k.lock().clone();
        reply.shard_metrics.truncate(req.top_k);
        Ok(reply)
    }

    async fn get_health_metrics(&self, _detailed: bool) -> Result<HealthMetrics> {
        Ok(self.health.lock().clone())
    }

    async fn average_shard_bytes(&self) -> Result<i64> {
        Ok(self.average_shard_bytes.load(Ordering::SeqCst))
    }
}

/// Shard routing mock keyed by team membership.
#[derive(Debug, Default)]
pub struct MockRouting {
    shards: Mutex<HashMap<Vec<ServerId>, Vec<KeyRange>>>,
    move_shard_calls: Mutex<Vec<(KeyRange, Vec<RoutingTeam>)>>,
    finish_move_calls: Mutex<Vec<KeyRange>>,
}

impl MockRouting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_shards_for(&self, servers: Vec<ServerId>, shards: Vec<KeyRange>) {
        self.shards.lock().insert(servers, shards);
    }

    pub fn move_shard_calls(&self) -> Vec<(KeyRange, Vec<RoutingTeam>)> {
        self.move_shard_calls.lock().clone()
    }

    pub fn finish_move_calls(&self) -> Vec<KeyRange> {
        self.finish_move_calls.lock().clone()
    }
}

impl ShardRouting for MockRouting {
    fn move_shard(&self, keys: &KeyRange, teams: Vec<RoutingTeam>) {
        self.move_shard_calls.lock().push((keys.clone(), teams));
    }

    fn finish_move(&self, keys: &KeyRange) {
        self.finish_move_calls.lock().push(keys.clone());
    }

    fn get_shards_for(&self, team: &RoutingTeam) -> Vec<KeyRange> {
        self.shards
            .lock()
            .get(&team.servers)
            .cloned()
            .unwrap_or_default()
    }
}
