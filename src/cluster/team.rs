//! Storage team abstraction and the per-region team collection interface.

use crate::error::Result;
use crate::types::ServerId;
use std::sync::Arc;

/// Penalty applied to in-flight data when scoring candidate teams. Selected
/// by the health of the relocation asking for a team.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InflightPenalty {
    /// Routine moves.
    Healthy,
    /// Team-unhealthy or two-replicas-left moves.
    Unhealthy,
    /// Region population or one/zero-replicas-left moves.
    OneLeft,
}

impl InflightPenalty {
    /// Multiplier applied to in-flight bytes when estimating team load.
    pub fn factor(self) -> f64 {
        match self {
            InflightPenalty::Healthy => 1.0,
            InflightPenalty::Unhealthy => 500.0,
            InflightPenalty::OneLeft => 4.0,
        }
    }
}

/// Constraint bundle for a team request.
#[derive(Debug, Clone)]
pub struct GetTeamRequest {
    /// Prefer teams that do not already host the shard's sources.
    pub want_new_servers: bool,
    /// Return the single best-scoring team instead of a random good one.
    pub want_true_best: bool,
    /// Prefer teams with lower disk utilization.
    pub prefer_lower_disk_util: bool,
    /// Only consider teams that currently host shards.
    pub team_must_have_shards: bool,
    /// Score by read load rather than disk.
    pub for_read_balance: bool,
    /// Prefer teams with lower read utilization.
    pub prefer_lower_read_util: bool,
    /// In-flight penalty to apply while scoring.
    pub inflight_penalty: InflightPenalty,
    /// Source servers of the relocation, for already-has-shard reporting.
    pub src: Vec<ServerId>,
    /// Servers holding the entire range.
    pub complete_sources: Vec<ServerId>,
    /// Restrict the reply to the team made of exactly these servers.
    pub pinned_servers: Option<Vec<ServerId>>,
}

impl GetTeamRequest {
    /// Build an unpinned request.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        want_new_servers: bool,
        want_true_best: bool,
        prefer_lower_disk_util: bool,
        team_must_have_shards: bool,
        for_read_balance: bool,
        prefer_lower_read_util: bool,
        inflight_penalty: InflightPenalty,
    ) -> Self {
        Self {
            want_new_servers,
            want_true_best,
            prefer_lower_disk_util,
            team_must_have_shards,
            for_read_balance,
            prefer_lower_read_util,
            inflight_penalty,
            src: Vec::new(),
            complete_sources: Vec::new(),
            pinned_servers: None,
        }
    }

    /// Build a request pinned to a restored move's destination team.
    pub fn pinned(servers: Vec<ServerId>) -> Self {
        Self {
            want_new_servers: false,
            want_true_best: false,
            prefer_lower_disk_util: false,
            team_must_have_shards: false,
            for_read_balance: false,
            prefer_lower_read_util: false,
            inflight_penalty: InflightPenalty::Healthy,
            src: Vec::new(),
            complete_sources: Vec::new(),
            pinned_servers: Some(servers),
        }
    }
}

/// Reply to a team request: the team, if any, and whether it already hosts
/// some of the shard's sources.
pub type GetTeamReply = (Option<Arc<dyn StorageTeam>>, bool);

/// A replica group of storage servers, as seen by the queue.
#[async_trait::async_trait]
pub trait StorageTeam: Send + Sync + std::fmt::Debug {
    /// Ordered server ids of the team.
    fn server_ids(&self) -> Vec<ServerId>;

    /// True when every member is serving.
    fn is_healthy(&self) -> bool;

    /// Adjust the bytes currently being moved toward this team.
    fn add_data_in_flight(&self, delta: i64);

    /// Adjust the read bandwidth currently being moved toward this team.
    fn add_read_in_flight(&self, delta: f64);

    /// Team load in bytes.
    fn load_bytes(&self, include_in_flight: bool, inflight_penalty: f64) -> i64;

    /// Team read bandwidth (bytes read per kilosecond).
    fn read_bandwidth(&self, include_in_flight: bool, inflight_penalty: f64) -> f64;

    /// Refresh the team's storage metrics from its servers.
    async fn refresh_storage_metrics(&self) -> Result<()>;

    /// Human-readable team description for traces.
    fn describe(&self) -> String {
        let ids = self.server_ids();
        format!("team({ids:?})")
    }
}

/// Per-region team collection, the source of destination teams.
#[async_trait::async_trait]
pub trait TeamCollection: Send + Sync + std::fmt::Debug {
    /// Pick a team meeting the request's constraints.
    async fn get_team(&self, req: GetTeamRequest) -> Result<GetTeamReply>;
}

/// Composite over the healthy destination teams of a multi-region move.
#[derive(Debug, Clone, Default)]
pub struct TeamSet {
    teams: Vec<Arc<dyn StorageTeam>>,
}

impl TeamSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a team.
    pub fn add(&mut self, team: Arc<dyn StorageTeam>) {
        self.teams.push(team);
    }

    /// True when the set has no teams.
    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    /// True when every member team is healthy. An empty set is healthy.
    pub fn is_healthy(&self) -> bool {
        self.teams.iter().all(|t| t.is_healthy())
    }

    /// Charge (or release) in-flight bytes on every team.
    pub fn add_data_in_flight(&self, delta: i64) {
        for team in &self.teams {
            team.add_data_in_flight(delta);
        }
    }

    /// Charge (or release) in-flight read bandwidth on every team.
    pub fn add_read_in_flight(&self, delta: f64) {
        for team in &self.teams {
            team.add_read_in_flight(delta);
        }
    }

    /// Refresh metrics on every team.
    pub async fn refresh_storage_metrics(&self) -> Result<()> {
        for team in &self.teams {
            team.refresh_storage_metrics().await?;
        }
        Ok(())
    }
}
