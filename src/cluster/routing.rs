//! Shard routing map interface: which teams serve which key ranges, kept so
//! team failures can be mapped back to affected shards.

use crate::keyspace::KeyRange;
use crate::types::ServerId;

/// A team as known to the routing map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingTeam {
    /// Server ids of the team.
    pub servers: Vec<ServerId>,
    /// True for the primary region's team.
    pub primary: bool,
}

impl RoutingTeam {
    /// Build a routing team.
    pub fn new(servers: Vec<ServerId>, primary: bool) -> Self {
        Self { servers, primary }
    }
}

/// Routing map of shards to destination teams. Implementations are expected
/// to answer synchronously from in-memory state: `move_shard` must be
/// callable inside the launcher's no-suspension commit section.
pub trait ShardRouting: Send + Sync + std::fmt::Debug {
    /// Record that `keys` is being moved to `teams` (one per region).
    fn move_shard(&self, keys: &KeyRange, teams: Vec<RoutingTeam>);

    /// Record that the move of `keys` finished.
    fn finish_move(&self, keys: &KeyRange);

    /// The shards currently assigned to `team`.
    fn get_shards_for(&self, team: &RoutingTeam) -> Vec<KeyRange>;
}
