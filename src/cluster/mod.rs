//! Interfaces to the queue's external collaborators: team collections,
//! the cluster metadata writer, the metrics oracle and the shard routing
//! map. The queue only consumes these; their implementations live with the
//! rest of the cluster controller.

mod metadata;
mod oracle;
mod routing;
mod team;

pub use metadata::{MetadataClient, MoveKeysRequest, SourceServers};
pub use oracle::{
    GetTopKMetricsRequest, GetTopKMetricsReply, HealthMetrics, MetricsOracle, ShardMetrics,
    StorageServerStats,
};
pub use routing::{RoutingTeam, ShardRouting};
pub use team::{GetTeamReply, GetTeamRequest, InflightPenalty, StorageTeam, TeamCollection, TeamSet};
