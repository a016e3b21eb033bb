//! Storage metrics oracle interface.

use crate::error::Result;
use crate::keyspace::KeyRange;
use crate::types::ServerId;
use std::collections::HashMap;

/// Size and load metrics for one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShardMetrics {
    /// Shard size in bytes.
    pub bytes: i64,
    /// Read throughput in bytes per kilosecond.
    pub bytes_read_per_ksecond: f64,
    /// Write throughput in bytes per second.
    pub bytes_written_per_second: i64,
}

/// Request for the top-K read-dense shards out of a candidate list.
#[derive(Debug, Clone)]
pub struct GetTopKMetricsRequest {
    /// Candidate shards.
    pub keys: Vec<KeyRange>,
    /// How many of the hottest shards to return.
    pub top_k: usize,
    /// Ignore shards whose read load exceeds this budget; moving them would
    /// overshoot the balance target.
    pub max_bytes_read_per_ksecond: f64,
    /// Ignore shards colder than this.
    pub min_bytes_read_per_ksecond: f64,
}

/// Reply to a top-K metrics request.
#[derive(Debug, Clone, Default)]
pub struct GetTopKMetricsReply {
    /// The selected shards with their metrics, hottest first.
    pub shard_metrics: Vec<(KeyRange, ShardMetrics)>,
    /// Coldest read load observed across the candidates.
    pub min_read_load: f64,
    /// Hottest read load observed across the candidates.
    pub max_read_load: f64,
}

/// Per-server health statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageServerStats {
    /// CPU usage percentage.
    pub cpu_usage: f64,
}

/// Cluster health metrics.
#[derive(Debug, Clone, Default)]
pub struct HealthMetrics {
    /// Per-server statistics; servers too busy to report may be absent.
    pub storage_stats: HashMap<ServerId, StorageServerStats>,
}

impl HealthMetrics {
    /// Worst CPU across `ids`. A server missing from the stats is assumed
    /// to be too busy to report and counts as 100%.
    pub fn worst_cpu(&self, ids: &[ServerId]) -> f64 {
        let mut cpu: f64 = 0.0;
        for id in ids {
            match self.storage_stats.get(id) {
                Some(stats) => cpu = cpu.max(stats.cpu_usage),
                None => return 100.0,
            }
        }
        cpu
    }
}

/// Read-only oracle for shard and server metrics.
#[async_trait::async_trait]
pub trait MetricsOracle: Send + Sync + std::fmt::Debug {
    /// Metrics for one key range.
    async fn get_metrics(&self, keys: &KeyRange) -> Result<ShardMetrics>;

    /// The hottest shards out of a candidate list.
    async fn get_top_k_metrics(&self, req: GetTopKMetricsRequest) -> Result<GetTopKMetricsReply>;

    /// Cluster health, optionally with per-server detail.
    async fn get_health_metrics(&self, detailed: bool) -> Result<HealthMetrics>;

    /// Current average shard size in bytes.
    async fn average_shard_bytes(&self) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_cpu() {
        let mut metrics = HealthMetrics::default();
        metrics
            .storage_stats
            .insert(1, StorageServerStats { cpu_usage: 12.0 });
        metrics
            .storage_stats
            .insert(2, StorageServerStats { cpu_usage: 55.0 });

        assert_eq!(metrics.worst_cpu(&[1, 2]), 55.0);
        assert_eq!(metrics.worst_cpu(&[1]), 12.0);
        // Missing server is assumed saturated.
        assert_eq!(metrics.worst_cpu(&[1, 99]), 100.0);
    }
}
