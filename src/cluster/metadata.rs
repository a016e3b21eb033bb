//! Cluster metadata writer interface: the transactions that record shard
//! assignments and physically drive a move.

use crate::error::Result;
use crate::keyspace::KeyRange;
use crate::types::{MoveId, MoveKeysLock, ServerId};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use uuid::Uuid;

/// Source servers resolved for a key range.
#[derive(Debug, Clone, Default)]
pub struct SourceServers {
    /// Every server holding any part of the range.
    pub src: Vec<ServerId>,
    /// Servers holding the entire range.
    pub complete_sources: Vec<ServerId>,
}

/// One `move_keys` invocation. The identity is stable across retries of the
/// same move; the second-phase call for extra destinations reuses it.
#[derive(Debug)]
pub struct MoveKeysRequest {
    /// Identity of the physical move.
    pub data_move_id: MoveId,
    /// Range to reassign.
    pub keys: KeyRange,
    /// All destination servers.
    pub dest_ids: Vec<ServerId>,
    /// Destination servers currently healthy.
    pub healthy_ids: Vec<ServerId>,
    /// Ownership token; stale tokens must fail with a conflict.
    pub lock: MoveKeysLock,
    /// Fired once the data transfer portion completes, ahead of the full
    /// transactional finish.
    pub data_movement_complete: Option<oneshot::Sender<()>>,
    /// Bounds concurrent start phases.
    pub start_parallelism: Arc<Semaphore>,
    /// Bounds concurrent finish phases.
    pub finish_parallelism: Arc<Semaphore>,
    /// True when the cluster spans more than one region.
    pub multi_region: bool,
    /// Identity of the relocation driving this call, for tracing.
    pub relocation_id: Uuid,
    /// Cancel conflicting moves instead of failing on them.
    pub cancel_conflicting: bool,
}

/// Writer of cluster metadata and executor of physical moves.
#[async_trait::async_trait]
pub trait MetadataClient: Send + Sync + std::fmt::Debug {
    /// Resolve the servers currently holding `keys`.
    async fn get_source_servers(&self, keys: &KeyRange) -> Result<SourceServers>;

    /// Reassign `keys` to the destination servers and move the data.
    async fn move_keys(&self, req: MoveKeysRequest) -> Result<()>;

    /// Tear down the persistent state of a data move.
    async fn clean_up_data_move(
        &self,
        id: MoveId,
        lock: MoveKeysLock,
        parallelism: Arc<Semaphore>,
        keys: KeyRange,
    ) -> Result<()>;

    /// Read the operator's rebalance toggle key. `None` when absent.
    async fn rebalance_toggle(&self) -> Result<Option<Bytes>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_servers_default() {
        let s = SourceServers::default();
        assert!(s.src.is_empty());
        assert!(s.complete_sources.is_empty());
    }
}
