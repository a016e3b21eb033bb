//! Priority-aware shard relocation queue for a sharded key-value store.
//!
//! This crate implements the data distribution queue of a distributed,
//! transactional key-value store: the subsystem that decides, schedules and
//! executes the physical movement of key-range shards between replica
//! groups of storage servers. It uses:
//! - **Coverage maps** over the keyspace to serialize conflicting moves on
//!   overlapping ranges
//! - **Priority-banded busyness ledgers** to throttle concurrent moves per
//!   source and destination server
//! - **Preemptive relocator tasks**, one per in-flight range, cancelled when
//!   a higher-priority move arrives on the same keys
//! - **Background rebalancers** that chip away at disk and read-load
//!   imbalance through the same admission machinery
//!
//! # Architecture
//!
//! ```text
//!  RelocateShard ──▶ queue_relocation ──▶ fetch_sources ──▶ queue[server]
//!                          │                                     │
//!                          ▼                                     ▼
//!                      queue_map                          launch_queued_work
//!                    (range index)                     (busyness admission)
//!                                                               │
//!  rebalancers ──▶ output ─▶ (fed back to input)                ▼
//!                                                      relocator per range
//!                                                    (get_team → move_keys)
//! ```
//!
//! External collaborators (team collections, the cluster metadata writer,
//! the metrics oracle and the shard routing map) are consumed through the
//! traits in [`cluster`].
//!
//! # Example
//!
//! ```rust,ignore
//! use shardferry::{DistributionQueue, QueueConfig, QueueContext};
//! use tokio::sync::mpsc;
//!
//! let (input_tx, input_rx) = mpsc::unbounded_channel();
//! let (output_tx, mut output_rx) = mpsc::unbounded_channel();
//!
//! let queue = DistributionQueue::new(QueueConfig::default(), ctx, input_rx, output_tx);
//! let handle = queue.handle();
//! tokio::spawn(queue.run());
//!
//! // Feed self-injected rebalance moves back into the queue.
//! let feedback = input_tx.clone();
//! tokio::spawn(async move {
//!     while let Some(rs) = output_rx.recv().await {
//!         let _ = feedback.send(rs);
//!     }
//! });
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod keyspace;
pub mod metrics;
pub mod queue;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{PriorityTable, QueueConfig, WORK_FULL_UTILIZATION};
pub use error::{Error, Result};
pub use keyspace::{Key, KeyRange, RangeMap};
pub use queue::relocation::{MovementReason, RelocateData, RelocateReason, RelocateShard};
pub use queue::{DistributionQueue, QueueContext, QueueHandle};
pub use types::{DataMove, MoveId, MoveKeysLock, ServerId};

// Re-export collaborator interfaces
pub use cluster::{
    GetTeamRequest, MetadataClient, MetricsOracle, MoveKeysRequest, RoutingTeam, ShardMetrics,
    ShardRouting, StorageTeam, TeamCollection,
};

// Re-export metrics types
pub use metrics::{Counter, Gauge, QueueMetrics, QueueMetricsSnapshot};
