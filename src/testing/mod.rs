//! Testing utilities: mock collaborators and a ready-made queue harness.

pub mod mocks;

mod queue_tests;

pub use mocks::{
    MockMetadataClient, MockOracle, MockRouting, MockTeam, MockTeamCollection, MoveKeysBehavior,
    RecordedMoveKeys,
};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::queue::relocation::RelocateShard;
use crate::queue::{DistributionQueue, QueueContext, QueueHandle};
use crate::types::MoveKeysLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A queue wired to mock collaborators, running on the current runtime.
pub struct TestQueue {
    pub metadata: Arc<MockMetadataClient>,
    pub oracle: Arc<MockOracle>,
    pub collections: Vec<Arc<MockTeamCollection>>,
    pub routing: Arc<MockRouting>,
    pub input: mpsc::UnboundedSender<RelocateShard>,
    pub output: mpsc::UnboundedReceiver<RelocateShard>,
    pub handle: QueueHandle,
    pub task: JoinHandle<Result<()>>,
}

impl TestQueue {
    /// Convenience for the common single-region setup.
    pub fn collection(&self) -> &Arc<MockTeamCollection> {
        &self.collections[0]
    }
}

/// Start a queue over fresh mocks with `regions` team collections.
pub fn start_queue(config: QueueConfig, regions: usize, team_size: usize) -> TestQueue {
    let metadata = MockMetadataClient::new();
    let oracle = MockOracle::new();
    let routing = MockRouting::new();
    let collections: Vec<Arc<MockTeamCollection>> =
        (0..regions).map(|_| MockTeamCollection::new()).collect();

    let ctx = QueueContext {
        distributor_id: Uuid::new_v4(),
        lock: MoveKeysLock::new(Uuid::new_v4()),
        metadata: metadata.clone(),
        oracle: oracle.clone(),
        team_collections: collections
            .iter()
            .map(|c| c.clone() as Arc<dyn crate::cluster::TeamCollection>)
            .collect(),
        routing: routing.clone(),
        team_size,
        single_region_team_size: team_size / regions,
    };

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let queue = DistributionQueue::new(config, ctx, input_rx, output_tx);
    let handle = queue.handle();
    let task = tokio::spawn(queue.run());

    TestQueue {
        metadata,
        oracle,
        collections,
        routing,
        input: input_tx,
        output: output_rx,
        handle,
        task,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
