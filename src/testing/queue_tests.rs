//! End-to-end tests driving the queue against mock collaborators.

#[cfg(test)]
mod tests {
    use crate::config::{PriorityTable, QueueConfig, WORK_FULL_UTILIZATION};
    use crate::cluster::{GetTopKMetricsReply, HealthMetrics, ShardMetrics, StorageServerStats};
    use crate::error::Error;
    use crate::keyspace::KeyRange;
    use crate::queue::busyness::Busyness;
    use crate::queue::relocation::{
        MovementReason, RelocateData, RelocateReason, RelocateShard,
    };
    use crate::testing::{start_queue, wait_until, MockTeam, MoveKeysBehavior};
    use crate::types::{DataMove, MoveId};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    const WAIT: Duration = Duration::from_secs(5);

    fn shard(keys: KeyRange, priority: i32) -> RelocateShard {
        RelocateShard {
            keys,
            priority,
            move_reason: MovementReason::RecoverMove,
            reason: RelocateReason::Other,
            data_move_id: MoveId::ANONYMOUS,
            data_move: None,
            cancelled: false,
        }
    }

    fn quiet_config() -> QueueConfig {
        let mut cfg = QueueConfig::default().with_expensive_validation(true);
        // Keep background rebalancers parked during queue-path tests.
        cfg.bg_rebalance_polling_interval = Duration::from_secs(3600);
        cfg.bg_rebalance_switch_check_interval = Duration::from_secs(3600);
        cfg
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_move_launches_and_charges_ledgers() {
        let mut cfg = quiet_config();
        cfg.relocation_parallelism_per_source = 4;
        let q = start_queue(cfg, 1, 3);
        q.metadata.set_sources(vec![1, 2, 3], vec![1, 2, 3]);
        q.metadata.set_move_keys_behavior(MoveKeysBehavior::Hang);
        q.collection().set_team(MockTeam::new(vec![4, 5, 6]), true);

        q.input
            .send(shard(KeyRange::new("a", "z"), 100))
            .expect("queue input open");

        assert!(wait_until(|| q.metadata.move_keys_calls().len() == 1, WAIT).await);
        let call = &q.metadata.move_keys_calls()[0];
        assert_eq!(call.keys, KeyRange::new("a", "z"));
        assert_eq!(call.dest_ids, vec![4, 5, 6]);
        assert_eq!(call.healthy_ids, vec![4, 5, 6]);

        let expected = WORK_FULL_UTILIZATION / 3 / 4;
        {
            let st = q.handle.core.state.lock();
            for server in [1u64, 2, 3] {
                assert_eq!(st.busymap[&server].ledger()[1], expected);
                assert_eq!(st.busymap[&server].ledger()[2], 0);
            }
            assert_eq!(st.active_relocations, 1);
            assert_eq!(st.queued_relocations, 0);
            let (range, rd) = st.in_flight.range_containing(b"m");
            assert_eq!(range, KeyRange::new("a", "z"));
            assert_eq!(rd.priority, 100);
            assert!(!rd.cancellable);
        }

        assert_eq!(q.routing.move_shard_calls().len(), 1);
        assert!(q.handle.validate().is_empty(), "{:?}", q.handle.validate());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overlapping_request_subsumes_queued() {
        let q = start_queue(quiet_config(), 1, 3);
        q.metadata.set_sources(vec![1, 2, 3], vec![1, 2, 3]);
        q.metadata.set_fetch_delay(Duration::from_millis(200));
        q.metadata.set_move_keys_behavior(MoveKeysBehavior::Hang);
        q.collection().set_team(MockTeam::new(vec![4, 5, 6]), true);

        q.input
            .send(shard(KeyRange::new("a", "m"), 150))
            .expect("queue input open");
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.input
            .send(shard(KeyRange::new("a", "z"), 200))
            .expect("queue input open");
        tokio::time::sleep(Duration::from_millis(40)).await;

        {
            let st = q.handle.core.state.lock();
            assert_eq!(st.queued_relocations, 1);
            assert_eq!(st.fetching_sources.len(), 1);
            let survivor = st.fetching_sources.iter().next().expect("one entry");
            assert_eq!(survivor.keys, KeyRange::new("a", "z"));
            assert_eq!(survivor.priority, 200);
        }

        // Only the subsuming request ever reaches move_keys.
        assert!(wait_until(|| !q.metadata.move_keys_calls().is_empty(), WAIT).await);
        for call in q.metadata.move_keys_calls() {
            assert_eq!(call.keys, KeyRange::new("a", "z"));
        }
        assert!(q.handle.validate().is_empty(), "{:?}", q.handle.validate());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health_move_preempts_where_ordinary_moves_wait() {
        let table = PriorityTable::default();
        let q = start_queue(quiet_config(), 1, 3);
        q.metadata.set_sources(vec![1, 2, 3], vec![1, 2, 3]);
        // The first move signals transfer-complete but keeps running.
        q.metadata
            .push_move_keys_behavior(MoveKeysBehavior::SignalThenHang);
        q.metadata.set_move_keys_behavior(MoveKeysBehavior::Hang);
        q.collection().set_team(MockTeam::new(vec![4, 5, 6]), true);

        q.input
            .send(shard(KeyRange::new("a", "z"), 900))
            .expect("queue input open");
        assert!(wait_until(|| q.metadata.move_keys_calls().len() == 1, WAIT).await);
        assert!(
            wait_until(
                || q.handle.core.state.lock().fetch_keys_complete.len() == 1,
                WAIT
            )
            .await
        );

        // An ordinary lower-priority move on a strict sub-range is held back
        // behind the live higher-priority move.
        q.input
            .send(shard(KeyRange::new("c", "d"), 300))
            .expect("queue input open");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(q.metadata.move_keys_calls().len(), 1);
        assert_eq!(q.handle.core.state.lock().queued_relocations, 1);

        // A team-0-left move on a sub-range bypasses the overlap rule.
        let rescue = RelocateShard::new(
            KeyRange::new("a", "m"),
            MovementReason::Team0Left,
            RelocateReason::Other,
            &table,
        );
        q.input.send(rescue).expect("queue input open");

        assert!(
            wait_until(
                || {
                    q.metadata
                        .move_keys_calls()
                        .iter()
                        .any(|c| c.keys == KeyRange::new("a", "m"))
                },
                WAIT
            )
            .await
        );

        // The preempted move's surviving fragment is relaunched on [m, z).
        assert!(
            wait_until(
                || {
                    let st = q.handle.core.state.lock();
                    let (_, high) = st.in_flight.range_containing(b"b");
                    let (range, rest) = st.in_flight.range_containing(b"n");
                    high.priority == table.team_0_left
                        && rest.priority == 900
                        && range == KeyRange::new("m", "z")
                },
                WAIT
            )
            .await
        );

        let routed: Vec<KeyRange> = q
            .routing
            .move_shard_calls()
            .iter()
            .map(|(keys, _)| keys.clone())
            .collect();
        assert!(routed.contains(&KeyRange::new("a", "m")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_source_ledgers_block_admission() {
        let q = start_queue(quiet_config(), 1, 3);
        q.metadata.set_sources(vec![1, 2], vec![1, 2]);
        q.metadata.set_move_keys_behavior(MoveKeysBehavior::Hang);
        q.collection().set_team(MockTeam::new(vec![4, 5, 6]), true);

        {
            let mut st = q.handle.core.state.lock();
            for server in [1u64, 2] {
                let mut busy = Busyness::default();
                busy.add_work(100, WORK_FULL_UTILIZATION);
                st.busymap.insert(server, busy);
            }
        }

        q.input
            .send(shard(KeyRange::new("a", "b"), 100))
            .expect("queue input open");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(q.metadata.move_keys_calls().is_empty());
        assert_eq!(q.handle.core.state.lock().queued_relocations, 1);

        // A cancellable in-flight move containing the range is discounted
        // from the ledgers during admission.
        {
            let mut st = q.handle.core.state.lock();
            let mut prior = RelocateData {
                keys: KeyRange::new("a", "b"),
                priority: 100,
                start_time: 0,
                random_id: Uuid::new_v4(),
                work_factor: WORK_FULL_UTILIZATION,
                src: vec![1, 2],
                cancellable: true,
                ..RelocateData::default()
            };
            prior.complete_sources = vec![1, 2];
            st.in_flight.insert(prior.keys.clone(), prior);
        }
        q.handle.core.launch_by_range(&KeyRange::new("a", "b"));

        assert!(wait_until(|| q.metadata.move_keys_calls().len() == 1, WAIT).await);
        assert_eq!(
            q.metadata.move_keys_calls()[0].keys,
            KeyRange::new("a", "b")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_completes_and_releases_everything() {
        let q = start_queue(quiet_config(), 1, 3);
        q.metadata.set_sources(vec![1, 2, 3], vec![1, 2, 3]);
        q.collection().set_team(MockTeam::new(vec![4, 5, 6]), true);
        q.oracle.set_default_metrics(ShardMetrics {
            bytes: 4096,
            ..ShardMetrics::default()
        });

        q.input
            .send(shard(KeyRange::new("a", "z"), 100))
            .expect("queue input open");

        assert!(wait_until(|| q.handle.metrics().completed == 1, WAIT).await);
        assert!(
            wait_until(
                || {
                    let st = q.handle.core.state.lock();
                    st.active_relocations == 0
                        && st
                            .busymap
                            .values()
                            .all(|b| b.ledger().iter().all(|v| *v == 0))
                        && st
                            .dest_busymap
                            .values()
                            .all(|b| b.ledger().iter().all(|v| *v == 0))
                },
                WAIT
            )
            .await
        );

        assert_eq!(q.handle.metrics().bytes_written, 4096);
        assert_eq!(q.routing.finish_move_calls(), vec![KeyRange::new("a", "z")]);
        assert_eq!(q.handle.core.state.lock().bytes_written, 4096);
        assert!(q.handle.validate().is_empty(), "{:?}", q.handle.validate());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unhealthy_backpressure_gauge() {
        let table = PriorityTable::default();
        let q = start_queue(quiet_config(), 1, 3);
        q.metadata.set_sources(vec![1, 2, 3], vec![1, 2, 3]);
        q.metadata
            .set_move_keys_behavior(MoveKeysBehavior::SucceedAfter(Duration::from_millis(100)));
        q.collection().set_team(MockTeam::new(vec![4, 5, 6]), true);

        let mut unhealthy_watch = q.handle.processing_unhealthy();
        assert!(!*unhealthy_watch.borrow());

        let rescue = RelocateShard::new(
            KeyRange::new("a", "m"),
            MovementReason::Team0Left,
            RelocateReason::Other,
            &table,
        );
        q.input.send(rescue).expect("queue input open");

        assert!(wait_until(|| q.handle.unhealthy_relocations() == 1, WAIT).await);
        assert!(*unhealthy_watch.borrow_and_update());

        // Team removal waits for this to drain back to zero.
        assert!(wait_until(|| q.handle.unhealthy_relocations() == 0, WAIT).await);
        assert!(wait_until(|| !*q.handle.processing_unhealthy().borrow(), WAIT).await);
        assert!(wait_until(|| q.handle.metrics().completed == 1, WAIT).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_two_phase_expansion_into_new_region() {
        let q = start_queue(quiet_config(), 2, 6);
        q.metadata.set_sources(vec![1, 2, 3], vec![1, 2, 3]);
        q.metadata
            .push_move_keys_behavior(MoveKeysBehavior::Succeed);
        q.metadata.push_move_keys_behavior(MoveKeysBehavior::Hang);
        // Primary region already hosts the shard; the remote one does not.
        q.collections[0].set_team(MockTeam::new(vec![1, 2, 3]), true);
        q.collections[1].set_team(MockTeam::new(vec![7, 8, 9]), false);

        q.input
            .send(shard(KeyRange::new("a", "z"), 100))
            .expect("queue input open");

        assert!(wait_until(|| q.metadata.move_keys_calls().len() == 2, WAIT).await);
        let calls = q.metadata.move_keys_calls();

        // First phase: the full primary team plus one member of the remote
        // team, saving cross-region bandwidth.
        assert_eq!(calls[0].dest_ids.len(), 4);
        assert!(calls[0].dest_ids.starts_with(&[1, 2, 3]));
        let initial_remote = calls[0].dest_ids[3];
        assert!([7u64, 8, 9].contains(&initial_remote));

        // Second phase: the remaining remote members join.
        assert_eq!(calls[1].dest_ids.len(), 6);
        assert_eq!(calls[1].data_move_id, calls[0].data_move_id);

        // The routing map claimed the full teams from the start.
        let (_, teams) = &q.routing.move_shard_calls()[0];
        assert_eq!(teams.len(), 2);
        assert_eq!(teams[0].servers, vec![1, 2, 3]);
        assert_eq!(teams[1].servers, vec![7, 8, 9]);
        assert!(teams[0].primary);
        assert!(!teams[1].primary);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restore_pins_teams_then_gives_up() {
        let table = PriorityTable::default();
        let mut cfg = quiet_config();
        cfg.shard_location_metadata = true;
        cfg.best_team_stuck_delay = Duration::from_millis(1);
        let mut q = start_queue(cfg, 1, 3);
        // No team is ever offered for the pinned destination.

        let dm = Arc::new(DataMove {
            id: MoveId::random(),
            keys: KeyRange::new("a", "m"),
            src: vec![1, 2, 3],
            primary_dest: vec![7, 8, 9],
            remote_dest: vec![],
        });
        q.input
            .send(RelocateShard::restore(dm.clone(), &table))
            .expect("queue input open");

        // After 50 stuck rounds the restore fails, cancels its own data move
        // and aborts the queue.
        let result = std::pin::Pin::new(&mut q.task)
            .await
            .expect("queue task not aborted");
        assert_eq!(result, Err(Error::DataMoveDestTeamNotFound));

        let requests = q.collection().requests();
        assert!(!requests.is_empty());
        assert!(requests
            .iter()
            .all(|r| r.pinned_servers.as_deref() == Some(&[7, 8, 9][..])));

        assert!(
            wait_until(
                || q
                    .metadata
                    .cleanup_calls()
                    .iter()
                    .any(|(id, keys)| *id == dm.id && *keys == KeyRange::new("a", "m")),
                WAIT
            )
            .await
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requeue_is_idempotent() {
        let q = start_queue(quiet_config(), 1, 3);
        q.metadata.set_sources(vec![1, 2, 3], vec![1, 2, 3]);
        q.metadata.set_fetch_delay(Duration::from_millis(100));
        q.metadata.set_move_keys_behavior(MoveKeysBehavior::Hang);
        q.collection().set_team(MockTeam::new(vec![4, 5, 6]), true);

        q.input
            .send(shard(KeyRange::new("a", "z"), 100))
            .expect("queue input open");
        q.input
            .send(shard(KeyRange::new("a", "z"), 100))
            .expect("queue input open");
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(q.handle.core.state.lock().queued_relocations, 1);

        assert!(wait_until(|| q.metadata.move_keys_calls().len() == 1, WAIT).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.metadata.move_keys_calls().len(), 1);
        assert_eq!(q.handle.core.state.lock().active_relocations, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_data_move_registry() {
        let q = start_queue(quiet_config(), 1, 3);
        let core = &q.handle.core;
        let id = MoveId::random();
        let range = KeyRange::new("d", "k");

        // Cancellations arrive on the regular input stream.
        q.input
            .send(RelocateShard::cancellation(range.clone(), id))
            .expect("queue input open");
        assert!(
            wait_until(
                || q.metadata.cleanup_calls().iter().any(|(i, _)| *i == id),
                WAIT
            )
            .await
        );
        {
            let st = core.state.lock();
            let (_, slot) = st.data_moves.range_containing(b"f");
            assert_eq!(slot.id, id);
        }

        // A second cancellation overlapping a tracked move is refused.
        let other = MoveId::random();
        core.enqueue_cancelled_data_move(other, KeyRange::new("e", "f"));
        {
            let st = core.state.lock();
            let valid: Vec<MoveId> = st
                .data_moves
                .intersecting(&range)
                .into_iter()
                .filter(|(_, slot)| slot.is_valid())
                .map(|(_, slot)| slot.id)
                .collect();
            assert_eq!(valid, vec![id]);
        }

        // Cancelling the range installs an empty record over the whole span.
        core.cancel_data_move(range.clone())
            .await
            .expect("cleanup succeeds");
        {
            let st = core.state.lock();
            assert!(st
                .data_moves
                .intersecting(&range)
                .into_iter()
                .all(|(_, slot)| !slot.is_valid()));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subsumed_servers_are_returned_for_relaunch() {
        let q = start_queue(quiet_config(), 1, 3);
        let core = &q.handle.core;
        // Park the background fetch so sources are resolved by hand only.
        q.metadata.set_fetch_delay(Duration::from_secs(3600));

        core.queue_relocation(&shard(KeyRange::new("a", "m"), 150));
        let fetching = {
            let st = core.state.lock();
            st.fetching_sources.iter().next().expect("fetching entry").clone()
        };
        let mut resolved = fetching;
        resolved.src = vec![1, 2];
        resolved.complete_sources = vec![1];
        assert!(core.complete_source_fetch(&resolved));
        assert!(core.state.lock().queue[&1].contains(&resolved));

        // A containing request subsumes it and reports its servers.
        let relaunch = core.queue_relocation(&shard(KeyRange::new("a", "z"), 200));
        let mut servers: Vec<u64> = relaunch.into_iter().collect();
        servers.sort_unstable();
        assert_eq!(servers, vec![1, 2]);

        let st = core.state.lock();
        assert!(st.queue[&1].is_empty());
        assert!(st.queue[&2].is_empty());
        let survivor = st.fetching_sources.iter().next().expect("new entry");
        assert_eq!(survivor.keys, KeyRange::new("a", "z"));
        assert_eq!(survivor.priority, 200);
        // The earlier request's start time is inherited.
        assert_eq!(survivor.start_time, resolved.start_time);
    }

    fn rebalance_config() -> QueueConfig {
        let mut cfg = QueueConfig::default();
        cfg.bg_rebalance_polling_interval = Duration::from_millis(10);
        cfg.bg_rebalance_switch_check_interval = Duration::from_millis(50);
        cfg
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disk_rebalance_emits_move() {
        let mut q = start_queue(rebalance_config(), 1, 3);
        let source = MockTeam::new(vec![1, 2, 3]);
        source.set_load_bytes(10_000_000);
        let dest = MockTeam::new(vec![4, 5, 6]);
        q.collection().set_team_with_shards(source);
        q.collection().set_team(dest, false);
        q.routing
            .set_shards_for(vec![1, 2, 3], vec![KeyRange::new("a", "b")]);
        q.oracle.set_metrics(
            KeyRange::new("a", "b"),
            ShardMetrics {
                bytes: 1_000_000,
                ..ShardMetrics::default()
            },
        );
        q.oracle.set_average_shard_bytes(500_000);

        let emitted = tokio::time::timeout(WAIT, q.output.recv())
            .await
            .expect("rebalance move emitted")
            .expect("output open");
        assert!(emitted.move_reason.is_disk_rebalance());
        assert_eq!(emitted.reason, RelocateReason::RebalanceDisk);
        assert_eq!(emitted.keys, KeyRange::new("a", "b"));
        assert!(q.handle.metrics().rebalance_moves_emitted >= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_rebalance_skips_single_shard_source() {
        let mut cfg = rebalance_config();
        cfg.read_sampling_enabled = true;
        let mut q = start_queue(cfg, 1, 3);
        let source = MockTeam::new(vec![1, 2, 3]);
        source.set_read_bandwidth(100_000.0);
        let dest = MockTeam::new(vec![4, 5, 6]);
        q.collection().set_team_with_shards(source);
        q.collection().set_team(dest, false);
        // One hot shard: moving it only moves the problem.
        q.routing
            .set_shards_for(vec![1, 2, 3], vec![KeyRange::new("a", "b")]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(q.output.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_rebalance_moves_hot_shard() {
        let mut cfg = rebalance_config();
        cfg.read_sampling_enabled = true;
        let mut q = start_queue(cfg, 1, 3);
        let source = MockTeam::new(vec![1, 2, 3]);
        source.set_read_bandwidth(100_000.0);
        let dest = MockTeam::new(vec![4, 5, 6]);
        q.collection().set_team_with_shards(source);
        q.collection().set_team(dest, false);

        let shards: Vec<KeyRange> = (b'a'..=b'l')
            .map(|c| {
                KeyRange::new(
                    vec![c],
                    vec![c + 1],
                )
            })
            .collect();
        q.routing.set_shards_for(vec![1, 2, 3], shards.clone());
        let hot = KeyRange::new("c", "d");
        q.oracle.set_top_k(GetTopKMetricsReply {
            shard_metrics: vec![(
                hot.clone(),
                ShardMetrics {
                    bytes_read_per_ksecond: 50_000.0,
                    ..ShardMetrics::default()
                },
            )],
            min_read_load: 10.0,
            max_read_load: 50_000.0,
        });
        let mut health = HealthMetrics::default();
        for server in [1u64, 2, 3] {
            health
                .storage_stats
                .insert(server, StorageServerStats { cpu_usage: 60.0 });
        }
        q.oracle.set_health(health);

        let emitted = tokio::time::timeout(WAIT, q.output.recv())
            .await
            .expect("read rebalance move emitted")
            .expect("output open");
        assert!(emitted.move_reason.is_read_rebalance());
        assert_eq!(emitted.reason, RelocateReason::RebalanceRead);
        assert_eq!(emitted.keys, hot);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rebalance_toggle_disables_workers() {
        let mut q = start_queue(rebalance_config(), 1, 3);
        // Legacy sentinel disables everything.
        q.metadata.set_toggle(Some("on".into()));

        // Let the workers pick up the toggle before making a move eligible.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let source = MockTeam::new(vec![1, 2, 3]);
        source.set_load_bytes(10_000_000);
        q.collection().set_team_with_shards(source);
        q.collection().set_team(MockTeam::new(vec![4, 5, 6]), false);
        q.routing
            .set_shards_for(vec![1, 2, 3], vec![KeyRange::new("a", "b")]);
        q.oracle.set_metrics(
            KeyRange::new("a", "b"),
            ShardMetrics {
                bytes: 1_000_000,
                ..ShardMetrics::default()
            },
        );
        q.oracle.set_average_shard_bytes(500_000);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(q.output.try_recv().is_err());

        // Bitmask with only the read bit set leaves disk rebalancing on.
        q.metadata.set_toggle(Some(vec![0b01u8].into()));
        let emitted = tokio::time::timeout(WAIT, q.output.recv())
            .await
            .expect("disk rebalance no longer disabled")
            .expect("output open");
        assert!(emitted.move_reason.is_disk_rebalance());
    }
}
