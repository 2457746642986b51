mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use raftling::Config;
use raftling::RaftStorageDebug;
use raftling::SnapshotPolicy;

use fixtures::RaftRouter;

/// Partitioned follower catch-up via AppendEntries.
///
/// What does this test do?
///
/// - brings a 3-node cluster online and isolates node 2.
/// - writes 100 commands through the leader.
/// - heals the partition; node 2 receives the gap over regular AppendEntries replication and
///   converges to a byte-for-byte identical state machine.
///
/// RUST_LOG=raftling,memstore,catchup_snapshot=trace cargo test -p raftling --test catchup_snapshot
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catchup_via_append_entries() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    let mut want = 0;
    router.wait_for_log(&btreeset![0, 1, 2], want, None, "empty").await?;
    router.initialize_from_all_nodes(0).await?;
    want += 1;
    router.wait_for_log(&btreeset![0, 1, 2], want, None, "init").await?;
    let leader = router.leader().await.expect("leader not found");

    router.isolate_node(2).await;

    router.client_request_many(leader, "client0", 100).await;
    want += 100;
    let reachable: std::collections::BTreeSet<u64> = (0..3).filter(|id| *id != 2).collect();
    router.wait_for_log(&reachable, want, Some(Duration::from_secs(10)), "writes on majority").await?;

    router.restore_node(2).await;
    router.wait_for_log(&btreeset![2], want, Some(Duration::from_secs(10)), "node 2 catches up").await?;

    let sm_leader = router.get_storage_handle(&leader).await?.get_state_machine().await;
    let sm_follower = router.get_storage_handle(&2).await?.get_state_machine().await;
    assert_eq!(sm_leader, sm_follower, "node 2 state machine diverged after catch-up");
    assert_eq!(sm_follower.last_applied_log, want);

    Ok(())
}

/// New-node catch-up via InstallSnapshot.
///
/// What does this test do?
///
/// - brings a single-node cluster online with a low snapshot threshold and a tiny chunk size.
/// - writes enough commands that the leader snapshots and purges the covered log prefix.
/// - adds a pristine node; the purged prefix cannot be replayed from the log, so the new node
///   is brought up-to-speed with a chunked snapshot stream, after which its state matches the
///   leader byte-for-byte.
///
/// RUST_LOG=raftling,memstore,catchup_snapshot=trace cargo test -p raftling --test catchup_snapshot
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catchup_via_install_snapshot() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(50))
            .snapshot_max_chunk_size(128)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));
    let mut want = router.new_nodes_from_single(btreeset! {0}, btreeset! {}).await?;

    // Drive the log past the snapshot threshold so the prefix gets compacted away.
    router.client_request_many(0, "client0", 100).await;
    want += 100;
    router.wait_for_log(&btreeset![0], want, Some(Duration::from_secs(10)), "writes on leader").await?;
    router
        .wait_for_metrics(
            &0,
            |m| m.snapshot.index >= 50,
            Some(Duration::from_secs(10)),
            "leader snapshot taken",
        )
        .await?;

    // A pristine node can only be synced with a snapshot now.
    router.new_raft_node(1).await;
    router.add_non_voter(0, 1).await?;
    router.wait_for_log(&btreeset![1], want, Some(Duration::from_secs(10)), "node 1 catches up").await?;

    // Node 1 must have installed the leader's snapshot rather than replaying the purged prefix.
    router
        .wait_for_metrics(
            &1,
            |m| m.snapshot.index >= 50,
            Some(Duration::from_secs(10)),
            "node 1 installed a snapshot",
        )
        .await?;

    let sm_leader = router.get_storage_handle(&0).await?.get_state_machine().await;
    let sm_follower = router.get_storage_handle(&1).await?.get_state_machine().await;
    assert_eq!(sm_leader, sm_follower, "node 1 state machine diverged after snapshot install");
    assert_eq!(sm_follower.last_applied_log, want);

    Ok(())
}
