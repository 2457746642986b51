mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::MemStoreStateMachine;
use raftling::error::ClientReadError;
use raftling::Config;
use raftling::RaftStorageDebug;
use raftling::State;

use fixtures::RaftRouter;

/// Linearizable read test.
///
/// What does this test do?
///
/// - brings a 3-node cluster online.
/// - performs a linearizable read against the leader; it must succeed and return the leader's
///   state machine view.
/// - performs a read against a follower; it must be rejected with a forward-to-leader error.
///
/// RUST_LOG=raftling,memstore,client_reads=trace cargo test -p raftling --test client_reads
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_reads() -> Result<()> {
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

    // A read against the leader succeeds and reflects the applied state.
    let res = router.client_read(leader).await.expect("read against leader must succeed");
    assert_eq!(res.index, want, "read must observe the applied index");
    let view: MemStoreStateMachine = serde_json::from_slice(&res.state)?;
    let sm = router.get_storage_handle(&leader).await?.get_state_machine().await;
    assert_eq!(view, sm, "read must return the state machine's current view");

    // A read against a follower is rejected with a redirect to the leader.
    let follower = (0..3u64).find(|id| *id != leader).unwrap();
    let err = router.client_read(follower).await.expect_err("read against follower must fail");
    match err {
        ClientReadError::ForwardToLeader(hint) => assert_eq!(hint, Some(leader)),
        err => panic!("expected ForwardToLeader, got {:?}", err),
    }

    Ok(())
}

/// Linearizable read rejection on lost leadership.
///
/// What does this test do?
///
/// - brings a 3-node cluster online, with node 0 as leader of term 1.
/// - isolates node 0; the remaining nodes elect a new leader at a higher term.
/// - reads against node 0 must not succeed while its leadership is stale: its heartbeats either
///   fail to reach a majority, or come back bearing the higher term, deposing it.
/// - after healing, node 0 settles as a follower with the new term persisted.
///
/// RUST_LOG=raftling,memstore,client_reads=trace cargo test -p raftling --test client_reads
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_read_rejected_on_deposed_leader() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    let want = 0;
    router.wait_for_log(&btreeset![0, 1, 2], want, None, "empty").await?;
    router.initialize_from_all_nodes(0).await?;
    router.wait_for_log(&btreeset![0, 1, 2], 1, None, "init").await?;
    let old_leader = router.leader().await.expect("leader not found");

    // Cut the leader off and let the rest of the cluster move on to a new term.
    router.isolate_node(old_leader).await;
    let healthy: Vec<u64> = (0..3).filter(|id| *id != old_leader).collect();
    router
        .wait_for_metrics(
            &healthy[0],
            |m| m.current_leader.is_some() && m.current_leader != Some(old_leader) && m.current_term >= 2,
            Some(Duration::from_secs(5)),
            "new leader elected at higher term",
        )
        .await?;

    // While stale, a read against the old leader must never succeed: either leadership
    // confirmation fails outright, or a higher term comes back and deposes it.
    let res = router.client_read(old_leader).await;
    match res {
        Err(ClientReadError::LeadershipLost { old_term, new_term }) => {
            assert_eq!(old_term, 1);
            assert!(new_term > old_term);
        }
        Err(ClientReadError::Confirmation(_)) | Err(ClientReadError::ForwardToLeader(_)) => {}
        Ok(_) => panic!("stale read must not succeed"),
        Err(err) => panic!("unexpected read error: {:?}", err),
    }

    // Heal the partition; the old leader must settle as a follower on the new term, durably.
    router.restore_node(old_leader).await;
    router
        .wait_for_metrics(
            &old_leader,
            |m| m.state == State::Follower && m.current_term >= 2,
            Some(Duration::from_secs(5)),
            "old leader steps down onto the new term",
        )
        .await?;
    let hs = router
        .get_storage_handle(&old_leader)
        .await?
        .read_hard_state()
        .await
        .expect("hard state must be persisted");
    assert!(hs.current_term >= 2, "the new term must be durable before the step-down completes");

    Ok(())
}
