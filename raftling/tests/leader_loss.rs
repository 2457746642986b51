mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use raftling::error::ClientWriteError;
use raftling::Config;
use raftling::RaftStorageDebug;

use fixtures::RaftRouter;

/// Leader loss during a pending write.
///
/// What does this test do?
///
/// - brings a 3-node cluster online.
/// - submits a command against the leader and immediately partitions the leader away.
/// - the command's future must resolve exactly once, with either the state machine's result
///   (the command got through before the cut) or a permitted error; never both.
/// - the surviving majority elects a new leader and keeps serving writes.
///
/// RUST_LOG=raftling,memstore,leader_loss=trace cargo test -p raftling --test leader_loss
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_loss() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    router.wait_for_log(&btreeset![0, 1, 2], 0, None, "empty").await?;
    router.initialize_from_all_nodes(0).await?;
    router.wait_for_log(&btreeset![0, 1, 2], 1, None, "init").await?;
    let leader = router.leader().await.expect("leader not found");

    // Submit a command and cut the leader off while it is in flight.
    let write = {
        let router = router.clone();
        tokio::spawn(async move {
            router
                .send_client_request_with_ttl(
                    leader,
                    ClientRequest {
                        client: "client0".into(),
                        serial: 0,
                        status: "racing".into(),
                    },
                    Duration::from_millis(500),
                )
                .await
        })
    };
    router.isolate_node(leader).await;

    // Exactly one resolution: the state machine result, or a permitted error.
    let res = write.await?;
    match res {
        Ok(response) => {
            assert_eq!(response.data.0, None, "a fulfilled command must carry the state machine's result");
        }
        Err(ClientWriteError::CommitTimeout { .. })
        | Err(ClientWriteError::LeadershipLost { .. })
        | Err(ClientWriteError::ForwardToLeader(..)) => {}
        Err(err) => panic!("unexpected write error: {:?}", err),
    }

    // The surviving majority moves on and keeps accepting writes.
    let healthy: Vec<u64> = (0..3).filter(|id| *id != leader).collect();
    router
        .wait_for_metrics(
            &healthy[0],
            |m| m.current_leader.is_some() && m.current_leader != Some(leader),
            Some(Duration::from_secs(5)),
            "new leader elected",
        )
        .await?;
    let new_leader = router.current_leader(healthy[0]).await.expect("new leader not found");
    router
        .send_client_request(new_leader, ClientRequest {
            client: "client1".into(),
            serial: 0,
            status: "after-failover".into(),
        })
        .await?;

    let sm = router.get_storage_handle(&new_leader).await?.get_state_machine().await;
    assert_eq!(sm.client_status.get("client1"), Some(&"after-failover".to_string()));

    Ok(())
}
