mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use raftling::error::ClientWriteError;
use raftling::Config;

use fixtures::RaftRouter;

/// Commit deadline test.
///
/// What does this test do?
///
/// - brings a 2-node cluster online, with node 0 as leader.
/// - isolates node 1 so nothing can replicate to a majority.
/// - submits a command with a short deadline; it must fail with a commit timeout carrying the
///   entry's index, without blocking for longer than the deadline allows.
/// - heals the partition and asserts the entry eventually commits anyway: a timed-out command's
///   outcome is indeterminate, not rolled back.
///
/// RUST_LOG=raftling,memstore,commit_deadlines=trace cargo test -p raftling --test commit_deadlines
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_deadlines() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut want = router.new_nodes_from_single(btreeset! {0}, btreeset! {}).await?;

    // Bring node 1 in as a voter so the quorum is 2 of 2.
    router.new_raft_node(1).await;
    router.add_non_voter(0, 1).await?;
    router.change_membership(0, btreeset! {0, 1}).await?;
    want += 2;
    router.wait_for_log(&btreeset![0, 1], want, None, "cluster of 2").await?;

    // Cut off node 1; the leader can no longer reach a majority for new entries.
    router.isolate_node(1).await;

    let res = router
        .send_client_request_with_ttl(
            0,
            ClientRequest {
                client: "client0".into(),
                serial: 0,
                status: "stranded".into(),
            },
            Duration::from_millis(300),
        )
        .await;
    want += 1;

    match res {
        Err(ClientWriteError::CommitTimeout { index, timeout }) => {
            assert_eq!(index, want, "the timeout must carry the stranded entry's index");
            assert_eq!(timeout, Duration::from_millis(300));
        }
        res => panic!("expected CommitTimeout, got {:?}", res),
    }

    // The command may still commit later; healing the partition lets it through.
    router.restore_node(1).await;
    router.wait_for_log(&btreeset![0, 1], want, Some(Duration::from_secs(5)), "stranded entry commits").await?;

    Ok(())
}
