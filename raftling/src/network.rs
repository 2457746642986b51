//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::msg::AppendEntriesRequest;
use crate::msg::AppendEntriesResponse;
use crate::msg::InstallSnapshotRequest;
use crate::msg::InstallSnapshotResponse;
use crate::msg::VoteRequest;
use crate::msg::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// Typically, the network layer will also serialize the messages — any `RaftCodec` impl, or the
/// application's own encoding — and carry them over whatever transport the deployment uses.
/// Raft enforces deadlines on every call from the outside with the async timer, so impls do not
/// need their own timeouts.
///
/// Failures should be built from `NetworkError` where the cause is known (for example
/// `Err(anyhow::Error::new(NetworkError::ConnectionRefused))`) so that the retry layer can
/// classify them precisely and back off accordingly.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>)
        -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;
}
