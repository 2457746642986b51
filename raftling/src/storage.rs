//! The durability seam: hard state, log, snapshots, and the application state machine.

use std::error::Error;
use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

use crate::msg::Entry;
use crate::msg::MembershipConfig;
use crate::raft_types::SnapshotId;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;

/// What a snapshot covers and how its transfer stream is identified.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// The last log id folded into the snapshot, inclusive.
    pub last_log_id: LogId,
    /// The newest membership config at or below `last_log_id`.
    pub membership: MembershipConfig,
    /// A fresh id per built snapshot. Two snapshots over the same `last_log_id` can still
    /// differ in bytes, so transfers are keyed by this rather than by the log id.
    pub snapshot_id: SnapshotId,
}

/// A readable snapshot: its metadata plus a seekable byte stream.
pub struct Snapshot<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    pub meta: SnapshotMeta,
    pub snapshot: Box<S>,
}

/// The `(current_term, voted_for)` pair.
///
/// A vote only means anything inside the term it was cast in, so the two fields are written as
/// one atomic unit — a crash must never leave one updated without the other.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    pub current_term: u64,
    /// Who received this node's vote in `current_term`, if anyone.
    pub voted_for: Option<NodeId>,
}

/// Everything a node reloads from storage on startup.
#[derive(Clone, Debug)]
pub struct RecoveredState {
    /// The id of the last entry in the log.
    pub last_log_id: LogId,
    /// The id of the last entry the state machine has absorbed.
    pub last_applied_log: LogId,
    /// The persisted term/vote pair.
    pub hard_state: HardState,
    /// The newest membership config in the log (or snapshot), else a config of just this node.
    pub membership: MembershipConfig,
}

impl RecoveredState {
    /// The state of a node which has never run: empty log, term 0, alone in its config.
    pub fn pristine(id: NodeId) -> Self {
        Self {
            last_log_id: LogId { term: 0, index: 0 },
            last_applied_log: LogId { term: 0, index: 0 },
            hard_state: HardState::default(),
            membership: MembershipConfig::single(id),
        }
    }
}

/// Storage for a Raft node.
///
/// One implementation carries four concerns: the hard state, the log, snapshots, and the
/// application's state machine. Raft sequences all calls from a single writer and holds one
/// invariant above all: **nothing is acknowledged before it is durable**. Vote responses wait
/// on the hard state, AppendEntries acks wait on the appended entries, snapshot acks wait on
/// the installed snapshot, and client responses wait on application. Any error from any method
/// except `apply` stops the node — storage which cannot promise durability must not keep
/// voting or acknowledging.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The readable/writable byte stream snapshots are exposed as.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// An error which `apply` may return to demand a shutdown.
    ///
    /// `apply` is the one method whose errors can be ordinary application outcomes: a non-
    /// `ShutdownError` failure there halts the apply loop and is reported to the waiting
    /// client, while a `ShutdownError` stops the node like any other storage failure.
    type ShutdownError: Error + Send + Sync + 'static;

    /// Reload the node's state after a restart.
    ///
    /// Gathers the last log id, the state machine's applied position, the hard state, and the
    /// newest membership config. A node starting for the first time returns
    /// `RecoveredState::pristine`.
    async fn recover_state(&self) -> Result<RecoveredState>;

    /// Durably replace the `(current_term, voted_for)` pair, atomically.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// The newest membership config appended to the log, searched from the tail.
    ///
    /// Falls back to the config embedded in the current snapshot when the log holds none, and
    /// to `MembershipConfig::single(node_id)` on a pristine node. Adoption does not wait for
    /// commitment: whatever is newest in the log governs.
    async fn last_membership(&self) -> Result<MembershipConfig>;

    /// Read the entries whose indices fall in `range`.
    ///
    /// Indices compacted into a snapshot no longer exist and are simply omitted; callers
    /// detect the gap from the indices that do come back.
    async fn read_log<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG)
        -> Result<Vec<Entry<D>>>;

    /// Read one entry, `None` if never written or already compacted away.
    async fn read_entry(&self, index: u64) -> Result<Option<Entry<D>>>;

    /// The id of the last entry in the log, falling back to the snapshot boundary, else (0,0).
    async fn last_log_id(&self) -> Result<LogId>;

    /// Durably write the given entries at their own indices.
    ///
    /// Entries arrive in order; an index being rewritten replaces what was there.
    async fn write_entries(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Durably remove every entry whose index falls in `range`.
    ///
    /// Used from both ends: `from..` truncates a conflicting suffix on a follower, `..=to`
    /// purges a prefix superseded by a snapshot.
    async fn remove_log<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()>;

    /// Feed committed entries to the state machine, in log order, one response per entry.
    ///
    /// Raft only ever passes committed entries here, and passes each exactly once, so this is
    /// where application business logic lives: interpret `EntryPayload::Normal` commands,
    /// record the applied index for `Blank` and `ConfigChange` entries, and return the
    /// responses the waiting clients should see. Deduplicating retried client commands by
    /// serial belongs here too.
    async fn apply(&self, entries: &[&Entry<D>]) -> Result<Vec<R>>;

    /// Serialize a read-only view of the state machine.
    ///
    /// Raft calls this only after confirming leadership against a heartbeat majority, which is
    /// what makes the returned view linearizable.
    async fn read_state_machine(&self) -> Result<Vec<u8>>;

    /// Capture the state machine into a new snapshot, purging the covered log prefix.
    ///
    /// Snapshot the state machine first and let *its* applied position define the boundary —
    /// under write load the live applied index moves while the capture runs. Errors here are
    /// logged and retried rather than fatal.
    async fn build_snapshot(&self) -> Result<Snapshot<Self::SnapshotData>>;

    /// Open an empty buffer for a snapshot arriving from the leader.
    async fn open_snapshot_writer(&self) -> Result<Box<Self::SnapshotData>>;

    /// Durably install a fully received snapshot.
    ///
    /// Atomically: restore the state machine from the snapshot bytes, discarding its previous
    /// state; keep the log suffix above `meta.last_log_id` if the entry at that id matches by
    /// term, else discard the whole log; and make this the one current snapshot. The writer's
    /// `shutdown()` has already been called, so the bytes are complete.
    async fn install_snapshot(&self, meta: &SnapshotMeta, snapshot: Box<Self::SnapshotData>) -> Result<()>;

    /// A read handle onto the current snapshot, if one exists.
    ///
    /// Implementations keep at most one live snapshot (plus whatever is mid-build); this
    /// returns the live one with its decoded metadata.
    async fn current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;
}

/// Extra lookups test suites need from a store.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    /// Clone out the state machine.
    async fn get_state_machine(&self) -> SM;

    /// Read the persisted hard state.
    async fn read_hard_state(&self) -> Option<HardState>;
}
