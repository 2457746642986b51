//! Log entries, membership configs, and the six Raft wire messages.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// One slot of the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        self.iter().map(|ent| ent.summary()).collect::<Vec<_>>().join(",")
    }
}

/// What a log entry carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// No application data; appended by a fresh leader so its term has an entry to commit.
    Blank,
    /// An application command.
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    /// A cluster membership change.
    ConfigChange(EntryConfigChange),
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(_) => "normal".to_string(),
            EntryPayload::ConfigChange(cfg) => format!("config-change: {:?}", cfg.membership),
        }
    }
}

/// An application command wrapped as an entry payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// A membership change wrapped as an entry payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    pub membership: MembershipConfig,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The voting configuration of the cluster.
///
/// A config with `members_after_consensus` present is a joint config (§6): the cluster is
/// migrating from `members` to that second group, and until the migration finishes every
/// election and every commitment needs a majority in *each* group. Nodes adopt whatever config
/// is newest in their log, committed or not.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// The current voting group.
    pub members: BTreeSet<NodeId>,
    /// The voting group being migrated to, when a joint config is in flight.
    pub members_after_consensus: Option<BTreeSet<NodeId>>,
}

impl MembershipConfig {
    /// A config holding only the given node; the shape of a pristine, uninitialized cluster.
    pub fn single(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self {
            members,
            members_after_consensus: None,
        }
    }

    /// Every node in either voting group.
    pub fn all_members(&self) -> BTreeSet<NodeId> {
        match &self.members_after_consensus {
            None => self.members.clone(),
            Some(next) => self.members.union(next).copied().collect(),
        }
    }

    /// Check whether the given node sits in either voting group.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
            || self.members_after_consensus.as_ref().map(|next| next.contains(id)).unwrap_or(false)
    }

    /// Check whether this is a joint config.
    pub fn is_joint(&self) -> bool {
        self.members_after_consensus.is_some()
    }

    /// The uniform config this one settles into once the migration completes.
    pub fn final_config(&self) -> Self {
        match &self.members_after_consensus {
            None => self.clone(),
            Some(next) => MembershipConfig {
                members: next.clone(),
                members_after_consensus: None,
            },
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Leader → follower: replicate entries, or assert leadership with an empty batch (§5.2, §5.3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's term.
    pub term: u64,
    /// The leader's id, so followers can redirect clients.
    pub leader_id: NodeId,
    /// The id of the entry directly before `entries`; the follower's consistency check anchor.
    pub prev_log_id: LogId,
    /// The entries to store. Empty for a heartbeat; batched otherwise.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The index up to which the leader knows the log is committed.
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// Follower → leader: the verdict on an AppendEntries batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responder's term, so a deposed leader finds out.
    pub term: u64,
    /// Whether the batch was accepted: the consistency check at `prev_log_id` held.
    pub success: bool,
    /// On rejection, the term of the responder's entry at `prev_log_id.index`; absent when the
    /// responder has nothing there. Lets the leader skip back a whole term per round trip
    /// instead of one entry (§5.3).
    pub conflict_term: Option<u64>,
    /// On rejection, the first index of the responder's log holding `conflict_term`, or one
    /// past the responder's last entry when `conflict_term` is absent.
    pub conflict_index: Option<u64>,
}

impl AppendEntriesResponse {
    /// A rejection with no conflict hints; sent for stale-term requests.
    pub(crate) fn rejected(term: u64) -> Self {
        Self {
            term,
            success: false,
            conflict_term: None,
            conflict_index: None,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Candidate → peer: ask for this term's vote (§5.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's term.
    pub term: u64,
    /// The candidate's id.
    pub candidate_id: NodeId,
    /// The index of the candidate's last entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate's last entry (§5.4).
    pub last_log_term: u64,
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// Peer → candidate: the ballot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The responder's term, so an outdated candidate can stand down.
    pub term: u64,
    /// Whether the responder's vote went to the candidate.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Leader → follower: one segment of a snapshot stream (§7).
///
/// Segments are produced and must be consumed strictly in offset order within a stream, streams
/// being keyed by `meta.snapshot_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's term.
    pub term: u64,
    /// The leader's id, so followers can redirect clients.
    pub leader_id: NodeId,
    /// What the snapshot covers: its last log id, membership config, and stream id.
    pub meta: SnapshotMeta,
    /// Where in the snapshot this segment's bytes belong.
    pub offset: u64,
    /// The segment's bytes.
    pub data: Vec<u8>,
    /// Whether this is the stream's final segment.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={:?}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.meta,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// Follower → leader: acknowledgment of a snapshot segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The responder's term, so a deposed leader finds out.
    pub term: u64,
}
