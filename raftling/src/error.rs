//! Error types exposed by this crate.

use std::fmt;
use std::time::Duration;

use crate::raft_types::SnapshotSegmentId;
use crate::AppData;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,
    /// The node received an out-of-order snapshot segment.
    ///
    /// Snapshot streams are accepted strictly in order. A segment whose id or offset does not
    /// line up with the stream currently being received is rejected with this error, and the
    /// leader restarts the stream from offset 0.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
    /// An IO error from tokio.
    #[error("{0}")]
    IO(#[from] tokio::io::Error),
}

/// An error related to a client read request.
#[derive(Debug, thiserror::Error)]
pub enum ClientReadError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client read request must be forwarded to the cluster leader.
    #[error("the node is not the Raft leader")]
    ForwardToLeader(Option<NodeId>),
    /// Leadership was lost while confirming the read: a peer responded with a higher term.
    ///
    /// The node has stepped down to follower and persisted the new term before this error is
    /// returned.
    #[error("leadership lost while confirming a read, old term {old_term}, new term {new_term}")]
    LeadershipLost { old_term: u64, new_term: u64 },
    /// A majority of heartbeat confirmations could not be collected before the deadline.
    #[error("{0}")]
    Confirmation(#[from] CollectError),
}

/// An error related to a client write request.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError<D: AppData> {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error("the node is not the Raft leader")]
    ForwardToLeader(D, Option<NodeId>),
    /// The entry was appended but did not commit and apply within the requested deadline.
    ///
    /// The command may still commit later; callers must resolve the outcome with a subsequent
    /// read or an idempotent retry.
    #[error("entry {index} did not commit within {timeout:?}")]
    CommitTimeout { index: u64, timeout: Duration },
    /// The node lost leadership while the entry was pending; its outcome is indeterminate.
    #[error("leadership lost while awaiting commit, old term {old_term}, new term {new_term}")]
    LeadershipLost { old_term: u64, new_term: u64 },
    /// The state machine returned an error while applying the entry.
    ///
    /// The application loop halts at this entry; operations at higher indices will time out.
    #[error("the state machine rejected entry {index}: {cause}")]
    ApplicationError { index: u64, cause: anyhow::Error },
    /// The operation was superseded by a cluster membership change.
    #[error("the operation was cancelled by a cluster configuration change")]
    CancelledByConfigChange,
}

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The specified min & max election timeouts are invalid: max must be greater than min.
    #[error("given values for election timeout min & max are invalid: max must be greater than min")]
    InvalidElectionTimeoutMinMax,
    /// The given value for max_payload_entries is too small, must be > 0.
    #[error("the given value for max_payload_entries is too small, must be > 0")]
    MaxPayloadEntriesTooSmall,
    /// The retry policy's jitter factor must be within [0, 1].
    #[error("the retry policy's jitter factor must be within [0, 1]")]
    InvalidJitterFactor,
    /// The retry policy must allow at least one attempt.
    #[error("the retry policy must allow at least one attempt")]
    NoRetryAttempts,
}

/// The set of errors which may take place when initializing a pristine Raft node.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the Raft node's current state.
    #[error("the requested action is not allowed due to the Raft node's current state")]
    NotAllowed,
}

/// The set of errors which may take place when requesting to propose a config change.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChangeConfigError {
    /// An error related to the processing of the config change request.
    ///
    /// Errors of this type will only come about from the internals of applying the config change
    /// to the Raft log and the process related to that workflow.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The cluster is already undergoing a configuration change.
    #[error("the cluster is already undergoing a configuration change")]
    ConfigChangeInProgress,
    /// The given config would leave the cluster in an inoperable state.
    ///
    /// This error will be returned if the full set of changes violates any safety guarantees or
    /// would leave the cluster in an inoperable state.
    #[error("the given config would leave the cluster in an inoperable state")]
    InoperableConfig,
    /// The node the config change proposal was sent to was not the leader of the cluster. The ID
    /// of the current leader is returned if known.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// The proposed config changes would make no difference to the current config.
    ///
    /// This takes into account a current joint consensus and the end result of the config.
    #[error("the proposed config change would have no effect, this is a no-op")]
    Noop,
}

/// The set of errors which may be returned on the response channel of an admin request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResponseError {
    #[error(transparent)]
    ChangeConfig(#[from] ChangeConfigError),
    /// The internal entry backing the request could not be applied to the state machine.
    #[error("error applying entry {index} to the state machine")]
    Application { index: u64 },
}

impl From<RaftError> for ResponseError {
    fn from(src: RaftError) -> Self {
        ResponseError::ChangeConfig(ChangeConfigError::RaftError(src))
    }
}

/// The set of errors which may take place while collecting peer responses.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CollectError {
    /// The deadline elapsed before a quorum of successful responses arrived.
    #[error("timed out collecting peer responses")]
    Timeout,
    /// The collection was cancelled by its owner.
    #[error("the response collection was cancelled")]
    Cancelled,
    /// There were no peers to collect from.
    #[error("no peer requests to collect")]
    NoPeers,
    /// Every pending request has resolved, but too few succeeded to form a quorum.
    #[error("insufficient peers responded successfully to form a quorum")]
    InsufficientResponses,
}

/// A typed transport failure surfaced by `RaftNetwork` implementations.
///
/// Network impls are encouraged to wrap their failures in this type (via `anyhow::Error::new`) so
/// that the retry layer can classify them precisely; errors of any other type are classified by
/// message heuristics instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NetworkError {
    /// No response arrived within the RPC deadline.
    #[error("the request timed out")]
    Timeout,
    /// The target host could not be reached.
    #[error("the target node is unreachable")]
    Unreachable,
    /// The connection attempt was actively refused.
    #[error("the connection was refused")]
    ConnectionRefused,
    /// An established connection was dropped or reset.
    #[error("the connection was reset")]
    ConnectionReset,
    /// The peer stalled while framing a message.
    #[error("timed out while serializing or deserializing a frame")]
    SerializationTimeout,
    /// The payload was malformed and could not be decoded. Not retryable.
    #[error("malformed payload: {0}")]
    Serialization(String),
    /// The peer violated the RPC protocol. Not retryable.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A failure which is expected to clear on its own shortly.
    #[error("temporary failure: {0}")]
    Temporary(String),
}

impl NetworkError {
    pub fn temporary(msg: impl fmt::Display) -> anyhow::Error {
        anyhow::Error::new(NetworkError::Temporary(msg.to_string()))
    }
}
