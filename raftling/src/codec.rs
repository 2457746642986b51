//! The pluggable RPC serializer seam.
//!
//! Raft itself hands `RaftNetwork` impls fully-typed messages; this module exists for transports
//! which carry raw byte frames and need a codec to move between the two. Encoding must be
//! bijective: for any valid message `m`, `decode(encode(m))` must reproduce `m` exactly,
//! field for field.

use serde::Deserialize;
use serde::Serialize;

use crate::msg::AppendEntriesRequest;
use crate::msg::AppendEntriesResponse;
use crate::msg::InstallSnapshotRequest;
use crate::msg::InstallSnapshotResponse;
use crate::msg::VoteRequest;
use crate::msg::VoteResponse;
use crate::AppData;

/// Any of the six Raft wire messages, tagged for transport framing.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub enum RaftRpc<D: AppData> {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntriesRequest(AppendEntriesRequest<D>),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

/// Errors arising while encoding or decoding Raft wire messages.
///
/// A decode failure maps to the transport layer's non-retryable `SerializationError` class;
/// resending an identical malformed frame will fail identically.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("error encoding RPC frame: {0}")]
    Encode(String),
    #[error("error decoding RPC frame: {0}")]
    Decode(String),
}

/// A bijective codec between Raft wire messages and byte frames.
pub trait RaftCodec<D: AppData>: Send + Sync + 'static {
    /// Encode the given message to a byte frame.
    fn encode(&self, rpc: &RaftRpc<D>) -> Result<Vec<u8>, CodecError>;

    /// Decode a byte frame back into a message.
    fn decode(&self, frame: &[u8]) -> Result<RaftRpc<D>, CodecError>;
}

/// The default codec, framing messages as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<D: AppData> RaftCodec<D> for JsonCodec {
    fn encode(&self, rpc: &RaftRpc<D>) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(rpc).map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<RaftRpc<D>, CodecError> {
        serde_json::from_slice(frame).map_err(|err| CodecError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;
    use rand::Rng;
    use serde::Deserialize;
    use serde::Serialize;

    use super::*;
    use crate::msg::Entry;
    use crate::msg::EntryConfigChange;
    use crate::msg::EntryNormal;
    use crate::msg::EntryPayload;
    use crate::msg::MembershipConfig;
    use crate::storage::SnapshotMeta;
    use crate::LogId;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct TestCommand {
        key: String,
        value: u64,
    }

    impl crate::AppData for TestCommand {}

    fn rand_membership<R: Rng>(rng: &mut R) -> MembershipConfig {
        let members = (0..rng.gen_range(1..5u64)).collect();
        let members_after_consensus = if rng.gen_bool(0.5) {
            Some((0..rng.gen_range(1..7u64)).collect())
        } else {
            None
        };
        MembershipConfig {
            members,
            members_after_consensus,
        }
    }

    fn rand_entry<R: Rng>(rng: &mut R) -> Entry<TestCommand> {
        let log_id = LogId::new(rng.gen_range(0..100), rng.gen_range(0..10_000));
        let payload = match rng.gen_range(0..3) {
            0 => EntryPayload::Blank,
            1 => EntryPayload::Normal(EntryNormal {
                data: TestCommand {
                    key: format!("key-{}", rng.gen_range(0..1000u64)),
                    value: rng.gen(),
                },
            }),
            _ => EntryPayload::ConfigChange(EntryConfigChange {
                membership: rand_membership(rng),
            }),
        };
        Entry { log_id, payload }
    }

    fn rand_rpc<R: Rng>(rng: &mut R) -> RaftRpc<TestCommand> {
        match rng.gen_range(0..6) {
            0 => RaftRpc::VoteRequest(VoteRequest::new(rng.gen(), rng.gen(), rng.gen(), rng.gen())),
            1 => RaftRpc::VoteResponse(VoteResponse {
                term: rng.gen(),
                vote_granted: rng.gen(),
            }),
            2 => RaftRpc::AppendEntriesRequest(AppendEntriesRequest {
                term: rng.gen(),
                leader_id: rng.gen(),
                prev_log_id: LogId::new(rng.gen_range(0..100), rng.gen_range(0..10_000)),
                entries: (0..rng.gen_range(0..8)).map(|_| rand_entry(rng)).collect(),
                leader_commit: rng.gen(),
            }),
            3 => RaftRpc::AppendEntriesResponse(AppendEntriesResponse {
                term: rng.gen(),
                success: rng.gen(),
                conflict_term: if rng.gen_bool(0.5) { Some(rng.gen()) } else { None },
                conflict_index: if rng.gen_bool(0.5) { Some(rng.gen()) } else { None },
            }),
            4 => RaftRpc::InstallSnapshotRequest(InstallSnapshotRequest {
                term: rng.gen(),
                leader_id: rng.gen(),
                meta: SnapshotMeta {
                    last_log_id: LogId::new(rng.gen_range(0..100), rng.gen_range(0..10_000)),
                    membership: rand_membership(rng),
                    snapshot_id: format!("snapshot-{}", rng.gen_range(0..1000u64)),
                },
                offset: rng.gen(),
                data: (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect(),
                done: rng.gen(),
            }),
            _ => RaftRpc::InstallSnapshotResponse(InstallSnapshotResponse { term: rng.gen() }),
        }
    }

    /// Property: for any valid RPC message, decode(encode(m)) == m.
    #[test]
    fn test_rpc_round_trip() {
        let codec = JsonCodec;
        let mut rng = thread_rng();
        for _ in 0..500 {
            let rpc = rand_rpc(&mut rng);
            let frame = codec.encode(&rpc).expect("encode failed");
            let decoded = codec.decode(&frame).expect("decode failed");
            assert_eq!(rpc, decoded);
        }
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        let codec = JsonCodec;
        let res: Result<RaftRpc<TestCommand>, _> = codec.decode(b"{ not json");
        assert!(matches!(res, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_empty_append_entries_is_a_valid_frame() {
        // Heartbeats are empty-entry AppendEntries frames and must round-trip like any other.
        let codec = JsonCodec;
        let rpc: RaftRpc<TestCommand> = RaftRpc::AppendEntriesRequest(AppendEntriesRequest {
            term: 1,
            leader_id: 0,
            prev_log_id: LogId::new(1, 3),
            entries: vec![],
            leader_commit: 3,
        });
        let frame = codec.encode(&rpc).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), rpc);
    }
}
