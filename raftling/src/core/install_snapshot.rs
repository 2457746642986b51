//! The follower side of snapshot streaming (§7).

use tokio::io::AsyncWriteExt;

use crate::core::IncomingSnapshot;
use crate::core::RaftNode;
use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::msg::InstallSnapshotRequest;
use crate::msg::InstallSnapshotResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::SnapshotSegmentId;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftNode<D, R, N, S> {
    /// Accept one segment of a snapshot stream from the leader (§7).
    ///
    /// Segments are accepted strictly in order within a stream: the stream id must match the
    /// stream in progress and the offset must be exactly where that stream left off. A fresh
    /// stream (offset 0) may supersede an unfinished one at any time — leaders restart from
    /// zero after an error — but a gap or a replay is refused with `SnapshotMismatch`. The
    /// final segment's acknowledgment is sent only after the snapshot is durably installed
    /// and the log it supersedes is gone.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // A stale-term sender learns our term and stops.
        if req.term < self.term {
            return Ok(InstallSnapshotResponse { term: self.term });
        }

        // Only a live leader streams snapshots; treat it as such.
        self.note_heartbeat();
        let mut dirty = false;
        if req.term > self.term {
            self.term = req.term;
            self.voted_for = None;
            self.persist_hard_state().await?;
            dirty = true;
        }
        if self.leader != Some(req.leader_id) {
            self.leader = Some(req.leader_id);
            dirty = true;
        }
        if !self.role.is_follower() && !self.role.is_non_voter() {
            self.set_role(State::Follower);
            dirty = true;
        }
        if dirty {
            self.publish_metrics();
        }

        // Match the segment against the stream in progress, if any.
        let mut stream = match self.incoming_snapshot.take() {
            Some(stream) if stream.id == req.meta.snapshot_id => {
                if req.offset != stream.offset {
                    // In-order only: a gap or replay within the stream is refused, and the
                    // stream is kept where it was for the leader's restart.
                    let expect = SnapshotSegmentId {
                        id: stream.id.clone(),
                        offset: stream.offset,
                    };
                    self.incoming_snapshot = Some(stream);
                    return Err(RaftError::SnapshotMismatch {
                        expect,
                        got: (req.meta.snapshot_id.clone(), req.offset).into(),
                    });
                }
                stream
            }
            Some(stale) => {
                if req.offset != 0 {
                    // A mid-stream segment of some other stream: refuse it.
                    let expect = SnapshotSegmentId {
                        id: stale.id.clone(),
                        offset: stale.offset,
                    };
                    self.incoming_snapshot = Some(stale);
                    return Err(RaftError::SnapshotMismatch {
                        expect,
                        got: (req.meta.snapshot_id.clone(), req.offset).into(),
                    });
                }
                // A new stream supersedes the unfinished one.
                drop(stale);
                self.open_incoming_stream(&req).await?
            }
            None => {
                if req.offset != 0 {
                    return Err(RaftError::SnapshotMismatch {
                        expect: (req.meta.snapshot_id.clone(), 0).into(),
                        got: (req.meta.snapshot_id.clone(), req.offset).into(),
                    });
                }
                self.open_incoming_stream(&req).await?
            }
        };

        stream.writer.as_mut().write_all(&req.data).await?;
        stream.offset += req.data.len() as u64;

        if req.done {
            self.complete_incoming_stream(req, stream).await?;
        } else {
            self.incoming_snapshot = Some(stream);
        }
        Ok(InstallSnapshotResponse { term: self.term })
    }

    /// Start buffering a fresh snapshot stream.
    ///
    /// A locally running compaction is pointless next to what the leader is pushing, so it is
    /// abandoned first.
    async fn open_incoming_stream(
        &mut self,
        req: &InstallSnapshotRequest,
    ) -> RaftResult<IncomingSnapshot<S::SnapshotData>> {
        if let Some(build) = self.compaction.take() {
            build.abort.abort();
        }
        let writer = self.storage.open_snapshot_writer().await.map_err(|err| self.storage_failure(err))?;
        Ok(IncomingSnapshot {
            id: req.meta.snapshot_id.clone(),
            offset: 0,
            writer,
        })
    }

    /// The stream is complete: install it and catch every cursor up to its boundary.
    ///
    /// Everything the snapshot covers is committed and applied by definition, so the commit
    /// and apply cursors jump forward with the log.
    async fn complete_incoming_stream(
        &mut self,
        req: InstallSnapshotRequest,
        mut stream: IncomingSnapshot<S::SnapshotData>,
    ) -> RaftResult<()> {
        stream.writer.as_mut().shutdown().await.map_err(|err| self.storage_failure(err.into()))?;
        self.storage
            .install_snapshot(&req.meta, stream.writer)
            .await
            .map_err(|err| self.storage_failure(err))?;

        let membership = self.storage.last_membership().await.map_err(|err| self.storage_failure(err))?;
        self.adopt_membership(membership);

        let boundary = req.meta.last_log_id;
        self.last_log_id = boundary;
        self.last_applied = boundary;
        self.commit_index = std::cmp::max(self.commit_index, boundary.index);
        self.snapshotted_up_to = boundary;
        self.publish_metrics();
        Ok(())
    }
}
