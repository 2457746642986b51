//! The follower side of log replication.

use crate::core::RaftNode;
use crate::core::State;
use crate::error::RaftResult;
use crate::msg::AppendEntriesRequest;
use crate::msg::AppendEntriesResponse;
use crate::msg::Entry;
use crate::msg::EntryPayload;
use crate::msg::MembershipConfig;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftNode<D, R, N, S> {
    /// Answer the leader's AppendEntries RPC (§5.3); an empty batch is its heartbeat (§5.2).
    ///
    /// The success response leaves this node only after every newly accepted entry is durable.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // A stale-term sender learns our term and stops.
        if req.term < self.term {
            tracing::debug!({self.term, rpc_term=req.term}, "refusing AppendEntries from a stale term");
            return Ok(AppendEntriesResponse::rejected(self.term));
        }

        // A valid AppendEntries doubles as the leader's heartbeat: elections wait.
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
        // A candidate (or a stale leader) hearing the current-term leader falls in line.
        if !self.role.is_follower() && !self.role.is_non_voter() {
            self.set_role(State::Follower);
            dirty = true;
        }

        // The §5.3 consistency check: our entry at `prev_log_id.index` must exist and carry
        // `prev_log_id.term`. On failure we hand back conflict hints that let the leader jump
        // its probe a whole term at a time instead of one entry per round trip.
        if req.prev_log_id.index > 0 {
            match self.local_term_at(req.prev_log_id.index).await? {
                Some(term) if term == req.prev_log_id.term => {} // Anchored.
                Some(term) => {
                    let conflict_index = self.first_index_of_term(term, req.prev_log_id.index).await?;
                    tracing::debug!(
                        prev_log_id=%req.prev_log_id, local_term=term, conflict_index,
                        "refusing AppendEntries, terms disagree at the anchor"
                    );
                    if dirty {
                        self.publish_metrics();
                    }
                    return Ok(AppendEntriesResponse {
                        term: self.term,
                        success: false,
                        conflict_term: Some(term),
                        conflict_index: Some(conflict_index),
                    });
                }
                None => {
                    tracing::debug!(prev_log_id=%req.prev_log_id, "refusing AppendEntries, no entry at the anchor");
                    if dirty {
                        self.publish_metrics();
                    }
                    return Ok(AppendEntriesResponse {
                        term: self.term,
                        success: false,
                        conflict_term: None,
                        conflict_index: Some(self.last_log_id.index + 1),
                    });
                }
            }
        }

        // Walk the batch past entries we already hold. The first disagreement truncates our
        // suffix from that point; matching entries — and anything beyond the batch, absent a
        // disagreement — are never touched (Log Matching guarantees their prefixes too).
        let mut fresh = req.entries.as_slice();
        while let Some(head) = fresh.first() {
            let local = self.storage.read_entry(head.log_id.index).await.map_err(|e| self.storage_failure(e))?;
            match local {
                Some(ours) if ours.log_id == head.log_id => fresh = &fresh[1..],
                Some(_) => {
                    tracing::debug!(conflict_at=%head.log_id, "removing conflicting log suffix");
                    self.storage
                        .remove_log(head.log_id.index..)
                        .await
                        .map_err(|e| self.storage_failure(e))?;
                    break;
                }
                None => break,
            }
        }

        if !fresh.is_empty() {
            let refs: Vec<_> = fresh.iter().collect();
            self.storage.write_entries(&refs).await.map_err(|e| self.storage_failure(e))?;
            if let Some(last) = fresh.last() {
                self.last_log_id = last.log_id;
            }
            dirty = true;

            // Configs take effect on append, not on commit.
            if let Some(cfg) = newest_config_in(fresh) {
                self.adopt_membership(cfg);
            }
        }

        // Commitment advances to the leader's word, bounded by what we actually hold.
        let last_new = req.entries.last().map(|ent| ent.log_id.index).unwrap_or(req.prev_log_id.index);
        let commit = std::cmp::min(req.leader_commit, last_new);
        if commit > self.commit_index {
            self.commit_index = commit;
            self.schedule_apply();
        }

        if dirty {
            self.publish_metrics();
        }

        Ok(AppendEntriesResponse {
            term: self.term,
            success: true,
            conflict_term: None,
            conflict_index: None,
        })
    }

    /// The term of our entry at `index`, with the snapshot boundary standing in for its
    /// compacted entry.
    async fn local_term_at(&mut self, index: u64) -> RaftResult<Option<u64>> {
        if index == self.snapshotted_up_to.index && index != 0 {
            return Ok(Some(self.snapshotted_up_to.term));
        }
        let entry = self.storage.read_entry(index).await.map_err(|e| self.storage_failure(e))?;
        Ok(entry.map(|ent| ent.log_id.term))
    }

    /// The first index at or below `from` carrying `term`, for the conflict hint.
    ///
    /// Terms never decrease along the log, so the walk stops at the first entry of an earlier
    /// term, or at the snapshot boundary.
    async fn first_index_of_term(&mut self, term: u64, from: u64) -> RaftResult<u64> {
        let mut first = from;
        while first > 1 {
            match self.local_term_at(first - 1).await? {
                Some(t) if t == term => first -= 1,
                _ => break,
            }
        }
        Ok(first)
    }
}

/// The newest membership config in a batch, if it carries one.
fn newest_config_in<D: AppData>(entries: &[Entry<D>]) -> Option<MembershipConfig> {
    entries.iter().rev().find_map(|ent| match &ent.payload {
        EntryPayload::ConfigChange(cfg) => Some(cfg.membership.clone()),
        _ => None,
    })
}
