//! The leader's side of the replication streams: progress, commitment, snapshot handoff.

use tokio::sync::oneshot;

use crate::config::SnapshotPolicy;
use crate::core::LeaderContext;
use crate::core::MembershipPhase;
use crate::core::Replica;
use crate::core::State;
use crate::quorum;
use crate::replication::Directive;
use crate::replication::ReplicaReport;
use crate::replication::Replicator;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderContext<'a, D, R, N, S> {
    /// Start a replication task towards the given peer and return its bookkeeping handle.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replica(&self, target: NodeId) -> Replica<D> {
        let stream = Replicator::spawn(
            self.core.id,
            target,
            self.core.term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.tx_report.clone(),
        );
        Replica {
            matched: LogId::default(),
            retire_at: None,
            stream,
        }
    }

    /// Absorb one report from a replication task.
    #[tracing::instrument(level = "trace", skip(self, report))]
    pub(super) async fn handle_report(&mut self, report: ReplicaReport<S::SnapshotData>) {
        match report {
            ReplicaReport::Progress { target, matched } => self.on_progress(target, matched).await,
            ReplicaReport::Steady { target, steady } => self.on_steady(target, steady).await,
            ReplicaReport::HigherTerm { term, .. } => {
                if term > self.core.term {
                    if let Err(err) = self.core.step_down(term).await {
                        tracing::error!({error=%err}, "error stepping down on a higher term");
                    }
                }
            }
            ReplicaReport::Partition { target, suspected } => self.on_partition_hint(target, suspected),
            ReplicaReport::SnapshotNeeded { target, tx } => self.on_snapshot_request(target, tx).await,
            ReplicaReport::Fatal => self.core.set_role(State::Shutdown),
        }
    }

    /// A target confirmed replication up to `matched`: track it, maybe retire the target,
    /// and re-derive the commit index.
    async fn on_progress(&mut self, target: NodeId, matched: LogId) {
        let mut retire = false;
        if let Some(learner) = self.learners.get_mut(&target) {
            learner.rep.matched = matched;
        } else if let Some(replica) = self.replicas.get_mut(&target) {
            replica.matched = matched;
            // A removed peer is retired once it has seen the config that removed it.
            retire = replica.retire_at.map(|at| matched.index >= at).unwrap_or(false);
        } else {
            return; // A report from a stream already torn down.
        }
        if retire {
            self.retire_replica(target);
        } else if let Some(metrics) = self.core.leader_metrics.as_mut() {
            metrics.replication.entry(target).or_default().matched = matched;
        }

        self.advance_commit_index().await;
        self.core.publish_metrics();
    }

    /// Push the commit index to the highest entry of this term with quorum coverage (§5.4.2).
    ///
    /// Entries of earlier terms never commit on their own count: they ride in under the first
    /// current-term entry above them, which is why a fresh leader plants one immediately.
    async fn advance_commit_index(&mut self) {
        let candidate = self.quorum_watermark();
        if candidate <= self.core.commit_index {
            return;
        }

        let at_current_term = match self.core.storage.read_entry(candidate).await {
            Ok(entry) => entry.map(|ent| ent.log_id.term == self.core.term).unwrap_or(false),
            Err(err) => {
                let _ = self.core.storage_failure(err);
                return;
            }
        };
        if !at_current_term {
            return;
        }

        self.core.commit_index = candidate;

        for replica in self.replicas.values() {
            replica.stream.send(Directive::Commit(candidate));
        }
        for learner in self.learners.values() {
            learner.rep.stream.send(Directive::Commit(candidate));
        }

        self.apply_committed().await;
    }

    /// The highest index replicated on a majority of every active voting group.
    ///
    /// The leader's own log stands in for its vote in each group containing it, and incoming
    /// joint-config members still tracked as learners are counted too — the joint entry itself
    /// could never commit otherwise.
    fn quorum_watermark(&self) -> u64 {
        let mut watermark = self.group_watermark(&self.core.membership.members);
        if let Some(next) = &self.core.membership.members_after_consensus {
            watermark = std::cmp::min(watermark, self.group_watermark(next));
        }
        watermark
    }

    fn group_watermark(&self, group: &std::collections::BTreeSet<NodeId>) -> u64 {
        let mut confirmed: Vec<u64> = group
            .iter()
            .map(|node| {
                if node == &self.core.id {
                    self.core.last_log_id.index
                } else if let Some(replica) = self.replicas.get(node) {
                    replica.matched.index
                } else if let Some(learner) = self.learners.get(node) {
                    learner.rep.matched.index
                } else {
                    0
                }
            })
            .collect();
        if confirmed.is_empty() {
            return 0;
        }
        confirmed.sort_unstable();
        confirmed.reverse();
        confirmed.get(quorum::majority_of(group.len()) - 1).copied().unwrap_or(0)
    }

    /// A stream reported whether its target is keeping pace.
    ///
    /// The interesting case is a learner reaching steady state: that makes it eligible for
    /// membership, resolves its `add_non_voter` caller, and — when a proposed membership change
    /// was waiting on it — may unblock the migration.
    async fn on_steady(&mut self, target: NodeId, steady: bool) {
        if !steady {
            return;
        }
        let learner = match self.learners.get_mut(&target) {
            Some(learner) => learner,
            None => return,
        };
        learner.synced = true;
        if let Some(tx) = learner.notify.take() {
            let _ = tx.send(Ok(learner.rep.matched.index));
        }

        let ready = match &mut self.phase {
            MembershipPhase::SyncingLearners { pending, .. } => {
                pending.remove(&target);
                pending.is_empty()
            }
            _ => false,
        };
        if ready {
            let waiting = std::mem::replace(&mut self.phase, MembershipPhase::Settled);
            if let MembershipPhase::SyncingLearners { proposal, tx, .. } = waiting {
                self.begin_joint_change(proposal, tx).await;
            }
        }
    }

    /// Record a stream's advisory partition suspicion in the leader metrics.
    fn on_partition_hint(&mut self, target: NodeId, suspected: bool) {
        if suspected {
            tracing::warn!(target, "error pattern towards this peer suggests a partition");
        }
        if let Some(metrics) = self.core.leader_metrics.as_mut() {
            metrics.replication.entry(target).or_default().suspect_partition = suspected;
        }
        self.core.publish_metrics();
    }

    /// A stream's target has fallen below the log and needs a snapshot.
    ///
    /// Serve the current snapshot if it is fresh enough; otherwise make sure one is being
    /// built and let the stream's retry come back for it. Dropping `tx` without an answer is
    /// the signal for that retry.
    async fn on_snapshot_request(&mut self, target: NodeId, tx: oneshot::Sender<Snapshot<S::SnapshotData>>) {
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.core.config.snapshot_policy;
        let threshold = *threshold;

        match self.core.storage.current_snapshot().await {
            Ok(Some(snapshot)) => {
                let lag = self.core.last_log_id.index.saturating_sub(snapshot.meta.last_log_id.index);
                if lag <= threshold / 2 {
                    let _ = tx.send(snapshot);
                    return;
                }
                // Too stale to be worth streaming; fall through and build a fresh one.
            }
            Ok(None) => {}
            Err(err) => {
                let _ = self.core.storage_failure(err);
                return;
            }
        }

        if let Some(build) = &self.core.compaction {
            // One is already building: answer the stream once it lands.
            let mut done = build.done.subscribe();
            tokio::spawn(async move {
                let _ = done.recv().await;
                drop(tx); // The stream re-requests and receives the fresh snapshot.
            });
            tracing::debug!(target, "stream waiting on the in-flight snapshot build");
            return;
        }

        self.core.maybe_compact(true);
    }
}
