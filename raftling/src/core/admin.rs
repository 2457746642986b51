//! Cluster formation and joint-consensus membership changes (§6).

use std::collections::BTreeSet;
use std::collections::HashSet;

use crate::commit_wait::CancelKind;
use crate::commit_wait::ClientRequestEntry;
use crate::core::LeaderContext;
use crate::core::MembershipPhase;
use crate::core::RaftNode;
use crate::core::State;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::error::RaftResult;
use crate::msg::EntryConfigChange;
use crate::msg::EntryPayload;
use crate::msg::MembershipConfig;
use crate::raft::ResponseTx;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftNode<D, R, N, S> {
    /// Form a cluster out of a pristine node.
    ///
    /// Only a node which has never voted and never held an entry may do this; anything else
    /// means a cluster already exists and the request is refused. The config is adopted in
    /// memory only — it becomes durable as the first leader's initial config entry. With no
    /// peers in the config the node simply leads outright; with peers it campaigns, and
    /// whichever of the initialized nodes wins propagates its config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_initialize(&mut self, mut members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        if self.last_log_id.index != 0 || self.term != 0 {
            tracing::error!({self.last_log_id.index, self.term}, "refusing initialize, this node has history");
            return Err(InitializeError::NotAllowed);
        }

        members.insert(self.id);
        self.membership = MembershipConfig {
            members,
            members_after_consensus: None,
        };

        if self.membership.members.len() == 1 {
            // Alone in the config: lead without an election.
            self.term += 1;
            self.voted_for = Some(self.id);
            self.set_role(State::Leader);
            self.persist_hard_state().await?;
        } else {
            self.set_role(State::Candidate);
        }
        Ok(())
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderContext<'a, D, R, N, S> {
    /// Start syncing a new node as a learner; its response resolves once it has caught up.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) fn add_learner(&mut self, target: NodeId, tx: ResponseTx) {
        if self.core.membership.contains(&target) || self.learners.contains_key(&target) {
            tracing::debug!(target, "target is already a member or already syncing");
            let _ = tx.send(Err(ChangeConfigError::Noop.into()));
            return;
        }

        let rep = self.spawn_replica(target);
        self.learners.insert(target, super::Learner {
            rep,
            synced: false,
            notify: Some(tx),
        });
    }

    /// Propose a new voting membership (§6).
    ///
    /// New nodes are synced as learners first; once the last of them reports caught up, the
    /// migration proper starts with `begin_joint_change`. The response channel rides along and
    /// resolves when the final config commits.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn change_membership(&mut self, proposal: BTreeSet<NodeId>, tx: ResponseTx) {
        if proposal.is_empty() {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
            return;
        }
        if !matches!(self.phase, MembershipPhase::Settled) {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
            return;
        }

        // Which of the proposed nodes still need to catch up before they can be given a vote?
        let mut pending = HashSet::new();
        for node in proposal.difference(&self.core.membership.members) {
            let synced = match self.learners.get(node) {
                Some(learner) => learner.synced,
                None => {
                    let rep = self.spawn_replica(*node);
                    self.learners.insert(*node, super::Learner {
                        rep,
                        synced: false,
                        notify: None,
                    });
                    false
                }
            };
            if !synced {
                pending.insert(*node);
            }
        }

        if pending.is_empty() {
            self.begin_joint_change(proposal, tx).await;
        } else {
            // `on_steady` re-enters here once the stragglers catch up.
            self.phase = MembershipPhase::SyncingLearners { pending, proposal, tx };
        }
    }

    /// Drive the migration into the log: the joint config, then directly the final config.
    ///
    /// The leader governs under the joint config the moment the joint entry is appended, and
    /// commitment keeps requiring dual majorities until that entry commits. Appending the final
    /// config immediately behind it means a leader change mid-migration leaves at most a
    /// dangling joint config — which the next leader completes on election.
    pub(super) async fn begin_joint_change(&mut self, proposal: BTreeSet<NodeId>, tx: ResponseTx) {
        if !proposal.contains(&self.core.id) {
            self.departing = true;
        }
        self.phase = MembershipPhase::Joint { committed: false };
        self.core.membership.members_after_consensus = Some(proposal.clone());

        let joint = self.core.membership.clone();
        let settled = MembershipConfig {
            members: proposal,
            members_after_consensus: None,
        };

        if let Err(err) = self.append_config_entry(joint, None).await {
            tracing::error!({error=%err}, "error appending the joint config entry");
        }
        if let Err(err) = self.append_config_entry(settled, Some(tx)).await {
            tracing::error!({error=%err}, "error appending the final config entry");
        }
    }

    /// Append a config entry and hand it to replication, optionally wiring a response channel
    /// to its commitment.
    pub(super) async fn append_config_entry(
        &mut self,
        membership: MembershipConfig,
        tx: Option<ResponseTx>,
    ) -> RaftResult<()> {
        let payload = EntryPayload::ConfigChange(EntryConfigChange { membership });
        let entry = match self.append_entry(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Err(ChangeConfigError::RaftError(err).into()));
                    return Ok(());
                }
                return Err(err);
            }
        };
        self.submit_for_replication(ClientRequestEntry::from_entry(entry, tx), None).await;
        Ok(())
    }

    /// The joint config entry has committed: the migration is decided.
    ///
    /// Learners belonging to the incoming group become full replicas, and the leader's config
    /// settles onto the new voting group. From here only the final config entry remains, and it
    /// is already in the log right behind.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn on_joint_config_committed(&mut self) {
        match &mut self.phase {
            MembershipPhase::Joint { committed } => *committed = true,
            _ => {
                tracing::error!("joint config committed outside of a membership migration");
                return;
            }
        }

        self.promote_joining_learners();

        if let Some(next) = self.core.membership.members_after_consensus.take() {
            self.core.membership.members = next;
        }
        self.phase = MembershipPhase::Settled;

        // Peers voted out of the config keep their replication streams until they have seen
        // the config that removes them; `on_final_config_committed` handles the teardown. If a
        // new leader takes over before then, the removed peers simply stop hearing heartbeats
        // and settle down per the §6 disruption countermeasure.
    }

    /// Move every learner named by the joint config's target group into the replica set.
    fn promote_joining_learners(&mut self) {
        let incoming: Vec<NodeId> = match &self.core.membership.members_after_consensus {
            Some(next) => next.difference(&self.core.membership.members).copied().collect(),
            None => return,
        };
        for node in incoming {
            match self.learners.remove(&node) {
                Some(learner) => {
                    self.replicas.insert(node, learner.rep);
                }
                None => {
                    if !self.replicas.contains_key(&node) {
                        tracing::error!(node, "joining node has no replication stream");
                    }
                }
            }
        }
    }

    /// The final (uniform) config entry has committed: finish the migration.
    ///
    /// A leader that voted itself out steps down here, cancelling whatever operations it was
    /// still holding above the config entry — nobody will resolve them now. Otherwise, peers no
    /// longer in the config are retired: immediately if they have replicated past the config
    /// entry, or as soon as they do.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn on_final_config_committed(&mut self, index: u64) {
        if self.departing {
            tracing::debug!(id = self.core.id, "stepping down, removed from the cluster by this config");
            self.waiter.cancel_operations_after_index(index, CancelKind::ConfigChange);
            self.core.leader = None;
            self.core.set_role(State::NonVoter);
            return;
        }

        let mut retire_now = Vec::new();
        for (peer, replica) in self.replicas.iter_mut() {
            if self.core.membership.contains(peer) {
                continue;
            }
            if replica.matched.index >= index {
                retire_now.push(*peer);
            } else {
                replica.retire_at = Some(index);
            }
        }

        tracing::debug!(?retire_now, membership = ?self.core.membership, "final config committed");

        for peer in retire_now {
            self.retire_replica(peer);
        }
        self.core.publish_metrics();
    }

    /// Tear down the replication stream of a peer that has left the cluster.
    pub(super) fn retire_replica(&mut self, peer: NodeId) {
        tracing::debug!(peer, "retiring replication to a removed peer");
        if let Some(replica) = self.replicas.remove(&peer) {
            replica.stream.stop();
        }
        if let Some(metrics) = self.core.leader_metrics.as_mut() {
            metrics.replication.remove(&peer);
        }
    }
}
