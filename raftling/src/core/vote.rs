//! Vote granting and the candidate's campaign.

use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::RaftNode;
use crate::core::State;
use crate::error::RaftResult;
use crate::msg::MembershipConfig;
use crate::msg::VoteRequest;
use crate::msg::VoteResponse;
use crate::quorum;
use crate::raft::ApiMessage;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// Ballot counting for one campaign round, with joint-consensus double counting.
///
/// While the config is joint, winning requires a majority in the old voting group *and* in the
/// new one (§6); a plain config needs just the one.
struct BallotBox {
    old_group: MembershipConfig,
    granted_old: u64,
    needed_old: u64,
    granted_new: u64,
    needed_new: u64,
}

impl BallotBox {
    /// Open a ballot box for the given config, counting the candidate's own vote up front.
    fn new(membership: &MembershipConfig) -> Self {
        let needed_old = quorum::majority_of(membership.members.len()) as u64;
        let needed_new = membership
            .members_after_consensus
            .as_ref()
            .map(|group| quorum::majority_of(group.len()) as u64)
            .unwrap_or(0);
        Self {
            old_group: membership.clone(),
            granted_old: 1,
            needed_old,
            granted_new: if needed_new > 0 { 1 } else { 0 },
            needed_new,
        }
    }

    /// Count a granted ballot towards each group the voter belongs to.
    fn grant(&mut self, voter: NodeId) {
        if self.old_group.members.contains(&voter) {
            self.granted_old += 1;
        }
        if self
            .old_group
            .members_after_consensus
            .as_ref()
            .map(|group| group.contains(&voter))
            .unwrap_or(false)
        {
            self.granted_new += 1;
        }
    }

    /// Check whether every required majority has been reached.
    fn elected(&self) -> bool {
        self.granted_old >= self.needed_old && self.granted_new >= self.needed_new
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftNode<D, R, N, S> {
    /// Answer a peer's RequestVote RPC (§5.2, §5.4).
    ///
    /// At most one ballot per term, first come first served, and only for candidates whose log
    /// is at least as up-to-date as ours. Nothing is answered until the term/vote pair backing
    /// the answer is durable.
    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(super) async fn handle_vote(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        let refuse = |term: u64| {
            Ok(VoteResponse {
                term,
                vote_granted: false,
            })
        };

        // A stale-term candidate learns our term and goes away.
        if req.term < self.term {
            tracing::debug!({self.term, rpc_term=req.term}, "refusing ballot for a stale term");
            return refuse(self.term);
        }

        // Leader stickiness: while the current leader is still being heard from, disruptive
        // candidates (often rejoining partitioned nodes) are ignored outright.
        if let Some(heard) = self.last_heartbeat {
            let since = Instant::now().duration_since(heard).as_millis() as u64;
            if since <= self.config.election_timeout_min {
                tracing::debug!({candidate = req.candidate_id}, "refusing ballot, the leader is still live");
                return refuse(self.term);
            }
        }

        let mut dirty = false;

        // A higher term converts us on the spot, ballot or no ballot.
        if req.term > self.term {
            self.term = req.term;
            self.voted_for = None;
            self.leader = None;
            self.set_role(State::Follower);
            dirty = true;
        }

        // The §5.4.1 election restriction: no ballot for a candidate whose log trails ours.
        let candidate_log = LogId::new(req.last_log_term, req.last_log_index);
        let grant = candidate_log >= self.last_log_id
            && match self.voted_for {
                None => true,
                Some(prior) => prior == req.candidate_id,
            };

        if grant && self.voted_for.is_none() {
            self.voted_for = Some(req.candidate_id);
            self.set_role(State::Follower);
            self.roll_election_deadline();
            dirty = true;
        }

        // The ballot is only a ballot once it is durable.
        if dirty {
            self.persist_hard_state().await?;
            self.publish_metrics();
        }

        tracing::debug!({candidate = req.candidate_id, self.term, grant}, "answered vote request");
        Ok(VoteResponse {
            term: self.term,
            vote_granted: grant,
        })
    }

    /// The candidate role: one campaign round per iteration, each in a fresh term (§5.2).
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, raft_state="candidate"))]
    pub(super) async fn campaign(&mut self) -> RaftResult<()> {
        loop {
            if !self.role.is_candidate() {
                return Ok(());
            }

            // A new term: vote for ourselves and make it durable before soliciting anyone.
            self.roll_election_deadline();
            self.term += 1;
            self.voted_for = Some(self.id);
            self.leader = None;
            self.persist_hard_state().await?;
            self.publish_metrics();

            let mut ballots = BallotBox::new(&self.membership);
            let mut returns = self.request_votes();

            // Collect ballots while staying responsive; a silent round restarts in a new term.
            loop {
                if !self.role.is_candidate() {
                    return Ok(());
                }
                let round_over = sleep_until(self.election_deadline());

                tokio::select! {
                    _ = round_over => break,
                    Some((voter, res)) = returns.recv() => {
                        if res.term > self.term {
                            tracing::debug!("standing down, a voter answered with a higher term");
                            self.step_down(res.term).await?;
                            return Ok(());
                        }
                        if res.vote_granted {
                            ballots.grant(voter);
                            if ballots.elected() {
                                tracing::debug!("campaign won, becoming leader");
                                self.set_role(State::Leader);
                                return Ok(());
                            }
                        }
                    }
                    Some((msg, span)) = self.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            ApiMessage::ElectionTick => {
                                if Instant::now() >= self.election_deadline() {
                                    break;
                                }
                            }
                            other => self.handle_common(other).await,
                        }
                    }
                    Some(report) = self.rx_apply.recv() => {
                        let _ = self.on_apply_report(report);
                    }
                    Some(outcome) = self.rx_compaction.recv() => self.on_compaction_outcome(outcome),
                    Ok(_) = &mut self.rx_shutdown => self.set_role(State::Shutdown),
                }
            }
        }
    }

    /// Fan a RequestVote out to every peer, streaming responses back as they arrive.
    ///
    /// The channel keeps the candidate responsive — it must keep answering RPCs (including the
    /// other candidates' vote requests) while its own ballots trickle in.
    fn request_votes(&self) -> mpsc::Receiver<(NodeId, VoteResponse)> {
        let peers: Vec<NodeId> =
            self.membership.all_members().into_iter().filter(|peer| peer != &self.id).collect();
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        for peer in peers {
            let rpc = VoteRequest::new(self.term, self.id, self.last_log_id.index, self.last_log_id.term);
            let network = self.network.clone();
            let tx = tx.clone();
            tokio::spawn(
                async move {
                    match network.send_vote(peer, rpc).await {
                        Ok(res) => {
                            let _ = tx.send((peer, res)).await;
                        }
                        Err(err) => {
                            tracing::warn!({error=%err, target=peer}, "vote request failed");
                        }
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            );
        }
        rx
    }
}
