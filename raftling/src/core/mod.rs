//! The Raft node: role loops, timers, and the apply/compaction pipelines.

mod admin;
mod append_entries;
pub(crate) mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::commit_wait::CancelKind;
use crate::commit_wait::CommitWaiter;
use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::msg::EntryPayload;
use crate::msg::MembershipConfig;
use crate::raft::ApiMessage;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::raft::ResponseTx;
use crate::raft_types::SnapshotId;
use crate::replication::ReplicaReport;
use crate::replication::ReplicationHandle;
use crate::storage::HardState;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// What a background apply task reports back: the last log id it absorbed, or the failure.
type ApplyReport = anyhow::Result<LogId>;

/// How a background compaction ended.
#[derive(Debug)]
pub(self) enum CompactionOutcome {
    /// A snapshot now covers the log through the given id.
    Done(LogId),
    /// The build failed or was abandoned.
    Failed,
}

/// A compaction running in the background.
pub(self) struct CompactionTask {
    /// Aborts the build, e.g. when the leader starts streaming us a snapshot instead.
    abort: AbortHandle,
    /// Announces the covered index to anyone waiting on the build.
    done: broadcast::Sender<u64>,
}

/// A snapshot stream arriving from the leader, segment by segment.
pub(self) struct IncomingSnapshot<W> {
    /// The stream id; segments of any other stream are rejected.
    id: SnapshotId,
    /// How many bytes have been accepted so far — exactly the next segment's required offset.
    offset: u64,
    /// The storage buffer the bytes are landing in.
    writer: Box<W>,
}

/// The state and machinery of one Raft peer.
pub struct RaftNode<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    id: NodeId,
    config: Arc<Config>,
    network: Arc<N>,
    storage: Arc<S>,

    /// The role this node is currently playing. Loops watch this and hand control back to
    /// `run` whenever a handler changes it.
    role: State,
    /// The current term. Only ever increases; a higher term observed anywhere forces an update
    /// and a step-down before anything else happens under it.
    term: u64,
    /// Who got this node's vote in `term`, if anyone. Cleared whenever `term` advances.
    voted_for: Option<NodeId>,
    /// The leader this node currently recognizes, for redirecting clients.
    leader: Option<NodeId>,
    /// The newest membership config in the log, committed or not.
    membership: MembershipConfig,

    /// The id of the last entry in the log.
    last_log_id: LogId,
    /// The highest index known to be committed cluster-wide. Never persisted: a restarted node
    /// relearns it from the leader, or re-derives it by leading.
    commit_index: u64,
    /// The id of the last entry fed to the state machine.
    last_applied: LogId,
    /// Latched when the state machine refuses an entry: nothing further is applied, because
    /// applying around a refusal would fork this replica from the rest of the cluster.
    apply_halted: bool,
    /// Whether a background apply task is currently running. At most one ever is.
    apply_in_flight: bool,

    /// The id through which the current snapshot covers the log, (0,0) if none.
    snapshotted_up_to: LogId,
    /// A compaction in progress, if any.
    compaction: Option<CompactionTask>,
    /// A leader-pushed snapshot stream in progress, if any.
    incoming_snapshot: Option<IncomingSnapshot<S::SnapshotData>>,

    /// When the last valid heartbeat arrived; used to ignore vote requests which arrive while
    /// a live leader is still being heard from.
    last_heartbeat: Option<Instant>,
    /// When the election timer fires, if armed.
    election_deadline: Option<Instant>,

    /// Leader-only metrics, present exactly while this node leads.
    leader_metrics: Option<LeaderMetrics>,

    tx_apply: mpsc::UnboundedSender<ApplyReport>,
    rx_apply: mpsc::UnboundedReceiver<ApplyReport>,
    tx_compaction: mpsc::UnboundedSender<CompactionOutcome>,
    rx_compaction: mpsc::UnboundedReceiver<CompactionOutcome>,
    rx_api: mpsc::UnboundedReceiver<(ApiMessage<D, R>, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftNode<D, R, N, S> {
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<(ApiMessage<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_apply, rx_apply) = mpsc::unbounded_channel();
        let (tx_compaction, rx_compaction) = mpsc::unbounded_channel();
        let this = Self {
            id,
            config,
            network,
            storage,
            role: State::Follower,
            term: 0,
            voted_for: None,
            leader: None,
            membership: MembershipConfig::single(id),
            last_log_id: LogId::default(),
            commit_index: 0,
            last_applied: LogId::default(),
            apply_halted: false,
            apply_in_flight: false,
            snapshotted_up_to: LogId::default(),
            compaction: None,
            incoming_snapshot: None,
            last_heartbeat: None,
            election_deadline: None,
            leader_metrics: None,
            tx_apply,
            rx_apply,
            tx_compaction,
            rx_compaction,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.run().instrument(tracing::debug_span!("spawn")))
    }

    /// Recover persisted state, pick a starting role, then cycle through the role loops.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn run(mut self) -> RaftResult<()> {
        let recovered = self.storage.recover_state().await.map_err(|err| self.storage_failure(err))?;
        self.term = recovered.hard_state.current_term;
        self.voted_for = recovered.hard_state.voted_for;
        self.last_log_id = recovered.last_log_id;
        self.last_applied = recovered.last_applied_log;
        self.membership = recovered.membership;
        if let Some(snapshot) = self.storage.current_snapshot().await.map_err(|err| self.storage_failure(err))? {
            self.snapshotted_up_to = snapshot.meta.last_log_id;
        }

        // Pick the starting role. Non-members idle as learners; a lone member with history is
        // its whole cluster and leads directly; a lone member with no history is a pristine node
        // awaiting `initialize`; everyone else follows.
        let has_log = self.last_log_id.index > 0;
        self.role = if !self.membership.contains(&self.id) {
            State::NonVoter
        } else if self.membership.members.len() == 1 {
            if has_log {
                State::Leader
            } else {
                State::NonVoter
            }
        } else {
            State::Follower
        };

        // A restarted follower waits out a generous grace period before its first election, so
        // that rebooting nodes don't push the cluster's term up before they can even hear the
        // live leader.
        if self.role == State::Follower {
            self.election_deadline =
                Some(Instant::now() + Duration::from_secs(2) + Duration::from_millis(self.config.new_rand_election_timeout()));
        }

        tracing::debug!(id = self.id, role = ?self.role, "raft node recovered");
        self.publish_metrics();

        loop {
            match self.role {
                State::Leader => LeaderContext::new(&mut self).run().await?,
                State::Candidate => self.campaign().await?,
                State::Follower => self.follower_loop().await?,
                State::NonVoter => self.learner_loop().await?,
                State::Shutdown => {
                    tracing::info!(id = self.id, "raft node stopped");
                    return Ok(());
                }
            }
        }
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Role & term bookkeeping.

    /// Move to the given role, demoting to learner instead when this node has no vote.
    pub(self) fn set_role(&mut self, role: State) {
        self.role = if role == State::Follower && !self.membership.contains(&self.id) {
            State::NonVoter
        } else {
            role
        };
    }

    /// Adopt a strictly higher term observed from a peer: forget the vote, forget the leader,
    /// become a follower, and persist — all before acting under the new term.
    pub(self) async fn step_down(&mut self, term: u64) -> RaftResult<()> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.leader = None;
        self.set_role(State::Follower);
        self.persist_hard_state().await
    }

    /// Durably record the `(term, voted_for)` pair.
    pub(self) async fn persist_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.storage_failure(err))
    }

    /// Switch to the given membership config, which is adopted the moment it is in the log.
    ///
    /// A config that drops this node demotes it to learner; the parent application can watch
    /// for that transition to know when a removed node may be torn down. A config that
    /// (re)admits a learner promotes it to follower.
    pub(self) fn adopt_membership(&mut self, cfg: MembershipConfig) {
        self.membership = cfg;
        if !self.membership.contains(&self.id) {
            self.set_role(State::NonVoter);
        } else if self.role == State::NonVoter && self.membership.members.contains(&self.id) {
            self.set_role(State::Follower);
        }
    }

    /// Record a storage failure: these are never recoverable, so the node stops.
    pub(self) fn storage_failure(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "storage failure, stopping the node");
        self.set_role(State::Shutdown);
        RaftError::RaftStorage(err)
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Election timer.

    /// When the election timer fires, arming it with a fresh randomized timeout if idle.
    pub(self) fn election_deadline(&mut self) -> Instant {
        match self.election_deadline {
            Some(at) => at,
            None => {
                let at = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.election_deadline = Some(at);
                at
            }
        }
    }

    /// Re-arm the election timer with a fresh randomized timeout.
    pub(self) fn roll_election_deadline(&mut self) {
        self.election_deadline = Some(Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout()));
    }

    /// Note a valid message from the current leader: remember when, and push elections out.
    pub(self) fn note_heartbeat(&mut self) {
        self.last_heartbeat = Some(Instant::now());
        self.roll_election_deadline();
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // The apply pipeline (non-leader side).

    /// Start a background task applying committed-but-unapplied entries, if none is running.
    ///
    /// Application is strictly sequential: one batch at a time, in log order, reported back
    /// over the apply channel. Leaders never use this path — they apply inline so they can
    /// fulfill the operations waiting on each entry.
    pub(self) fn schedule_apply(&mut self) {
        if self.role.is_leader() || self.apply_halted || self.apply_in_flight {
            return;
        }
        if self.last_applied.index >= self.commit_index {
            return;
        }

        let from = self.last_applied.index + 1;
        let to = self.commit_index;
        let storage = self.storage.clone();
        let tx = self.tx_apply.clone();
        self.apply_in_flight = true;
        tokio::spawn(
            async move {
                let report = async {
                    let entries = storage.read_log(from..to + 1).await?;
                    let last = entries
                        .last()
                        .map(|ent| ent.log_id)
                        .ok_or_else(|| anyhow::anyhow!("committed entries {}..={} missing from the log", from, to))?;
                    let refs: Vec<_> = entries.iter().collect();
                    storage.apply(&refs).await?;
                    Ok(last)
                }
                .await;
                let _ = tx.send(report);
            }
            .instrument(tracing::debug_span!("apply")),
        );
    }

    /// Absorb a finished apply task, then chase the tail if commitment moved meanwhile.
    pub(self) fn on_apply_report(&mut self, report: ApplyReport) -> RaftResult<()> {
        self.apply_in_flight = false;
        let last = report.map_err(|err| self.storage_failure(err))?;
        self.last_applied = last;
        self.publish_metrics();
        self.maybe_compact(false);
        self.schedule_apply();
        Ok(())
    }

    /// Wait out any in-flight apply task. A new leader calls this before its first inline
    /// apply so that no entry can be applied twice.
    pub(self) async fn drain_apply(&mut self) -> RaftResult<()> {
        while self.apply_in_flight {
            match self.rx_apply.recv().await {
                Some(report) => self.on_apply_report(report)?,
                None => break,
            }
        }
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Compaction.

    /// Kick off a snapshot build when the log has outgrown the policy (or unconditionally).
    pub(self) fn maybe_compact(&mut self, force: bool) {
        if self.compaction.is_some() || self.incoming_snapshot.is_some() {
            return;
        }
        if self.last_applied.index == 0 || self.last_applied.index < self.snapshotted_up_to.index {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        if !force && self.last_applied.index - self.snapshotted_up_to.index < *threshold {
            return;
        }

        let (abort, reg) = AbortHandle::new_pair();
        let (done, _) = broadcast::channel(1);
        self.compaction = Some(CompactionTask {
            abort,
            done: done.clone(),
        });

        let storage = self.storage.clone();
        let tx = self.tx_compaction.clone();
        tokio::spawn(
            async move {
                match Abortable::new(storage.build_snapshot(), reg).await {
                    Ok(Ok(snapshot)) => {
                        let _ = done.send(snapshot.meta.last_log_id.index);
                        let _ = tx.send(CompactionOutcome::Done(snapshot.meta.last_log_id));
                    }
                    Ok(Err(err)) => {
                        tracing::error!({error=%err}, "error building snapshot");
                        let _ = tx.send(CompactionOutcome::Failed);
                    }
                    Err(_aborted) => {
                        let _ = tx.send(CompactionOutcome::Failed);
                    }
                }
            }
            .instrument(tracing::debug_span!("compaction")),
        );
    }

    pub(self) fn on_compaction_outcome(&mut self, outcome: CompactionOutcome) {
        self.compaction = None;
        if let CompactionOutcome::Done(log_id) = outcome {
            self.snapshotted_up_to = log_id;
            self.publish_metrics();
        }
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Metrics & redirects.

    /// Push the node's current shape onto the metrics channel. Fire-and-forget.
    pub(self) fn publish_metrics(&mut self) {
        let snapshot = RaftMetrics {
            id: self.id,
            state: self.role,
            current_term: self.term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.leader,
            membership_config: self.membership.clone(),
            snapshot: self.snapshotted_up_to,
            leader_metrics: self.leader_metrics.clone(),
        };
        if self.tx_metrics.send(snapshot).is_err() {
            tracing::debug!(id = self.id, "metrics receiver dropped");
        }
    }

    /// Bounce a client write back with the leader's address, when known.
    pub(self) fn redirect_write(&self, req: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        match req.entry {
            EntryPayload::Normal(inner) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(inner.data, self.leader)));
            }
            _ => {
                // Client requests can only carry Normal payloads; anything else is a bug here.
                tracing::error!("attempted to redirect a non-client entry payload");
            }
        }
    }

    /// Bounce a client read back with the leader's address, when known.
    pub(self) fn redirect_read(&self, tx: ClientReadResponseTx) {
        let _ = tx.send(Err(ClientReadError::ForwardToLeader(self.leader)));
    }

    /// Refuse an admin request because this node does not lead.
    pub(self) fn reject_admin(&self, tx: ResponseTx) {
        let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.leader).into()));
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Non-leader role loops.

    /// Everything that is handled identically in the follower, candidate, and learner roles.
    pub(self) async fn handle_common(&mut self, msg: ApiMessage<D, R>) {
        match msg {
            ApiMessage::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.handle_append_entries(rpc).await);
            }
            ApiMessage::Vote { rpc, tx } => {
                let _ = tx.send(self.handle_vote(rpc).await);
            }
            ApiMessage::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.handle_install_snapshot(rpc).await);
            }
            ApiMessage::Write { rpc, tx, .. } => self.redirect_write(rpc, tx),
            ApiMessage::Read { tx, .. } => self.redirect_read(tx),
            ApiMessage::Initialize { tx, .. } => {
                let _ = tx.send(Err(InitializeError::NotAllowed));
            }
            ApiMessage::AddLearner { tx, .. } => self.reject_admin(tx),
            ApiMessage::ChangeMembership { tx, .. } => self.reject_admin(tx),
            // Role-specific ticks are intercepted before this is called; here they are no-ops.
            ApiMessage::ElectionTick => {}
            ApiMessage::HeartbeatTick => {}
        }
    }

    /// The follower role: service requests until the election timer fires.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, raft_state="follower"))]
    async fn follower_loop(&mut self) -> RaftResult<()> {
        self.publish_metrics();
        loop {
            if !self.role.is_follower() {
                return Ok(());
            }
            // Heartbeat handling pushes this deadline forward as long as a leader is alive.
            let election = sleep_until(self.election_deadline());

            tokio::select! {
                _ = election => self.set_role(State::Candidate),
                Some((msg, span)) = self.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        ApiMessage::ElectionTick => {
                            if Instant::now() >= self.election_deadline() {
                                self.set_role(State::Candidate);
                            }
                        }
                        other => self.handle_common(other).await,
                    }
                }
                Some(report) = self.rx_apply.recv() => {
                    // Failures flip the role to Shutdown; the loop check handles the rest.
                    let _ = self.on_apply_report(report);
                }
                Some(outcome) = self.rx_compaction.recv() => self.on_compaction_outcome(outcome),
                Ok(_) = &mut self.rx_shutdown => self.set_role(State::Shutdown),
            }
        }
    }

    /// The learner (non-voter) role: replicate passively, never vote, never campaign.
    ///
    /// This is also the only role in which a pristine node accepts `initialize`.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, raft_state="learner"))]
    async fn learner_loop(&mut self) -> RaftResult<()> {
        self.publish_metrics();
        loop {
            if !self.role.is_non_voter() {
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        ApiMessage::Initialize { members, tx } => {
                            let _ = tx.send(self.handle_initialize(members).await);
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

///////////////////////////////////////////////////////////////////////////////////////////////////

/// The roles a Raft node moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Replicating passively: no vote, no election timer.
    NonVoter,
    /// Tracking the leader's log and watching for its silence.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Leading: the one writer of the cluster for its term.
    Leader,
    /// Stopping.
    Shutdown,
}

impl State {
    /// Check if currently in non-voter state.
    pub fn is_non_voter(&self) -> bool {
        matches!(self, Self::NonVoter)
    }

    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Replication bookkeeping for one target node, as the leader sees it.
pub(self) struct Replica<D: AppData> {
    /// The highest log id confirmed replicated on the target.
    matched: LogId,
    /// When set, retire this target's stream once `matched` passes the given index — the
    /// config entry which removed it from the cluster.
    retire_at: Option<u64>,
    /// The channel into the target's replication task.
    stream: ReplicationHandle<D>,
}

/// A node being synced ahead of joining the voting membership.
pub(self) struct Learner<D: AppData> {
    rep: Replica<D>,
    /// Whether the node has caught up enough to be made a voter.
    synced: bool,
    /// Resolved once the node is synced, for `add_non_voter` callers.
    notify: Option<ResponseTx>,
}

/// Where the leader stands in a membership migration.
pub(self) enum MembershipPhase {
    /// No migration in flight.
    Settled,
    /// A proposed migration is waiting on new nodes to catch up.
    SyncingLearners {
        /// The new nodes still catching up.
        pending: HashSet<NodeId>,
        /// The proposed voting membership.
        proposal: BTreeSet<NodeId>,
        /// Resolved when the final config commits.
        tx: ResponseTx,
    },
    /// The joint config is in the log; dual majorities govern until it commits.
    Joint {
        /// Whether the joint config entry has committed yet.
        committed: bool,
    },
}

/// Everything a node holds only while leading.
pub(self) struct LeaderContext<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(self) core: &'a mut RaftNode<D, R, N, S>,
    /// Replication state per voting peer.
    pub(self) replicas: BTreeMap<NodeId, Replica<D>>,
    /// Replication state per syncing learner.
    pub(self) learners: BTreeMap<NodeId, Learner<D>>,
    /// Client operations awaiting commit + apply, keyed by log index.
    pub(self) waiter: CommitWaiter<D, R>,
    /// Migration progress, if a membership change is in flight.
    pub(self) phase: MembershipPhase,
    /// Set when the in-flight migration removes this node; it steps down once the final
    /// config commits.
    pub(self) departing: bool,
    /// The term this leadership was won in, quoted when rejecting operations after losing it.
    pub(self) term: u64,
    /// Reports flowing in from the replication tasks.
    pub(self) rx_report: mpsc::UnboundedReceiver<(ReplicaReport<S::SnapshotData>, Span)>,
    pub(self) tx_report: mpsc::UnboundedSender<(ReplicaReport<S::SnapshotData>, Span)>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderContext<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftNode<D, R, N, S>) -> Self {
        let phase = if core.membership.is_joint() {
            MembershipPhase::Joint { committed: false }
        } else {
            MembershipPhase::Settled
        };
        let term = core.term;
        let (tx_report, rx_report) = mpsc::unbounded_channel();
        Self {
            core,
            replicas: BTreeMap::new(),
            learners: BTreeMap::new(),
            waiter: CommitWaiter::new(),
            phase,
            departing: false,
            term,
            rx_report,
            tx_report,
        }
    }

    /// The leader role: replicate, commit, apply, and serve clients, until deposed.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // One replication task per peer.
        for peer in self.core.membership.all_members() {
            if peer != self.core.id {
                let replica = self.spawn_replica(peer);
                self.replicas.insert(peer, replica);
            }
        }

        self.core.election_deadline = None;
        self.core.last_heartbeat = None;
        self.core.leader = Some(self.core.id);
        self.core.leader_metrics = Some(LeaderMetrics::default());
        self.core.publish_metrics();

        // Leftover follower-side apply work must settle before this leader applies inline.
        self.core.drain_apply().await?;

        // Per §8, anchor this term with an entry of its own; nothing commits — and no read is
        // served — until it does.
        self.establish_leadership_entry().await?;

        // Deadlines on pending client operations are enforced on this cadence.
        let mut sweep = interval(Duration::from_millis(self.core.config.heartbeat_interval));

        loop {
            if !self.core.role.is_leader() {
                return self.relinquish();
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    self.dispatch(msg).await;
                }
                _ = sweep.tick() => self.waiter.cancel_timed_out_operations(),
                Some((report, span)) = self.rx_report.recv() => {
                    tracing::debug!("replica report: {}", report.summary());
                    let _ent = span.enter();
                    self.handle_report(report).await;
                }
                Some(report) = self.core.rx_apply.recv() => {
                    let _ = self.core.on_apply_report(report);
                }
                Some(outcome) = self.core.rx_compaction.recv() => self.core.on_compaction_outcome(outcome),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_role(State::Shutdown),
            }
        }
    }

    /// Handle one message while leading.
    async fn dispatch(&mut self, msg: ApiMessage<D, R>) {
        match msg {
            ApiMessage::AppendEntries { rpc, tx } => {
                tracing::debug!("leader rx: AppendEntries, {}", rpc.summary());
                let _ = tx.send(self.core.handle_append_entries(rpc).await);
            }
            ApiMessage::Vote { rpc, tx } => {
                tracing::debug!("leader rx: Vote, {}", rpc.summary());
                let _ = tx.send(self.core.handle_vote(rpc).await);
            }
            ApiMessage::InstallSnapshot { rpc, tx } => {
                tracing::debug!("leader rx: InstallSnapshot, {}", rpc.summary());
                let _ = tx.send(self.core.handle_install_snapshot(rpc).await);
            }
            ApiMessage::Write { rpc, ttl, tx } => {
                tracing::debug!("leader rx: Write, {}", rpc.summary());
                self.handle_client_write(rpc, ttl, tx).await;
            }
            ApiMessage::Read { ttl, tx } => {
                tracing::debug!("leader rx: Read");
                self.handle_client_read(ttl, tx).await;
            }
            // Leaders run no election timer.
            ApiMessage::ElectionTick => {}
            ApiMessage::HeartbeatTick => {
                tracing::debug!("leader rx: HeartbeatTick");
                self.broadcast_heartbeat();
            }
            ApiMessage::Initialize { tx, .. } => {
                let _ = tx.send(Err(InitializeError::NotAllowed));
            }
            ApiMessage::AddLearner { id, tx } => {
                tracing::debug!("leader rx: AddLearner, {}", id);
                self.add_learner(id, tx);
            }
            ApiMessage::ChangeMembership { members, tx } => {
                tracing::debug!("leader rx: ChangeMembership, {:?}", members);
                self.change_membership(members, tx).await;
            }
        }
    }

    /// Bring the next heartbeat forward on every replication stream.
    fn broadcast_heartbeat(&self) {
        for replica in self.replicas.values() {
            replica.stream.beat();
        }
        for learner in self.learners.values() {
            learner.rep.stream.beat();
        }
    }

    /// Leave the leader role: stop replication and resolve whatever is still pending.
    ///
    /// Operations at or below the commit index were already fulfilled during apply; the rest
    /// are indeterminate and rejected as such.
    fn relinquish(self) -> RaftResult<()> {
        tracing::info!(id = self.core.id, role = ?self.core.role, "leaving the leader role");
        for replica in self.replicas.values() {
            replica.stream.stop();
        }
        for learner in self.learners.values() {
            learner.rep.stream.stop();
        }
        match self.core.role {
            State::Shutdown => self.waiter.cancel_all_operations(CancelKind::Shutdown),
            _ => self.waiter.cancel_all_operations_leadership_lost(self.term, self.core.term),
        }
        self.core.leader_metrics = None;
        Ok(())
    }
}
