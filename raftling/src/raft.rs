//! The public handle to a running Raft node.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftNode;
use crate::core::State;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::msg::AppendEntriesRequest;
use crate::msg::AppendEntriesResponse;
use crate::msg::EntryNormal;
use crate::msg::EntryPayload;
use crate::msg::InstallSnapshotRequest;
use crate::msg::InstallSnapshotResponse;
use crate::msg::VoteRequest;
use crate::msg::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The channel ends and task handles shared by all clones of a `Raft` handle.
struct Shared<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<(ApiMessage<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    node_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// A handle to a spawned Raft node.
///
/// Creating one with [`Raft::new`] starts the node as a background task; every interaction —
/// peer RPCs arriving off the wire, client reads and writes, membership administration —
/// goes through this handle. Clones are cheap and all refer to the same node.
///
/// If any method returns `RaftError::ShuttingDown` the node is stopping (possibly because the
/// storage layer reported an unrecoverable error); call [`Raft::shutdown`] to await it.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    shared: Arc<Shared<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Start a new Raft node as a background task and return its handle.
    ///
    /// `id` must be stable across restarts of this node — persist it alongside the node's log.
    /// `network` carries RPCs to peers; `storage` owns durability and hosts the application
    /// state machine. See the docs on the two traits for their contracts.
    #[tracing::instrument(level="trace", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let node_handle = RaftNode::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        Self {
            shared: Arc::new(Shared {
                tx_api,
                rx_metrics,
                node_handle: Mutex::new(Some(node_handle)),
                tx_shutdown: Mutex::new(Some(tx_shutdown)),
                marker_n: std::marker::PhantomData,
                marker_s: std::marker::PhantomData,
            }),
        }
    }

    /// Enqueue a message for the node, failing fast once the node task is gone.
    fn post(&self, msg: ApiMessage<D, R>) -> Result<(), RaftError> {
        let span = tracing::debug_span!("CH");
        self.shared.tx_api.send((msg, span)).map_err(|_| RaftError::ShuttingDown)
    }

    /// Enqueue a message built around a fresh response channel and await the answer.
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ApiMessage<D, R>) -> Result<T, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Feed an AppendEntries RPC from a cluster peer into this node (§5.3, §5.2).
    ///
    /// Transport servers hosting this node dispatch decoded AppendEntries frames here.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        self.call(|tx| ApiMessage::AppendEntries { rpc, tx }).await?
    }

    /// Feed a RequestVote RPC from a campaigning peer into this node (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        self.call(|tx| ApiMessage::Vote { rpc, tx }).await?
    }

    /// Feed an InstallSnapshot segment from the cluster leader into this node (§7).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot_id=%rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        self.call(|tx| ApiMessage::InstallSnapshot { rpc, tx }).await?
    }

    /// Submit a command to the replicated state machine (§5.1).
    ///
    /// The command is appended to the log, replicated, committed, and applied; only then does
    /// this resolve, carrying whatever the state machine returned for it. `ttl` bounds the wait:
    /// past it the call fails with `CommitTimeout` and the command's fate is unresolved — it may
    /// yet commit. Callers should tag commands with client serials so an unresolved command can
    /// be retried idempotently; `RaftStorage::apply` is the natural place to deduplicate.
    ///
    /// Fails fast with `ForwardToLeader` on a non-leader, returning the payload and the known
    /// leader id for redirection.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(
        &self,
        rpc: ClientWriteRequest<D>,
        ttl: Duration,
    ) -> Result<ClientWriteResponse<R>, ClientWriteError<D>> {
        self.call(|tx| ApiMessage::Write { rpc, ttl, tx })
            .await
            .map_err(ClientWriteError::RaftError)?
    }

    /// Read the state machine linearizably (§8).
    ///
    /// The leader first proves it is still the leader by exchanging heartbeats with a majority —
    /// its information would otherwise be stale if someone else has since been elected — and only
    /// then serves the read, so the returned view reflects every acknowledged write. `ttl`
    /// bounds the whole operation.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self, ttl: Duration) -> Result<ClientReadResponse, ClientReadError> {
        self.call(|tx| ApiMessage::Read { ttl, tx }).await.map_err(ClientReadError::RaftError)?
    }

    /// Force an immediate election-timer evaluation.
    ///
    /// The node runs its own timer; external schedulers may drive the same path through here.
    /// A follower or candidate whose timeout has elapsed starts (or restarts) campaigning,
    /// otherwise nothing happens.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn check_election_timeout(&self) -> Result<(), RaftError> {
        self.post(ApiMessage::ElectionTick)
    }

    /// Force an immediate heartbeat round to every replication target.
    ///
    /// Leaders pace heartbeats themselves; external schedulers may bring one forward through
    /// here. Nothing happens on a non-leader.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn check_heartbeat_timeout(&self) -> Result<(), RaftError> {
        self.post(ApiMessage::HeartbeatTick)
    }

    /// Turn a pristine node into a cluster of the given members.
    ///
    /// Only valid while the node has an empty log and term 0; `InitializeError::NotAllowed`
    /// otherwise, which simply means the cluster is already formed and may be ignored. Call this
    /// on the discovered members once the application's peer discovery settles; whichever node
    /// wins the resulting election propagates its config, so the call is race-free. The first
    /// leader of a fresh cluster commits the config itself as its initial entry.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        self.call(|tx| ApiMessage::Initialize { members, tx })
            .await
            .map_err(|err| InitializeError::RaftError(err))?
    }

    /// Sync a new node as a non-voter, resolving once it has caught up (§6).
    ///
    /// This starts replication to the target without giving it a vote. Once synced — and this
    /// method has resolved for every node being added — call [`Raft::change_membership`] to make
    /// it a voter. Leader only.
    #[tracing::instrument(level = "debug", skip(self, id), fields(target=id))]
    pub async fn add_non_voter(&self, id: NodeId) -> Result<(), ResponseError> {
        let res = self
            .call(|tx| ApiMessage::AddLearner { id, tx })
            .await
            .map_err(|err| ResponseError::from(ChangeConfigError::RaftError(err)))?;
        res.map(|_| ())
    }

    /// Migrate the cluster to a new voting membership via joint consensus (§6).
    ///
    /// New nodes which have not yet been synced with `add_non_voter` are synced first, then the
    /// joint and final configs are driven through the log. Resolves once the final config
    /// commits. Leader only.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_membership(&self, members: BTreeSet<NodeId>) -> Result<(), ResponseError> {
        let res = self
            .call(|tx| ApiMessage::ChangeMembership { members, tx })
            .await
            .map_err(|err| ResponseError::from(ChangeConfigError::RaftError(err)))?;
        res.map(|_| ())
    }

    /// The id of the current leader, as far as this node knows.
    ///
    /// Kept current by the metrics stream; good for routing client requests, but never a
    /// substitute for `client_read`'s staleness guard.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// This node's current role.
    pub fn server_state(&self) -> State {
        self.metrics().borrow().state
    }

    /// Check whether this node is currently the cluster leader.
    pub fn is_leader(&self) -> bool {
        self.server_state() == State::Leader
    }

    /// This node's current term.
    pub fn current_term(&self) -> u64 {
        self.metrics().borrow().current_term
    }

    /// A receiver for the node's metrics stream.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.shared.rx_metrics.clone()
    }

    /// A helper which awaits metrics conditions, for tests and orchestration.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use raftling::{State, Raft};
    /// // wait for entry 3 to be received and applied:
    /// r.wait(Some(Duration::from_millis(200))).log(3, "entry 3").await?;
    /// // wait for the node to become a follower:
    /// r.wait(None).state(State::Follower, "stepping down").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.shared.rx_metrics.clone(),
        }
    }

    /// Stop this node and await its task.
    ///
    /// Pending client operations are rejected with a shutdown error; replication streams and
    /// timers are released.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.shared.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.shared.node_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub(crate) type ClientWriteResponseTx<D, R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError<D>>>;
pub(crate) type ClientReadResponseTx = oneshot::Sender<Result<ClientReadResponse, ClientReadError>>;
pub(crate) type ResponseTx = oneshot::Sender<Result<u64, ResponseError>>;

/// Everything a `Raft` handle can ask of its node task.
pub(crate) enum ApiMessage<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    Vote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>>,
    },
    Write {
        rpc: ClientWriteRequest<D>,
        ttl: Duration,
        tx: ClientWriteResponseTx<D, R>,
    },
    Read {
        ttl: Duration,
        tx: ClientReadResponseTx,
    },
    ElectionTick,
    HeartbeatTick,
    Initialize {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    AddLearner {
        id: NodeId,
        tx: ResponseTx,
    },
    ChangeMembership {
        members: BTreeSet<NodeId>,
        tx: ResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A client command on its way into the log (§5.1).
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    /// The payload the entry will carry.
    #[serde(bound = "D: AppData")]
    pub(crate) entry: EntryPayload<D>,
}

impl<D: AppData> ClientWriteRequest<D> {
    /// Wrap an application command for submission.
    pub fn new(data: D) -> Self {
        Self {
            entry: EntryPayload::Normal(EntryNormal { data }),
        }
    }
}

impl<D: AppData> MessageSummary for ClientWriteRequest<D> {
    fn summary(&self) -> String {
        self.entry.summary()
    }
}

/// What a fulfilled client write carries back.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    /// The log index the command landed at.
    pub index: u64,
    /// The state machine's response for the command.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

/// What a linearizable read carries back.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientReadResponse {
    /// The applied index the view was taken at.
    pub index: u64,
    /// The state machine's serialized view, from `RaftStorage::read_state_machine`.
    pub state: Vec<u8>,
}
