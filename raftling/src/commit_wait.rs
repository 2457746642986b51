//! The commit waiter: the registry bridging log indices to pending client operations.
//!
//! When the leader appends a client entry it registers the operation here, keyed by the entry's
//! index. The operation is resolved exactly once: fulfilled after the entry is both committed
//! and applied (with the state machine's response for it), or rejected when the deadline passes,
//! leadership is lost, a membership change supersedes it, the state machine refuses the entry,
//! or the node shuts down.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::ResponseError;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::msg::Entry;
use crate::raft::ResponseTx;
use crate::AppData;
use crate::AppDataResponse;

/// A wrapper around a ClientRequest which has been transformed into an Entry, along with its response channel.
pub(crate) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the ClientRequest.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx<D, R>,
}

impl<D: AppData, R: AppDataResponse> ClientRequestEntry<D, R> {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx<D, R>>>(entry: Entry<D>, tx: T) -> Self {
        Self {
            entry: Arc::new(entry),
            tx: tx.into(),
        }
    }
}

/// An enum type wrapping either a client response channel or an internal Raft response channel.
#[derive(derive_more::From)]
pub(crate) enum ClientOrInternalResponseTx<D: AppData, R: AppDataResponse> {
    Client(ClientWriteResponseTx<D, R>),
    Internal(Option<ResponseTx>),
}

/// The reason a batch of pending operations is being rejected.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CancelKind {
    /// The node stepped down (or observed a higher term) while the operations were pending.
    LeadershipLost { old_term: u64, new_term: u64 },
    /// The operation's deadline elapsed before commit + apply.
    Timeout,
    /// The operation was superseded by a cluster membership change.
    ConfigChange,
    /// The node is stopping.
    Shutdown,
}

struct PendingOp<D: AppData, R: AppDataResponse> {
    req: ClientRequestEntry<D, R>,
    /// The registered deadline, along with the original timeout for error reporting.
    /// Internal operations carry no deadline.
    deadline: Option<(Instant, Duration)>,
}

/// A thread-safe registry of client operations awaiting commit + apply, keyed by log index.
///
/// Multiple operations at the same index are supported, though the normal path is one-to-one.
/// The internal lock is never held across a response channel send: matching operations are
/// drained out of the map first, then resolved.
pub(crate) struct CommitWaiter<D: AppData, R: AppDataResponse> {
    pending: Mutex<BTreeMap<u64, Vec<PendingOp<D, R>>>>,
}

impl<D: AppData, R: AppDataResponse> CommitWaiter<D, R> {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register an operation awaiting the commitment and application of its entry.
    ///
    /// `ttl` is the client's deadline; internal operations (membership changes, the leader's
    /// initial blank entry) pass `None` and wait indefinitely.
    pub(crate) fn register_operation(&self, req: ClientRequestEntry<D, R>, ttl: Option<Duration>) {
        let index = req.entry.log_id.index;
        let deadline = ttl.map(|t| (Instant::now() + t, t));
        let mut pending = self.pending.lock().expect("commit waiter lock poisoned");
        pending.entry(index).or_default().push(PendingOp { req, deadline });
    }

    /// The number of operations still pending.
    pub(crate) fn pending_count(&self) -> usize {
        let pending = self.pending.lock().expect("commit waiter lock poisoned");
        pending.values().map(|ops| ops.len()).sum()
    }

    /// Fulfill every operation at indices at or below `index`, in index order.
    ///
    /// `produce` is supplied by the node and yields, per index, the state machine's post-apply
    /// response for the entry at that index; it is only invoked for indices which are both
    /// committed and applied. An `Err` from `produce` rejects the operation instead.
    pub(crate) fn notify_committed_and_applied<F>(&self, index: u64, mut produce: F)
    where F: FnMut(u64) -> Result<R, ClientWriteError<D>> {
        let drained = {
            let mut pending = self.pending.lock().expect("commit waiter lock poisoned");
            let mut keep = pending.split_off(&(index + 1));
            std::mem::swap(&mut *pending, &mut keep);
            keep
        };

        for (idx, ops) in drained {
            for op in ops {
                match op.req.tx {
                    ClientOrInternalResponseTx::Client(tx) => {
                        let res = produce(idx).map(|data| ClientWriteResponse { index: idx, data });
                        let _ = tx.send(res);
                    }
                    ClientOrInternalResponseTx::Internal(tx) => {
                        let res = produce(idx).map(|_| idx).map_err(|_| ResponseError::Application { index: idx });
                        if let Some(tx) = tx {
                            let send_res = tx.send(res);
                            tracing::debug!("sent internal response for index {}, res: {:?}", idx, send_res);
                        }
                    }
                }
            }
        }
    }

    /// Reject every pending operation: the node stepped down while they were in flight.
    pub(crate) fn cancel_all_operations_leadership_lost(&self, old_term: u64, new_term: u64) {
        self.cancel_all_operations(CancelKind::LeadershipLost { old_term, new_term });
    }

    /// Reject pending operations above `committed_index`.
    ///
    /// Used when a partial prefix has committed but the entries above it will not be resolved
    /// by this node, e.g. when the leader steps down after committing a final membership config.
    pub(crate) fn cancel_operations_after_index(&self, committed_index: u64, kind: CancelKind) {
        let drained = {
            let mut pending = self.pending.lock().expect("commit waiter lock poisoned");
            pending.split_off(&(committed_index + 1))
        };
        for (_, ops) in drained {
            for op in ops {
                reject(op, kind);
            }
        }
    }

    /// Reject every operation whose deadline has passed with a commit timeout.
    ///
    /// Driven periodically from the leader loop.
    pub(crate) fn cancel_timed_out_operations(&self) {
        let now = Instant::now();
        let drained = {
            let mut pending = self.pending.lock().expect("commit waiter lock poisoned");
            let mut expired = Vec::new();
            for (_, ops) in pending.iter_mut() {
                let mut idx = 0;
                while idx < ops.len() {
                    let timed_out = ops[idx].deadline.map(|(deadline, _)| deadline <= now).unwrap_or(false);
                    if timed_out {
                        expired.push(ops.remove(idx));
                    } else {
                        idx += 1;
                    }
                }
            }
            pending.retain(|_, ops| !ops.is_empty());
            expired
        };
        for op in drained {
            reject(op, CancelKind::Timeout);
        }
    }

    /// Reject everything; the shutdown and step-down path.
    pub(crate) fn cancel_all_operations(&self, kind: CancelKind) {
        let drained = {
            let mut pending = self.pending.lock().expect("commit waiter lock poisoned");
            std::mem::take(&mut *pending)
        };
        for (_, ops) in drained {
            for op in ops {
                reject(op, kind);
            }
        }
    }
}

fn reject<D: AppData, R: AppDataResponse>(op: PendingOp<D, R>, kind: CancelKind) {
    let index = op.req.entry.log_id.index;
    match op.req.tx {
        ClientOrInternalResponseTx::Client(tx) => {
            let err = match kind {
                CancelKind::LeadershipLost { old_term, new_term } => {
                    ClientWriteError::LeadershipLost { old_term, new_term }
                }
                CancelKind::Timeout => {
                    let timeout = op.deadline.map(|(_, ttl)| ttl).unwrap_or_default();
                    ClientWriteError::CommitTimeout { index, timeout }
                }
                CancelKind::ConfigChange => ClientWriteError::CancelledByConfigChange,
                CancelKind::Shutdown => ClientWriteError::RaftError(RaftError::ShuttingDown),
            };
            let _ = tx.send(Err(err));
        }
        ClientOrInternalResponseTx::Internal(tx) => {
            if let Some(tx) = tx {
                let err = match kind {
                    CancelKind::Shutdown => crate::error::ChangeConfigError::RaftError(RaftError::ShuttingDown),
                    _ => crate::error::ChangeConfigError::NodeNotLeader(None),
                };
                let _ = tx.send(Err(err.into()));
            }
        }
    }
}
