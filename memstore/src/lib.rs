//! An in-memory storage system implementing the `raftling::RaftStorage` trait.


use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use raftling::async_trait::async_trait;
use raftling::msg::Entry;
use raftling::msg::EntryPayload;
use raftling::msg::MembershipConfig;
use raftling::storage::HardState;
use raftling::storage::RecoveredState;
use raftling::storage::Snapshot;
use raftling::AppData;
use raftling::AppDataResponse;
use raftling::LogId;
use raftling::NodeId;
use raftling::RaftStorage;
use raftling::RaftStorageDebug;
use raftling::SnapshotMeta;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::sync::RwLockWriteGuard;

/// The application data request type which the `MemStore` works with.
///
/// Conceptually, for demo purposes, this represents an update to a client's status info,
/// returning the previously recorded status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
    /// A string describing the status of the client. For a real application, this should probably
    /// be an enum representing all of the various types of requests / operations which a client
    /// can perform.
    pub status: String,
}

impl AppData for ClientRequest {}

/// The application data response type which the `MemStore` works with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// The MemStore storage error type.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("unsafe storage error")]
    UnsafeStorageError,
}

/// The application snapshot type which the `MemStore` works with.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemStoreSnapshot {
    /// The snapshot metadata: last included log id, membership config and stream id.
    pub meta: SnapshotMeta,

    /// The data of the state machine at the time of this snapshot.
    pub data: Vec<u8>,
}

/// The state machine of the `MemStore`.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct MemStoreStateMachine {
    pub last_applied_log: u64,

    /// A mapping of client IDs to their state info: the serial of the last applied request and
    /// the response returned for it, used to answer duplicate requests without re-applying them.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,

    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,
}

/// An in-memory storage system implementing the `raftling::RaftStorage` trait.
pub struct MemStore {
    /// The ID of the Raft node for which this memory storage instances is configured.
    id: NodeId,
    /// The Raft log.
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    /// The Raft state machine.
    sm: RwLock<MemStoreStateMachine>,
    /// The current hard state.
    hs: RwLock<Option<HardState>>,
    /// The current snapshot.
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,
    /// A counter used to give each built snapshot a unique stream id.
    snapshot_idx: Arc<Mutex<u64>>,
}

impl MemStore {
    /// Create a new `MemStore` instance.
    pub fn new(id: NodeId) -> Self {
        let log = RwLock::new(BTreeMap::new());
        let sm = RwLock::new(MemStoreStateMachine::default());
        let hs = RwLock::new(None);
        let current_snapshot = RwLock::new(None);

        Self {
            id,
            log,
            sm,
            hs,
            current_snapshot,
            snapshot_idx: Arc::new(Mutex::new(0)),
        }
    }

    /// Create a new `MemStore` instance with some existing state (for testing).
    pub fn new_with_state(
        id: NodeId,
        log: BTreeMap<u64, Entry<ClientRequest>>,
        sm: MemStoreStateMachine,
        hs: Option<HardState>,
        current_snapshot: Option<MemStoreSnapshot>,
    ) -> Self {
        Self {
            id,
            log: RwLock::new(log),
            sm: RwLock::new(sm),
            hs: RwLock::new(hs),
            current_snapshot: RwLock::new(current_snapshot),
            snapshot_idx: Arc::new(Mutex::new(0)),
        }
    }

    /// Get a handle to the log for testing purposes.
    pub async fn get_log(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Entry<ClientRequest>>> {
        self.log.write().await
    }

    /// Find the most recent membership config appended to the log at or below the given index.
    async fn membership_from_log(&self, upto: Option<u64>) -> Result<MembershipConfig> {
        let log = self.log.read().await;
        let cfg = log
            .values()
            .rev()
            .filter(|entry| upto.map(|bound| entry.log_id.index <= bound).unwrap_or(true))
            .find_map(|entry| match &entry.payload {
                EntryPayload::ConfigChange(cfg) => Some(cfg.membership.clone()),
                _ => None,
            });
        if let Some(cfg) = cfg {
            return Ok(cfg);
        }
        drop(log);

        // Fall back to the config embedded in the current snapshot, else a pristine initial.
        let snapshot = self.current_snapshot.read().await;
        Ok(snapshot
            .as_ref()
            .map(|snap| snap.meta.membership.clone())
            .unwrap_or_else(|| MembershipConfig::single(self.id)))
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;
    type ShutdownError = ShutdownError;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn last_membership(&self) -> Result<MembershipConfig> {
        self.membership_from_log(None).await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn recover_state(&self) -> Result<RecoveredState> {
        let membership = self.last_membership().await?;
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let sm = self.sm.read().await;
        match &mut *hs {
            Some(inner) => {
                let last_log_id = match log.values().rev().next() {
                    Some(log) => log.log_id,
                    None => LogId { term: 0, index: 0 },
                };
                let last_applied_log = LogId {
                    term: log.get(&sm.last_applied_log).map(|entry| entry.log_id.term).unwrap_or(last_log_id.term),
                    index: sm.last_applied_log,
                };
                Ok(RecoveredState {
                    last_log_id,
                    last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let new = RecoveredState::pristine(self.id);
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn read_log<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, val)| val.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn read_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn last_log_id(&self) -> Result<LogId> {
        let log = self.log.read().await;
        if let Some(entry) = log.values().rev().next() {
            return Ok(entry.log_id);
        }
        let snapshot = self.current_snapshot.read().await;
        Ok(snapshot.as_ref().map(|snap| snap.meta.last_log_id).unwrap_or(LogId { term: 0, index: 0 }))
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn remove_log<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<()> {
        let mut log = self.log.write().await;
        let keys = log.range(range).map(|(key, _)| *key).collect::<Vec<_>>();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn write_entries(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            tracing::debug!("id:{} apply to sm index:{}", self.id, entry.log_id.index);
            sm.last_applied_log = entry.log_id.index;
            match &entry.payload {
                EntryPayload::Blank => res.push(ClientResponse(None)),
                EntryPayload::ConfigChange(_) => res.push(ClientResponse(None)),
                EntryPayload::Normal(data) => {
                    let data = &data.data;
                    if let Some((serial, response)) = sm.client_serial_responses.get(&data.client) {
                        if serial == &data.serial {
                            res.push(ClientResponse(response.clone()));
                            continue;
                        }
                    }
                    let previous = sm.client_status.insert(data.client.clone(), data.status.clone());
                    sm.client_serial_responses.insert(data.client.clone(), (data.serial, previous.clone()));
                    res.push(ClientResponse(previous));
                }
            }
        }
        Ok(res)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn read_state_machine(&self) -> Result<Vec<u8>> {
        let sm = self.sm.read().await;
        Ok(serde_json::to_vec(&*sm)?)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn build_snapshot(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (data, last_applied_log);
        {
            // Serialize the data of the state machine.
            let sm = self.sm.read().await;
            data = serde_json::to_vec(&*sm)?;
            last_applied_log = sm.last_applied_log;
        }

        let membership_config = self.membership_from_log(Some(last_applied_log)).await?;

        let snapshot_id;
        {
            let mut snapshot_idx = self.snapshot_idx.lock().map_err(|_| ShutdownError::UnsafeStorageError)?;
            *snapshot_idx += 1;
            snapshot_id = format!("{}-{}-{}", self.id, last_applied_log, snapshot_idx);
        }

        let term;
        let meta;
        {
            let mut log = self.log.write().await;
            let snapshot = self.current_snapshot.read().await;
            term = log
                .get(&last_applied_log)
                .map(|entry| entry.log_id.term)
                .or_else(|| snapshot.as_ref().map(|snap| snap.meta.last_log_id.term))
                .unwrap_or_default();
            meta = SnapshotMeta {
                last_log_id: LogId {
                    term,
                    index: last_applied_log,
                },
                membership: membership_config,
                snapshot_id,
            };
            // The snapshot supersedes the covered log prefix; drop it.
            *log = log.split_off(&(last_applied_log + 1));
        }

        let snapshot = MemStoreSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        {
            let mut current_snapshot = self.current_snapshot.write().await;
            *current_snapshot = Some(snapshot);
        }

        tracing::trace!({ snapshot_size = data.len() }, "log compaction complete");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn open_snapshot_writer(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn install_snapshot(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        tracing::info!(
            { snapshot_size = snapshot.get_ref().len() },
            "decoding snapshot for installation"
        );

        let new_sm: MemStoreStateMachine = serde_json::from_slice(snapshot.get_ref().as_slice())?;

        {
            let mut log = self.log.write().await;
            // If the local log has the entry the snapshot ends at, with a matching term, then
            // only the covered prefix is discarded; otherwise the whole log is replaced by the
            // snapshot.
            let term_matches = log
                .get(&meta.last_log_id.index)
                .map(|entry| entry.log_id.term == meta.last_log_id.term)
                .unwrap_or(false);
            if term_matches {
                *log = log.split_off(&(meta.last_log_id.index + 1));
            } else {
                log.clear();
            }
        }

        {
            let mut sm = self.sm.write().await;
            *sm = new_sm;
        }

        let new_snapshot = MemStoreSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };
        let mut current_snapshot = self.current_snapshot.write().await;
        *current_snapshot = Some(new_snapshot);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => {
                let data = snapshot.data.clone();
                Ok(Some(Snapshot {
                    meta: snapshot.meta.clone(),
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RaftStorageDebug<MemStoreStateMachine> for MemStore {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}
