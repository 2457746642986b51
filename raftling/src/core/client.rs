//! The leader's client-facing paths: writes, linearizable reads, and the apply loop that
//! fulfills them.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::timeout;

use crate::collector;
use crate::collector::PeerResult;
use crate::commit_wait::ClientRequestEntry;
use crate::core::LeaderContext;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::NetworkError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::msg::AppendEntriesRequest;
use crate::msg::AppendEntriesResponse;
use crate::msg::Entry;
use crate::msg::EntryConfigChange;
use crate::msg::EntryPayload;
use crate::quorum;
use crate::raft::ClientReadResponse;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::replication::Directive;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderContext<'a, D, R, N, S> {
    /// Put an entry of this term into the log, immediately, per §8.
    ///
    /// Commitment may only be anchored on a current-term entry (§5.4.2), so until this one
    /// commits nothing else can, and no read may be served. A brand new cluster uses its config
    /// as the anchor; an established one uses a blank marker — unless the previous leader died
    /// between the two halves of a membership change, in which case the dangling joint config
    /// is completed instead.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn establish_leadership_entry(&mut self) -> RaftResult<()> {
        let payload = match self.core.last_log_id.index {
            0 => EntryPayload::ConfigChange(EntryConfigChange {
                membership: self.core.membership.clone(),
            }),
            last => {
                let head = self.core.storage.read_entry(last).await.map_err(RaftError::RaftStorage)?;
                match head {
                    Some(Entry {
                        payload: EntryPayload::ConfigChange(cfg),
                        ..
                    }) if cfg.membership.is_joint() => EntryPayload::ConfigChange(EntryConfigChange {
                        membership: cfg.membership.final_config(),
                    }),
                    _ => EntryPayload::Blank,
                }
            }
        };

        let entry = self.append_entry(payload).await?;
        self.core.last_log_id.term = self.core.term; // Settled once per leadership.

        self.submit_for_replication(ClientRequestEntry::from_entry(entry, None), None).await;
        Ok(())
    }

    /// Serve a client write: append, register with the commit waiter, replicate.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write(
        &mut self,
        rpc: ClientWriteRequest<D>,
        ttl: Duration,
        tx: ClientWriteResponseTx<D, R>,
    ) {
        match self.append_entry(rpc.entry).await {
            Ok(entry) => {
                let op = ClientRequestEntry::from_entry(entry, tx);
                self.submit_for_replication(op, Some(ttl)).await;
            }
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
            }
        }
    }

    /// Serve a linearizable read (§8).
    ///
    /// The leader proves it has not been deposed by exchanging heartbeats with a majority of
    /// every active voting group — the collector resolves as soon as the groups confirm,
    /// carrying everything received so far. One response bearing a higher term deposes this
    /// leader on the spot and fails the read; otherwise the state machine's view is served.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_client_read(&mut self, ttl: Duration, tx: ClientReadResponseTx) {
        let membership = self.core.membership.clone();
        let me = self.core.id;

        // Quorum arithmetic per voting group, with this node's own implicit confirmation.
        let needed_old = quorum::majority_of(membership.members.len());
        let needed_new =
            membership.members_after_consensus.as_ref().map(|group| quorum::majority_of(group.len())).unwrap_or(0);
        let self_old = membership.members.contains(&me) as usize;
        let self_new = membership
            .members_after_consensus
            .as_ref()
            .map(|group| group.contains(&me) as usize)
            .unwrap_or(0);

        // One bounded heartbeat per replication target.
        let mut probes: Vec<BoxFuture<'static, PeerResult<AppendEntriesResponse>>> = Vec::new();
        for (peer, replica) in self.replicas.iter() {
            let rpc = AppendEntriesRequest {
                term: self.core.term,
                leader_id: me,
                prev_log_id: replica.matched,
                entries: vec![],
                leader_commit: self.core.commit_index,
            };
            let target = *peer;
            let network = self.core.network.clone();
            let probe_ttl = Duration::from_millis(self.core.config.heartbeat_interval);
            probes.push(
                async move {
                    match timeout(probe_ttl, network.send_append_entries(target, rpc)).await {
                        Ok(Ok(res)) => Ok((target, res)),
                        Ok(Err(err)) => Err((target, err)),
                        Err(_elapsed) => Err((target, anyhow::Error::new(NetworkError::Timeout))),
                    }
                }
                .boxed(),
            );
        }

        let confirmed = move |received: &[PeerResult<AppendEntriesResponse>]| {
            let mut old = self_old;
            let mut new = self_new;
            for (peer, _) in received.iter().flatten() {
                if membership.members.contains(peer) {
                    old += 1;
                }
                if membership
                    .members_after_consensus
                    .as_ref()
                    .map(|group| group.contains(peer))
                    .unwrap_or(false)
                {
                    new += 1;
                }
            }
            old >= needed_old && new >= needed_new
        };

        let responses = match collector::collect_until(probes, ttl, confirmed).await {
            Ok(responses) => responses,
            Err(err) => {
                tracing::debug!(error=%err, "leadership confirmation failed for a read");
                let _ = tx.send(Err(ClientReadError::Confirmation(err)));
                return;
            }
        };

        // One higher term anywhere in the responses means we have been deposed.
        let highest = responses.iter().flatten().map(|(_, res)| res.term).max().unwrap_or(self.core.term);
        if highest > self.core.term {
            let deposed_term = self.core.term;
            if let Err(err) = self.core.step_down(highest).await {
                let _ = tx.send(Err(ClientReadError::RaftError(err)));
                return;
            }
            let _ = tx.send(Err(ClientReadError::LeadershipLost {
                old_term: deposed_term,
                new_term: highest,
            }));
            return;
        }

        // Still the leader at this term; the read is linearizable.
        match self.core.storage.read_state_machine().await {
            Ok(state) => {
                let _ = tx.send(Ok(ClientReadResponse {
                    index: self.core.last_applied.index,
                    state,
                }));
            }
            Err(err) => {
                let err = self.core.storage_failure(err);
                let _ = tx.send(Err(ClientReadError::RaftError(err)));
            }
        }
    }

    /// Stamp a payload with the next index at this term and write it durably to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_entry(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId {
                term: self.core.term,
                index: self.core.last_log_id.index + 1,
            },
            payload,
        };
        self.core
            .storage
            .write_entries(&[&entry])
            .await
            .map_err(|err| self.core.storage_failure(err))?;
        self.core.last_log_id.index = entry.log_id.index;
        self.core.publish_metrics();
        Ok(entry)
    }

    /// Register an appended entry's operation and push the entry to every replication stream.
    ///
    /// This never waits for replication: the operation resolves later, through the commit
    /// waiter, once the entry commits and applies — or by deadline, step-down or shutdown. In
    /// a single-node cluster there is nobody to wait for and the entry commits here and now.
    #[tracing::instrument(level = "trace", skip(self, op))]
    pub(super) async fn submit_for_replication(&mut self, op: ClientRequestEntry<D, R>, ttl: Option<Duration>) {
        let entry = op.entry.clone();
        self.waiter.register_operation(op, ttl);

        if self.replicas.is_empty() && self.learners.is_empty() {
            self.core.commit_index = entry.log_id.index;
            self.core.publish_metrics();
            self.apply_committed().await;
            return;
        }

        for replica in self.replicas.values() {
            replica.stream.send(Directive::Entry {
                entry: entry.clone(),
                commit_index: self.core.commit_index,
            });
        }
        for learner in self.learners.values() {
            learner.rep.stream.send(Directive::Entry {
                entry: entry.clone(),
                commit_index: self.core.commit_index,
            });
        }
    }

    /// Apply every committed-but-unapplied entry, in order, fulfilling its waiting operation
    /// with the state machine's response for exactly that entry.
    ///
    /// One entry at a time: an operation must see the post-apply result of its own index, and
    /// a refusal must stop the line. When the state machine does refuse — any error that is not
    /// the storage impl's `ShutdownError` — the responsible operation is rejected with the
    /// cause, the apply pipeline latches shut, and operations above it run out their deadlines.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn apply_committed(&mut self) {
        // No background apply may overlap the inline loop, or an entry could apply twice.
        if self.core.drain_apply().await.is_err() {
            return;
        }

        while self.core.last_applied.index < self.core.commit_index && !self.core.apply_halted {
            let index = self.core.last_applied.index + 1;
            let entry = match self.core.storage.read_entry(index).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    let _ = self
                        .core
                        .storage_failure(anyhow::anyhow!("committed entry {} missing from the log", index));
                    return;
                }
                Err(err) => {
                    let _ = self.core.storage_failure(err);
                    return;
                }
            };

            // A config entry committing has membership side effects, processed before the
            // waiting operation hears anything.
            if let EntryPayload::ConfigChange(cfg) = &entry.payload {
                if cfg.membership.is_joint() {
                    self.on_joint_config_committed();
                } else {
                    self.on_final_config_committed(entry.log_id.index);
                }
            }

            match self.core.storage.apply(&[&entry]).await {
                Ok(mut responses) => {
                    self.core.last_applied = entry.log_id;
                    let response = responses.pop();
                    self.waiter.notify_committed_and_applied(index, |idx| match response.clone() {
                        Some(data) => Ok(data),
                        None => Err(ClientWriteError::RaftError(RaftError::RaftStorage(anyhow::anyhow!(
                            "state machine produced no response for entry {}",
                            idx
                        )))),
                    });
                }
                Err(err) => {
                    if err.downcast_ref::<S::ShutdownError>().is_some() {
                        let _ = self.core.storage_failure(err);
                        return;
                    }
                    tracing::error!({error=%err, index}, "state machine refused an entry, apply pipeline halted");
                    self.core.apply_halted = true;
                    let cause = err.to_string();
                    self.waiter.notify_committed_and_applied(index, |idx| {
                        Err(ClientWriteError::ApplicationError {
                            index: idx,
                            cause: anyhow::anyhow!(cause.clone()),
                        })
                    });
                    return;
                }
            }
        }

        self.core.publish_metrics();
        self.core.maybe_compact(false);
    }
}
