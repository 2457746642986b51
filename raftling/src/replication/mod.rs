//! Per-target replication: one background task per peer, driven by the leader.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeek;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::error::NetworkError;
use crate::msg::AppendEntriesRequest;
use crate::msg::AppendEntriesResponse;
use crate::msg::Entry;
use crate::msg::InstallSnapshotRequest;
use crate::retry;
use crate::retry::ErrorMonitor;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// One target's replication state, as surfaced through the leader metrics.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    /// The highest log id confirmed replicated on the target.
    pub matched: LogId,
    /// Raised while the recent error pattern towards the target looks like a partition.
    /// Advisory only; Raft never consults it.
    pub suspect_partition: bool,
}

/// The leader's channel into one replication task.
pub(crate) struct ReplicationHandle<D: AppData> {
    tx: mpsc::UnboundedSender<(Directive<D>, Span)>,
}

impl<D: AppData> ReplicationHandle<D> {
    /// Hand the task a directive; a task that has exited just ignores it.
    pub(crate) fn send(&self, directive: Directive<D>) {
        let _ = self.tx.send((directive, tracing::debug_span!("CH")));
    }

    /// Ask for an immediate heartbeat, off the regular cadence.
    pub(crate) fn beat(&self) {
        self.send(Directive::Beat);
    }

    /// Shut the task down.
    pub(crate) fn stop(&self) {
        self.send(Directive::Stop);
    }
}

/// What the leader tells a replication task.
pub(crate) enum Directive<D: AppData> {
    /// A freshly appended entry to ship, along with the commit index as of its append.
    Entry { entry: Arc<Entry<D>>, commit_index: u64 },
    /// The commit index moved.
    Commit(u64),
    /// Send a heartbeat now.
    Beat,
    /// Wind down.
    Stop,
}

/// What a replication task tells the leader.
pub(crate) enum ReplicaReport<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// The target confirmed replication through `matched`. Only ever derived from an
    /// acknowledged exchange, never from conflict bookkeeping.
    Progress { target: NodeId, matched: LogId },
    /// Whether the target is keeping pace with the log's tail. A learner reporting steady is
    /// ready to be granted a vote.
    Steady { target: NodeId, steady: bool },
    /// The target answered from a higher term: this leadership is over.
    HigherTerm { target: NodeId, term: u64 },
    /// The sliding error window towards this target filled with timeout-class failures (or
    /// recovered). Advisory.
    Partition { target: NodeId, suspected: bool },
    /// The target's next entries are compacted away; a snapshot is required.
    SnapshotNeeded {
        target: NodeId,
        tx: oneshot::Sender<Snapshot<S>>,
    },
    /// Storage failed in the replication path; the node must stop.
    Fatal,
}

impl<S: AsyncRead + AsyncSeek + Send + Unpin + 'static> MessageSummary for ReplicaReport<S> {
    fn summary(&self) -> String {
        match self {
            ReplicaReport::Progress { target, matched } => format!("Progress: target={}, matched={}", target, matched),
            ReplicaReport::Steady { target, steady } => format!("Steady: target={}, steady={}", target, steady),
            ReplicaReport::HigherTerm { target, term } => format!("HigherTerm: target={}, term={}", target, term),
            ReplicaReport::Partition { target, suspected } => {
                format!("Partition: target={}, suspected={}", target, suspected)
            }
            ReplicaReport::SnapshotNeeded { target, .. } => format!("SnapshotNeeded: target={}", target),
            ReplicaReport::Fatal => "Fatal".to_string(),
        }
    }
}

/// Where a replication task currently stands with its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// In step with the log's tail; entries ship as the leader hands them over.
    Steady,
    /// Behind; batches are pulled from storage until the commit index is reached.
    CatchUp,
    /// Below the log entirely; a snapshot must be streamed.
    Snapshot,
    /// Finished, by request or by a fatal condition.
    Closed,
}

/// The replication task for a single target.
///
/// Exchanges are strictly one at a time: a batch stays in `inflight` until the target
/// acknowledges it, which both preserves ordering and gives transient transport failures a
/// retransmission path. The `queue` holds entries handed over by the leader while in step;
/// anything missed while behind is read back from storage instead.
pub(crate) struct Replicator<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    id: NodeId,
    target: NodeId,
    /// The leadership term this task serves; it never changes, the task is replaced instead.
    term: u64,
    config: Arc<Config>,
    network: Arc<N>,
    storage: Arc<S>,

    tx_report: mpsc::UnboundedSender<(ReplicaReport<S::SnapshotData>, Span)>,
    rx: mpsc::UnboundedReceiver<(Directive<D>, Span)>,

    phase: Phase,
    /// The next index to ship.
    next_index: u64,
    /// The id of the entry at `next_index - 1`: the consistency anchor of the next exchange,
    /// and — after an acknowledged exchange — the target's confirmed high-water mark.
    prev: LogId,
    /// The index of the leader's last appended entry.
    leader_last: u64,
    /// The cluster commit index as last told by the leader.
    commit_index: u64,

    /// Entries handed over by the leader while in step, awaiting their turn.
    queue: VecDeque<Arc<Entry<D>>>,
    /// The batch currently awaiting acknowledgment; retransmitted after transport failures.
    inflight: Vec<Entry<D>>,
    /// At most this many entries per exchange.
    batch_limit: usize,

    beat: Interval,
    beat_now: bool,
    rpc_timeout: Duration,
    chunk_timeout: Duration,

    /// Whether the leader has been told this target is in step. Steadiness is only ever
    /// announced off an acknowledged exchange, never assumed.
    steady_announced: bool,

    errors: ErrorMonitor,
    partition_flagged: bool,

    marker_r: std::marker::PhantomData<R>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Replicator<D, R, N, S> {
    /// Start a replication task towards `target` and hand back its channel.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        leader_last: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        tx_report: mpsc::UnboundedSender<(ReplicaReport<S::SnapshotData>, Span)>,
    ) -> ReplicationHandle<D> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rpc_timeout = Duration::from_millis(config.heartbeat_interval);
        let chunk_timeout = Duration::from_millis(config.install_snapshot_timeout);
        let batch_limit = config.max_payload_entries as usize;
        let window = config.partition_error_threshold;
        let this = Self {
            id,
            target,
            term,
            config,
            network,
            storage,
            tx_report,
            rx,
            phase: Phase::Steady,
            next_index: leader_last.index + 1,
            prev: leader_last,
            leader_last: leader_last.index,
            commit_index,
            queue: VecDeque::new(),
            inflight: Vec::new(),
            batch_limit,
            beat: interval(rpc_timeout),
            beat_now: false,
            rpc_timeout,
            chunk_timeout,
            steady_announced: false,
            errors: ErrorMonitor::new(window),
            partition_flagged: false,
            marker_r: std::marker::PhantomData,
        };
        tokio::spawn(this.run().instrument(tracing::debug_span!("replication", target)));
        ReplicationHandle { tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target))]
    async fn run(mut self) {
        // The opening exchange asserts authority right away and, through its conflict hints,
        // discovers where the target's log actually stands before any phase settles.
        self.exchange().await;
        loop {
            match self.phase {
                Phase::Steady => self.steady_loop().await,
                Phase::CatchUp => self.catch_up_loop().await,
                Phase::Snapshot => self.snapshot_loop().await,
                Phase::Closed => return,
            }
        }
    }

    fn report(&self, report: ReplicaReport<S::SnapshotData>) {
        let _ = self.tx_report.send((report, tracing::debug_span!("CH")));
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Phases.

    /// In step with the log: ship entries as the leader queues them, heartbeat otherwise.
    #[tracing::instrument(level = "trace", skip(self), fields(phase = "steady"))]
    async fn steady_loop(&mut self) {
        while self.phase == Phase::Steady {
            if self.beat_now {
                self.beat_now = false;
                self.exchange().await;
                continue;
            }

            if self.inflight.is_empty() {
                // Drop queue entries the target already holds (overlap after a catch-up).
                while self.queue.front().map(|ent| ent.log_id.index < self.next_index).unwrap_or(false) {
                    self.queue.pop_front();
                }

                // A hole below the queue — or a bare tail the queue never saw — is filled
                // straight from storage.
                let gap_end = self.queue.front().map(|ent| ent.log_id.index - 1).unwrap_or(self.leader_last);
                if self.next_index <= gap_end {
                    if !self.load_batch_upto(gap_end).await {
                        return; // Phase changed: snapshot required or storage failed.
                    }
                    self.exchange().await;
                    continue;
                }

                // The queue's head is exactly what the target needs next.
                if self.queue.front().map(|ent| ent.log_id.index) == Some(self.next_index) {
                    let take = self.queue.len().min(self.batch_limit);
                    self.inflight = self.queue.drain(..take).map(|ent| ent.as_ref().clone()).collect();
                    self.exchange().await;
                    continue;
                }
            }

            tokio::select! {
                _ = self.beat.tick() => self.exchange().await,
                directive = self.rx.recv() => match directive {
                    Some((directive, span)) => {
                        let _ent = span.enter();
                        self.absorb(directive);
                    }
                    None => self.phase = Phase::Closed,
                }
            }
        }
    }

    /// Behind the commit index: pull batches from storage until caught up.
    #[tracing::instrument(level = "trace", skip(self), fields(phase = "catch-up"))]
    async fn catch_up_loop(&mut self) {
        self.steady_announced = false;
        self.report(ReplicaReport::Steady {
            target: self.target,
            steady: false,
        });
        self.queue.clear();
        while self.phase == Phase::CatchUp {
            if self.snapshot_needed() {
                self.phase = Phase::Snapshot;
                return;
            }
            if self.next_index > self.commit_index {
                self.phase = Phase::Steady;
                return;
            }

            if self.inflight.is_empty() && !self.load_batch_upto(self.commit_index).await {
                return; // Phase changed under us.
            }
            self.exchange().await;
            self.absorb_ready();
        }
    }

    /// Below the log: obtain a snapshot from the leader task and stream it across.
    #[tracing::instrument(level = "trace", skip(self), fields(phase = "snapshot"))]
    async fn snapshot_loop(&mut self) {
        self.steady_announced = false;
        self.report(ReplicaReport::Steady {
            target: self.target,
            steady: false,
        });
        self.queue.clear();
        self.inflight.clear();

        let (tx, mut rx) = oneshot::channel();
        self.report(ReplicaReport::SnapshotNeeded {
            target: self.target,
            tx,
        });

        // Wait for the snapshot while keeping our authority asserted. A dropped channel means
        // a snapshot build was still running; the outer loop simply asks again.
        let snapshot = loop {
            if self.phase != Phase::Snapshot {
                return;
            }
            tokio::select! {
                _ = self.beat.tick() => self.assert_authority().await,
                directive = self.rx.recv() => match directive {
                    Some((directive, span)) => {
                        let _ent = span.enter();
                        self.absorb(directive);
                    }
                    None => self.phase = Phase::Closed,
                },
                res = &mut rx => match res {
                    Ok(snapshot) => break snapshot,
                    Err(_) => return,
                },
            }
        };

        self.stream_snapshot(snapshot).await;
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Exchanges.

    /// One AppendEntries exchange: the in-flight batch (or a bare heartbeat), acknowledged,
    /// conflicted, or abandoned for this tick after transport retries run out.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn exchange(&mut self) {
        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.prev,
            entries: self.inflight.clone(),
            leader_commit: self.commit_index,
        };

        let res = match self.transport_append(rpc).await {
            Ok(res) => res,
            // Logged and recorded inside; the batch stays in-flight for retransmission.
            Err(_) => return,
        };

        if res.term > self.term {
            tracing::debug!({ res.term }, "target answered from a higher term");
            self.report(ReplicaReport::HigherTerm {
                target: self.target,
                term: res.term,
            });
            self.phase = Phase::Closed;
            return;
        }

        if res.success {
            if let Some(last) = self.inflight.last().map(|ent| ent.log_id) {
                self.prev = last;
                self.next_index = last.index + 1;
                self.inflight.clear();
                self.report(ReplicaReport::Progress {
                    target: self.target,
                    matched: last,
                });
            }
            // An acknowledged exchange while in step — including a bare heartbeat, whose
            // consistency check covers the whole log — is what steadiness means.
            if self.phase == Phase::Steady && self.next_index > self.leader_last && !self.steady_announced {
                self.steady_announced = true;
                self.report(ReplicaReport::Steady {
                    target: self.target,
                    steady: true,
                });
            }
            return;
        }

        self.backtrack(res).await;
    }

    /// The consistency check failed: walk `next_index` back along the target's conflict hints.
    ///
    /// A `conflict_term` this leader also holds lets the probe resume just past the leader's
    /// last entry of that term — one whole term per round trip; otherwise the probe lands on
    /// the target's `conflict_index` directly.
    async fn backtrack(&mut self, res: AppendEntriesResponse) {
        self.inflight.clear();
        self.queue.clear();

        let fallback = res.conflict_index.unwrap_or_else(|| self.next_index.saturating_sub(1).max(1));
        let resume = match res.conflict_term {
            Some(conflict_term) => match self.last_index_of_term(conflict_term).await {
                Ok(Some(index)) => index + 1,
                Ok(None) => fallback,
                Err(err) => {
                    tracing::error!(error=%err, "storage failed while resolving a conflict hint");
                    self.report(ReplicaReport::Fatal);
                    self.phase = Phase::Closed;
                    return;
                }
            },
            None => fallback,
        };
        self.next_index = resume.max(1).min(self.leader_last + 1);
        tracing::debug!(
            conflict_term = ?res.conflict_term,
            conflict_index = ?res.conflict_index,
            next_index = self.next_index,
            "probe moved back along conflict hints"
        );

        // Re-anchor `prev` on the entry before the probe; its absence means that part of the
        // log is compacted and only a snapshot will do.
        if self.next_index <= 1 {
            self.next_index = 1;
            self.prev = LogId::default();
            self.phase = Phase::CatchUp;
            return;
        }
        match self.storage.read_entry(self.next_index - 1).await {
            Ok(Some(entry)) => {
                self.prev = entry.log_id;
                self.phase = Phase::CatchUp;
            }
            Ok(None) => self.phase = Phase::Snapshot,
            Err(err) => {
                tracing::error!(error=%err, "storage failed while re-anchoring the probe");
                self.report(ReplicaReport::Fatal);
                self.phase = Phase::Closed;
            }
        }
    }

    /// An empty exchange whose only purpose is finding out whether we are still the leader;
    /// conflicts are ignored, higher terms are not.
    async fn assert_authority(&mut self) {
        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.prev,
            entries: vec![],
            leader_commit: self.commit_index,
        };
        if let Ok(res) = self.transport_append(rpc).await {
            if res.term > self.term {
                self.report(ReplicaReport::HigherTerm {
                    target: self.target,
                    term: res.term,
                });
                self.phase = Phase::Closed;
            }
        }
    }

    /// Ship the given snapshot chunk by chunk, then drop back to catch-up (§7).
    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn stream_snapshot(&mut self, mut snapshot: Snapshot<S::SnapshotData>) {
        let total = match snapshot.snapshot.seek(SeekFrom::End(0)).await {
            Ok(total) => total,
            Err(err) => {
                tracing::warn!(error=%err, "could not size the snapshot; will re-request");
                return;
            }
        };

        let mut offset = 0u64;
        let mut chunk = Vec::with_capacity(self.config.snapshot_max_chunk_size as usize);

        loop {
            if self.phase != Phase::Snapshot {
                return;
            }

            let read = async {
                snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
                snapshot.snapshot.read_buf(&mut chunk).await
            }
            .await;
            let n = match read {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(error=%err, "error reading snapshot bytes; will re-request");
                    return;
                }
            };

            let done = offset + n as u64 == total;
            let rpc = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: snapshot.meta.clone(),
                offset,
                data: chunk[..n].to_vec(),
                done,
            };
            chunk.clear();

            tracing::debug!(offset, len = n, total, done, "shipping snapshot chunk");

            // Chunks go strictly in order; the receiver refuses gaps, so a failed chunk is
            // simply sent again at the same offset.
            match self.transport_snapshot(rpc).await {
                Err(err) => {
                    tracing::warn!(error=%err, "snapshot chunk failed; resending");
                    continue;
                }
                Ok(res) => {
                    if res.term > self.term {
                        self.report(ReplicaReport::HigherTerm {
                            target: self.target,
                            term: res.term,
                        });
                        self.phase = Phase::Closed;
                        return;
                    }
                    if done {
                        // The target now holds everything the snapshot covers.
                        self.prev = snapshot.meta.last_log_id;
                        self.next_index = self.prev.index + 1;
                        self.report(ReplicaReport::Progress {
                            target: self.target,
                            matched: self.prev,
                        });
                        self.phase = Phase::CatchUp;
                        return;
                    }
                    offset += n as u64;
                }
            }

            self.absorb_ready();
        }
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Transport, with retry and classification.

    async fn transport_append(&mut self, rpc: AppendEntriesRequest<D>) -> anyhow::Result<AppendEntriesResponse> {
        let (network, target, ttl) = (self.network.clone(), self.target, self.rpc_timeout);
        let res = self
            .config
            .retry_policy
            .retry("append_entries", || {
                let rpc = rpc.clone();
                let network = network.clone();
                async move {
                    match timeout(ttl, network.send_append_entries(target, rpc)).await {
                        Ok(res) => res,
                        Err(_elapsed) => Err(anyhow::Error::new(NetworkError::Timeout)),
                    }
                }
            })
            .await;
        self.note_exchange(&res);
        res
    }

    async fn transport_snapshot(&mut self, rpc: InstallSnapshotRequest) -> anyhow::Result<crate::msg::InstallSnapshotResponse> {
        let (network, target, ttl) = (self.network.clone(), self.target, self.chunk_timeout);
        let res = self
            .config
            .retry_policy
            .retry("install_snapshot", || {
                let rpc = rpc.clone();
                let network = network.clone();
                async move {
                    match timeout(ttl, network.send_install_snapshot(target, rpc)).await {
                        Ok(res) => res,
                        Err(_elapsed) => Err(anyhow::Error::new(NetworkError::Timeout)),
                    }
                }
            })
            .await;
        self.note_exchange(&res);
        res
    }

    /// Track the exchange outcome in the sliding error window behind the partition heuristic.
    fn note_exchange<T>(&mut self, res: &anyhow::Result<T>) {
        match res {
            Ok(_) => {
                self.errors.record_success();
                if self.partition_flagged {
                    self.partition_flagged = false;
                    self.report(ReplicaReport::Partition {
                        target: self.target,
                        suspected: false,
                    });
                }
            }
            Err(err) => {
                let category = retry::classify(err);
                tracing::warn!(error=%err, ?category, target=self.target, "exchange with target failed");
                self.errors.record(category);
                if self.errors.suspects_partition() && !self.partition_flagged {
                    self.partition_flagged = true;
                    tracing::warn!(target = self.target, "error window filled with timeouts, partition suspected");
                    self.report(ReplicaReport::Partition {
                        target: self.target,
                        suspected: true,
                    });
                }
            }
        }
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Bookkeeping.

    /// Fill `inflight` from storage with the batch starting at `next_index`, bounded by
    /// `limit` and the batch size. False when the phase changed instead: the range is
    /// compacted away (snapshot) or storage failed (closed).
    async fn load_batch_upto(&mut self, limit: u64) -> bool {
        let from = self.next_index;
        let to = std::cmp::min(limit, from + self.batch_limit as u64 - 1);
        let entries = match self.storage.read_log(from..to + 1).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "storage failed while loading a replication batch");
                self.report(ReplicaReport::Fatal);
                self.phase = Phase::Closed;
                return false;
            }
        };

        // A short range means its low end is under the snapshot boundary.
        if entries.first().map(|ent| ent.log_id.index) != Some(from) {
            self.phase = Phase::Snapshot;
            return false;
        }

        self.inflight = entries;
        true
    }

    /// Our last index holding `term`, if any. Terms never decrease along the log, so the
    /// backwards walk stops at the first entry below the searched term.
    async fn last_index_of_term(&self, term: u64) -> anyhow::Result<Option<u64>> {
        let mut index = self.leader_last;
        while index > 0 {
            match self.storage.read_entry(index).await? {
                None => return Ok(None), // Compacted below this point.
                Some(entry) if entry.log_id.term == term => return Ok(Some(index)),
                Some(entry) if entry.log_id.term < term => return Ok(None),
                Some(_) => index -= 1,
            }
        }
        Ok(None)
    }

    /// Whether the target is so far behind that streaming a snapshot beats replaying the log.
    fn snapshot_needed(&self) -> bool {
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        self.commit_index.saturating_sub(self.prev.index) >= *threshold
    }

    /// Apply one directive from the leader.
    fn absorb(&mut self, directive: Directive<D>) {
        match directive {
            Directive::Entry { entry, commit_index } => {
                self.commit_index = commit_index;
                self.leader_last = entry.log_id.index;
                // Only a task in step buffers entries; a task behind re-reads from storage.
                if self.phase == Phase::Steady {
                    self.queue.push_back(entry);
                }
            }
            Directive::Commit(index) => self.commit_index = index,
            Directive::Beat => self.beat_now = true,
            Directive::Stop => self.phase = Phase::Closed,
        }
    }

    /// Drain whatever directives are already waiting, without blocking.
    fn absorb_ready(&mut self) {
        // Bounded so a hot feed cannot starve the exchange loop.
        for _ in 0..self.batch_limit.max(16) {
            match self.rx.recv().now_or_never() {
                Some(Some((directive, span))) => {
                    let _ent = span.enter();
                    self.absorb(directive);
                }
                Some(None) => {
                    self.phase = Phase::Closed;
                    return;
                }
                None => return,
            }
        }
    }
}
