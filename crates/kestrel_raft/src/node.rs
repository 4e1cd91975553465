//! The consensus actor.
//!
//! One `RaftNode` task owns all state for a cluster member. Peer RPCs,
//! proposals, membership changes, and queries all arrive as [`RaftCommand`]
//! messages carrying `oneshot` responders; the `run` loop multiplexes them
//! with election and heartbeat timers. Anything the node promises over an
//! RPC (term, vote, log entries) hits the WAL before the response leaves.
//! A WAL or snapshot persistence failure halts the node: continuing without
//! durable state would let it break promises after a restart.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::config::KestrelConfig;
use kestrel_common::error::{ErrorKind, KestrelError, KestrelResult, RaftError};
use kestrel_common::types::{LogIndex, NodeId, NodeRole, NodeStatus, Term};
use kestrel_storage::{SyncMode, WalReader, WalRecord, WalWriter};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};

use crate::log::{EntryPayload, LogEntry, RaftLog};
use crate::membership::ClusterConfig;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftTransport, RequestVoteRequest, RequestVoteResponse,
};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::state::RaftState;
use crate::StateMachine;

/// Runtime parameters for one node.
#[derive(Debug, Clone)]
pub struct RaftNodeConfig {
    pub node_id: NodeId,
    /// Initial voting members, used only when no durable config exists yet.
    pub voters: Vec<NodeId>,
    pub data_dir: PathBuf,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub max_entries_per_append: usize,
    pub rpc_timeout: Duration,
    /// How long a proposal may wait for commitment before failing with
    /// `QuorumUnavailable`.
    pub proposal_timeout: Duration,
    /// Applied entries between snapshots; 0 disables snapshotting.
    pub snapshot_interval_entries: u64,
    /// Entries kept in the log behind the snapshot point for catch-up.
    pub log_retain_entries: u64,
    pub wal_sync: SyncMode,
    pub wal_segment_size: u64,
}

impl Default for RaftNodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            voters: vec![1],
            data_dir: PathBuf::from("./kestrel-data"),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 128,
            rpc_timeout: Duration::from_millis(100),
            proposal_timeout: Duration::from_millis(3000),
            snapshot_interval_entries: 10_000,
            log_retain_entries: 1_000,
            wal_sync: SyncMode::FSync,
            wal_segment_size: 64 * 1024 * 1024,
        }
    }
}

impl RaftNodeConfig {
    /// Derive node parameters from the application config.
    pub fn from_config(config: &KestrelConfig, voters: Vec<NodeId>) -> Self {
        Self {
            node_id: config.node.node_id,
            voters,
            data_dir: PathBuf::from(&config.node.data_dir),
            election_timeout_min: Duration::from_millis(config.raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(config.raft.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(config.raft.heartbeat_interval_ms),
            max_entries_per_append: config.raft.max_entries_per_append,
            rpc_timeout: Duration::from_millis(config.raft.heartbeat_interval_ms.max(50) * 2),
            proposal_timeout: Duration::from_millis(config.raft.proposal_timeout_ms),
            snapshot_interval_entries: config.snapshot.snapshot_interval_entries,
            log_retain_entries: config.snapshot.log_retain_entries,
            wal_sync: SyncMode::parse(&config.wal.sync_mode).unwrap_or(SyncMode::FSync),
            wal_segment_size: config.wal.segment_size_bytes,
        }
    }
}

/// Messages accepted by the node task.
pub enum RaftCommand {
    Propose {
        data: Vec<u8>,
        response: oneshot::Sender<KestrelResult<LogIndex>>,
    },
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Linearizable read fence: resolves with an index once leadership is
    /// confirmed by a quorum round and the state machine has caught up to it.
    ReadIndex {
        response: oneshot::Sender<KestrelResult<LogIndex>>,
    },
    AddNode {
        node_id: NodeId,
        response: oneshot::Sender<KestrelResult<LogIndex>>,
    },
    RemoveNode {
        node_id: NodeId,
        response: oneshot::Sender<KestrelResult<LogIndex>>,
    },
    Status {
        response: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Cheap cloneable client for a running node task.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<RaftCommand>,
}

impl RaftHandle {
    pub fn new(tx: mpsc::Sender<RaftCommand>) -> Self {
        Self { tx }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<KestrelResult<T>>) -> RaftCommand,
    ) -> KestrelResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| KestrelError::Raft(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| KestrelError::Raft(RaftError::ShuttingDown))?
    }

    /// Replicate a command; resolves with its log index once applied.
    pub async fn propose(&self, data: Vec<u8>) -> KestrelResult<LogIndex> {
        self.call(|response| RaftCommand::Propose { data, response }).await
    }

    pub async fn read_index(&self) -> KestrelResult<LogIndex> {
        self.call(|response| RaftCommand::ReadIndex { response }).await
    }

    pub async fn add_node(&self, node_id: NodeId) -> KestrelResult<LogIndex> {
        self.call(|response| RaftCommand::AddNode { node_id, response }).await
    }

    pub async fn remove_node(&self, node_id: NodeId) -> KestrelResult<LogIndex> {
        self.call(|response| RaftCommand::RemoveNode { node_id, response }).await
    }

    pub async fn status(&self) -> KestrelResult<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RaftCommand::Status { response: tx })
            .await
            .map_err(|_| KestrelError::Raft(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| KestrelError::Raft(RaftError::ShuttingDown))
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RaftCommand::Shutdown).await;
    }
}

struct ProposalWaiter {
    term: Term,
    deadline: Instant,
    tx: oneshot::Sender<KestrelResult<LogIndex>>,
}

enum Outbound {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

enum PeerReply {
    Append(AppendEntriesResponse),
    Snapshot(InstallSnapshotResponse),
}

/// One cluster member's consensus state and event loop.
pub struct RaftNode<S: StateMachine> {
    config: RaftNodeConfig,
    state: RaftState,
    log: RaftLog,
    /// Effective membership: the latest config entry in the log, or the
    /// one carried by the newest snapshot.
    cluster: ClusterConfig,
    config_index: LogIndex,
    /// Config as of the snapshot point, the fallback when a truncation
    /// removes the entry `cluster` came from.
    base_config: ClusterConfig,
    base_config_index: LogIndex,
    snapshot_index: LogIndex,
    wal: WalWriter,
    snapshots: SnapshotStore,
    state_machine: S,
    transport: Arc<dyn RaftTransport>,
    command_tx: mpsc::Sender<RaftCommand>,
    proposal_waiters: BTreeMap<LogIndex, ProposalWaiter>,
    pending_reads: Vec<(LogIndex, oneshot::Sender<KestrelResult<LogIndex>>)>,
}

impl<S: StateMachine> RaftNode<S> {
    /// Open (or recover) a node. Replays the WAL and the newest snapshot to
    /// rebuild the log, hard state, and membership before any timer starts.
    pub fn new(
        config: RaftNodeConfig,
        transport: Arc<dyn RaftTransport>,
        mut state_machine: S,
    ) -> KestrelResult<(Self, mpsc::Receiver<RaftCommand>)> {
        let wal_dir = config.data_dir.join("wal");
        let replay = WalReader::new(&wal_dir).read_all()?;
        let (mut log, term, voted_for) = RaftLog::rebuild(&replay)?;

        let snapshots = SnapshotStore::open(&config.data_dir.join("snapshot"))?;
        let mut base_config = ClusterConfig::single(config.voters.iter().copied());
        let mut base_config_index = 0;
        let mut snapshot_index = 0;
        if let Some(snapshot) = snapshots.load()? {
            if state_machine.applied_index() < snapshot.last_included_index {
                state_machine.restore(&snapshot.data, snapshot.last_included_index)?;
            }
            log.compact(snapshot.last_included_index, snapshot.last_included_term);
            base_config = snapshot.config;
            base_config_index = snapshot.last_included_index;
            snapshot_index = snapshot.last_included_index;
        }

        let mut cluster = base_config.clone();
        let mut config_index = base_config_index;
        if let Some((index, cfg)) = log.latest_config() {
            if index > config_index {
                cluster = cfg;
                config_index = index;
            }
        }

        let wal =
            WalWriter::open_with_options(&wal_dir, config.wal_sync, config.wal_segment_size)?;

        let mut state = RaftState::new(config.node_id);
        state.current_term = term;
        state.voted_for = voted_for;
        // Applied entries were committed before the crash; replay resumes
        // above them.
        let applied = state_machine.applied_index().max(snapshot_index);
        state.commit_index = applied;
        state.last_applied = applied;

        tracing::info!(
            node_id = config.node_id,
            term,
            last_log_index = log.last_index(),
            applied,
            "raft node recovered"
        );

        let (command_tx, command_rx) = mpsc::channel(256);
        let node = Self {
            config,
            state,
            log,
            cluster,
            config_index,
            base_config,
            base_config_index,
            snapshot_index,
            wal,
            snapshots,
            state_machine,
            transport,
            command_tx,
            proposal_waiters: BTreeMap::new(),
            pending_reads: Vec::new(),
        };
        Ok((node, command_rx))
    }

    pub fn handle(&self) -> RaftHandle {
        RaftHandle::new(self.command_tx.clone())
    }

    pub fn command_sender(&self) -> mpsc::Sender<RaftCommand> {
        self.command_tx.clone()
    }

    /// Run until shutdown or a fatal persistence failure.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<RaftCommand>) {
        tracing::info!(node_id = self.config.node_id, "raft node started");
        if let Err(e) = self.run_loop(&mut command_rx).await {
            e.log_if_fatal();
            tracing::error!(
                node_id = self.config.node_id,
                error = %e,
                "raft node halted"
            );
        }
        self.fail_waiters();
        tracing::info!(node_id = self.config.node_id, "raft node stopped");
    }

    async fn run_loop(
        &mut self,
        command_rx: &mut mpsc::Receiver<RaftCommand>,
    ) -> KestrelResult<()> {
        let mut election_deadline = self.next_election_deadline();
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let is_leader = self.state.is_leader();

            tokio::select! {
                maybe_cmd = command_rx.recv() => {
                    let Some(cmd) = maybe_cmd else { return Ok(()) };
                    match cmd {
                        RaftCommand::Shutdown => return Ok(()),
                        RaftCommand::Propose { data, response } => {
                            match self.propose_payload(EntryPayload::Command(data)).await {
                                Ok(index) => self.register_waiter(index, response),
                                Err(e) => self.reject_proposal(response, e)?,
                            }
                        }
                        RaftCommand::AddNode { node_id, response } => {
                            match self.handle_membership_change(node_id, true).await {
                                Ok(index) => self.register_waiter(index, response),
                                Err(e) => self.reject_proposal(response, e)?,
                            }
                        }
                        RaftCommand::RemoveNode { node_id, response } => {
                            match self.handle_membership_change(node_id, false).await {
                                Ok(index) => self.register_waiter(index, response),
                                Err(e) => self.reject_proposal(response, e)?,
                            }
                        }
                        RaftCommand::RequestVote { request, response } => {
                            let reply = self.handle_request_vote(request)?;
                            if reply.vote_granted {
                                election_deadline = self.next_election_deadline();
                            }
                            let _ = response.send(reply);
                        }
                        RaftCommand::AppendEntries { request, response } => {
                            let reply = self.handle_append_entries(request)?;
                            // Any reply acknowledging a live leader defers
                            // the next election, including consistency
                            // rejections during backtracking.
                            if reply.success || reply.conflict_index.is_some() {
                                election_deadline = self.next_election_deadline();
                            }
                            let _ = response.send(reply);
                        }
                        RaftCommand::InstallSnapshot { request, response } => {
                            let reply = self.handle_install_snapshot(request)?;
                            election_deadline = self.next_election_deadline();
                            let _ = response.send(reply);
                        }
                        RaftCommand::ReadIndex { response } => {
                            self.handle_read_index(response).await?;
                        }
                        RaftCommand::Status { response } => {
                            let _ = response.send(self.status());
                        }
                    }
                }

                _ = heartbeat.tick(), if is_leader => {
                    self.replicate_to_all().await?;
                }

                _ = sleep_until(election_deadline), if !is_leader => {
                    self.start_election().await?;
                    election_deadline = self.next_election_deadline();
                }
            }

            self.apply_committed_entries()?;
            self.expire_proposals();
            self.maybe_snapshot()?;
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.state.node_id,
            role: self.state.role,
            term: self.state.current_term,
            leader_hint: self.state.leader_hint,
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_index: self.log.last_index(),
            voters: self.cluster.voters().into_iter().collect(),
        }
    }

    fn next_election_deadline(&self) -> Instant {
        let timeout = rand::thread_rng()
            .gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Instant::now() + timeout
    }

    // ---- proposals ----

    async fn propose_payload(&mut self, payload: EntryPayload) -> KestrelResult<LogIndex> {
        let index = self.append_leader_entry(payload)?;
        self.replicate_to_all().await?;
        Ok(index)
    }

    /// Append an entry to the leader's own log, durably, without waiting
    /// for replication (the next heartbeat carries it).
    fn append_leader_entry(&mut self, payload: EntryPayload) -> KestrelResult<LogIndex> {
        if !self.state.is_leader() {
            return Err(KestrelError::Raft(RaftError::NotLeader {
                leader_hint: self.state.leader_hint,
            }));
        }
        let index = self.log.last_index() + 1;
        let term = self.state.current_term;
        let entry = LogEntry::new(term, index, payload);
        self.wal.append_durable(&WalRecord::Append {
            index,
            term,
            payload: entry.encode_payload()?,
        })?;
        self.log.append(entry.clone())?;
        if let EntryPayload::Config(cfg) = entry.payload {
            self.adopt_config(index, cfg);
        }
        Ok(index)
    }

    fn register_waiter(
        &mut self,
        index: LogIndex,
        response: oneshot::Sender<KestrelResult<LogIndex>>,
    ) {
        if index <= self.state.last_applied {
            let _ = response.send(Ok(index));
            return;
        }
        let term = self.state.current_term;
        let deadline = Instant::now() + self.config.proposal_timeout;
        self.proposal_waiters.insert(
            index,
            ProposalWaiter {
                term,
                deadline,
                tx: response,
            },
        );
    }

    /// Fail proposals that outlived the commit window. The entry may still
    /// commit later; the caller retried or gave up either way.
    fn expire_proposals(&mut self) {
        let now = Instant::now();
        let expired: Vec<LogIndex> = self
            .proposal_waiters
            .iter()
            .filter(|(_, w)| w.deadline <= now)
            .map(|(&index, _)| index)
            .collect();
        if expired.is_empty() {
            return;
        }

        let voters = self.cluster.voters();
        let needed = self.cluster.quorum_size();
        let me = self.state.node_id;
        for index in expired {
            let reached = match &self.state.leader {
                Some(leader) => {
                    1 + voters
                        .iter()
                        .filter(|&&id| {
                            id != me
                                && leader.match_index.get(&id).copied().unwrap_or(0) >= index
                        })
                        .count()
                }
                None => 1,
            };
            if let Some(waiter) = self.proposal_waiters.remove(&index) {
                let _ = waiter
                    .tx
                    .send(Err(KestrelError::Raft(RaftError::QuorumUnavailable {
                        reached,
                        needed,
                        index,
                    })));
            }
        }
    }

    fn reject_proposal(
        &mut self,
        response: oneshot::Sender<KestrelResult<LogIndex>>,
        error: KestrelError,
    ) -> KestrelResult<()> {
        if matches!(error.kind(), ErrorKind::Fatal | ErrorKind::Corruption) {
            let _ = response.send(Err(KestrelError::Internal(
                "node halting after persistence failure".into(),
            )));
            return Err(error);
        }
        let _ = response.send(Err(error));
        Ok(())
    }

    fn fail_waiters(&mut self) {
        let hint = self.state.leader_hint;
        for (_, waiter) in std::mem::take(&mut self.proposal_waiters) {
            let _ = waiter
                .tx
                .send(Err(KestrelError::Raft(RaftError::NotLeader {
                    leader_hint: hint,
                })));
        }
        for (_, tx) in self.pending_reads.drain(..) {
            let _ = tx.send(Err(KestrelError::Raft(RaftError::NotLeader {
                leader_hint: hint,
            })));
        }
    }

    // ---- membership ----

    async fn handle_membership_change(
        &mut self,
        node_id: NodeId,
        add: bool,
    ) -> KestrelResult<LogIndex> {
        if !self.state.is_leader() {
            return Err(KestrelError::Raft(RaftError::NotLeader {
                leader_hint: self.state.leader_hint,
            }));
        }
        let ClusterConfig::Single(current) = &self.cluster else {
            return Err(KestrelError::Raft(RaftError::ConfigChangeInProgress));
        };

        let mut target = current.clone();
        if add {
            if !target.insert(node_id) {
                return Err(KestrelError::Raft(RaftError::InvalidMembershipChange {
                    node_id,
                    reason: "already a voter",
                }));
            }
        } else {
            if !target.remove(&node_id) {
                return Err(KestrelError::Raft(RaftError::NodeNotFound(node_id)));
            }
            if target.is_empty() {
                return Err(KestrelError::Raft(RaftError::InvalidMembershipChange {
                    node_id,
                    reason: "cannot remove the last voter",
                }));
            }
        }

        let joint = self
            .cluster
            .enter_joint(target)
            .ok_or(KestrelError::Raft(RaftError::ConfigChangeInProgress))?;
        self.propose_payload(EntryPayload::Config(joint)).await
    }

    fn adopt_config(&mut self, index: LogIndex, cfg: ClusterConfig) {
        tracing::info!(
            node_id = self.state.node_id,
            index,
            config = ?cfg,
            "adopting cluster configuration"
        );
        let last_index = self.log.last_index();
        let me = self.state.node_id;
        if let Some(leader) = self.state.leader.as_mut() {
            for peer in cfg.voters() {
                if peer != me {
                    leader.ensure_peer(peer, last_index);
                }
            }
        }
        self.cluster = cfg;
        self.config_index = index;
    }

    /// A truncation may have removed the entry the effective config came
    /// from; fall back to the newest surviving one.
    fn refresh_config_after_truncate(&mut self) {
        if self.config_index <= self.log.last_index() {
            return;
        }
        if let Some((index, cfg)) = self.log.latest_config() {
            self.cluster = cfg;
            self.config_index = index;
        } else {
            self.cluster = self.base_config.clone();
            self.config_index = self.base_config_index;
        }
    }

    /// Drive the two-phase change forward once entries commit: a committed
    /// joint config gets its final single config appended; a committed final
    /// config that excludes this leader makes it step down.
    fn continue_config_change(&mut self) -> KestrelResult<()> {
        if !self.state.is_leader() || self.config_index > self.state.commit_index {
            return Ok(());
        }
        if let Some(final_cfg) = self.cluster.finalize() {
            let index = self.append_leader_entry(EntryPayload::Config(final_cfg))?;
            tracing::info!(
                node_id = self.state.node_id,
                index,
                "joint configuration committed, appending final configuration"
            );
        } else if !self.cluster.contains(self.state.node_id) {
            tracing::info!(
                node_id = self.state.node_id,
                "removed from cluster, stepping down"
            );
            let term = self.state.current_term;
            self.step_down(term, None);
        }
        Ok(())
    }

    // ---- elections ----

    async fn start_election(&mut self) -> KestrelResult<()> {
        if !self.cluster.contains(self.state.node_id) {
            // A removed node must not disrupt the cluster.
            return Ok(());
        }
        self.state.become_candidate();
        self.persist_hard_state()?;

        let term = self.state.current_term;
        let request = RequestVoteRequest {
            term,
            candidate_id: self.state.node_id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        let me = self.state.node_id;
        let peers: Vec<NodeId> = self
            .cluster
            .voters()
            .into_iter()
            .filter(|&p| p != me)
            .collect();

        let rpc_timeout = self.config.rpc_timeout;
        let mut vote_futures = Vec::new();
        for peer in peers {
            let transport = Arc::clone(&self.transport);
            let req = request.clone();
            vote_futures.push(async move {
                match timeout(rpc_timeout, transport.request_vote(peer, req)).await {
                    Ok(Ok(resp)) => Some((peer, resp)),
                    _ => None,
                }
            });
        }
        let results = futures::future::join_all(vote_futures).await;

        let mut granted: HashSet<NodeId> = HashSet::new();
        granted.insert(me);
        for result in results.into_iter().flatten() {
            let (peer, resp) = result;
            if resp.term > self.state.current_term {
                self.step_down(resp.term, None);
                self.persist_hard_state()?;
                return Ok(());
            }
            if resp.vote_granted {
                granted.insert(peer);
            }
        }

        if self.state.role != NodeRole::Candidate || self.state.current_term != term {
            return Ok(());
        }
        if self.cluster.has_quorum(|id| granted.contains(&id)) {
            let last_index = self.log.last_index();
            let peers: Vec<NodeId> = self
                .cluster
                .voters()
                .into_iter()
                .filter(|&p| p != me)
                .collect();
            self.state.become_leader(peers, last_index);
            // NoOp from the new term so prior-term entries can commit.
            self.append_leader_entry(EntryPayload::NoOp)?;
            self.replicate_to_all().await?;
        }
        Ok(())
    }

    fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> KestrelResult<RequestVoteResponse> {
        let mut persist = false;
        if request.term > self.state.current_term {
            self.step_down(request.term, None);
            persist = true;
        }

        let vote_granted = request.term == self.state.current_term
            && (self.state.voted_for.is_none()
                || self.state.voted_for == Some(request.candidate_id))
            && self
                .log
                .is_up_to_date(request.last_log_index, request.last_log_term);

        if vote_granted && self.state.voted_for != Some(request.candidate_id) {
            self.state.voted_for = Some(request.candidate_id);
            persist = true;
        }
        if persist {
            // The vote is a promise; it must survive a restart.
            self.persist_hard_state()?;
        }

        tracing::debug!(
            node_id = self.state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "handled vote request"
        );
        Ok(RequestVoteResponse {
            term: self.state.current_term,
            vote_granted,
        })
    }

    // ---- replication (leader side) ----

    async fn replicate_to_all(&mut self) -> KestrelResult<HashSet<NodeId>> {
        let me = self.state.node_id;
        let mut acks: HashSet<NodeId> = HashSet::new();
        acks.insert(me);
        if !self.state.is_leader() {
            return Ok(acks);
        }

        let term = self.state.current_term;
        let commit = self.state.commit_index;
        let last_index = self.log.last_index();
        let peers: Vec<NodeId> = self
            .cluster
            .voters()
            .into_iter()
            .filter(|&p| p != me)
            .collect();

        let mut outbound: Vec<(NodeId, Outbound)> = Vec::new();
        for peer in peers {
            let next = {
                let Some(leader) = self.state.leader.as_mut() else {
                    return Ok(acks);
                };
                leader.ensure_peer(peer, last_index);
                leader.next_index.get(&peer).copied().unwrap_or(last_index + 1)
            };

            let entries = match self
                .log
                .entries_from_checked(next, self.config.max_entries_per_append)
            {
                Ok(entries) => entries,
                Err(compacted) => {
                    // The entries this follower needs are gone; ship the
                    // snapshot.
                    match self.snapshots.load() {
                        Ok(Some(snapshot)) => outbound.push((
                            peer,
                            Outbound::Snapshot(InstallSnapshotRequest {
                                term,
                                leader_id: me,
                                snapshot,
                            }),
                        )),
                        Ok(None) => tracing::warn!(
                            peer,
                            error = %compacted,
                            "no snapshot covers the compacted prefix"
                        ),
                        Err(e) => tracing::warn!(
                            peer,
                            error = %e,
                            "failed to load snapshot for lagging follower"
                        ),
                    }
                    continue;
                }
            };

            let prev_log_index = next - 1;
            let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
            outbound.push((
                peer,
                Outbound::Append(AppendEntriesRequest {
                    term,
                    leader_id: me,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: commit,
                }),
            ));
        }

        let rpc_timeout = self.config.rpc_timeout;
        let mut reply_futures = Vec::new();
        for (peer, request) in outbound {
            let transport = Arc::clone(&self.transport);
            reply_futures.push(async move {
                let reply = match request {
                    Outbound::Append(req) => {
                        match timeout(rpc_timeout, transport.append_entries(peer, req)).await {
                            Ok(Ok(resp)) => Some(PeerReply::Append(resp)),
                            _ => None,
                        }
                    }
                    Outbound::Snapshot(req) => {
                        // Full-state transfer gets a longer budget.
                        match timeout(rpc_timeout * 4, transport.install_snapshot(peer, req))
                            .await
                        {
                            Ok(Ok(resp)) => Some(PeerReply::Snapshot(resp)),
                            _ => None,
                        }
                    }
                };
                (peer, reply)
            });
        }
        let results = futures::future::join_all(reply_futures).await;

        for (peer, reply) in results {
            let Some(reply) = reply else { continue };
            match reply {
                PeerReply::Append(resp) => {
                    if resp.term > self.state.current_term {
                        self.step_down(resp.term, None);
                        self.persist_hard_state()?;
                        return Ok(acks);
                    }
                    if !self.state.is_leader() {
                        return Ok(acks);
                    }
                    if let Some(leader) = self.state.leader.as_mut() {
                        if resp.success {
                            leader.update_match(peer, resp.match_index);
                            acks.insert(peer);
                        } else {
                            let fallback = leader
                                .next_index
                                .get(&peer)
                                .copied()
                                .unwrap_or(2)
                                .saturating_sub(1);
                            leader.rewind_next(peer, resp.conflict_index.unwrap_or(fallback));
                        }
                    }
                }
                PeerReply::Snapshot(resp) => {
                    if resp.term > self.state.current_term {
                        self.step_down(resp.term, None);
                        self.persist_hard_state()?;
                        return Ok(acks);
                    }
                    if let Some(leader) = self.state.leader.as_mut() {
                        leader.update_match(peer, resp.match_index);
                        acks.insert(peer);
                    }
                }
            }
        }

        self.advance_commit()?;
        Ok(acks)
    }

    /// Move the commit index to the highest current-term entry replicated
    /// on a quorum. Prior-term entries commit only transitively.
    fn advance_commit(&mut self) -> KestrelResult<()> {
        if !self.state.is_leader() {
            return Ok(());
        }
        let me = self.state.node_id;
        let match_index = match &self.state.leader {
            Some(leader) => leader.match_index.clone(),
            None => return Ok(()),
        };

        let mut new_commit = self.state.commit_index;
        for index in (self.state.commit_index + 1)..=self.log.last_index() {
            if self.log.term_at(index) != Some(self.state.current_term) {
                continue;
            }
            let replicated = |id: NodeId| {
                id == me || match_index.get(&id).copied().unwrap_or(0) >= index
            };
            if self.cluster.has_quorum(replicated) {
                new_commit = index;
            }
        }

        if new_commit > self.state.commit_index {
            self.state.commit_index = new_commit;
            tracing::debug!(
                node_id = me,
                commit_index = new_commit,
                "commit index advanced"
            );
            self.continue_config_change()?;
        }
        Ok(())
    }

    // ---- replication (follower side) ----

    /// Record a rejected stale-term RPC. The failure response carries our
    /// term, which refreshes the sender.
    fn note_stale_term(&self, rpc: &'static str, observed: Term) {
        let rejection = RaftError::TermMismatch {
            observed,
            current: self.state.current_term,
        };
        tracing::debug!(
            node_id = self.state.node_id,
            rpc,
            error = %rejection,
            "rejected stale-term rpc"
        );
    }

    fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> KestrelResult<AppendEntriesResponse> {
        if request.term > self.state.current_term {
            self.step_down(request.term, Some(request.leader_id));
            self.persist_hard_state()?;
        }
        if request.term < self.state.current_term {
            self.note_stale_term("append_entries", request.term);
            return Ok(AppendEntriesResponse {
                term: self.state.current_term,
                success: false,
                match_index: 0,
                conflict_index: None,
            });
        }
        // A current-term AppendEntries settles any election in progress.
        if self.state.role != NodeRole::Follower {
            self.step_down(request.term, Some(request.leader_id));
        }
        self.state.leader_hint = Some(request.leader_id);

        if !self.log.matches(request.prev_log_index, request.prev_log_term) {
            // Tell the leader where to retry: the first index of the
            // conflicting term, or just past our log if we are short.
            let conflict_index = match self.log.term_at(request.prev_log_index) {
                Some(conflicting_term) => {
                    let mut index = request.prev_log_index;
                    while index > self.log.first_index()
                        && self.log.term_at(index - 1) == Some(conflicting_term)
                    {
                        index -= 1;
                    }
                    index
                }
                None => self.log.last_index() + 1,
            };
            return Ok(AppendEntriesResponse {
                term: self.state.current_term,
                success: false,
                match_index: 0,
                conflict_index: Some(conflict_index),
            });
        }

        // Only the prefix up to the last entry in this request has been
        // consistency-checked; commit advancement and the reported match
        // must not run past it, or a stale uncommitted suffix we still
        // hold would count as replicated.
        let last_new_index = request.prev_log_index + request.entries.len() as u64;

        let mut wrote = false;
        for entry in request.entries {
            if entry.index < self.log.first_index() {
                // Already covered by our snapshot; a late retransmission.
                continue;
            }
            if entry.index <= self.log.last_index() {
                if self.log.term_at(entry.index) == Some(entry.term) {
                    continue;
                }
                // Conflict: ours is from a deposed leader.
                self.wal.append(&WalRecord::Truncate { from: entry.index })?;
                self.log.truncate_from(entry.index);
                self.refresh_config_after_truncate();
                wrote = true;
            }
            self.wal.append(&WalRecord::Append {
                index: entry.index,
                term: entry.term,
                payload: entry.encode_payload()?,
            })?;
            self.log.append(entry.clone())?;
            if let EntryPayload::Config(cfg) = entry.payload {
                self.adopt_config(entry.index, cfg);
            }
            wrote = true;
        }
        if wrote {
            // Durable before the success response: the leader counts this
            // toward commitment.
            self.wal.sync()?;
        }

        let new_commit = request.leader_commit.min(last_new_index);
        if new_commit > self.state.commit_index {
            self.state.commit_index = new_commit;
        }

        Ok(AppendEntriesResponse {
            term: self.state.current_term,
            success: true,
            match_index: last_new_index,
            conflict_index: None,
        })
    }

    fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> KestrelResult<InstallSnapshotResponse> {
        if request.term > self.state.current_term {
            self.step_down(request.term, Some(request.leader_id));
            self.persist_hard_state()?;
        }
        if request.term < self.state.current_term {
            self.note_stale_term("install_snapshot", request.term);
            return Ok(InstallSnapshotResponse {
                term: self.state.current_term,
                match_index: 0,
            });
        }
        if self.state.role != NodeRole::Follower {
            self.step_down(request.term, Some(request.leader_id));
        }
        self.state.leader_hint = Some(request.leader_id);

        let snapshot = request.snapshot;
        if snapshot.last_included_index <= self.state.last_applied {
            // Already past this point; nothing to install.
            return Ok(InstallSnapshotResponse {
                term: self.state.current_term,
                match_index: self.state.last_applied,
            });
        }

        tracing::info!(
            node_id = self.state.node_id,
            last_included_index = snapshot.last_included_index,
            size = snapshot.data.len(),
            "installing snapshot from leader"
        );

        self.snapshots.save(&snapshot)?;
        self.state_machine
            .restore(&snapshot.data, snapshot.last_included_index)?;
        self.log
            .compact(snapshot.last_included_index, snapshot.last_included_term);

        self.base_config = snapshot.config.clone();
        self.base_config_index = snapshot.last_included_index;
        if self.config_index <= snapshot.last_included_index {
            self.cluster = snapshot.config;
            self.config_index = snapshot.last_included_index;
        }

        self.snapshot_index = snapshot.last_included_index;
        self.state.commit_index = self
            .state
            .commit_index
            .max(snapshot.last_included_index);
        self.state.last_applied = snapshot.last_included_index;

        self.checkpoint_wal(snapshot.last_included_index, snapshot.last_included_term)?;

        Ok(InstallSnapshotResponse {
            term: self.state.current_term,
            match_index: self.log.last_index(),
        })
    }

    // ---- reads ----

    async fn handle_read_index(
        &mut self,
        response: oneshot::Sender<KestrelResult<LogIndex>>,
    ) -> KestrelResult<()> {
        if !self.state.is_leader() {
            let _ = response.send(Err(KestrelError::Raft(RaftError::NotLeader {
                leader_hint: self.state.leader_hint,
            })));
            return Ok(());
        }
        let read_index = self.state.commit_index;

        // Confirm we are still the leader with a quorum round before
        // promising linearizability for this index.
        let acks = self.replicate_to_all().await?;
        if !self.state.is_leader() || !self.cluster.has_quorum(|id| acks.contains(&id)) {
            let _ = response.send(Err(KestrelError::Raft(RaftError::NotLeader {
                leader_hint: self.state.leader_hint,
            })));
            return Ok(());
        }

        if self.state.last_applied >= read_index {
            let _ = response.send(Ok(read_index));
        } else {
            self.pending_reads.push((read_index, response));
        }
        Ok(())
    }

    // ---- apply & snapshot ----

    fn apply_committed_entries(&mut self) -> KestrelResult<()> {
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            let entry = self.log.get(index).cloned().ok_or_else(|| {
                KestrelError::fatal(
                    "RAFT_LOG_GAP",
                    "committed entry missing from log",
                    format!("index={} first_index={}", index, self.log.first_index()),
                )
            })?;

            if let EntryPayload::Command(data) = &entry.payload {
                if index > self.state_machine.applied_index() {
                    self.state_machine.apply(index, data)?;
                }
            }
            self.state.last_applied = index;

            if let Some(waiter) = self.proposal_waiters.remove(&index) {
                if entry.term == waiter.term {
                    let _ = waiter.tx.send(Ok(index));
                } else {
                    // A different leader's entry landed at this index.
                    let _ = waiter
                        .tx
                        .send(Err(KestrelError::Raft(RaftError::ProposalSuperseded {
                            index,
                        })));
                }
            }
        }

        if !self.pending_reads.is_empty() {
            let applied = self.state.last_applied;
            let mut still_pending = Vec::new();
            for (read_index, tx) in self.pending_reads.drain(..) {
                if applied >= read_index {
                    let _ = tx.send(Ok(read_index));
                } else {
                    still_pending.push((read_index, tx));
                }
            }
            self.pending_reads = still_pending;
        }
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> KestrelResult<()> {
        if self.config.snapshot_interval_entries == 0 {
            return Ok(());
        }
        if self.state.last_applied < self.snapshot_index + self.config.snapshot_interval_entries
        {
            return Ok(());
        }
        let last_applied = self.state.last_applied;
        let Some(last_term) = self.log.term_at(last_applied) else {
            return Ok(());
        };

        let data = self.state_machine.snapshot()?;
        let config = if self.config_index <= last_applied {
            self.cluster.clone()
        } else {
            self.base_config.clone()
        };
        let snapshot = Snapshot {
            last_included_index: last_applied,
            last_included_term: last_term,
            config: config.clone(),
            data,
        };
        self.snapshots.save(&snapshot)?;
        self.snapshot_index = last_applied;
        self.base_config = config;
        self.base_config_index = last_applied;

        // Keep a tail of entries behind the snapshot so slightly lagging
        // followers can catch up without a full-state transfer.
        let compact_to = last_applied.saturating_sub(self.config.log_retain_entries);
        if compact_to >= self.log.first_index() {
            if let Some(compact_term) = self.log.term_at(compact_to) {
                self.log.compact(compact_to, compact_term);
                self.checkpoint_wal(compact_to, compact_term)?;
            }
        }

        tracing::info!(
            node_id = self.state.node_id,
            last_applied,
            retained_from = self.log.first_index(),
            "snapshot taken and log compacted"
        );
        Ok(())
    }

    /// Rewrite the live log suffix into a fresh WAL segment and drop the
    /// old ones. Replay of the new segment alone reproduces the current
    /// hard state and retained entries.
    fn checkpoint_wal(&mut self, compact_index: LogIndex, compact_term: Term) -> KestrelResult<()> {
        self.wal.rotate()?;
        self.wal.append(&WalRecord::HardState {
            term: self.state.current_term,
            voted_for: self.state.voted_for,
        })?;
        self.wal.append(&WalRecord::Compact {
            index: compact_index,
            term: compact_term,
        })?;
        for entry in self.log.entries_range(self.log.first_index(), self.log.last_index()) {
            self.wal.append(&WalRecord::Append {
                index: entry.index,
                term: entry.term,
                payload: entry.encode_payload()?,
            })?;
        }
        self.wal.sync()?;

        let current = self.wal.current_segment_id();
        if let Err(e) = self.wal.purge_segments_before(current) {
            tracing::warn!(error = %e, "failed to purge old WAL segments");
        }
        Ok(())
    }

    // ---- shared ----

    fn step_down(&mut self, term: Term, leader_hint: Option<NodeId>) {
        self.state.become_follower(term, leader_hint);
        self.fail_waiters();
    }

    fn persist_hard_state(&mut self) -> KestrelResult<()> {
        self.wal
            .append_durable(&WalRecord::HardState {
                term: self.state.current_term,
                voted_for: self.state.voted_for,
            })
            .map_err(KestrelError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RaftRouter;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingStateMachine {
        inner: Arc<Mutex<RecordingInner>>,
    }

    #[derive(Default)]
    struct RecordingInner {
        applied: Vec<(LogIndex, Vec<u8>)>,
        applied_index: LogIndex,
    }

    impl RecordingStateMachine {
        fn shared(&self) -> Arc<Mutex<RecordingInner>> {
            Arc::clone(&self.inner)
        }
    }

    impl StateMachine for RecordingStateMachine {
        fn apply(&mut self, index: LogIndex, command: &[u8]) -> KestrelResult<()> {
            let mut inner = self.inner.lock();
            inner.applied.push((index, command.to_vec()));
            inner.applied_index = index;
            Ok(())
        }

        fn applied_index(&self) -> LogIndex {
            self.inner.lock().applied_index
        }

        fn snapshot(&mut self) -> KestrelResult<Vec<u8>> {
            Ok(bincode::serialize(&self.inner.lock().applied).unwrap())
        }

        fn restore(&mut self, data: &[u8], last_included_index: LogIndex) -> KestrelResult<()> {
            let mut inner = self.inner.lock();
            inner.applied = bincode::deserialize(data).unwrap();
            inner.applied_index = last_included_index;
            Ok(())
        }
    }

    fn fast_config(node_id: NodeId, voters: Vec<NodeId>, dir: &std::path::Path) -> RaftNodeConfig {
        RaftNodeConfig {
            node_id,
            voters,
            data_dir: dir.join(format!("node-{}", node_id)),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            wal_sync: SyncMode::None,
            ..Default::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_node_elects_itself_and_applies() {
        let dir = TempDir::new().unwrap();
        let router = RaftRouter::new();
        let sm = RecordingStateMachine::default();
        let applied = sm.shared();

        let (node, rx) =
            RaftNode::new(fast_config(1, vec![1], dir.path()), router.transport(1), sm).unwrap();
        let handle = node.handle();
        router.register(1, node.command_sender());
        let task = tokio::spawn(node.run(rx));

        let index = handle.propose(b"hello".to_vec()).await.unwrap();
        assert!(index >= 1);

        wait_for(
            || applied.lock().applied.iter().any(|(_, d)| d == b"hello"),
            "command applied",
        )
        .await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.role, NodeRole::Leader);
        assert_eq!(status.leader_hint, Some(1));

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_propose_without_quorum_fails_not_leader() {
        let dir = TempDir::new().unwrap();
        let router = RaftRouter::new();
        // Node 2 is never registered, so node 1 can never win a 2-node vote.
        let (node, rx) = RaftNode::new(
            fast_config(1, vec![1, 2], dir.path()),
            router.transport(1),
            RecordingStateMachine::default(),
        )
        .unwrap();
        let handle = node.handle();
        router.register(1, node.command_sender());
        let task = tokio::spawn(node.run(rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = handle.propose(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(
            err,
            KestrelError::Raft(RaftError::NotLeader { .. })
        ));

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_recovers_term_and_log() {
        let dir = TempDir::new().unwrap();
        let router = RaftRouter::new();

        let (term, last_index) = {
            let sm = RecordingStateMachine::default();
            let (node, rx) =
                RaftNode::new(fast_config(1, vec![1], dir.path()), router.transport(1), sm)
                    .unwrap();
            let handle = node.handle();
            router.register(1, node.command_sender());
            let task = tokio::spawn(node.run(rx));

            handle.propose(b"a".to_vec()).await.unwrap();
            handle.propose(b"b".to_vec()).await.unwrap();
            let status = handle.status().await.unwrap();

            handle.shutdown().await;
            task.await.unwrap();
            router.deregister(1);
            (status.term, status.last_log_index)
        };

        let sm = RecordingStateMachine::default();
        let (node, _rx) =
            RaftNode::new(fast_config(1, vec![1], dir.path()), router.transport(1), sm).unwrap();
        assert!(node.state.current_term >= term);
        assert_eq!(node.log.last_index(), last_index);
        // Replay applies nothing until commit is re-established.
        assert_eq!(node.state.last_applied, 0);
    }

    #[test]
    fn test_follower_commit_clamped_to_verified_prefix() {
        let dir = TempDir::new().unwrap();
        let router = RaftRouter::new();
        let (mut node, _rx) = RaftNode::new(
            fast_config(2, vec![1, 2, 3], dir.path()),
            router.transport(2),
            RecordingStateMachine::default(),
        )
        .unwrap();

        let entry =
            |term, index, data: &[u8]| LogEntry::new(term, index, EntryPayload::Command(data.to_vec()));

        // A term-1 leader replicates two committed entries plus a third
        // that never reaches quorum.
        let resp = node
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(1, 1, b"a"), entry(1, 2, b"b"), entry(1, 3, b"stale")],
                leader_commit: 2,
            })
            .unwrap();
        assert!(resp.success);
        assert_eq!(node.state.commit_index, 2);

        // A term-2 leader that committed a different entry at index 3
        // heartbeats with prev = 2. Only the prefix up to 2 is verified
        // by this request; the retained stale suffix must be neither
        // committed nor reported as matched.
        let resp = node
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: 3,
                prev_log_index: 2,
                prev_log_term: 1,
                entries: vec![],
                leader_commit: 3,
            })
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(node.state.commit_index, 2);

        // The real entry replaces the stale one and only then commits.
        let resp = node
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: 3,
                prev_log_index: 2,
                prev_log_term: 1,
                entries: vec![entry(2, 3, b"real")],
                leader_commit: 3,
            })
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 3);
        assert_eq!(node.state.commit_index, 3);
        assert_eq!(node.log.term_at(3), Some(2));
    }

    #[test]
    fn test_duplicate_append_below_snapshot_is_ignored() {
        let dir = TempDir::new().unwrap();
        let router = RaftRouter::new();
        let (mut node, _rx) = RaftNode::new(
            fast_config(2, vec![1, 2, 3], dir.path()),
            router.transport(2),
            RecordingStateMachine::default(),
        )
        .unwrap();

        let snapshot = Snapshot {
            last_included_index: 5,
            last_included_term: 1,
            config: ClusterConfig::single(vec![1, 2, 3]),
            data: bincode::serialize(&Vec::<(LogIndex, Vec<u8>)>::new()).unwrap(),
        };
        let resp = node
            .handle_install_snapshot(InstallSnapshotRequest {
                term: 1,
                leader_id: 1,
                snapshot,
            })
            .unwrap();
        assert_eq!(resp.match_index, 5);
        assert_eq!(node.log.first_index(), 6);

        // A delayed retransmission of a prefix the snapshot already
        // covers must be acknowledged without touching the log.
        let resp = node
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![
                    LogEntry::new(1, 1, EntryPayload::Command(b"a".to_vec())),
                    LogEntry::new(1, 2, EntryPayload::Command(b"b".to_vec())),
                ],
                leader_commit: 2,
            })
            .unwrap();
        assert!(resp.success);
        assert_eq!(node.log.first_index(), 6);
        assert_eq!(node.log.last_index(), 5);
        assert_eq!(node.state.last_applied, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_index_on_single_node_leader() {
        let dir = TempDir::new().unwrap();
        let router = RaftRouter::new();
        let (node, rx) = RaftNode::new(
            fast_config(1, vec![1], dir.path()),
            router.transport(1),
            RecordingStateMachine::default(),
        )
        .unwrap();
        let handle = node.handle();
        router.register(1, node.command_sender());
        let task = tokio::spawn(node.run(rx));

        let index = handle.propose(b"v".to_vec()).await.unwrap();
        let read_index = handle.read_index().await.unwrap();
        assert!(read_index >= index);

        handle.shutdown().await;
        task.await.unwrap();
    }
}
