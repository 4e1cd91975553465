//! One replicated key-value node: LSM engine + consensus actor + the
//! public read/write surface.

use std::sync::Arc;

use kestrel_common::config::KestrelConfig;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{LogIndex, NodeId, NodeStatus, ReadConsistency};
use kestrel_raft::node::{RaftCommand, RaftHandle, RaftNode, RaftNodeConfig};
use kestrel_raft::rpc::RaftTransport;
use kestrel_storage::{
    CompactionConfig, CompactionPolicy, CompactionWorker, LsmEngine, LsmEngineConfig, LsmStats,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::state_machine::KvStateMachine;

/// A running cluster member. Writes go through consensus; reads are served
/// from the local engine, optionally fenced by a ReadIndex round.
pub struct KvNode {
    node_id: NodeId,
    engine: Arc<LsmEngine>,
    raft: RaftHandle,
    command_tx: mpsc::Sender<RaftCommand>,
    compaction_worker: CompactionWorker,
    raft_task: JoinHandle<()>,
}

impl KvNode {
    /// Open the storage engine, recover the consensus state, and spawn the
    /// node task. The caller wires `command_sender()` into its transport.
    pub fn start(
        raft_config: RaftNodeConfig,
        lsm_config: LsmEngineConfig,
        transport: Arc<dyn RaftTransport>,
    ) -> KestrelResult<Self> {
        let node_id = raft_config.node_id;
        let engine = Arc::new(LsmEngine::open(
            &raft_config.data_dir.join("lsm"),
            lsm_config,
        )?);
        let compaction_worker = CompactionWorker::spawn(Arc::clone(&engine));

        let state_machine = KvStateMachine::new(Arc::clone(&engine));
        let (raft_node, command_rx) = RaftNode::new(raft_config, transport, state_machine)?;
        let raft = raft_node.handle();
        let command_tx = raft_node.command_sender();
        let raft_task = tokio::spawn(raft_node.run(command_rx));

        tracing::info!(node_id, "kv node started");
        Ok(Self {
            node_id,
            engine,
            raft,
            command_tx,
            compaction_worker,
            raft_task,
        })
    }

    /// `start` with parameters derived from the application config.
    pub fn start_from_config(
        config: &KestrelConfig,
        voters: Vec<NodeId>,
        transport: Arc<dyn RaftTransport>,
    ) -> KestrelResult<Self> {
        config.raft.validate().map_err(KestrelError::Internal)?;
        let raft_config = RaftNodeConfig::from_config(config, voters);
        let lsm_config = LsmEngineConfig {
            memtable_size_bytes: config.lsm.memtable_size_bytes,
            compaction: CompactionConfig {
                policy: CompactionPolicy::parse(&config.lsm.compaction_policy)
                    .unwrap_or(CompactionPolicy::Leveled),
                l0_compaction_trigger: config.lsm.l0_compaction_trigger,
                l0_stall_trigger: config.lsm.l0_stall_trigger,
                l1_target_bytes: config.lsm.l1_target_bytes,
                level_multiplier: config.lsm.level_multiplier,
                max_levels: config.lsm.max_levels,
                bloom_fp_rate: config.lsm.bloom_fp_rate,
                ..CompactionConfig::default()
            },
            compaction_queue_depth: config.lsm.compaction_queue_depth,
        };
        Self::start(raft_config, lsm_config, transport)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The inbound channel for this node's RPCs.
    pub fn command_sender(&self) -> mpsc::Sender<RaftCommand> {
        self.command_tx.clone()
    }

    pub fn raft(&self) -> RaftHandle {
        self.raft.clone()
    }

    /// Replicate a put; resolves once the entry is committed and applied.
    pub async fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> KestrelResult<LogIndex> {
        let data = Command::put(key, value).encode()?;
        self.raft.propose(data).await
    }

    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> KestrelResult<LogIndex> {
        let data = Command::delete(key).encode()?;
        self.raft.propose(data).await
    }

    /// Read a key. `Linearizable` fences through the leader's ReadIndex
    /// round and waits until this node has applied up to it; `Local` reads
    /// whatever the local engine has, which may lag.
    pub async fn read(
        &self,
        key: &[u8],
        consistency: ReadConsistency,
    ) -> KestrelResult<Option<Vec<u8>>> {
        if consistency == ReadConsistency::Linearizable {
            self.raft.read_index().await?;
        }
        Ok(self.engine.get(key)?)
    }

    pub async fn leader_hint(&self) -> Option<NodeId> {
        self.raft.status().await.ok().and_then(|s| s.leader_hint)
    }

    pub async fn status(&self) -> KestrelResult<NodeStatus> {
        self.raft.status().await
    }

    pub fn storage_stats(&self) -> LsmStats {
        self.engine.stats()
    }

    /// Begin adding a voter; resolves when the joint config commits.
    pub async fn add_node(&self, node_id: NodeId) -> KestrelResult<LogIndex> {
        self.raft.add_node(node_id).await
    }

    pub async fn remove_node(&self, node_id: NodeId) -> KestrelResult<LogIndex> {
        self.raft.remove_node(node_id).await
    }

    /// Stop the node task, the compaction worker, and the engine.
    pub async fn shutdown(self) {
        self.raft.shutdown().await;
        let _ = self.raft_task.await;
        if let Err(e) = self.engine.close() {
            tracing::warn!(node_id = self.node_id, error = %e, "engine close failed");
        }
        self.compaction_worker.join();
        tracing::info!(node_id = self.node_id, "kv node stopped");
    }
}
