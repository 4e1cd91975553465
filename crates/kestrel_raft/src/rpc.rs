//! Consensus RPC messages and transport.
//!
//! The transport is a trait so tests and embedders choose the wiring.
//! [`RaftRouter`] is the in-process implementation: it delivers RPCs
//! straight into each node's command channel and can partition nodes to
//! simulate network failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use kestrel_common::error::{KestrelError, KestrelResult, RaftError};
use kestrel_common::types::{LogIndex, NodeId, Term};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::log::LogEntry;
use crate::node::RaftCommand;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    /// Empty for heartbeats.
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Last index the follower now holds, valid when `success`.
    pub match_index: LogIndex,
    /// Where the leader should retry from after a consistency failure.
    /// Skips whole conflicting terms instead of stepping back one entry
    /// at a time.
    pub conflict_index: Option<LogIndex>,
}

/// Full-state transfer for a follower that has fallen behind the leader's
/// retained log. One message carries the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    /// Last index covered by the installed snapshot; the leader resumes
    /// replication above it.
    pub match_index: LogIndex,
}

/// Peer-to-peer transport used by the consensus core.
#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> KestrelResult<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> KestrelResult<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> KestrelResult<InstallSnapshotResponse>;
}

/// In-process message router connecting nodes by their command channels.
pub struct RaftRouter {
    nodes: Mutex<HashMap<NodeId, mpsc::Sender<RaftCommand>>>,
    partitioned: Mutex<HashSet<NodeId>>,
}

impl RaftRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            partitioned: Mutex::new(HashSet::new()),
        })
    }

    pub fn register(&self, node_id: NodeId, tx: mpsc::Sender<RaftCommand>) {
        self.nodes.lock().insert(node_id, tx);
    }

    pub fn deregister(&self, node_id: NodeId) {
        self.nodes.lock().remove(&node_id);
    }

    /// Cut the node off: RPCs to and from it fail until `reconnect`.
    pub fn disconnect(&self, node_id: NodeId) {
        self.partitioned.lock().insert(node_id);
        tracing::info!(node_id, "router: node partitioned");
    }

    pub fn reconnect(&self, node_id: NodeId) {
        self.partitioned.lock().remove(&node_id);
        tracing::info!(node_id, "router: node reconnected");
    }

    /// A transport handle bound to `origin`, for one node's outbound RPCs.
    pub fn transport(self: &Arc<Self>, origin: NodeId) -> Arc<RouterTransport> {
        Arc::new(RouterTransport {
            router: Arc::clone(self),
            origin,
        })
    }

    fn sender(
        &self,
        origin: NodeId,
        target: NodeId,
    ) -> KestrelResult<mpsc::Sender<RaftCommand>> {
        let partitioned = self.partitioned.lock();
        if partitioned.contains(&origin) || partitioned.contains(&target) {
            return Err(KestrelError::Raft(RaftError::NodeNotFound(target)));
        }
        drop(partitioned);
        self.nodes
            .lock()
            .get(&target)
            .cloned()
            .ok_or_else(|| KestrelError::Raft(RaftError::NodeNotFound(target)))
    }
}

/// [`RaftTransport`] over a [`RaftRouter`], bound to the sending node.
pub struct RouterTransport {
    router: Arc<RaftRouter>,
    origin: NodeId,
}

impl RouterTransport {
    async fn deliver<Resp>(
        &self,
        target: NodeId,
        make: impl FnOnce(oneshot::Sender<Resp>) -> RaftCommand,
    ) -> KestrelResult<Resp> {
        let sender = self.router.sender(self.origin, target)?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(make(tx))
            .await
            .map_err(|_| KestrelError::Raft(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| KestrelError::Raft(RaftError::ShuttingDown))
    }
}

#[async_trait::async_trait]
impl RaftTransport for RouterTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> KestrelResult<RequestVoteResponse> {
        self.deliver(target, |response| RaftCommand::RequestVote { request, response })
            .await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> KestrelResult<AppendEntriesResponse> {
        self.deliver(target, |response| RaftCommand::AppendEntries { request, response })
            .await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> KestrelResult<InstallSnapshotResponse> {
        self.deliver(target, |response| {
            RaftCommand::InstallSnapshot { request, response }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_router_delivers_to_registered_node() {
        let router = RaftRouter::new();
        let (tx, mut rx) = mpsc::channel(8);
        router.register(2, tx);

        let transport = router.transport(1);
        let request = RequestVoteRequest {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let server = tokio::spawn(async move {
            match rx.recv().await {
                Some(RaftCommand::RequestVote { request, response }) => {
                    let _ = response.send(RequestVoteResponse {
                        term: request.term,
                        vote_granted: true,
                    });
                }
                other => panic!("unexpected command: {:?}", other.is_some()),
            }
        });

        let resp = transport.request_vote(2, request).await.unwrap();
        assert!(resp.vote_granted);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_router_partition_blocks_both_directions() {
        let router = RaftRouter::new();
        let (tx, _rx) = mpsc::channel(8);
        router.register(2, tx);

        router.disconnect(2);
        let transport = router.transport(1);
        let request = RequestVoteRequest {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let err = transport.request_vote(2, request.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            KestrelError::Raft(RaftError::NodeNotFound(2))
        ));

        // Sender partitioned: outbound fails too.
        router.reconnect(2);
        router.disconnect(1);
        let err = transport.request_vote(2, request).await.unwrap_err();
        assert!(matches!(err, KestrelError::Raft(RaftError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_router_unknown_target() {
        let router = RaftRouter::new();
        let transport = router.transport(1);
        let err = transport
            .request_vote(
                9,
                RequestVoteRequest {
                    term: 1,
                    candidate_id: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::Raft(RaftError::NodeNotFound(9))));
    }
}
