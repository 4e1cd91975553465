use serde::{Deserialize, Serialize};

/// Cluster-unique node identifier.
pub type NodeId = u64;

/// Monotonic election term. Term 0 means "no term yet".
pub type Term = u64;

/// 1-based position in the replicated log. Index 0 is the sentinel "before
/// the first entry" and never holds a real entry.
pub type LogIndex = u64;

/// Consensus role of a node at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "follower"),
            NodeRole::Candidate => write!(f, "candidate"),
            NodeRole::Leader => write!(f, "leader"),
        }
    }
}

/// Consistency level for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// Leader confirms its authority with a quorum round before serving.
    Linearizable,
    /// Serve from local applied state; may lag the leader.
    Local,
}

/// Point-in-time view of a node, for diagnostics and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub term: Term,
    pub leader_hint: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub voters: Vec<NodeId>,
}
