//! Raft consensus core for Kestrel.
//!
//! A single [`node::RaftNode`] task owns all consensus state for one cluster
//! member. Everything reaches it as a [`node::RaftCommand`] message: peer
//! RPCs, client proposals, membership changes, and status queries. Durable
//! state (term, vote, log entries) goes through the segmented WAL in
//! `kestrel_storage` before any response that promises it.

pub mod log;
pub mod membership;
pub mod node;
pub mod rpc;
pub mod snapshot;
pub mod state;

pub use log::{EntryPayload, LogEntry, RaftLog};
pub use membership::ClusterConfig;
pub use node::{RaftCommand, RaftHandle, RaftNode, RaftNodeConfig};
pub use rpc::{RaftRouter, RaftTransport, RouterTransport};
pub use snapshot::{Snapshot, SnapshotStore};

use kestrel_common::error::KestrelResult;
use kestrel_common::types::LogIndex;

/// The replicated state machine driven by committed log entries.
///
/// `apply` receives the log index of the entry it applies; implementations
/// use it as the write sequence number so that replaying an already-applied
/// entry is a no-op.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command. Must be deterministic.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> KestrelResult<()>;

    /// Highest log index whose effects are durable in the state machine.
    /// Replay after restart resumes above this.
    fn applied_index(&self) -> LogIndex;

    /// Serialize the complete current state.
    fn snapshot(&mut self) -> KestrelResult<Vec<u8>>;

    /// Replace the current state with a snapshot taken at `last_included_index`.
    fn restore(&mut self, data: &[u8], last_included_index: LogIndex) -> KestrelResult<()>;
}
