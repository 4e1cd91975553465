use thiserror::Error;

use crate::types::{LogIndex, NodeId, Term};

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `Retryable`  — leader change, stale term, config in flight; client SHOULD retry
/// - `Transient`  — quorum unavailable, write stall, backpressure; client MAY retry after back-off
/// - `Corruption` — checksum mismatch in an on-disk structure; affected file is quarantined
/// - `Fatal`      — persistence failure or invariant violation; the node must stop accepting work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Transient,
    Corruption,
    Fatal,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Consensus error: {0}")]
    Raft(#[from] RaftError),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Invariant violation — should never occur in production.
    /// Always carries a unique `error_code` and `debug_context` for post-mortem.
    #[error("Fatal [{error_code}]: {message} | context: {debug_context}")]
    Fatal {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Storage layer errors (WAL, memtable, SST, manifest).
#[derive(Error, Debug)]
pub enum StorageError {
    /// Durability write failed. Fatal: the node can no longer guarantee that
    /// acknowledged entries survive a restart.
    #[error("Persistence failure during {operation}: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A checksummed on-disk structure failed verification.
    #[error("Corrupted segment {path}: {detail}")]
    CorruptedSegment { path: String, detail: String },

    /// Write rejected while L0 is over the stall threshold.
    #[error("Write stalled: {l0_files} L0 files (stall threshold {stall_threshold})")]
    WriteStalled {
        l0_files: usize,
        stall_threshold: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),
}

/// Consensus layer errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Operation requires the leader. Carries the caller's best next hop.
    #[error("Not leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// An RPC arrived with a stale term and was rejected.
    #[error("Term mismatch: observed {observed}, current {current}")]
    TermMismatch { observed: Term, current: Term },

    /// Replication could not reach a majority within the timeout.
    #[error("Quorum unavailable: {reached} of {needed} acks for index {index}")]
    QuorumUnavailable {
        reached: usize,
        needed: usize,
        index: LogIndex,
    },

    /// A proposal was abandoned because leadership was lost before commit.
    #[error("Proposal at index {index} superseded by new leader")]
    ProposalSuperseded { index: LogIndex },

    /// A membership change was rejected because one is already in flight.
    #[error("Configuration change already in progress")]
    ConfigChangeInProgress,

    /// A membership change that cannot apply to the current configuration,
    /// e.g. adding an existing voter or removing the last one.
    #[error("Invalid membership change for node {node_id}: {reason}")]
    InvalidMembershipChange {
        node_id: NodeId,
        reason: &'static str,
    },

    /// Requested log range falls below the snapshot horizon.
    #[error("Log compacted: index {index} below first retained index {first_index}")]
    LogCompacted {
        index: LogIndex,
        first_index: LogIndex,
    },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Shutting down")]
    ShuttingDown,
}

// ── KestrelError classification & helpers ────────────────────────────────────

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Retryable: the cluster is healthy, the caller just talked to the
            // wrong node or raced a leadership/config change.
            KestrelError::Raft(RaftError::NotLeader { .. }) => ErrorKind::Retryable,
            KestrelError::Raft(RaftError::TermMismatch { .. }) => ErrorKind::Retryable,
            KestrelError::Raft(RaftError::ProposalSuperseded { .. }) => ErrorKind::Retryable,
            KestrelError::Raft(RaftError::ConfigChangeInProgress) => ErrorKind::Retryable,
            KestrelError::Raft(RaftError::InvalidMembershipChange { .. }) => ErrorKind::Retryable,
            KestrelError::Raft(RaftError::LogCompacted { .. }) => ErrorKind::Retryable,

            // Transient: back-pressure or partial availability; back off and retry.
            KestrelError::Raft(RaftError::QuorumUnavailable { .. }) => ErrorKind::Transient,
            KestrelError::Storage(StorageError::WriteStalled { .. }) => ErrorKind::Transient,

            // Corruption: the file is quarantined, the node keeps serving.
            KestrelError::Storage(StorageError::CorruptedSegment { .. }) => ErrorKind::Corruption,

            // Everything else means the node cannot be trusted to make progress.
            KestrelError::Storage(StorageError::Persistence { .. }) => ErrorKind::Fatal,
            KestrelError::Storage(StorageError::Io(_)) => ErrorKind::Fatal,
            KestrelError::Storage(StorageError::Codec(_)) => ErrorKind::Fatal,
            KestrelError::Raft(RaftError::NodeNotFound(_)) => ErrorKind::Transient,
            KestrelError::Raft(RaftError::ShuttingDown) => ErrorKind::Transient,
            KestrelError::Fatal { .. } => ErrorKind::Fatal,
            KestrelError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the client should retry this operation immediately
    /// (possibly against a different node).
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this is a transient availability/backpressure error.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if the node must stop accepting work.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    /// Suggested retry delay in milliseconds (0 = retry immediately).
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            KestrelError::Raft(RaftError::QuorumUnavailable { .. }) => 200,
            KestrelError::Storage(StorageError::WriteStalled { .. }) => 50,
            KestrelError::Raft(RaftError::NodeNotFound(_)) => 100,
            _ => 0,
        }
    }

    /// Extract the leader hint, if this error carries one.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            KestrelError::Raft(RaftError::NotLeader { leader_hint }) => *leader_hint,
            _ => None,
        }
    }

    /// Construct a fatal invariant-violation error with code and context.
    pub fn fatal(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        KestrelError::Fatal {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Add context string to an error, **preserving error classification**.
    ///
    /// For `Fatal`, the context is prepended to the message. For `Internal`,
    /// it is prepended to the string. All other variants keep their structure
    /// and the context is folded into an `Internal` wrapper only as a last
    /// resort — callers that need the structured variant should not re-wrap.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            KestrelError::Internal(msg) => KestrelError::Internal(format!("{ctx}: {msg}")),
            KestrelError::Fatal {
                error_code,
                message,
                debug_context,
            } => KestrelError::Fatal {
                error_code,
                message: format!("{ctx}: {message}"),
                debug_context,
            },
            other => other,
        }
    }

    /// Set `leader_hint` on a `NotLeader` error. No-op for other variants.
    pub fn with_leader_hint(self, hint: NodeId) -> Self {
        match self {
            KestrelError::Raft(RaftError::NotLeader { .. }) => {
                KestrelError::Raft(RaftError::NotLeader {
                    leader_hint: Some(hint),
                })
            }
            other => other,
        }
    }

    /// Emit a structured log entry for Fatal errors.
    /// Must be called for every Fatal error before the node transitions to
    /// its halted state. Log format is stable across patch versions.
    pub fn log_if_fatal(&self) {
        if !self.is_fatal() {
            return;
        }
        match self {
            KestrelError::Fatal {
                error_code,
                message,
                debug_context,
            } => {
                tracing::error!(
                    error_code = error_code,
                    error_category = "Fatal",
                    component = self.affected_component(),
                    debug_context = debug_context.as_str(),
                    "FATAL [{}]: {}",
                    error_code,
                    message
                );
            }
            other => {
                tracing::error!(
                    error_category = "Fatal",
                    component = other.affected_component(),
                    "FATAL: {}",
                    other
                );
            }
        }
    }

    /// Identify the affected component for structured logging.
    fn affected_component(&self) -> &'static str {
        match self {
            KestrelError::Storage(_) => "storage",
            KestrelError::Raft(_) => "raft",
            KestrelError::Fatal { .. } => "internal",
            KestrelError::Internal(_) => "internal",
        }
    }
}

impl StorageError {
    /// Wrap an IO error from a durability-critical write path.
    pub fn persistence(operation: &'static str, source: std::io::Error) -> Self {
        StorageError::Persistence { operation, source }
    }

    /// Construct a corruption error for a quarantined file.
    pub fn corrupted(path: impl Into<String>, detail: impl Into<String>) -> Self {
        StorageError::CorruptedSegment {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// Add context to a Result, preserving error classification.
/// Usage: `some_result.ctx("stage=flush, sst=000004")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> Result<T, KestrelError>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, KestrelError>;
}

impl<T, E: Into<KestrelError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> Result<T, KestrelError> {
        self.map_err(|e| e.into().with_context(context))
    }
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, KestrelError> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod error_classification {
    use super::*;

    // ── ErrorKind classification ─────────────────────────────────────────────

    #[test]
    fn test_not_leader_is_retryable() {
        let e = KestrelError::Raft(RaftError::NotLeader {
            leader_hint: Some(2),
        });
        assert_eq!(e.kind(), ErrorKind::Retryable);
        assert!(e.is_retryable());
        assert!(!e.is_transient());
        assert!(!e.is_fatal());
        assert_eq!(e.leader_hint(), Some(2));
    }

    #[test]
    fn test_term_mismatch_is_retryable() {
        let e = KestrelError::Raft(RaftError::TermMismatch {
            observed: 3,
            current: 5,
        });
        assert_eq!(e.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn test_proposal_superseded_is_retryable() {
        let e = KestrelError::Raft(RaftError::ProposalSuperseded { index: 10 });
        assert_eq!(e.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn test_config_change_in_progress_is_retryable() {
        let e = KestrelError::Raft(RaftError::ConfigChangeInProgress);
        assert_eq!(e.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn test_quorum_unavailable_is_transient() {
        let e = KestrelError::Raft(RaftError::QuorumUnavailable {
            reached: 1,
            needed: 2,
            index: 7,
        });
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_transient());
        assert_eq!(e.retry_after_ms(), 200);
    }

    #[test]
    fn test_write_stalled_is_transient() {
        let e = KestrelError::Storage(StorageError::WriteStalled {
            l0_files: 12,
            stall_threshold: 12,
        });
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert_eq!(e.retry_after_ms(), 50);
    }

    #[test]
    fn test_corrupted_segment_is_corruption() {
        let e = KestrelError::Storage(StorageError::corrupted(
            "data/sst/000004.sst",
            "footer checksum mismatch",
        ));
        assert_eq!(e.kind(), ErrorKind::Corruption);
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_persistence_failure_is_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = KestrelError::Storage(StorageError::persistence("wal append", io));
        assert_eq!(e.kind(), ErrorKind::Fatal);
        assert!(e.is_fatal());
    }

    #[test]
    fn test_fatal_variant() {
        let e = KestrelError::fatal(
            "E-RAFT-001",
            "commit index moved backwards",
            "old=9, new=7, term=3",
        );
        assert_eq!(e.kind(), ErrorKind::Fatal);
        assert!(e.to_string().contains("E-RAFT-001"));
    }

    #[test]
    fn test_internal_string_is_fatal() {
        let e = KestrelError::Internal("something went wrong".into());
        assert_eq!(e.kind(), ErrorKind::Fatal);
    }

    // ── retry_after_ms ───────────────────────────────────────────────────────

    #[test]
    fn test_retryable_has_zero_delay() {
        let e = KestrelError::Raft(RaftError::NotLeader { leader_hint: None });
        assert_eq!(e.retry_after_ms(), 0);
    }

    // ── with_context ─────────────────────────────────────────────────────────

    #[test]
    fn test_with_context_preserves_fatal() {
        let e = KestrelError::fatal("E-WAL-001", "torn header", "");
        let e2 = e.with_context("stage=replay");
        assert_eq!(e2.kind(), ErrorKind::Fatal);
        assert!(e2.to_string().contains("stage=replay"));
        assert!(e2.to_string().contains("torn header"));
    }

    #[test]
    fn test_with_context_preserves_structured_variants() {
        let e = KestrelError::Raft(RaftError::NotLeader { leader_hint: None });
        let e2 = e.with_context("stage=propose");
        assert_eq!(e2.kind(), ErrorKind::Retryable);
        assert!(matches!(
            e2,
            KestrelError::Raft(RaftError::NotLeader { .. })
        ));
    }

    // ── with_leader_hint ─────────────────────────────────────────────────────

    #[test]
    fn test_with_leader_hint_on_not_leader() {
        let e = KestrelError::Raft(RaftError::NotLeader { leader_hint: None });
        let e2 = e.with_leader_hint(3);
        assert_eq!(e2.leader_hint(), Some(3));
    }

    #[test]
    fn test_with_leader_hint_noop_on_other_variants() {
        let e = KestrelError::Internal("test".into());
        let e2 = e.with_leader_hint(1);
        assert!(matches!(e2, KestrelError::Internal(_)));
    }

    // ── ErrorContext trait ───────────────────────────────────────────────────

    #[test]
    fn test_error_context_trait_ctx() {
        use super::ErrorContext;
        let result: Result<(), KestrelError> = Err(KestrelError::Internal("boom".into()));
        let err = result.ctx("stage=apply, index=42").unwrap_err();
        assert!(err.to_string().contains("stage=apply"));
    }

    #[test]
    fn test_error_context_ok_passthrough() {
        use super::ErrorContext;
        let result: Result<i32, KestrelError> = Ok(42);
        let result2 = result.ctx("should not appear");
        assert_eq!(result2.unwrap(), 42);
    }

    // ── From conversions ─────────────────────────────────────────────────────

    #[test]
    fn test_from_storage_error() {
        let e: KestrelError = StorageError::Codec("bad frame".into()).into();
        assert_eq!(e.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_from_raft_error() {
        let e: KestrelError = RaftError::ShuttingDown.into();
        assert_eq!(e.kind(), ErrorKind::Transient);
    }
}
