//! Durable storage for the kestrel replicated KV store.
//!
//! Two independent pieces live here:
//! - `wal`: the segmented write-ahead log that holds consensus log entries
//!   and hard state. Every acknowledged entry is fsynced before the node
//!   reports it as persisted.
//! - `lsm`: the log-structured merge engine that holds applied KV state.
//!   Memtable → L0 SSTs → leveled/size-tiered compacted levels, with a
//!   manifest for crash-safe file tracking.

pub mod lsm;
pub mod wal;

pub use lsm::compaction::{CompactionConfig, CompactionPolicy};
pub use lsm::engine::{CompactionWorker, LsmEngine, LsmEngineConfig, LsmStats};
pub use wal::{SyncMode, WalReader, WalRecord, WalReplay, WalWriter};
