//! Log-structured merge engine.
//!
//! Write path: active memtable → (freeze + flush) → L0 SST → compaction.
//! Read path:  active memtable → frozen memtables → L0 (newest first) →
//!             L1..Ln (one file per key range).
//!
//! Sequence numbers are assigned by the caller, not the engine. The
//! replication layer passes its applied log index as the sequence so that
//! replaying the same log prefix twice produces an identical store.

pub mod bloom;
pub mod compaction;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sst;
