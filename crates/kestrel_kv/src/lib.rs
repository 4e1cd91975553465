//! Replicated key-value store built on the Kestrel consensus core.
//!
//! Each [`KvNode`] pairs a local LSM engine with a consensus actor. Writes
//! are proposed to the leader, committed by quorum, and applied to every
//! replica's engine with the log index as the storage sequence number, so
//! crash-replay converges on the same state.

pub mod command;
pub mod node;
pub mod state_machine;

pub use command::Command;
pub use node::KvNode;
pub use state_machine::KvStateMachine;
