//! Shared types, errors, and configuration for the kestrel replicated KV store.

pub mod config;
pub mod error;
pub mod types;

pub use config::KestrelConfig;
pub use error::{ErrorKind, KestrelError, KestrelResult};
pub use types::{LogIndex, NodeId, Term};
