use serde::{Deserialize, Serialize};

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub lsm: LsmConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID in cluster.
    pub node_id: u64,
    /// Data directory for WAL, SSTs, and snapshots.
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            data_dir: "./kestrel-data".into(),
        }
    }
}

/// Consensus timing and batching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout, in milliseconds.
    /// Must be strictly greater than the lower bound.
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat interval in milliseconds. Must be well below the
    /// election timeout lower bound or followers will start elections under
    /// normal operation.
    pub heartbeat_interval_ms: u64,
    /// Max entries shipped in one AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// How long a proposal waits for quorum before reporting
    /// `QuorumUnavailable`, in milliseconds.
    pub proposal_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_entries_per_append: 128,
            proposal_timeout_ms: 3000,
        }
    }
}

impl RaftConfig {
    /// Validate timing relationships. Rejects configs that would make the
    /// cluster unstable (heartbeat >= election timeout) or degenerate
    /// (empty randomization window).
    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(format!(
                "election_timeout_min_ms ({}) must be < election_timeout_max_ms ({})",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(format!(
                "heartbeat_interval_ms ({}) must be < election_timeout_min_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Max WAL segment size in bytes before rotation.
    pub segment_size_bytes: u64,
    /// Sync mode: "fsync", "fdatasync", or "none".
    pub sync_mode: String,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size_bytes: 64 * 1024 * 1024,
            sync_mode: "fsync".into(),
        }
    }
}

/// LSM engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsmConfig {
    /// Memtable size threshold in bytes; exceeding it freezes the memtable
    /// and schedules a flush.
    pub memtable_size_bytes: u64,
    /// L0 file count that triggers compaction.
    pub l0_compaction_trigger: usize,
    /// L0 file count that stalls writes until compaction catches up.
    pub l0_stall_trigger: usize,
    /// Target total bytes for L1; deeper levels multiply by `level_multiplier`.
    pub l1_target_bytes: u64,
    /// Size ratio between adjacent levels.
    pub level_multiplier: u64,
    /// Maximum number of levels.
    pub max_levels: usize,
    /// Compaction strategy: "leveled" or "size_tiered".
    pub compaction_policy: String,
    /// Bloom filter false-positive rate for new SSTs.
    pub bloom_fp_rate: f64,
    /// Bounded queue depth for the background compaction worker.
    pub compaction_queue_depth: usize,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            memtable_size_bytes: 4 * 1024 * 1024,
            l0_compaction_trigger: 4,
            l0_stall_trigger: 12,
            l1_target_bytes: 64 * 1024 * 1024,
            level_multiplier: 10,
            max_levels: 7,
            compaction_policy: "leveled".into(),
            bloom_fp_rate: 0.01,
            compaction_queue_depth: 16,
        }
    }
}

/// Snapshot / log-compaction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Take a snapshot once this many entries have been applied since the
    /// last one. 0 disables automatic snapshots.
    pub snapshot_interval_entries: u64,
    /// Keep this many log entries behind the snapshot index so slow
    /// followers can catch up without a full snapshot transfer.
    pub log_retain_entries: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_entries: 10_000,
            log_retain_entries: 1_000,
        }
    }
}
