//! SST compaction.
//!
//! Compaction merges SST files to bound read amplification, reclaim
//! space shadowed by newer writes, and drop tombstones once nothing
//! older can resurrect the key.
//!
//! Two strategies, selected by `CompactionPolicy`:
//! - `Leveled` (RocksDB-style): L0 files overlap and are merged with the
//!   overlapping part of L1 when the L0 count passes a trigger; deeper
//!   levels hold non-overlapping files and spill when they exceed a size
//!   target that grows by `level_multiplier` per level.
//! - `SizeTiered` (Cassandra-style): files of similar size within a level
//!   are merged together into the next level once enough of them pile up.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::sst::{SstEntry, SstMeta, SstReader, SstWriter};

/// Compaction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPolicy {
    Leveled,
    SizeTiered,
}

impl CompactionPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "leveled" => Some(Self::Leveled),
            "size_tiered" => Some(Self::SizeTiered),
            _ => None,
        }
    }
}

/// Compaction tuning knobs.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub policy: CompactionPolicy,
    /// L0 file count that triggers compaction (leveled).
    pub l0_compaction_trigger: usize,
    /// L0 file count that stalls writes.
    pub l0_stall_trigger: usize,
    /// Target total bytes for L1; each deeper level multiplies by
    /// `level_multiplier`.
    pub l1_target_bytes: u64,
    pub level_multiplier: u64,
    pub max_levels: usize,
    /// Minimum number of similar-sized files to merge (size-tiered).
    pub tier_min_files: usize,
    pub bloom_fp_rate: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            policy: CompactionPolicy::Leveled,
            l0_compaction_trigger: 4,
            l0_stall_trigger: 12,
            l1_target_bytes: 64 * 1024 * 1024,
            level_multiplier: 10,
            max_levels: 7,
            tier_min_files: 4,
            bloom_fp_rate: 0.01,
        }
    }
}

/// A planned unit of compaction work.
#[derive(Debug, Clone)]
pub struct CompactionTask {
    /// Input files, all of which are consumed.
    pub inputs: Vec<SstMeta>,
    /// Level the output lands in.
    pub target_level: u32,
}

/// Result of executing one task.
#[derive(Debug)]
pub struct CompactionResult {
    pub consumed: Vec<SstMeta>,
    pub produced: Vec<SstMeta>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub tombstones_dropped: u64,
}

/// Counters, snapshotted into `LsmStats`.
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    pub runs_completed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub files_consumed: u64,
    pub files_produced: u64,
    pub tombstones_dropped: u64,
}

/// Plans and executes compaction tasks. The engine owns level membership;
/// the compactor only reads the metas it is handed.
pub struct Compactor {
    config: CompactionConfig,
    data_dir: PathBuf,
    stats_runs: AtomicU64,
    stats_bytes_read: AtomicU64,
    stats_bytes_written: AtomicU64,
    stats_files_consumed: AtomicU64,
    stats_files_produced: AtomicU64,
    stats_tombstones_dropped: AtomicU64,
}

impl Compactor {
    pub fn new(config: CompactionConfig, data_dir: &Path) -> Self {
        Self {
            config,
            data_dir: data_dir.to_path_buf(),
            stats_runs: AtomicU64::new(0),
            stats_bytes_read: AtomicU64::new(0),
            stats_bytes_written: AtomicU64::new(0),
            stats_files_consumed: AtomicU64::new(0),
            stats_files_produced: AtomicU64::new(0),
            stats_tombstones_dropped: AtomicU64::new(0),
        }
    }

    pub fn should_stall_writes(&self, l0_count: usize) -> bool {
        l0_count >= self.config.l0_stall_trigger
    }

    /// Pick the next task under the configured policy, or `None` if the
    /// tree is in shape.
    pub fn plan(&self, levels: &[Vec<SstMeta>]) -> Option<CompactionTask> {
        match self.config.policy {
            CompactionPolicy::Leveled => self.plan_leveled(levels),
            CompactionPolicy::SizeTiered => self.plan_size_tiered(levels),
        }
    }

    fn plan_leveled(&self, levels: &[Vec<SstMeta>]) -> Option<CompactionTask> {
        // L0 backlog first: it hurts every read.
        if levels[0].len() >= self.config.l0_compaction_trigger {
            let mut inputs = levels[0].clone();
            let (min, max) = key_range(&inputs);
            if let Some(l1) = levels.get(1) {
                inputs.extend(
                    l1.iter()
                        .filter(|m| overlaps(m, &min, &max))
                        .cloned(),
                );
            }
            return Some(CompactionTask {
                inputs,
                target_level: 1,
            });
        }

        // Deeper levels spill by size.
        for level in 1..levels.len().saturating_sub(1) {
            let total: u64 = levels[level].iter().map(|m| m.file_size).sum();
            if total > self.level_target_bytes(level) {
                // Oldest file first keeps the spill roughly round-robin.
                let victim = levels[level].iter().min_by_key(|m| m.max_seq)?.clone();
                let mut inputs = vec![victim.clone()];
                if let Some(next) = levels.get(level + 1) {
                    inputs.extend(
                        next.iter()
                            .filter(|m| overlaps(m, &victim.min_key, &victim.max_key))
                            .cloned(),
                    );
                }
                return Some(CompactionTask {
                    inputs,
                    target_level: (level + 1) as u32,
                });
            }
        }
        None
    }

    fn plan_size_tiered(&self, levels: &[Vec<SstMeta>]) -> Option<CompactionTask> {
        for (level, files) in levels.iter().enumerate() {
            if level + 1 >= self.config.max_levels {
                break;
            }
            if files.len() < self.config.tier_min_files {
                continue;
            }
            // Group files whose sizes are within 2x of the tier's smallest.
            let mut sorted = files.clone();
            sorted.sort_by_key(|m| m.file_size);
            for start in 0..=(sorted.len() - self.config.tier_min_files) {
                let base = sorted[start].file_size.max(1);
                let tier: Vec<SstMeta> = sorted[start..]
                    .iter()
                    .take_while(|m| m.file_size <= base.saturating_mul(2))
                    .cloned()
                    .collect();
                if tier.len() >= self.config.tier_min_files {
                    return Some(CompactionTask {
                        inputs: tier,
                        target_level: (level + 1) as u32,
                    });
                }
            }
        }
        None
    }

    fn level_target_bytes(&self, level: usize) -> u64 {
        let mut target = self.config.l1_target_bytes;
        for _ in 1..level {
            target = target.saturating_mul(self.config.level_multiplier);
        }
        target
    }

    /// Execute a task: merge inputs, keep the highest-sequence version of
    /// each key, and write one output SST with the pre-allocated `output_id`.
    ///
    /// Tombstones are dropped only when the output lands in the bottom
    /// level; anywhere else an older file below could still hold the key.
    pub fn run(
        &self,
        task: &CompactionTask,
        output_id: u64,
    ) -> Result<CompactionResult, super::sst::SstReadError> {
        let mut all: Vec<SstEntry> = Vec::new();
        let mut bytes_read = 0u64;

        for meta in &task.inputs {
            let reader = SstReader::open(&meta.path, meta.id)?;
            all.extend(reader.scan()?);
            bytes_read += meta.file_size;
        }

        // Highest sequence wins per key.
        all.sort_by(|a, b| a.key.cmp(&b.key).then(b.seq.cmp(&a.seq)));
        all.dedup_by(|next, kept| next.key == kept.key);

        let at_bottom = task.target_level as usize == self.config.max_levels - 1;
        let mut tombstones_dropped = 0u64;
        if at_bottom {
            all.retain(|e| {
                if e.value.is_none() {
                    tombstones_dropped += 1;
                    false
                } else {
                    true
                }
            });
        }

        let mut produced = Vec::new();
        let mut bytes_written = 0u64;
        if !all.is_empty() {
            let out_path = self.data_dir.join(super::sst::sst_filename(output_id));
            let mut writer =
                SstWriter::new(&out_path, output_id, all.len(), self.config.bloom_fp_rate)
                    .map_err(|e| super::sst::SstReadError::Io {
                        sst_path: out_path.display().to_string(),
                        source: e,
                        detail: "create compaction output".into(),
                    })?;
            for entry in &all {
                writer
                    .add(&entry.key, entry.value.as_deref(), entry.seq)
                    .map_err(|e| super::sst::SstReadError::Io {
                        sst_path: out_path.display().to_string(),
                        source: e,
                        detail: "write compaction output".into(),
                    })?;
            }
            let meta = writer
                .finish(task.target_level)
                .map_err(|e| super::sst::SstReadError::Io {
                    sst_path: out_path.display().to_string(),
                    source: e,
                    detail: "finish compaction output".into(),
                })?;
            bytes_written = meta.file_size;
            produced.push(meta);
        }

        self.stats_runs.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.stats_bytes_written
            .fetch_add(bytes_written, Ordering::Relaxed);
        self.stats_files_consumed
            .fetch_add(task.inputs.len() as u64, Ordering::Relaxed);
        self.stats_files_produced
            .fetch_add(produced.len() as u64, Ordering::Relaxed);
        self.stats_tombstones_dropped
            .fetch_add(tombstones_dropped, Ordering::Relaxed);

        Ok(CompactionResult {
            consumed: task.inputs.clone(),
            produced,
            bytes_read,
            bytes_written,
            tombstones_dropped,
        })
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            runs_completed: self.stats_runs.load(Ordering::Relaxed),
            bytes_read: self.stats_bytes_read.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            files_consumed: self.stats_files_consumed.load(Ordering::Relaxed),
            files_produced: self.stats_files_produced.load(Ordering::Relaxed),
            tombstones_dropped: self.stats_tombstones_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }
}

fn key_range(metas: &[SstMeta]) -> (Vec<u8>, Vec<u8>) {
    let mut min = Vec::new();
    let mut max = Vec::new();
    for m in metas {
        if min.is_empty() || m.min_key < min {
            min = m.min_key.clone();
        }
        if max.is_empty() || m.max_key > max {
            max = m.max_key.clone();
        }
    }
    (min, max)
}

fn overlaps(meta: &SstMeta, min: &[u8], max: &[u8]) -> bool {
    meta.max_key.as_slice() >= min && meta.min_key.as_slice() <= max
}
