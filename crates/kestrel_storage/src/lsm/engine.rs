//! Top-level LSM engine.
//!
//! Coordinates the memtable, SST files, manifest, and compaction into a
//! unified key-value store for applied replication state.
//!
//! Write path: active memtable → (freeze + flush) → L0 SST → compaction
//! Read path:  memtable → frozen memtables → L0 (newest first) → L1..Ln

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use kestrel_common::error::StorageError;
use parking_lot::{Mutex, RwLock};

use super::compaction::{CompactionConfig, CompactionPolicy, CompactionStats, Compactor};
use super::manifest::{Manifest, ManifestSst};
use super::memtable::MemTable;
use super::sst::{sst_filename, SstEntry, SstMeta, SstReader, SstWriter};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct LsmEngineConfig {
    /// Memtable size threshold that triggers freeze + flush.
    pub memtable_size_bytes: u64,
    pub compaction: CompactionConfig,
    /// Bounded queue depth for the background compaction worker.
    pub compaction_queue_depth: usize,
}

impl Default for LsmEngineConfig {
    fn default() -> Self {
        Self {
            memtable_size_bytes: 4 * 1024 * 1024,
            compaction: CompactionConfig::default(),
            compaction_queue_depth: 16,
        }
    }
}

/// Engine statistics snapshot.
#[derive(Debug, Clone)]
pub struct LsmStats {
    pub memtable_bytes: u64,
    pub memtable_entries: u64,
    pub frozen_memtable_count: usize,
    pub l0_file_count: usize,
    pub total_sst_files: usize,
    pub total_sst_bytes: u64,
    pub flushes_completed: u64,
    pub writes_stalled: u64,
    pub quarantined_files: u64,
    pub compaction: CompactionStats,
    pub applied_seq: u64,
}

/// The LSM storage engine. Sequence numbers come from the caller; the
/// replication layer passes its log index so that re-applying a prefix of
/// the log is idempotent.
pub struct LsmEngine {
    config: LsmEngineConfig,
    data_dir: PathBuf,

    active_memtable: RwLock<Arc<MemTable>>,
    /// Frozen memtables awaiting flush (oldest first).
    frozen_memtables: RwLock<Vec<Arc<MemTable>>>,

    /// Live SSTs per level. L0 overlaps, ordered by max_seq on read;
    /// L1+ hold non-overlapping ranges sorted by min_key.
    levels: RwLock<Vec<Vec<SstMeta>>>,

    compactor: Compactor,
    /// Sender to the background compaction worker, once attached.
    compaction_tx: Mutex<Option<SyncSender<WorkerMsg>>>,

    next_sst_id: AtomicU64,
    /// Highest sequence durable in SSTs (manifest `flushed_seq`).
    flushed_seq: AtomicU64,
    flushes_completed: AtomicU64,
    writes_stalled: AtomicU64,
    quarantined_files: AtomicU64,
    shutdown: AtomicBool,
    /// Serializes flushes and manifest writes.
    flush_lock: Mutex<()>,
}

enum WorkerMsg {
    Compact,
    Shutdown,
}

impl LsmEngine {
    /// Open or create an engine at the given directory.
    ///
    /// Recovery order: load the manifest, delete SST files the manifest
    /// does not name (interrupted compaction leftovers), then verify each
    /// named file. A file that fails verification is quarantined rather
    /// than deleted, and the engine keeps serving from the rest.
    pub fn open(data_dir: &Path, config: LsmEngineConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir)?;
        let max_levels = config.compaction.max_levels;

        let manifest = match Manifest::load(data_dir)? {
            Some(m) => m,
            None => Manifest::new(max_levels),
        };

        let mut quarantined = 0u64;
        Self::remove_orphan_ssts(data_dir, &manifest)?;
        let levels = Self::verify_manifest_ssts(data_dir, &manifest, max_levels, &mut quarantined);

        let engine = Self {
            compactor: Compactor::new(config.compaction.clone(), data_dir),
            config,
            data_dir: data_dir.to_path_buf(),
            active_memtable: RwLock::new(Arc::new(MemTable::new())),
            frozen_memtables: RwLock::new(Vec::new()),
            levels: RwLock::new(levels),
            compaction_tx: Mutex::new(None),
            next_sst_id: AtomicU64::new(manifest.next_sst_id.max(1)),
            flushed_seq: AtomicU64::new(manifest.flushed_seq),
            flushes_completed: AtomicU64::new(0),
            writes_stalled: AtomicU64::new(0),
            quarantined_files: AtomicU64::new(quarantined),
            shutdown: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        };
        if quarantined > 0 {
            engine.persist_manifest()?;
        }
        Ok(engine)
    }

    // ── Write Path ──────────────────────────────────────────────────────

    /// Put a key-value pair at the given sequence.
    pub fn put(&self, key: &[u8], value: &[u8], seq: u64) -> Result<(), StorageError> {
        self.maybe_stall_writes()?;
        let memtable = self.active_memtable.read().clone();
        memtable
            .put(key.to_vec(), value.to_vec(), seq)
            .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))?;
        self.maybe_trigger_flush()?;
        Ok(())
    }

    /// Delete a key (insert a tombstone) at the given sequence.
    pub fn delete(&self, key: &[u8], seq: u64) -> Result<(), StorageError> {
        self.maybe_stall_writes()?;
        let memtable = self.active_memtable.read().clone();
        memtable
            .delete(key.to_vec(), seq)
            .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))?;
        self.maybe_trigger_flush()?;
        Ok(())
    }

    // ── Read Path ───────────────────────────────────────────────────────

    /// Point lookup. Memtables first (active, then frozen newest-first),
    /// then the SSTs: under the leveled policy L0 by max_seq and one
    /// candidate per deeper level; under size-tiered, every candidate
    /// table with the highest sequence winning.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let active = self.active_memtable.read().clone();
        if let Some(result) = active.get(key) {
            return Ok(result); // Some(data) or None for a tombstone
        }

        {
            let frozen = self.frozen_memtables.read();
            for mt in frozen.iter().rev() {
                if let Some(result) = mt.get(key) {
                    return Ok(result);
                }
            }
        }

        let levels = self.levels.read();

        if self.config.compaction.policy == CompactionPolicy::SizeTiered {
            // Tier merges leave overlapping tables in a level, and a merge
            // can push a key's newest version down while an older version
            // stays above, so table position proves nothing about recency.
            // Read every candidate and keep the highest sequence.
            let mut best: Option<SstEntry> = None;
            for meta in levels.iter().flatten() {
                if !meta.may_contain_key(key) {
                    continue;
                }
                let reader = SstReader::open(&meta.path, meta.id)?;
                if let Some(entry) = reader.get(key)? {
                    if best.as_ref().map_or(true, |b| entry.seq > b.seq) {
                        best = Some(entry);
                    }
                }
            }
            return Ok(best.and_then(|e| e.value));
        }

        // Leveled: L0 files are whole flush outputs with disjoint seq
        // ranges, so the newest containing file is definitive; L1+ hold
        // non-overlapping ranges, at most one candidate per level.
        let mut l0: Vec<&SstMeta> = levels[0].iter().collect();
        l0.sort_by(|a, b| b.max_seq.cmp(&a.max_seq));
        for meta in l0 {
            if !meta.may_contain_key(key) {
                continue;
            }
            let reader = SstReader::open(&meta.path, meta.id)?;
            if let Some(entry) = reader.get(key)? {
                return Ok(entry.value);
            }
        }

        for level in levels.iter().skip(1) {
            let idx = level.partition_point(|m| m.max_key.as_slice() < key);
            if idx < level.len() && level[idx].may_contain_key(key) {
                let meta = &level[idx];
                let reader = SstReader::open(&meta.path, meta.id)?;
                if let Some(entry) = reader.get(key)? {
                    return Ok(entry.value);
                }
            }
        }
        Ok(None)
    }

    /// Range scan over `[start, end)`, merged across the memtables and all
    /// levels. Newest sequence wins per key; tombstoned keys are omitted.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let in_range = |key: &[u8]| key >= start && key < end;
        let mut merged: Vec<(Vec<u8>, Option<Vec<u8>>, u64)> = Vec::new();

        for (k, v, seq) in self.active_memtable.read().iter_sorted() {
            if in_range(&k) {
                merged.push((k, v, seq));
            }
        }
        for mt in self.frozen_memtables.read().iter() {
            for (k, v, seq) in mt.iter_sorted() {
                if in_range(&k) {
                    merged.push((k, v, seq));
                }
            }
        }
        {
            let levels = self.levels.read();
            for level in levels.iter() {
                for meta in level {
                    if meta.max_key.as_slice() < start || meta.min_key.as_slice() >= end {
                        continue;
                    }
                    let reader = SstReader::open(&meta.path, meta.id)?;
                    for e in reader.scan()? {
                        if in_range(&e.key) {
                            merged.push((e.key, e.value, e.seq));
                        }
                    }
                }
            }
        }

        merged.sort_by(|a, b| a.0.cmp(&b.0).then(b.2.cmp(&a.2)));
        merged.dedup_by(|next, kept| next.0 == kept.0);

        Ok(merged
            .into_iter()
            .filter_map(|(k, v, _)| v.map(|v| (k, v)))
            .collect())
    }

    // ── Flush ───────────────────────────────────────────────────────────

    /// Flush the active memtable to an L0 SST: freeze it, swap in a fresh
    /// one, write the frozen contents, then commit the manifest.
    pub fn flush(&self) -> Result<(), StorageError> {
        let _lock = self.flush_lock.lock();

        let frozen = {
            let mut active = self.active_memtable.write();
            let old = active.clone();
            if old.is_empty() {
                return Ok(());
            }
            old.freeze();
            *active = Arc::new(MemTable::new());
            old
        };
        self.frozen_memtables.write().push(frozen.clone());

        let id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
        let path = self.data_dir.join(sst_filename(id));
        let entries = frozen.iter_sorted();

        let mut writer = SstWriter::new(
            &path,
            id,
            entries.len(),
            self.config.compaction.bloom_fp_rate,
        )
        .map_err(|e| StorageError::persistence("sst create", e))?;
        for (key, value, seq) in &entries {
            writer
                .add(key, value.as_deref(), *seq)
                .map_err(|e| StorageError::persistence("sst write", e))?;
        }
        let meta = writer
            .finish(0)
            .map_err(|e| StorageError::persistence("sst finish", e))?;

        self.levels.write()[0].push(meta);
        self.flushed_seq.fetch_max(frozen.max_seq(), Ordering::SeqCst);
        self.persist_manifest()?;

        self.frozen_memtables
            .write()
            .retain(|m| !Arc::ptr_eq(m, &frozen));
        self.flushes_completed.fetch_add(1, Ordering::Relaxed);

        self.schedule_compaction();
        Ok(())
    }

    // ── Compaction ──────────────────────────────────────────────────────

    /// Run at most one compaction task. Returns true if work was done.
    pub fn compact_once(&self) -> Result<bool, StorageError> {
        let task = {
            let levels = self.levels.read();
            match self.compactor.plan(&levels) {
                Some(t) => t,
                None => return Ok(false),
            }
        };

        let output_id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
        let result = self.compactor.run(&task, output_id)?;

        {
            let _lock = self.flush_lock.lock();
            let mut levels = self.levels.write();
            let consumed_ids: Vec<u64> = result.consumed.iter().map(|m| m.id).collect();
            for level in levels.iter_mut() {
                level.retain(|m| !consumed_ids.contains(&m.id));
            }
            let target = task.target_level as usize;
            levels[target].extend(result.produced.iter().cloned());
            levels[target].sort_by(|a, b| a.min_key.cmp(&b.min_key));
            drop(levels);
            self.persist_manifest()?;
        }

        // Input files only become garbage once the manifest no longer
        // names them.
        for meta in &result.consumed {
            if let Err(e) = fs::remove_file(&meta.path) {
                tracing::warn!("failed to remove compacted SST {:?}: {}", meta.path, e);
            }
        }

        tracing::debug!(
            consumed = result.consumed.len(),
            produced = result.produced.len(),
            tombstones_dropped = result.tombstones_dropped,
            "compaction completed"
        );
        Ok(true)
    }

    /// Nudge the background worker. Dropping the nudge when the queue is
    /// full is fine: the backlog that caused it will nudge again.
    fn schedule_compaction(&self) {
        let tx = self.compaction_tx.lock();
        if let Some(tx) = tx.as_ref() {
            match tx.try_send(WorkerMsg::Compact) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => {
                    tracing::warn!("compaction worker is gone");
                }
            }
        }
    }

    // ── Snapshot support ────────────────────────────────────────────────

    /// Export every live key-value pair in sorted order, tombstones
    /// resolved and dropped. This is the state-machine image shipped in
    /// snapshots.
    pub fn export_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut merged: Vec<(Vec<u8>, Option<Vec<u8>>, u64)> = Vec::new();

        merged.extend(self.active_memtable.read().iter_sorted());
        for mt in self.frozen_memtables.read().iter() {
            merged.extend(mt.iter_sorted());
        }
        {
            let levels = self.levels.read();
            for level in levels.iter() {
                for meta in level {
                    let reader = SstReader::open(&meta.path, meta.id)?;
                    for e in reader.scan()? {
                        merged.push((e.key, e.value, e.seq));
                    }
                }
            }
        }

        merged.sort_by(|a, b| a.0.cmp(&b.0).then(b.2.cmp(&a.2)));
        merged.dedup_by(|next, kept| next.0 == kept.0);

        Ok(merged
            .into_iter()
            .filter_map(|(k, v, _)| v.map(|v| (k, v)))
            .collect())
    }

    /// Replace the entire store with a snapshot image at `snapshot_seq`.
    /// All existing memtables and SSTs are discarded.
    pub fn restore(
        &self,
        entries: &[(Vec<u8>, Vec<u8>)],
        snapshot_seq: u64,
    ) -> Result<(), StorageError> {
        let _lock = self.flush_lock.lock();

        let old_paths: Vec<PathBuf> = {
            let levels = self.levels.read();
            levels
                .iter()
                .flat_map(|l| l.iter().map(|m| m.path.clone()))
                .collect()
        };

        *self.active_memtable.write() = Arc::new(MemTable::new());
        self.frozen_memtables.write().clear();

        let mut new_levels: Vec<Vec<SstMeta>> =
            vec![Vec::new(); self.config.compaction.max_levels];
        if !entries.is_empty() {
            let id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
            let path = self.data_dir.join(sst_filename(id));
            let mut writer = SstWriter::new(
                &path,
                id,
                entries.len(),
                self.config.compaction.bloom_fp_rate,
            )
            .map_err(|e| StorageError::persistence("snapshot sst create", e))?;
            for (key, value) in entries {
                writer
                    .add(key, Some(value), snapshot_seq)
                    .map_err(|e| StorageError::persistence("snapshot sst write", e))?;
            }
            let meta = writer
                .finish(1)
                .map_err(|e| StorageError::persistence("snapshot sst finish", e))?;
            new_levels[1].push(meta);
        }

        *self.levels.write() = new_levels;
        self.flushed_seq.store(snapshot_seq, Ordering::SeqCst);
        self.persist_manifest()?;

        for path in old_paths {
            let _ = fs::remove_file(&path);
        }
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Highest sequence reflected anywhere in the store. After a clean
    /// restart this is the manifest's flushed sequence; the replication
    /// layer re-applies log entries above it.
    pub fn applied_seq(&self) -> u64 {
        let mut seq = self.flushed_seq.load(Ordering::SeqCst);
        seq = seq.max(self.active_memtable.read().max_seq());
        for mt in self.frozen_memtables.read().iter() {
            seq = seq.max(mt.max_seq());
        }
        seq
    }

    pub fn stats(&self) -> LsmStats {
        let active = self.active_memtable.read();
        let frozen = self.frozen_memtables.read();
        let levels = self.levels.read();

        LsmStats {
            memtable_bytes: active.approx_bytes(),
            memtable_entries: active.entry_count(),
            frozen_memtable_count: frozen.len(),
            l0_file_count: levels[0].len(),
            total_sst_files: levels.iter().map(|l| l.len()).sum(),
            total_sst_bytes: levels
                .iter()
                .flat_map(|l| l.iter())
                .map(|m| m.file_size)
                .sum(),
            flushes_completed: self.flushes_completed.load(Ordering::Relaxed),
            writes_stalled: self.writes_stalled.load(Ordering::Relaxed),
            quarantined_files: self.quarantined_files.load(Ordering::Relaxed),
            compaction: self.compactor.stats(),
            applied_seq: self.applied_seq(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Flush pending data and stop accepting background work.
    pub fn close(&self) -> Result<(), StorageError> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = self.compaction_tx.lock().take() {
            let _ = tx.send(WorkerMsg::Shutdown);
        }
        self.flush()
    }

    // ── Internal helpers ────────────────────────────────────────────────

    fn maybe_trigger_flush(&self) -> Result<(), StorageError> {
        let over_budget = {
            let active = self.active_memtable.read();
            active.approx_bytes() >= self.config.memtable_size_bytes
        };
        if over_budget {
            self.flush()?;
        }
        Ok(())
    }

    fn maybe_stall_writes(&self) -> Result<(), StorageError> {
        let l0_count = self.levels.read()[0].len();
        if self.compactor.should_stall_writes(l0_count) {
            self.writes_stalled.fetch_add(1, Ordering::Relaxed);
            self.schedule_compaction();
            return Err(StorageError::WriteStalled {
                l0_files: l0_count,
                stall_threshold: self.compactor.config().l0_stall_trigger,
            });
        }
        Ok(())
    }

    fn persist_manifest(&self) -> Result<(), StorageError> {
        let manifest = {
            let levels = self.levels.read();
            Manifest {
                next_sst_id: self.next_sst_id.load(Ordering::SeqCst),
                flushed_seq: self.flushed_seq.load(Ordering::SeqCst),
                levels: levels
                    .iter()
                    .map(|l| l.iter().map(ManifestSst::from_meta).collect())
                    .collect(),
            }
        };
        manifest
            .store(&self.data_dir)
            .map_err(|e| StorageError::persistence("manifest store", e))
    }

    fn remove_orphan_ssts(data_dir: &Path, manifest: &Manifest) -> Result<(), StorageError> {
        let live = manifest.live_ids();
        for entry in fs::read_dir(data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sst") {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok());
            match id {
                Some(id) if live.contains(&id) => {}
                _ => {
                    tracing::info!("removing orphan SST {:?}", path);
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }

    fn verify_manifest_ssts(
        data_dir: &Path,
        manifest: &Manifest,
        max_levels: usize,
        quarantined: &mut u64,
    ) -> Vec<Vec<SstMeta>> {
        let mut levels: Vec<Vec<SstMeta>> = vec![Vec::new(); max_levels];
        for (level, files) in manifest.levels.iter().enumerate() {
            if level >= max_levels {
                break;
            }
            for rec in files {
                let meta = rec.to_meta(data_dir);
                match SstReader::open(&meta.path, meta.id) {
                    Ok(_) => levels[level].push(meta),
                    Err(e) => {
                        *quarantined += 1;
                        Self::quarantine_sst(&meta.path, &e.to_string());
                    }
                }
            }
        }
        for level in levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.min_key.cmp(&b.min_key));
        }
        levels
    }

    fn quarantine_sst(path: &Path, reason: &str) {
        let dest = path.with_extension("sst.quarantine");
        tracing::warn!(path = ?path, reason, "quarantining corrupt SST");
        if let Err(e) = fs::rename(path, &dest) {
            tracing::warn!("failed to quarantine {:?}: {}", path, e);
        }
    }
}

// ── Background compaction worker ────────────────────────────────────────────

/// Owns the compaction thread. Work arrives over a bounded queue; a full
/// queue drops nudges rather than blocking the write path.
pub struct CompactionWorker {
    handle: Option<JoinHandle<()>>,
}

impl CompactionWorker {
    /// Spawn the worker and attach its queue to the engine.
    pub fn spawn(engine: Arc<LsmEngine>) -> Self {
        let (tx, rx) = sync_channel(engine.config.compaction_queue_depth);
        *engine.compaction_tx.lock() = Some(tx);
        let handle = std::thread::Builder::new()
            .name("lsm-compaction".into())
            .spawn(move || Self::run(engine, rx))
            .ok();
        Self { handle }
    }

    fn run(engine: Arc<LsmEngine>, rx: Receiver<WorkerMsg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                WorkerMsg::Shutdown => break,
                WorkerMsg::Compact => loop {
                    match engine.compact_once() {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            tracing::error!("background compaction failed: {}", e);
                            break;
                        }
                    }
                },
            }
        }
        tracing::debug!("compaction worker exiting");
    }

    /// Wait for the worker to finish. Call after `LsmEngine::close`.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_engine(dir: &Path) -> LsmEngine {
        LsmEngine::open(
            dir,
            LsmEngineConfig {
                memtable_size_bytes: 4096,
                compaction: CompactionConfig {
                    l0_compaction_trigger: 4,
                    l0_stall_trigger: 50,
                    ..Default::default()
                },
                compaction_queue_depth: 4,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());

        engine.put(b"key1", b"val1", 1).unwrap();
        engine.put(b"key2", b"val2", 2).unwrap();
        assert_eq!(engine.get(b"key1").unwrap(), Some(b"val1".to_vec()));
        assert_eq!(engine.get(b"key3").unwrap(), None);

        engine.delete(b"key1", 3).unwrap();
        assert_eq!(engine.get(b"key1").unwrap(), None);
        assert_eq!(engine.applied_seq(), 3);
    }

    #[test]
    fn test_flush_and_read_from_sst() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());

        engine.put(b"key1", b"val1", 1).unwrap();
        engine.delete(b"gone", 2).unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.get(b"key1").unwrap(), Some(b"val1".to_vec()));
        assert_eq!(engine.get(b"gone").unwrap(), None);

        let stats = engine.stats();
        assert_eq!(stats.flushes_completed, 1);
        assert_eq!(stats.l0_file_count, 1);
        assert_eq!(stats.memtable_entries, 0);
    }

    #[test]
    fn test_newer_l0_shadows_older() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());

        engine.put(b"k", b"old", 1).unwrap();
        engine.flush().unwrap();
        engine.put(b"k", b"new", 2).unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_tombstone_in_sst_shadows_older_sst() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());

        engine.put(b"k", b"v", 1).unwrap();
        engine.flush().unwrap();
        engine.delete(b"k", 2).unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_recovery_from_manifest() {
        let dir = TempDir::new().unwrap();
        {
            let engine = test_engine(dir.path());
            engine.put(b"persist", b"me", 9).unwrap();
            engine.flush().unwrap();
        }
        {
            let engine = test_engine(dir.path());
            assert_eq!(engine.get(b"persist").unwrap(), Some(b"me".to_vec()));
            assert_eq!(engine.applied_seq(), 9);
        }
    }

    #[test]
    fn test_recovery_removes_orphan_sst() {
        let dir = TempDir::new().unwrap();
        {
            let engine = test_engine(dir.path());
            engine.put(b"a", b"1", 1).unwrap();
            engine.flush().unwrap();
        }
        // Simulate an interrupted compaction output the manifest never saw.
        let orphan = dir.path().join(sst_filename(999));
        let mut w = SstWriter::new(&orphan, 999, 1, 0.01).unwrap();
        w.add(b"junk", Some(b"junk"), 1).unwrap();
        w.finish(0).unwrap();

        let engine = test_engine(dir.path());
        assert!(!orphan.exists(), "orphan SST should be deleted on open");
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"junk").unwrap(), None);
    }

    #[test]
    fn test_recovery_quarantines_corrupt_sst() {
        let dir = TempDir::new().unwrap();
        {
            let engine = test_engine(dir.path());
            engine.put(b"good", b"1", 1).unwrap();
            engine.flush().unwrap();
            engine.put(b"bad", b"2", 2).unwrap();
            engine.flush().unwrap();
        }

        // Corrupt the second SST's footer.
        let victim = dir.path().join(sst_filename(2));
        let mut data = fs::read(&victim).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&victim, &data).unwrap();

        let engine = test_engine(dir.path());
        let stats = engine.stats();
        assert_eq!(stats.quarantined_files, 1);
        assert!(victim.with_extension("sst.quarantine").exists());
        // The intact file still serves.
        assert_eq!(engine.get(b"good").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_compaction_merges_l0() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());

        for round in 0..4u64 {
            for i in 0..10u64 {
                let key = format!("k_{:03}", i);
                let val = format!("v{}_{}", round, i);
                engine
                    .put(key.as_bytes(), val.as_bytes(), round * 10 + i + 1)
                    .unwrap();
            }
            engine.flush().unwrap();
        }
        assert!(engine.stats().l0_file_count >= 4);

        assert!(engine.compact_once().unwrap());
        let stats = engine.stats();
        assert_eq!(stats.l0_file_count, 0);
        assert_eq!(stats.compaction.runs_completed, 1);

        // Newest round wins everywhere.
        for i in 0..10u64 {
            let key = format!("k_{:03}", i);
            let want = format!("v3_{}", i);
            assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(want.into_bytes()));
        }
    }

    #[test]
    fn test_size_tiered_overlapping_tables_newest_wins() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(
            dir.path(),
            LsmEngineConfig {
                memtable_size_bytes: 1 << 30,
                compaction: CompactionConfig {
                    policy: CompactionPolicy::SizeTiered,
                    tier_min_files: 2,
                    ..Default::default()
                },
                compaction_queue_depth: 4,
            },
        )
        .unwrap();

        // First tier merge lands k@2 in L1.
        engine.put(b"a", b"1", 1).unwrap();
        engine.put(b"k", b"v1", 2).unwrap();
        engine.flush().unwrap();
        engine.put(b"b", b"2", 3).unwrap();
        engine.put(b"c", b"3", 4).unwrap();
        engine.flush().unwrap();
        assert!(engine.compact_once().unwrap());

        // Second tier merge lands k@5 in a sibling L1 table whose key
        // range overlaps the first.
        engine.put(b"k", b"v2", 5).unwrap();
        engine.put(b"m", b"4", 6).unwrap();
        engine.flush().unwrap();
        engine.put(b"y", b"8", 7).unwrap();
        engine.put(b"z", b"9", 8).unwrap();
        engine.flush().unwrap();
        assert!(engine.compact_once().unwrap());

        let stats = engine.stats();
        assert_eq!(stats.l0_file_count, 0);
        assert_eq!(stats.compaction.runs_completed, 2);

        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"z").unwrap(), Some(b"9".to_vec()));
    }

    #[test]
    fn test_write_stall_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(
            dir.path(),
            LsmEngineConfig {
                memtable_size_bytes: 1 << 30,
                compaction: CompactionConfig {
                    l0_compaction_trigger: 100,
                    l0_stall_trigger: 2,
                    ..Default::default()
                },
                compaction_queue_depth: 4,
            },
        )
        .unwrap();

        engine.put(b"a", b"1", 1).unwrap();
        engine.flush().unwrap();
        engine.put(b"b", b"2", 2).unwrap();
        engine.flush().unwrap();

        let err = engine.put(b"c", b"3", 3).unwrap_err();
        assert!(matches!(err, StorageError::WriteStalled { .. }));
        assert_eq!(engine.stats().writes_stalled, 1);
    }

    #[test]
    fn test_scan_merges_across_sources() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());

        engine.put(b"a", b"old", 1).unwrap();
        engine.put(b"b", b"2", 2).unwrap();
        engine.put(b"d", b"4", 3).unwrap();
        engine.flush().unwrap();
        // Memtable shadows the flushed version and adds a tombstone.
        engine.put(b"a", b"new", 4).unwrap();
        engine.delete(b"d", 5).unwrap();
        engine.put(b"c", b"3", 6).unwrap();

        let all = engine.scan(b"a", b"z").unwrap();
        assert_eq!(
            all,
            vec![
                (b"a".to_vec(), b"new".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );

        // Half-open bounds: "b" included, "c" excluded.
        let sub = engine.scan(b"b", b"c").unwrap();
        assert_eq!(sub, vec![(b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn test_export_all_resolves_tombstones() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());

        engine.put(b"a", b"1", 1).unwrap();
        engine.put(b"b", b"2", 2).unwrap();
        engine.flush().unwrap();
        engine.delete(b"a", 3).unwrap();
        engine.put(b"c", b"3", 4).unwrap();

        let image = engine.export_all().unwrap();
        assert_eq!(
            image,
            vec![
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_restore_replaces_state() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());

        engine.put(b"stale", b"x", 1).unwrap();
        engine.flush().unwrap();

        let image = vec![
            (b"alpha".to_vec(), b"1".to_vec()),
            (b"beta".to_vec(), b"2".to_vec()),
        ];
        engine.restore(&image, 50).unwrap();

        assert_eq!(engine.get(b"stale").unwrap(), None);
        assert_eq!(engine.get(b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.applied_seq(), 50);

        // Restore survives a restart.
        drop(engine);
        let engine = test_engine(dir.path());
        assert_eq!(engine.get(b"beta").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.applied_seq(), 50);
    }

    #[test]
    fn test_idempotent_replay_same_seq() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(dir.path());

        engine.put(b"k", b"v1", 1).unwrap();
        engine.put(b"k", b"v2", 2).unwrap();
        // Replaying the same updates leaves the same state.
        engine.put(b"k", b"v1", 1).unwrap();
        engine.put(b"k", b"v2", 2).unwrap();

        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(engine.applied_seq(), 2);
    }

    #[test]
    fn test_background_worker_compacts() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(test_engine(dir.path()));
        let worker = CompactionWorker::spawn(engine.clone());

        for round in 0..5u64 {
            for i in 0..5u64 {
                let key = format!("k{}", i);
                engine
                    .put(key.as_bytes(), b"v", round * 5 + i + 1)
                    .unwrap();
            }
            engine.flush().unwrap();
        }

        // Wait for the worker to drain the L0 backlog.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while engine.stats().l0_file_count >= 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(engine.stats().l0_file_count < 4, "worker never compacted");

        engine.close().unwrap();
        worker.join();
    }

    #[test]
    fn test_many_writes_all_readable() {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(
            dir.path(),
            LsmEngineConfig {
                memtable_size_bytes: 2048,
                compaction: CompactionConfig {
                    l0_compaction_trigger: 4,
                    l0_stall_trigger: 100,
                    ..Default::default()
                },
                compaction_queue_depth: 4,
            },
        )
        .unwrap();

        let n = 500u64;
        for i in 0..n {
            let key = format!("k_{:06}", i);
            let val = format!("v_{:06}", i);
            engine.put(key.as_bytes(), val.as_bytes(), i + 1).unwrap();
        }
        while engine.compact_once().unwrap() {}

        for i in 0..n {
            let key = format!("k_{:06}", i);
            let val = format!("v_{:06}", i);
            assert_eq!(
                engine.get(key.as_bytes()).unwrap(),
                Some(val.into_bytes()),
                "missing {}",
                key
            );
        }
        assert!(engine.stats().flushes_completed > 0);
    }
}
