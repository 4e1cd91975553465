//! Segmented write-ahead log for consensus state.
//!
//! Every log entry, truncation, hard-state update, and compaction marker
//! is appended here before the node acknowledges it. Records are framed
//! `[len: u32][crc32: u32][bincode body]`; each segment starts with a
//! magic + format-version header and rotates at a size threshold.
//!
//! Replay tolerates a torn tail: a record whose length or checksum does
//! not line up marks the end of usable log, everything before it is kept.
//! Anything after a torn record is unreachable by design — the node never
//! acknowledged it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use kestrel_common::error::StorageError;
use kestrel_common::types::{LogIndex, NodeId, Term};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// WAL format version for compatibility checks.
pub const WAL_FORMAT_VERSION: u32 = 1;

/// Magic bytes at the start of each segment.
pub const WAL_MAGIC: &[u8; 4] = b"KSTL";

/// Segment header: magic (4) + format version (4).
pub const WAL_SEGMENT_HEADER_SIZE: usize = 8;

/// A single durable consensus record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    /// A log entry at `index` with opaque payload bytes (the consensus
    /// layer owns the payload encoding).
    Append {
        index: LogIndex,
        term: Term,
        payload: Vec<u8>,
    },
    /// Discard entries at and above `from` (conflict resolution).
    Truncate { from: LogIndex },
    /// Current term and vote. Written before any RPC reply that makes a
    /// term or vote promise.
    HardState { term: Term, voted_for: Option<NodeId> },
    /// Entries at and below `index` are covered by a snapshot; `term` is
    /// the term of the entry at `index`.
    Compact { index: LogIndex, term: Term },
}

/// Durability mode for appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    None,
    FSync,
    FDataSync,
}

impl SyncMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "fsync" => Some(Self::FSync),
            "fdatasync" => Some(Self::FDataSync),
            _ => None,
        }
    }
}

const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

fn segment_filename(segment_id: u64) -> String {
    format!("kestrel_{:06}.wal", segment_id)
}

fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("kestrel_")?
        .strip_suffix(".wal")?
        .parse()
        .ok()
}

/// Append-only writer with segment rotation.
pub struct WalWriter {
    inner: Mutex<WalWriterInner>,
    sync_mode: SyncMode,
    max_segment_size: u64,
}

struct WalWriterInner {
    writer: BufWriter<File>,
    dir: PathBuf,
    current_segment: u64,
    current_segment_size: u64,
}

impl WalWriter {
    pub fn open(dir: &Path, sync_mode: SyncMode) -> Result<Self, StorageError> {
        Self::open_with_options(dir, sync_mode, DEFAULT_SEGMENT_SIZE)
    }

    pub fn open_with_options(
        dir: &Path,
        sync_mode: SyncMode,
        max_segment_size: u64,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;

        let segment_id = Self::find_latest_segment(dir).unwrap_or(0);
        let seg_path = dir.join(segment_filename(segment_id));
        let file = OpenOptions::new().create(true).append(true).open(&seg_path)?;
        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let mut current_segment_size = file_len;
        let mut writer = BufWriter::new(file);

        if file_len == 0 {
            writer.write_all(WAL_MAGIC)?;
            writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
            current_segment_size = WAL_SEGMENT_HEADER_SIZE as u64;
        }

        Ok(Self {
            inner: Mutex::new(WalWriterInner {
                writer,
                dir: dir.to_path_buf(),
                current_segment: segment_id,
                current_segment_size,
            }),
            sync_mode,
            max_segment_size,
        })
    }

    fn find_latest_segment(dir: &Path) -> Option<u64> {
        let mut max_id = None;
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                if let Some(id) = parse_segment_id(&entry.file_name().to_string_lossy()) {
                    max_id = Some(max_id.map_or(id, |cur: u64| cur.max(id)));
                }
            }
        }
        max_id
    }

    /// Append a record to the buffer. Not durable until `sync()` returns.
    pub fn append(&self, record: &WalRecord) -> Result<(), StorageError> {
        let data =
            bincode::serialize(record).map_err(|e| StorageError::Codec(e.to_string()))?;
        let checksum = crc32fast::hash(&data);
        let record_size = 8 + data.len() as u64;

        let mut inner = self.inner.lock();
        if inner.current_segment_size + record_size > self.max_segment_size {
            self.rotate_segment(&mut inner)?;
        }

        inner.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&checksum.to_le_bytes())?;
        inner.writer.write_all(&data)?;
        inner.current_segment_size += record_size;
        Ok(())
    }

    /// Flush buffered records and sync per the configured mode. A failure
    /// here is a persistence failure: the caller must not acknowledge
    /// anything appended since the last successful sync.
    pub fn sync(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner
            .writer
            .flush()
            .map_err(|e| StorageError::persistence("wal flush", e))?;
        match self.sync_mode {
            SyncMode::None => {}
            SyncMode::FSync => inner
                .writer
                .get_ref()
                .sync_all()
                .map_err(|e| StorageError::persistence("wal fsync", e))?,
            SyncMode::FDataSync => inner
                .writer
                .get_ref()
                .sync_data()
                .map_err(|e| StorageError::persistence("wal fdatasync", e))?,
        }
        Ok(())
    }

    /// Append a single record durably.
    pub fn append_durable(&self, record: &WalRecord) -> Result<(), StorageError> {
        self.append(record)?;
        self.sync()
    }

    /// Force a switch to a fresh segment. Used when checkpointing: the
    /// caller rewrites the live suffix of the log into the new segment and
    /// then purges everything before it.
    pub fn rotate(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        self.rotate_segment(&mut inner)
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<(), StorageError> {
        inner.writer.flush()?;
        if !matches!(self.sync_mode, SyncMode::None) {
            inner
                .writer
                .get_ref()
                .sync_data()
                .map_err(|e| StorageError::persistence("wal rotate sync", e))?;
        }

        inner.current_segment += 1;
        let new_path = inner.dir.join(segment_filename(inner.current_segment));
        let file = OpenOptions::new().create(true).append(true).open(&new_path)?;
        inner.writer = BufWriter::new(file);
        inner.writer.write_all(WAL_MAGIC)?;
        inner.writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
        inner.current_segment_size = WAL_SEGMENT_HEADER_SIZE as u64;

        tracing::debug!("WAL rotated to segment {}", inner.current_segment);
        Ok(())
    }

    pub fn current_segment_id(&self) -> u64 {
        self.inner.lock().current_segment
    }

    /// Remove segments with IDs below `segment_id`. Used after a snapshot
    /// makes a log prefix unnecessary.
    pub fn purge_segments_before(&self, segment_id: u64) -> Result<usize, StorageError> {
        let inner = self.inner.lock();
        let mut removed = 0;
        for id in 0..segment_id {
            let path = inner.dir.join(segment_filename(id));
            if path.exists() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Result of replaying the WAL.
#[derive(Debug, Default)]
pub struct WalReplay {
    pub records: Vec<WalRecord>,
    /// True if replay stopped at a torn or corrupt tail record.
    pub torn_tail: bool,
}

/// Reads all segments in order for crash recovery.
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Replay all records from all segments in segment order.
    pub fn read_all(&self) -> Result<WalReplay, StorageError> {
        let mut replay = WalReplay::default();

        let mut segment_ids = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if let Some(id) = parse_segment_id(&entry.file_name().to_string_lossy()) {
                    segment_ids.push(id);
                }
            }
        }
        segment_ids.sort_unstable();

        for seg_id in segment_ids {
            let seg_path = self.dir.join(segment_filename(seg_id));
            let data = fs::read(&seg_path)?;
            Self::parse_records(&data, &mut replay);
            if replay.torn_tail {
                // A torn segment is only valid as the last one. Records in
                // later segments were written after the tear and were never
                // acknowledged in order, so stop here.
                break;
            }
        }
        Ok(replay)
    }

    fn parse_records(data: &[u8], replay: &mut WalReplay) {
        let mut pos = 0;
        if data.len() >= WAL_SEGMENT_HEADER_SIZE && &data[0..4] == WAL_MAGIC.as_slice() {
            pos = WAL_SEGMENT_HEADER_SIZE;
        }

        while pos + 8 <= data.len() {
            let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                as usize;
            let checksum =
                u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
            pos += 8;

            if pos + len > data.len() {
                tracing::warn!("WAL truncated at position {}, stopping replay", pos);
                replay.torn_tail = true;
                return;
            }
            let body = &data[pos..pos + len];
            if crc32fast::hash(body) != checksum {
                tracing::warn!("WAL checksum mismatch at position {}, stopping replay", pos);
                replay.torn_tail = true;
                return;
            }
            match bincode::deserialize::<WalRecord>(body) {
                Ok(record) => replay.records.push(record),
                Err(e) => {
                    tracing::warn!("WAL decode error at position {}: {}", pos, e);
                    replay.torn_tail = true;
                    return;
                }
            }
            pos += len;
        }
        if pos != data.len() {
            replay.torn_tail = true;
        }
    }
}
