//! Sorted String Table (SST) file format.
//!
//! Layout:
//! ```text
//!   [DataBlock 0] [DataBlock 1] ... [DataBlock N]
//!   [IndexBlock]       — maps last_key_per_block → block_offset
//!   [BloomFilter]      — serialized bloom filter bytes
//!   [Footer]           — fixed 52-byte trailer with CRC
//! ```
//!
//! DataBlock layout: `[num_entries: u32] [entry...] [crc: u32]`
//!
//! Entry layout:
//! ```text
//!   [key_len: u32] [value_len: u32] [seq: u64] [flags: u8] [key] [value]
//! ```
//! Flag bit 0 marks a tombstone; tombstone entries carry an empty value.
//! The sequence travels with every entry so compaction can order versions
//! of the same key across files.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::bloom::BloomFilter;

/// Magic bytes for SST file identification.
const SST_MAGIC: &[u8; 4] = b"KSST";

/// SST format version.
const SST_FORMAT_VERSION: u32 = 1;

/// Target data block size. 4 KB default.
const TARGET_BLOCK_SIZE: usize = 4096;

/// Per-entry fixed header: key_len(4) + value_len(4) + seq(8) + flags(1).
const ENTRY_HEADER_SIZE: usize = 17;

/// Footer: magic(4) + version(4) + index_offset(8) + index_len(8) +
///         bloom_offset(8) + bloom_len(8) + entry_count(8) + crc(4) = 52.
const FOOTER_SIZE: usize = 52;

const FLAG_TOMBSTONE: u8 = 0b0000_0001;

// ── SstReadError — graded error type for SST read paths ──────────────────────

/// Graded error type for SST parse failures. Every variant carries
/// structured context for diagnostics.
#[derive(Debug)]
pub enum SstReadError {
    /// Data on disk does not match its checksum — file is corrupt.
    Corruption {
        sst_path: String,
        block_offset: u64,
        expected_crc: u32,
        actual_crc: u32,
        detail: String,
    },
    /// A structure is shorter than its declared length — truncated file.
    Truncated {
        sst_path: String,
        block_offset: u64,
        expected_len: usize,
        actual_len: usize,
        detail: String,
    },
    /// Underlying I/O error (permissions, disk failure, etc.).
    Io {
        sst_path: String,
        source: io::Error,
        detail: String,
    },
    /// Codec / format error (bad magic, unknown version, malformed encoding).
    Codec { sst_path: String, detail: String },
}

impl SstReadError {
    /// Whether this failure means the file itself is damaged (as opposed to
    /// an environmental I/O failure). Damaged files get quarantined.
    pub fn is_file_damage(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::Truncated { .. } | Self::Codec { .. }
        )
    }
}

impl fmt::Display for SstReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corruption {
                sst_path,
                block_offset,
                expected_crc,
                actual_crc,
                detail,
            } => write!(
                f,
                "SST corruption [{}]: block_offset={} expected_crc={:#010x} actual_crc={:#010x}: {}",
                sst_path, block_offset, expected_crc, actual_crc, detail
            ),
            Self::Truncated {
                sst_path,
                block_offset,
                expected_len,
                actual_len,
                detail,
            } => write!(
                f,
                "SST truncated [{}]: block_offset={} expected_len={} actual_len={}: {}",
                sst_path, block_offset, expected_len, actual_len, detail
            ),
            Self::Io {
                sst_path,
                source,
                detail,
            } => write!(f, "SST I/O error [{}]: {}: {}", sst_path, detail, source),
            Self::Codec { sst_path, detail } => {
                write!(f, "SST codec error [{}]: {}", sst_path, detail)
            }
        }
    }
}

impl std::error::Error for SstReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn slice_to_array<const N: usize>(slice: &[u8]) -> Result<[u8; N], SstReadError> {
    slice.try_into().map_err(|_| SstReadError::Codec {
        sst_path: String::new(),
        detail: "unexpected end of data".into(),
    })
}

fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Metadata about an SST file, kept in memory and in the manifest.
#[derive(Debug, Clone)]
pub struct SstMeta {
    /// File ID; also embedded in the filename.
    pub id: u64,
    pub path: PathBuf,
    /// LSM level (0 = freshly flushed, 1..N = compacted).
    pub level: u32,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub entry_count: u64,
    pub file_size: u64,
    /// Highest sequence in the file (for ordering L0 files).
    pub max_seq: u64,
}

impl SstMeta {
    pub fn may_contain_key(&self, key: &[u8]) -> bool {
        key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }
}

/// A single entry in an SST. `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub seq: u64,
}

// ── SST Writer ──────────────────────────────────────────────────────────────

/// Writes a new SST file from sorted key-value pairs.
pub struct SstWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    id: u64,
    bloom: BloomFilter,
    /// Index entries: (last_key_in_block, block_offset, block_len).
    index: Vec<(Vec<u8>, u64, u32)>,
    block_buf: Vec<u8>,
    block_entry_count: u32,
    offset: u64,
    entry_count: u64,
    max_seq: u64,
    first_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl SstWriter {
    /// Create a writer at the given path. `expected_entries` sizes the
    /// bloom filter.
    pub fn new(
        path: &Path,
        id: u64,
        expected_entries: usize,
        bloom_fp_rate: f64,
    ) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
            path: path.to_path_buf(),
            id,
            bloom: BloomFilter::new(expected_entries.max(1), bloom_fp_rate),
            index: Vec::new(),
            block_buf: Vec::with_capacity(TARGET_BLOCK_SIZE),
            block_entry_count: 0,
            offset: 0,
            entry_count: 0,
            max_seq: 0,
            first_key: None,
            last_key: None,
        })
    }

    /// Add an entry. Keys MUST be added in sorted order.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>, seq: u64) -> io::Result<()> {
        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        self.last_key = Some(key.to_vec());
        self.bloom.insert(key);
        self.max_seq = self.max_seq.max(seq);

        let val = value.unwrap_or(b"");
        let flags = if value.is_none() { FLAG_TOMBSTONE } else { 0 };
        self.block_buf
            .extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.block_buf
            .extend_from_slice(&(val.len() as u32).to_le_bytes());
        self.block_buf.extend_from_slice(&seq.to_le_bytes());
        self.block_buf.push(flags);
        self.block_buf.extend_from_slice(key);
        self.block_buf.extend_from_slice(val);
        self.block_entry_count += 1;
        self.entry_count += 1;

        if self.block_buf.len() >= TARGET_BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Finish the file. Returns metadata for the manifest.
    pub fn finish(mut self, level: u32) -> io::Result<SstMeta> {
        if !self.block_buf.is_empty() {
            self.flush_block()?;
        }

        let index_offset = self.offset;
        let index_data = self.encode_index();
        self.writer.write_all(&index_data)?;
        self.offset += index_data.len() as u64;

        let bloom_offset = self.offset;
        let bloom_data = self.bloom.to_bytes();
        self.writer.write_all(&bloom_data)?;
        self.offset += bloom_data.len() as u64;

        let mut footer = [0u8; FOOTER_SIZE];
        footer[0..4].copy_from_slice(SST_MAGIC);
        footer[4..8].copy_from_slice(&SST_FORMAT_VERSION.to_le_bytes());
        footer[8..16].copy_from_slice(&index_offset.to_le_bytes());
        footer[16..24].copy_from_slice(&(index_data.len() as u64).to_le_bytes());
        footer[24..32].copy_from_slice(&bloom_offset.to_le_bytes());
        footer[32..40].copy_from_slice(&(bloom_data.len() as u64).to_le_bytes());
        footer[40..48].copy_from_slice(&self.entry_count.to_le_bytes());
        let footer_crc = crc32(&footer[0..48]);
        footer[48..52].copy_from_slice(&footer_crc.to_le_bytes());
        self.writer.write_all(&footer)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        Ok(SstMeta {
            id: self.id,
            path: self.path,
            level,
            min_key: self.first_key.unwrap_or_default(),
            max_key: self.last_key.unwrap_or_default(),
            entry_count: self.entry_count,
            file_size: self.offset + FOOTER_SIZE as u64,
            max_seq: self.max_seq,
        })
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.block_buf.is_empty() {
            return Ok(());
        }
        let block_offset = self.offset;

        let header = self.block_entry_count.to_le_bytes();
        self.writer.write_all(&header)?;
        self.writer.write_all(&self.block_buf)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(&self.block_buf);
        let crc = hasher.finalize();
        self.writer.write_all(&crc.to_le_bytes())?;

        let block_len = 4 + self.block_buf.len() as u32 + 4;
        self.offset += block_len as u64;

        let last_key = self.last_key.clone().unwrap_or_default();
        self.index.push((last_key, block_offset, block_len));

        self.block_buf.clear();
        self.block_entry_count = 0;
        Ok(())
    }

    fn encode_index(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for (key, offset, len) in &self.index {
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
        }
        buf
    }
}

// ── SST Reader ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct IndexEntry {
    last_key: Vec<u8>,
    block_offset: u64,
    block_len: u32,
}

/// Reads an SST file for point lookups and full scans.
#[derive(Debug)]
pub struct SstReader {
    path: PathBuf,
    meta: SstMeta,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
}

impl SstReader {
    /// Open an SST and load its index + bloom filter into memory.
    pub fn open(path: &Path, sst_id: u64) -> Result<Self, SstReadError> {
        let sst_path = path.display().to_string();
        let io_err = |source: io::Error, detail: &str| SstReadError::Io {
            sst_path: sst_path.clone(),
            source,
            detail: detail.into(),
        };

        let file_len = fs::metadata(path).map_err(|e| io_err(e, "stat file"))?.len();
        if file_len < FOOTER_SIZE as u64 {
            return Err(SstReadError::Truncated {
                sst_path,
                block_offset: 0,
                expected_len: FOOTER_SIZE,
                actual_len: file_len as usize,
                detail: "file too small for footer".into(),
            });
        }

        let mut file =
            BufReader::new(File::open(path).map_err(|e| io_err(e, "open file"))?);
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))
            .map_err(|e| io_err(e, "seek to footer"))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)
            .map_err(|e| io_err(e, "read footer"))?;

        let stored_crc = u32::from_le_bytes(slice_to_array(&footer[48..52])?);
        let computed_crc = crc32(&footer[0..48]);
        if stored_crc != computed_crc {
            return Err(SstReadError::Corruption {
                sst_path,
                block_offset: file_len - FOOTER_SIZE as u64,
                expected_crc: stored_crc,
                actual_crc: computed_crc,
                detail: "footer checksum mismatch".into(),
            });
        }
        if &footer[0..4] != SST_MAGIC {
            return Err(SstReadError::Codec {
                sst_path,
                detail: format!("invalid magic: {:?}", &footer[0..4]),
            });
        }
        let version = u32::from_le_bytes(slice_to_array(&footer[4..8])?);
        if version != SST_FORMAT_VERSION {
            return Err(SstReadError::Codec {
                sst_path,
                detail: format!("unsupported SST version: {}", version),
            });
        }

        let index_offset = u64::from_le_bytes(slice_to_array(&footer[8..16])?);
        let index_len = u64::from_le_bytes(slice_to_array(&footer[16..24])?);
        let bloom_offset = u64::from_le_bytes(slice_to_array(&footer[24..32])?);
        let bloom_len = u64::from_le_bytes(slice_to_array(&footer[32..40])?);
        let entry_count = u64::from_le_bytes(slice_to_array(&footer[40..48])?);

        let data_end = file_len - FOOTER_SIZE as u64;
        if index_offset + index_len > data_end || bloom_offset + bloom_len > data_end {
            return Err(SstReadError::Truncated {
                sst_path,
                block_offset: index_offset,
                expected_len: (index_len + bloom_len) as usize,
                actual_len: data_end.saturating_sub(index_offset) as usize,
                detail: "index/bloom blocks extend beyond file".into(),
            });
        }

        file.seek(SeekFrom::Start(index_offset))
            .map_err(|e| io_err(e, "seek to index"))?;
        let mut index_buf = vec![0u8; index_len as usize];
        file.read_exact(&mut index_buf)
            .map_err(|e| io_err(e, "read index block"))?;
        let index = Self::parse_index(&index_buf).map_err(|detail| SstReadError::Codec {
            sst_path: sst_path.clone(),
            detail,
        })?;

        file.seek(SeekFrom::Start(bloom_offset))
            .map_err(|e| io_err(e, "seek to bloom"))?;
        let mut bloom_buf = vec![0u8; bloom_len as usize];
        file.read_exact(&mut bloom_buf)
            .map_err(|e| io_err(e, "read bloom filter"))?;
        let bloom = BloomFilter::from_bytes(&bloom_buf).ok_or_else(|| SstReadError::Codec {
            sst_path: sst_path.clone(),
            detail: "invalid bloom filter encoding".into(),
        })?;

        // Derive key range and max_seq by scanning block metadata lazily:
        // min key comes from the first block, max key from the index.
        let mut reader = Self {
            path: path.to_path_buf(),
            meta: SstMeta {
                id: sst_id,
                path: path.to_path_buf(),
                level: 0,
                min_key: Vec::new(),
                max_key: index.last().map(|e| e.last_key.clone()).unwrap_or_default(),
                entry_count,
                file_size: file_len,
                max_seq: 0,
            },
            index,
            bloom,
        };
        if let Some(first) = reader.index.first().cloned() {
            let block = reader.read_block(first.block_offset, first.block_len)?;
            let entries = reader.decode_block(&block, first.block_offset)?;
            if let Some(e) = entries.first() {
                reader.meta.min_key = e.key.clone();
            }
            reader.meta.max_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0);
        }
        Ok(reader)
    }

    /// Point lookup. `Ok(Some(entry))` includes tombstones so the caller
    /// can stop searching older files.
    pub fn get(&self, key: &[u8]) -> Result<Option<SstEntry>, SstReadError> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }
        let block_idx = self.index.partition_point(|e| e.last_key.as_slice() < key);
        if block_idx >= self.index.len() {
            return Ok(None);
        }
        let ie = &self.index[block_idx];
        let block = self.read_block(ie.block_offset, ie.block_len)?;
        let entries = self.decode_block(&block, ie.block_offset)?;
        Ok(entries.into_iter().find(|e| e.key == key))
    }

    /// Scan all entries in sorted order.
    pub fn scan(&self) -> Result<Vec<SstEntry>, SstReadError> {
        let mut out = Vec::new();
        for ie in &self.index {
            let block = self.read_block(ie.block_offset, ie.block_len)?;
            out.extend(self.decode_block(&block, ie.block_offset)?);
        }
        Ok(out)
    }

    pub fn meta(&self) -> &SstMeta {
        &self.meta
    }

    fn read_block(&self, offset: u64, len: u32) -> Result<Vec<u8>, SstReadError> {
        let sst_path = self.path.display().to_string();
        let mut file = BufReader::new(File::open(&self.path).map_err(|e| SstReadError::Io {
            sst_path: sst_path.clone(),
            source: e,
            detail: "open for block read".into(),
        })?);
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SstReadError::Io {
                sst_path: sst_path.clone(),
                source: e,
                detail: format!("seek to block offset={}", offset),
            })?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).map_err(|e| SstReadError::Truncated {
            sst_path: sst_path.clone(),
            block_offset: offset,
            expected_len: len as usize,
            actual_len: 0,
            detail: format!("block read_exact: {}", e),
        })?;

        let data_len = (len as usize).saturating_sub(4);
        let stored_crc = u32::from_le_bytes(slice_to_array(&buf[data_len..data_len + 4])?);
        let computed_crc = crc32(&buf[..data_len]);
        if stored_crc != computed_crc {
            return Err(SstReadError::Corruption {
                sst_path,
                block_offset: offset,
                expected_crc: stored_crc,
                actual_crc: computed_crc,
                detail: "block checksum mismatch".into(),
            });
        }
        buf.truncate(data_len);
        Ok(buf)
    }

    fn decode_block(&self, block: &[u8], offset: u64) -> Result<Vec<SstEntry>, SstReadError> {
        let truncated = |detail: String| SstReadError::Truncated {
            sst_path: self.path.display().to_string(),
            block_offset: offset,
            expected_len: 0,
            actual_len: block.len(),
            detail,
        };
        if block.len() < 4 {
            return Err(truncated("block too short for header".into()));
        }
        let num_entries = u32::from_le_bytes(slice_to_array(&block[0..4])?) as usize;
        let mut pos = 4;
        let mut entries = Vec::with_capacity(num_entries);

        for i in 0..num_entries {
            if pos + ENTRY_HEADER_SIZE > block.len() {
                return Err(truncated(format!(
                    "entry header {}/{} overruns block at pos {}",
                    i, num_entries, pos
                )));
            }
            let key_len = u32::from_le_bytes(slice_to_array(&block[pos..pos + 4])?) as usize;
            let val_len = u32::from_le_bytes(slice_to_array(&block[pos + 4..pos + 8])?) as usize;
            let seq = u64::from_le_bytes(slice_to_array(&block[pos + 8..pos + 16])?);
            let flags = block[pos + 16];
            pos += ENTRY_HEADER_SIZE;

            if pos + key_len + val_len > block.len() {
                return Err(truncated(format!(
                    "entry {}/{} overflow: key_len={} val_len={} pos={}",
                    i, num_entries, key_len, val_len, pos
                )));
            }
            let key = block[pos..pos + key_len].to_vec();
            let value = if flags & FLAG_TOMBSTONE != 0 {
                None
            } else {
                Some(block[pos + key_len..pos + key_len + val_len].to_vec())
            };
            pos += key_len + val_len;
            entries.push(SstEntry { key, value, seq });
        }
        Ok(entries)
    }

    fn parse_index(data: &[u8]) -> Result<Vec<IndexEntry>, String> {
        if data.len() < 4 {
            return Err(format!("index too short: {} bytes", data.len()));
        }
        let count = u32::from_le_bytes(data[0..4].try_into().map_err(|_| "bad count")?) as usize;
        let mut pos = 4;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            if pos + 16 > data.len() {
                return Err(format!("index truncated at entry {}/{}", i, count));
            }
            let block_offset =
                u64::from_le_bytes(data[pos..pos + 8].try_into().map_err(|_| "bad offset")?);
            let block_len =
                u32::from_le_bytes(data[pos + 8..pos + 12].try_into().map_err(|_| "bad len")?);
            let key_len = u32::from_le_bytes(
                data[pos + 12..pos + 16].try_into().map_err(|_| "bad key_len")?,
            ) as usize;
            pos += 16;
            if pos + key_len > data.len() {
                return Err(format!("index entry {}/{} key overflow", i, count));
            }
            let last_key = data[pos..pos + key_len].to_vec();
            pos += key_len;
            entries.push(IndexEntry {
                last_key,
                block_offset,
                block_len,
            });
        }
        Ok(entries)
    }
}

impl From<SstReadError> for kestrel_common::error::StorageError {
    fn from(e: SstReadError) -> Self {
        use kestrel_common::error::StorageError;
        match e {
            SstReadError::Io { source, detail, .. } => StorageError::Io(io::Error::new(
                source.kind(),
                format!("{}: {}", detail, source),
            )),
            other => {
                let path = match &other {
                    SstReadError::Corruption { sst_path, .. }
                    | SstReadError::Truncated { sst_path, .. }
                    | SstReadError::Codec { sst_path, .. } => sst_path.clone(),
                    SstReadError::Io { .. } => unreachable!(),
                };
                StorageError::corrupted(path, other.to_string())
            }
        }
    }
}

/// Filename for an SST with the given ID: `{:06}.sst`.
pub fn sst_filename(id: u64) -> String {
    format!("{:06}.sst", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_test_sst(dir: &Path, entries: &[(&[u8], Option<&[u8]>, u64)]) -> SstMeta {
        let path = dir.join("test.sst");
        let mut writer = SstWriter::new(&path, 1, entries.len(), 0.01).unwrap();
        for (k, v, seq) in entries {
            writer.add(k, *v, *seq).unwrap();
        }
        writer.finish(0).unwrap()
    }

    #[test]
    fn test_sst_write_read_basic() {
        let dir = TempDir::new().unwrap();
        let meta = write_test_sst(
            dir.path(),
            &[
                (b"aaa", Some(b"val_a"), 1),
                (b"bbb", Some(b"val_b"), 2),
                (b"ccc", Some(b"val_c"), 3),
            ],
        );

        assert_eq!(meta.entry_count, 3);
        assert_eq!(meta.min_key, b"aaa");
        assert_eq!(meta.max_key, b"ccc");
        assert_eq!(meta.max_seq, 3);

        let reader = SstReader::open(&meta.path, meta.id).unwrap();
        let e = reader.get(b"bbb").unwrap().unwrap();
        assert_eq!(e.value, Some(b"val_b".to_vec()));
        assert_eq!(e.seq, 2);
        assert!(reader.get(b"ddd").unwrap().is_none());
        assert!(reader.get(b"000").unwrap().is_none());
    }

    #[test]
    fn test_sst_tombstone_roundtrip() {
        let dir = TempDir::new().unwrap();
        let meta = write_test_sst(
            dir.path(),
            &[(b"dead", None, 5), (b"live", Some(b"v"), 6)],
        );
        let reader = SstReader::open(&meta.path, meta.id).unwrap();

        let dead = reader.get(b"dead").unwrap().unwrap();
        assert_eq!(dead.value, None);
        assert_eq!(dead.seq, 5);
        let live = reader.get(b"live").unwrap().unwrap();
        assert_eq!(live.value, Some(b"v".to_vec()));
    }

    #[test]
    fn test_sst_scan_sorted() {
        let dir = TempDir::new().unwrap();
        let meta = write_test_sst(
            dir.path(),
            &[
                (b"k1", Some(b"v1"), 1),
                (b"k2", None, 2),
                (b"k3", Some(b"v3"), 3),
            ],
        );
        let reader = SstReader::open(&meta.path, meta.id).unwrap();
        let scanned = reader.scan().unwrap();
        assert_eq!(scanned.len(), 3);
        assert_eq!(scanned[0].key, b"k1");
        assert_eq!(scanned[1].value, None);
        assert_eq!(scanned[2].value, Some(b"v3".to_vec()));
    }

    #[test]
    fn test_sst_many_entries_multi_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.sst");
        let n = 10_000u64;
        let mut writer = SstWriter::new(&path, 7, n as usize, 0.01).unwrap();
        for i in 0..n {
            let key = format!("key_{:08}", i);
            let val = format!("val_{:08}", i);
            writer.add(key.as_bytes(), Some(val.as_bytes()), i).unwrap();
        }
        let meta = writer.finish(0).unwrap();
        assert_eq!(meta.entry_count, n);

        let reader = SstReader::open(&path, meta.id).unwrap();
        for probe in [0u64, 5000, 9999] {
            let key = format!("key_{:08}", probe);
            let e = reader.get(key.as_bytes()).unwrap().unwrap();
            assert_eq!(e.value, Some(format!("val_{:08}", probe).into_bytes()));
        }
        assert!(reader.get(b"key_99999999").unwrap().is_none());
    }

    #[test]
    fn test_sst_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.sst");
        let writer = SstWriter::new(&path, 1, 0, 0.01).unwrap();
        let meta = writer.finish(0).unwrap();
        assert_eq!(meta.entry_count, 0);

        let reader = SstReader::open(&path, meta.id).unwrap();
        assert!(reader.get(b"anything").unwrap().is_none());
        assert!(reader.scan().unwrap().is_empty());
    }

    #[test]
    fn test_sst_corrupt_footer_detected() {
        let dir = TempDir::new().unwrap();
        let meta = write_test_sst(dir.path(), &[(b"k", Some(b"v"), 1)]);

        let mut data = fs::read(&meta.path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&meta.path, &data).unwrap();

        let err = SstReader::open(&meta.path, meta.id).unwrap_err();
        assert!(err.is_file_damage());
        assert!(matches!(err, SstReadError::Corruption { .. }));
    }

    #[test]
    fn test_sst_corrupt_data_block_detected() {
        let dir = TempDir::new().unwrap();
        let meta = write_test_sst(
            dir.path(),
            &[(b"aaa", Some(b"val_a"), 1), (b"bbb", Some(b"val_b"), 2)],
        );

        // Flip a byte inside the first data block.
        let mut data = fs::read(&meta.path).unwrap();
        data[10] ^= 0xFF;
        fs::write(&meta.path, &data).unwrap();

        // Footer is intact; the damage surfaces on block read.
        match SstReader::open(&meta.path, meta.id) {
            Ok(reader) => {
                let result = reader.get(b"aaa");
                assert!(result.is_err(), "corrupted block must fail checksum");
            }
            Err(e) => assert!(e.is_file_damage()),
        }
    }

    #[test]
    fn test_sst_truncated_file_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trunc.sst");
        fs::write(&path, b"too short").unwrap();

        let err = SstReader::open(&path, 99).unwrap_err();
        assert!(matches!(err, SstReadError::Truncated { .. }));
    }

    #[test]
    fn test_sst_bad_magic_detected() {
        let dir = TempDir::new().unwrap();
        let meta = write_test_sst(dir.path(), &[(b"k", Some(b"v"), 1)]);

        let mut data = fs::read(&meta.path).unwrap();
        let footer_start = data.len() - FOOTER_SIZE;
        data[footer_start..footer_start + 4].copy_from_slice(b"XXXX");
        // Recompute the footer CRC so the magic check fires, not the CRC check.
        let crc = crc32(&data[footer_start..footer_start + 48]);
        let crc_at = footer_start + 48;
        data[crc_at..crc_at + 4].copy_from_slice(&crc.to_le_bytes());
        fs::write(&meta.path, &data).unwrap();

        let err = SstReader::open(&meta.path, meta.id).unwrap_err();
        assert!(matches!(err, SstReadError::Codec { .. }));
    }

    #[test]
    fn test_sst_read_error_display() {
        let err = SstReadError::Corruption {
            sst_path: "/tmp/test.sst".into(),
            block_offset: 1024,
            expected_crc: 0xDEADBEEF,
            actual_crc: 0xCAFEBABE,
            detail: "test corruption".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/test.sst"));
        assert!(msg.contains("1024"));
        assert!(msg.contains("0xdeadbeef"));
        assert!(msg.contains("0xcafebabe"));
    }
}
