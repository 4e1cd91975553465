//! LSM manifest: the durable record of which SST files are live.
//!
//! The manifest is rewritten atomically (temp file + rename + dir fsync)
//! after every flush and every compaction. On startup the engine trusts
//! the manifest over the directory listing: SSTs missing from the manifest
//! are leftovers from an interrupted compaction and are deleted; manifest
//! entries whose file fails verification are quarantined.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::sst::SstMeta;

const MANIFEST_FILENAME: &str = "MANIFEST";
const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";
const MANIFEST_MAGIC: u32 = 0x4B4D4E46; // "KMNF"

/// One SST entry in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSst {
    pub id: u64,
    pub level: u32,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub entry_count: u64,
    pub file_size: u64,
    pub max_seq: u64,
}

impl ManifestSst {
    pub fn from_meta(meta: &SstMeta) -> Self {
        Self {
            id: meta.id,
            level: meta.level,
            min_key: meta.min_key.clone(),
            max_key: meta.max_key.clone(),
            entry_count: meta.entry_count,
            file_size: meta.file_size,
            max_seq: meta.max_seq,
        }
    }

    pub fn to_meta(&self, dir: &Path) -> SstMeta {
        SstMeta {
            id: self.id,
            path: dir.join(super::sst::sst_filename(self.id)),
            level: self.level,
            min_key: self.min_key.clone(),
            max_key: self.max_key.clone(),
            entry_count: self.entry_count,
            file_size: self.file_size,
            max_seq: self.max_seq,
        }
    }
}

/// The full manifest state, serialized with bincode behind a CRC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Next SST ID to allocate.
    pub next_sst_id: u64,
    /// Highest sequence flushed to any SST. Sequences at or below this are
    /// durable in the LSM without memtable replay.
    pub flushed_seq: u64,
    /// Live SSTs per level.
    pub levels: Vec<Vec<ManifestSst>>,
}

impl Manifest {
    pub fn new(max_levels: usize) -> Self {
        Self {
            next_sst_id: 1,
            flushed_seq: 0,
            levels: vec![Vec::new(); max_levels],
        }
    }

    /// All SST IDs named by the manifest.
    pub fn live_ids(&self) -> Vec<u64> {
        self.levels
            .iter()
            .flat_map(|l| l.iter().map(|s| s.id))
            .collect()
    }

    /// Persist atomically: write temp, fsync, rename, fsync directory.
    /// A crash at any point leaves either the old or the new manifest,
    /// never a torn one.
    pub fn store(&self, dir: &Path) -> io::Result<()> {
        let body = bincode::serialize(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let mut buf = Vec::with_capacity(body.len() + 8);
        buf.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&body);

        let tmp = dir.join(MANIFEST_TMP_FILENAME);
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, dir.join(MANIFEST_FILENAME))?;
        if let Ok(d) = OpenOptions::new().read(true).open(dir) {
            let _ = d.sync_all();
        }
        Ok(())
    }

    /// Load the manifest, if one exists. A corrupt manifest is an error,
    /// not a silent empty store.
    pub fn load(dir: &Path) -> io::Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let mut buf = Vec::new();
        File::open(&path)?.read_to_end(&mut buf)?;
        if buf.len() < 8 {
            return Err(corrupt(&path, "manifest shorter than header"));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap_or_default());
        if magic != MANIFEST_MAGIC {
            return Err(corrupt(&path, "bad manifest magic"));
        }
        let stored_crc = u32::from_le_bytes(buf[4..8].try_into().unwrap_or_default());
        let body = &buf[8..];
        if crc32fast::hash(body) != stored_crc {
            return Err(corrupt(&path, "manifest checksum mismatch"));
        }
        let manifest: Manifest = bincode::deserialize(body)
            .map_err(|e| corrupt(&path, &format!("manifest decode: {}", e)))?;
        Ok(Some(manifest))
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILENAME)
    }
}

fn corrupt(path: &Path, detail: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: {}", path.display(), detail),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Manifest {
        let mut m = Manifest::new(3);
        m.next_sst_id = 5;
        m.flushed_seq = 42;
        m.levels[0].push(ManifestSst {
            id: 4,
            level: 0,
            min_key: b"a".to_vec(),
            max_key: b"z".to_vec(),
            entry_count: 10,
            file_size: 1024,
            max_seq: 42,
        });
        m
    }

    #[test]
    fn test_manifest_store_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        sample().store(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.next_sst_id, 5);
        assert_eq!(loaded.flushed_seq, 42);
        assert_eq!(loaded.levels[0].len(), 1);
        assert_eq!(loaded.levels[0][0].min_key, b"a");
        assert_eq!(loaded.live_ids(), vec![4]);
    }

    #[test]
    fn test_manifest_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(Manifest::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_manifest_overwrite_keeps_latest() {
        let dir = TempDir::new().unwrap();
        sample().store(dir.path()).unwrap();

        let mut newer = sample();
        newer.flushed_seq = 100;
        newer.store(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.flushed_seq, 100);
    }

    #[test]
    fn test_manifest_corruption_detected() {
        let dir = TempDir::new().unwrap();
        sample().store(dir.path()).unwrap();

        let path = Manifest::path(dir.path());
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        assert!(Manifest::load(dir.path()).is_err());
    }

    #[test]
    fn test_manifest_meta_roundtrip() {
        let dir = TempDir::new().unwrap();
        let rec = sample().levels[0][0].clone();
        let meta = rec.to_meta(dir.path());
        assert_eq!(meta.id, 4);
        assert!(meta.path.ends_with("000004.sst"));
        let back = ManifestSst::from_meta(&meta);
        assert_eq!(back.max_seq, rec.max_seq);
    }
}
