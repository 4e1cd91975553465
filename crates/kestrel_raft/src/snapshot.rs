//! Durable state-machine snapshots.
//!
//! A snapshot replaces the log prefix up to `last_included_index`. It also
//! carries the membership configuration as of that index, so a node restored
//! from a snapshot knows who votes without any log entries.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use kestrel_common::error::StorageError;
use kestrel_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

use crate::membership::ClusterConfig;

const SNAPSHOT_FILE: &str = "SNAPSHOT";
const SNAPSHOT_TMP: &str = "SNAPSHOT.tmp";
const SNAPSHOT_MAGIC: u32 = 0x4B534E50; // "KSNP"

/// A complete state-machine snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub config: ClusterConfig,
    pub data: Vec<u8>,
}

/// Stores the single most recent snapshot in a directory.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Write the snapshot durably: temp file, sync, rename, directory sync.
    /// The previous snapshot stays readable until the rename lands.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let body =
            bincode::serialize(snapshot).map_err(|e| StorageError::Codec(e.to_string()))?;
        let checksum = crc32fast::hash(&body);

        let tmp_path = self.dir.join(SNAPSHOT_TMP);
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| StorageError::persistence("snapshot create", e))?;
            file.write_all(&SNAPSHOT_MAGIC.to_le_bytes())?;
            file.write_all(&checksum.to_le_bytes())?;
            file.write_all(&body)?;
            file.sync_all()
                .map_err(|e| StorageError::persistence("snapshot sync", e))?;
        }

        let final_path = self.dir.join(SNAPSHOT_FILE);
        fs::rename(&tmp_path, &final_path)
            .map_err(|e| StorageError::persistence("snapshot rename", e))?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        tracing::info!(
            last_included_index = snapshot.last_included_index,
            last_included_term = snapshot.last_included_term,
            size = snapshot.data.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Load the stored snapshot, if any. A damaged snapshot file is an
    /// error rather than `None`: silently starting empty would lose state.
    pub fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.dir.join(SNAPSHOT_FILE);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        if contents.len() < 8 {
            return Err(StorageError::corrupted(
                path.display().to_string(),
                "snapshot file too short",
            ));
        }

        let magic = u32::from_le_bytes([contents[0], contents[1], contents[2], contents[3]]);
        if magic != SNAPSHOT_MAGIC {
            return Err(StorageError::corrupted(
                path.display().to_string(),
                "bad snapshot magic",
            ));
        }
        let checksum = u32::from_le_bytes([contents[4], contents[5], contents[6], contents[7]]);
        let body = &contents[8..];
        if crc32fast::hash(body) != checksum {
            return Err(StorageError::corrupted(
                path.display().to_string(),
                "snapshot checksum mismatch",
            ));
        }

        let snapshot: Snapshot =
            bincode::deserialize(body).map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(Some(snapshot))
    }
}
