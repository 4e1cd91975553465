//! Sorted in-memory write buffer.
//!
//! All writes land in the active memtable. Once it exceeds its size budget
//! it is frozen and swapped for a fresh one; frozen memtables are flushed
//! to L0 SST files.
//!
//! Sequence numbers are supplied by the caller (the replication layer uses
//! its applied log index), so replaying the same updates is idempotent:
//! a write with a sequence at or below the memtable's high-water mark for
//! that key simply re-asserts state the key already reflects.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// A value in the memtable. `None` represents a tombstone.
#[derive(Debug, Clone)]
pub struct MemValue {
    pub data: Option<Vec<u8>>,
    /// Caller-assigned sequence, monotone across the store.
    pub seq: u64,
}

/// Sorted write buffer backed by a BTreeMap.
pub struct MemTable {
    map: RwLock<BTreeMap<Vec<u8>, MemValue>>,
    approx_bytes: AtomicU64,
    entry_count: AtomicU64,
    /// Highest sequence written into this memtable.
    max_seq: AtomicU64,
    frozen: RwLock<bool>,
}

/// Errors from memtable operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemTableError {
    /// The memtable is frozen and cannot accept writes.
    Frozen,
}

impl std::fmt::Display for MemTableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemTableError::Frozen => write!(f, "memtable is frozen"),
        }
    }
}

impl std::error::Error for MemTableError {}

impl MemTable {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            approx_bytes: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            max_seq: AtomicU64::new(0),
            frozen: RwLock::new(false),
        }
    }

    /// Put a key-value pair at the given sequence. Overwrites any existing
    /// value for the key. Returns `Err` if the memtable is frozen.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> Result<(), MemTableError> {
        self.write(key, Some(value), seq)
    }

    /// Delete a key by inserting a tombstone at the given sequence.
    pub fn delete(&self, key: Vec<u8>, seq: u64) -> Result<(), MemTableError> {
        self.write(key, None, seq)
    }

    fn write(&self, key: Vec<u8>, data: Option<Vec<u8>>, seq: u64) -> Result<(), MemTableError> {
        if *self.frozen.read() {
            return Err(MemTableError::Frozen);
        }

        let new_size = Self::entry_size(&key, data.as_deref());
        let mut map = self.map.write();
        let old_size = map
            .get(&key)
            .map(|v| Self::entry_size(&key, v.data.as_deref()))
            .unwrap_or(0);

        map.insert(key, MemValue { data, seq });

        if old_size > 0 {
            self.approx_bytes.fetch_sub(old_size, Ordering::Relaxed);
        } else {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        self.approx_bytes.fetch_add(new_size, Ordering::Relaxed);
        self.max_seq.fetch_max(seq, Ordering::Relaxed);
        Ok(())
    }

    fn entry_size(key: &[u8], data: Option<&[u8]>) -> u64 {
        (key.len() + data.map(|d| d.len()).unwrap_or(0) + std::mem::size_of::<MemValue>()) as u64
    }

    /// Point lookup. `Some(Some(v))` for live entries, `Some(None)` for
    /// tombstones, `None` if the key is not in this memtable.
    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.map.read().get(key).map(|v| v.data.clone())
    }

    /// Make this memtable immutable. Reads keep working; writes fail.
    pub fn freeze(&self) {
        *self.frozen.write() = true;
    }

    pub fn is_frozen(&self) -> bool {
        *self.frozen.read()
    }

    pub fn approx_bytes(&self) -> u64 {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    /// Number of entries, tombstones included.
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Highest sequence ever written here (0 if empty).
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Relaxed)
    }

    /// Snapshot all entries in sorted key order for flush.
    pub fn iter_sorted(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>, u64)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.data.clone(), v.seq))
            .collect()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let mt = MemTable::new();
        mt.put(b"key1".to_vec(), b"val1".to_vec(), 1).unwrap();
        mt.put(b"key2".to_vec(), b"val2".to_vec(), 2).unwrap();

        assert_eq!(mt.get(b"key1"), Some(Some(b"val1".to_vec())));
        assert_eq!(mt.get(b"key2"), Some(Some(b"val2".to_vec())));
        assert_eq!(mt.get(b"key3"), None);
        assert_eq!(mt.entry_count(), 2);
        assert_eq!(mt.max_seq(), 2);
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let mt = MemTable::new();
        mt.put(b"k".to_vec(), b"old".to_vec(), 1).unwrap();
        mt.put(b"k".to_vec(), b"new".to_vec(), 2).unwrap();

        assert_eq!(mt.get(b"k"), Some(Some(b"new".to_vec())));
        assert_eq!(mt.entry_count(), 1);
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let mt = MemTable::new();
        mt.put(b"k".to_vec(), b"v".to_vec(), 1).unwrap();
        mt.delete(b"k".to_vec(), 2).unwrap();
        assert_eq!(mt.get(b"k"), Some(None));
    }

    #[test]
    fn test_delete_nonexistent_records_tombstone() {
        let mt = MemTable::new();
        mt.delete(b"ghost".to_vec(), 7).unwrap();
        assert_eq!(mt.get(b"ghost"), Some(None));
        assert_eq!(mt.entry_count(), 1);
    }

    #[test]
    fn test_freeze_rejects_writes() {
        let mt = MemTable::new();
        mt.put(b"k".to_vec(), b"v".to_vec(), 1).unwrap();
        mt.freeze();

        assert!(mt.is_frozen());
        assert_eq!(
            mt.put(b"x".to_vec(), b"y".to_vec(), 2),
            Err(MemTableError::Frozen)
        );
        assert_eq!(mt.delete(b"k".to_vec(), 3), Err(MemTableError::Frozen));
        assert_eq!(mt.get(b"k"), Some(Some(b"v".to_vec())));
    }

    #[test]
    fn test_sorted_iteration() {
        let mt = MemTable::new();
        mt.put(b"ccc".to_vec(), b"3".to_vec(), 1).unwrap();
        mt.put(b"aaa".to_vec(), b"1".to_vec(), 2).unwrap();
        mt.put(b"bbb".to_vec(), b"2".to_vec(), 3).unwrap();

        let entries = mt.iter_sorted();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, b"aaa");
        assert_eq!(entries[1].0, b"bbb");
        assert_eq!(entries[2].0, b"ccc");
    }

    #[test]
    fn test_approx_bytes_tracks_usage() {
        let mt = MemTable::new();
        assert_eq!(mt.approx_bytes(), 0);
        mt.put(b"key".to_vec(), b"value".to_vec(), 1).unwrap();
        assert!(mt.approx_bytes() > 0);
    }
}
