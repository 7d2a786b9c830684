//! Storage backend interface and the in-memory backend.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use peerdrop_protocol::ChunkMetadata;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::file::MaterializedFile;

/// Persisted description of one file: its metadata and, once present,
/// where its complete bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(flatten)]
    pub meta: ChunkMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileLocation>,
}

/// Location of a complete file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub path: PathBuf,
    /// `true` when the cache produced the file by merging and may delete
    /// it; `false` for a sender's attached source file.
    pub owned: bool,
}

impl FileRecord {
    pub fn new(meta: ChunkMetadata) -> Self {
        Self { meta, file: None }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn materialized(&self) -> Option<MaterializedFile> {
        self.file
            .as_ref()
            .map(|loc| MaterializedFile::from_meta(&self.meta, loc.path.clone()))
    }
}

/// Transactional key-value backend holding metadata and chunks per file id.
///
/// Implementations are synchronous; the cache calls them from blocking
/// tasks.
pub trait ChunkStore: Send + Sync {
    fn load_info(&self, file_id: &str) -> Result<Option<FileRecord>, StoreError>;

    fn save_info(&self, record: &FileRecord) -> Result<(), StoreError>;

    /// Writes all `chunks` in one transaction; on error none are written.
    fn write_chunks(&self, file_id: &str, chunks: &[(u64, Vec<u8>)]) -> Result<(), StoreError>;

    fn read_chunk(&self, file_id: &str, index: u64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stored chunk indices, ascending.
    fn chunk_keys(&self, file_id: &str) -> Result<Vec<u64>, StoreError>;

    /// Every stored chunk, ascending by index.
    fn read_all_chunks(&self, file_id: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError>;

    fn clear_chunks(&self, file_id: &str) -> Result<(), StoreError>;

    /// Removes metadata and chunks.
    fn delete_file(&self, file_id: &str) -> Result<(), StoreError>;

    /// Ids with persisted metadata.
    fn file_ids(&self) -> Result<Vec<String>, StoreError>;
}

/// Volatile store, used in tests and for throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    fail_writes: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    info: HashMap<String, FileRecord>,
    chunks: HashMap<String, BTreeMap<u64, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent chunk writes fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl ChunkStore for MemoryStore {
    fn load_info(&self, file_id: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.inner.lock().info.get(file_id).cloned())
    }

    fn save_info(&self, record: &FileRecord) -> Result<(), StoreError> {
        self.inner
            .lock()
            .info
            .insert(record.id().to_string(), record.clone());
        Ok(())
    }

    fn write_chunks(&self, file_id: &str, chunks: &[(u64, Vec<u8>)]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        let mut inner = self.inner.lock();
        let entry = inner.chunks.entry(file_id.to_string()).or_default();
        for (index, data) in chunks {
            entry.insert(*index, data.clone());
        }
        Ok(())
    }

    fn read_chunk(&self, file_id: &str, index: u64) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .chunks
            .get(file_id)
            .and_then(|c| c.get(&index).cloned()))
    }

    fn chunk_keys(&self, file_id: &str) -> Result<Vec<u64>, StoreError> {
        Ok(self
            .inner
            .lock()
            .chunks
            .get(file_id)
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default())
    }

    fn read_all_chunks(&self, file_id: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        Ok(self
            .inner
            .lock()
            .chunks
            .get(file_id)
            .map(|c| c.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default())
    }

    fn clear_chunks(&self, file_id: &str) -> Result<(), StoreError> {
        self.inner.lock().chunks.remove(file_id);
        Ok(())
    }

    fn delete_file(&self, file_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.chunks.remove(file_id);
        inner.info.remove(file_id);
        Ok(())
    }

    fn file_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.inner.lock().info.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> FileRecord {
        FileRecord::new(ChunkMetadata {
            id: id.into(),
            file_name: "x.bin".into(),
            file_size: 10,
            chunk_size: 4,
            mime_type: None,
            last_modified: None,
        })
    }

    #[test]
    fn record_json_flattens_metadata() {
        let mut rec = record("a");
        rec.file = Some(FileLocation {
            path: PathBuf::from("/tmp/a"),
            owned: true,
        });
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["fileName"], "x.bin");
        assert_eq!(json["file"]["owned"], true);
        let back: FileRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn memory_store_keys_are_sorted() {
        let store = MemoryStore::new();
        store.save_info(&record("a")).unwrap();
        store
            .write_chunks("a", &[(2, vec![2]), (0, vec![0]), (1, vec![1])])
            .unwrap();
        assert_eq!(store.chunk_keys("a").unwrap(), vec![0, 1, 2]);
        assert_eq!(store.read_chunk("a", 1).unwrap(), Some(vec![1]));
        assert_eq!(store.read_chunk("a", 9).unwrap(), None);
    }

    #[test]
    fn failed_write_stores_nothing() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.write_chunks("a", &[(0, vec![0])]).is_err());
        assert!(store.chunk_keys("a").unwrap().is_empty());
    }

    #[test]
    fn delete_removes_everything() {
        let store = MemoryStore::new();
        store.save_info(&record("a")).unwrap();
        store.write_chunks("a", &[(0, vec![0])]).unwrap();
        store.delete_file("a").unwrap();
        assert_eq!(store.load_info("a").unwrap(), None);
        assert!(store.chunk_keys("a").unwrap().is_empty());
        assert!(store.file_ids().unwrap().is_empty());
    }
}
