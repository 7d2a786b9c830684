//! Per-file chunk cache.
//!
//! Incoming chunks are buffered in a write queue and committed to the
//! store in batches. The set of present chunks is tracked in memory
//! (persisted keys, the batch being committed, and the queue), so range
//! queries never touch the store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use peerdrop_protocol::{ChunkMetadata, EventBus, RangeSet, Subscription, complement};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, StoreError};
use crate::file::{MaterializedFile, MergeStrategy, merge_chunks, merged_file_name};
use crate::store::{ChunkStore, FileLocation, FileRecord};

/// Notifications raised by a [`ChunkCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    InfoChanged(FileRecord),
    ChunkStored { index: u64 },
    Merging,
    Merged(MaterializedFile),
    Cleanup,
}

/// Chunk cache for one file id.
pub struct ChunkCache {
    id: String,
    store: Arc<dyn ChunkStore>,
    config: CacheConfig,
    record: RwLock<Option<FileRecord>>,
    state: Mutex<ChunkState>,
    /// Held for the duration of a store commit.
    flush_lock: tokio::sync::Mutex<()>,
    merging: AtomicBool,
    events: EventBus<CacheEvent>,
}

#[derive(Default)]
struct ChunkState {
    persisted: BTreeSet<u64>,
    in_flight: BTreeMap<u64, Vec<u8>>,
    queue: BTreeMap<u64, Vec<u8>>,
}

impl ChunkState {
    fn keys(&self) -> BTreeSet<u64> {
        let mut keys = self.persisted.clone();
        keys.extend(self.in_flight.keys().copied());
        keys.extend(self.queue.keys().copied());
        keys
    }

    fn contains(&self, index: u64) -> bool {
        self.persisted.contains(&index)
            || self.in_flight.contains_key(&index)
            || self.queue.contains_key(&index)
    }

    fn pending(&self, index: u64) -> Option<Vec<u8>> {
        self.queue
            .get(&index)
            .or_else(|| self.in_flight.get(&index))
            .cloned()
    }
}

async fn blocking<T, E, F>(store: &Arc<dyn ChunkStore>, f: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    E: Into<CacheError> + Send + 'static,
    F: FnOnce(&dyn ChunkStore) -> Result<T, E> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
        .map_err(Into::into)
}

impl ChunkCache {
    /// Opens the cache for `id`, loading any persisted state.
    pub async fn open(
        id: impl Into<String>,
        store: Arc<dyn ChunkStore>,
        config: CacheConfig,
    ) -> Result<Arc<Self>, CacheError> {
        let id = id.into();
        let (record, keys) = {
            let id = id.clone();
            blocking(&store, move |s| -> Result<_, StoreError> {
                Ok((s.load_info(&id)?, s.chunk_keys(&id)?))
            })
            .await?
        };
        debug!(file = %id, chunks = keys.len(), "opened chunk cache");

        Ok(Arc::new(Self {
            id,
            store,
            config,
            record: RwLock::new(record),
            state: Mutex::new(ChunkState {
                persisted: keys.into_iter().collect(),
                ..ChunkState::default()
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            merging: AtomicBool::new(false),
            events: EventBus::new(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> Subscription<CacheEvent> {
        self.events.subscribe()
    }

    /// Current record, if metadata has been set.
    pub fn info(&self) -> Option<FileRecord> {
        self.record.read().clone()
    }

    pub fn meta(&self) -> Option<ChunkMetadata> {
        self.record.read().as_ref().map(|r| r.meta.clone())
    }

    /// Sets or replaces the metadata, keeping any materialized file.
    pub async fn set_info(&self, meta: ChunkMetadata) -> Result<(), CacheError> {
        let file = self.record.read().as_ref().and_then(|r| r.file.clone());
        self.save_record(FileRecord { meta, file }).await
    }

    /// Registers an existing local file as this cache's complete content.
    ///
    /// Used on the sending side; the file is read in place and never
    /// deleted by [`cleanup`](Self::cleanup).
    pub async fn attach_file(&self, meta: ChunkMetadata, path: impl Into<PathBuf>) -> Result<(), CacheError> {
        let record = FileRecord {
            meta,
            file: Some(FileLocation {
                path: path.into(),
                owned: false,
            }),
        };
        self.save_record(record).await
    }

    async fn save_record(&self, mut record: FileRecord) -> Result<(), CacheError> {
        record.meta.id = self.id.clone();
        {
            let record = record.clone();
            blocking(&self.store, move |s| s.save_info(&record)).await?;
        }
        *self.record.write() = Some(record.clone());
        self.events.emit(CacheEvent::InfoChanged(record));
        Ok(())
    }

    /// Total chunk count, `None` without metadata.
    pub fn chunk_count(&self) -> Option<u64> {
        self.record.read().as_ref().map(|r| r.meta.chunk_count())
    }

    fn is_materialized(&self) -> bool {
        self.record.read().as_ref().is_some_and(|r| r.file.is_some())
    }

    /// Queues a chunk, committing the queue once it reaches capacity.
    pub async fn store_chunk(&self, index: u64, data: Vec<u8>) -> Result<(), CacheError> {
        let count = self.chunk_count().ok_or_else(|| CacheError::NoInfo(self.id.clone()))?;
        if index >= count {
            return Err(CacheError::ChunkOutOfRange { index, count });
        }
        if self.is_materialized() {
            return Ok(());
        }

        let queued = {
            let mut state = self.state.lock();
            state.queue.insert(index, data);
            state.queue.len()
        };
        self.events.emit(CacheEvent::ChunkStored { index });

        if queued >= self.config.write_queue_capacity {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commits the queued chunks as one batch.
    ///
    /// Only one commit runs at a time; chunks queued meanwhile go into the
    /// next batch. A failed batch is put back in the queue.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<(u64, Vec<u8>)> = {
            let mut state = self.state.lock();
            if state.queue.is_empty() {
                return Ok(());
            }
            let queue = std::mem::take(&mut state.queue);
            state.in_flight = queue;
            state.in_flight.iter().map(|(k, v)| (*k, v.clone())).collect()
        };

        let id = self.id.clone();
        let len = batch.len();
        let result = blocking(&self.store, move |s| s.write_chunks(&id, &batch)).await;

        let mut state = self.state.lock();
        let in_flight = std::mem::take(&mut state.in_flight);
        match result {
            Ok(()) => {
                state.persisted.extend(in_flight.into_keys());
                debug!(file = %self.id, chunks = len, "flushed chunk batch");
                Ok(())
            }
            Err(e) => {
                for (index, data) in in_flight {
                    state.queue.entry(index).or_insert(data);
                }
                warn!(file = %self.id, chunks = len, error = %e, "chunk batch failed, re-queued");
                Err(e)
            }
        }
    }

    /// Returns the bytes of chunk `index`, or `None` if not present.
    pub async fn get_chunk(&self, index: u64) -> Result<Option<Vec<u8>>, CacheError> {
        let Some(record) = self.info() else {
            return Ok(None);
        };
        if let Some(file) = record.materialized() {
            let Some((start, end)) = record.meta.chunk_bounds(index) else {
                return Ok(None);
            };
            let data = tokio::task::spawn_blocking(move || file.read_range(start, end))
                .await
                .map_err(|e| CacheError::Join(e.to_string()))??;
            return Ok(Some(data));
        }

        if let Some(data) = self.state.lock().pending(index) {
            return Ok(Some(data));
        }
        let id = self.id.clone();
        blocking(&self.store, move |s| s.read_chunk(&id, index)).await
    }

    /// Indices of present chunks, ascending.
    pub fn cached_keys(&self) -> Vec<u64> {
        if self.is_materialized() {
            return (0..self.chunk_count().unwrap_or(0)).collect();
        }
        self.state.lock().keys().into_iter().collect()
    }

    /// `true` when chunk `index` is stored, queued or covered by the
    /// materialized file.
    pub fn has_chunk(&self, index: u64) -> bool {
        if self.is_materialized() {
            return self.chunk_count().is_some_and(|count| index < count);
        }
        self.state.lock().contains(index)
    }

    /// Exact number of content bytes present, `None` without metadata.
    pub fn calc_cached_bytes(&self) -> Option<u64> {
        let meta = self.meta()?;
        if self.is_materialized() {
            return Some(meta.file_size);
        }
        Some(
            self.state
                .lock()
                .keys()
                .into_iter()
                .map(|k| meta.chunk_len(k))
                .sum(),
        )
    }

    /// Chunks still missing, `None` without metadata.
    pub fn req_ranges(&self) -> Option<RangeSet> {
        let count = self.chunk_count()?;
        let present: RangeSet = self.cached_keys().into_iter().collect();
        Some(complement(count, &present))
    }

    /// `true` when the file is materialized or every chunk is present.
    pub fn is_done(&self) -> bool {
        let Some(count) = self.chunk_count() else {
            return false;
        };
        if self.is_materialized() {
            return true;
        }
        let state = self.state.lock();
        state.keys().range(..count).count() as u64 == count
    }

    /// Merges all chunks into one file, once.
    ///
    /// Returns the existing file if already merged and `None` if chunks are
    /// still missing. A call made while another merge is running fails with
    /// [`CacheError::MergeInProgress`].
    pub async fn get_file(&self) -> Result<Option<MaterializedFile>, CacheError> {
        if let Some(file) = self.info().and_then(|r| r.materialized()) {
            return Ok(Some(file));
        }
        if !self.is_done() {
            return Ok(None);
        }
        if self.merging.swap(true, Ordering::SeqCst) {
            warn!(file = %self.id, "merge already running, ignoring request");
            return Err(CacheError::MergeInProgress);
        }
        let _merging = MergeGuard(&self.merging);

        if let Some(file) = self.info().and_then(|r| r.materialized()) {
            return Ok(Some(file));
        }
        self.flush().await?;

        let record = self.info().ok_or_else(|| CacheError::NoInfo(self.id.clone()))?;
        let meta = record.meta.clone();
        let count = meta.chunk_count();
        let dest = self.config.files_dir.join(merged_file_name(&self.id));
        let strategy = MergeStrategy::for_size(meta.file_size, self.config.stream_merge_threshold);

        self.events.emit(CacheEvent::Merging);
        info!(file = %self.id, size = meta.file_size, ?strategy, "merging chunks");

        let written = {
            let id = self.id.clone();
            let dest = dest.clone();
            blocking(&self.store, move |s| merge_chunks(s, &id, count, &dest, strategy)).await?
        };
        if written != meta.file_size {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(CacheError::SizeMismatch {
                expected: meta.file_size,
                actual: written,
            });
        }

        let record = FileRecord {
            meta,
            file: Some(FileLocation {
                path: dest.clone(),
                owned: true,
            }),
        };
        {
            let record = record.clone();
            let id = self.id.clone();
            blocking(&self.store, move |s| -> Result<(), StoreError> {
                s.save_info(&record)?;
                s.clear_chunks(&id)
            })
            .await?;
        }
        *self.record.write() = Some(record.clone());
        {
            let mut state = self.state.lock();
            state.persisted.clear();
            state.queue.clear();
        }

        let file = MaterializedFile::from_meta(&record.meta, dest);
        info!(file = %self.id, path = %file.path.display(), "merged");
        self.events.emit(CacheEvent::Merged(file.clone()));
        Ok(Some(file))
    }

    /// Deletes every persisted trace of this file, including a merged file
    /// the cache produced. Irreversible.
    pub async fn cleanup(&self) -> Result<(), CacheError> {
        let _guard = self.flush_lock.lock().await;
        {
            let mut state = self.state.lock();
            *state = ChunkState::default();
        }

        let owned_file = self
            .record
            .read()
            .as_ref()
            .and_then(|r| r.file.as_ref())
            .filter(|loc| loc.owned)
            .map(|loc| loc.path.clone());

        let id = self.id.clone();
        blocking(&self.store, move |s| s.delete_file(&id)).await?;
        if let Some(path) = owned_file {
            remove_if_exists(&path).await?;
        }
        *self.record.write() = None;

        info!(file = %self.id, "cache cleaned up");
        self.events.emit(CacheEvent::Cleanup);
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

struct MergeGuard<'a>(&'a AtomicBool);

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("id", &self.id)
            .field("chunks", &self.chunk_count())
            .field("materialized", &self.is_materialized())
            .finish()
    }
}
