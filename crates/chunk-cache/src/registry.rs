//! Registry of open caches, keyed by transfer id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::cache::ChunkCache;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::store::ChunkStore;

/// Owns every [`ChunkCache`] opened against one store.
///
/// At most one cache instance exists per id, so all flows touching a file
/// share its write queue and merge guard.
pub struct CacheRegistry {
    store: Arc<dyn ChunkStore>,
    config: CacheConfig,
    caches: RwLock<HashMap<String, Arc<ChunkCache>>>,
}

impl CacheRegistry {
    pub fn new(store: Arc<dyn ChunkStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the cache for `id`, opening it from the store if needed.
    pub async fn open(&self, id: &str) -> Result<Arc<ChunkCache>, CacheError> {
        if let Some(cache) = self.get(id) {
            return Ok(cache);
        }
        let cache = ChunkCache::open(id, Arc::clone(&self.store), self.config.clone()).await?;
        // Another caller may have opened it while we were loading.
        Ok(Arc::clone(
            self.caches.write().entry(id.to_string()).or_insert(cache),
        ))
    }

    /// Returns an already open cache.
    pub fn get(&self, id: &str) -> Option<Arc<ChunkCache>> {
        self.caches.read().get(id).cloned()
    }

    /// Ids with persisted metadata, open or not.
    pub async fn ids(&self) -> Result<Vec<String>, CacheError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.file_ids())
            .await
            .map_err(|e| CacheError::Join(e.to_string()))?
            .map_err(Into::into)
    }

    /// Deletes every trace of `id` and drops it from the registry.
    pub async fn evict(&self, id: &str) -> Result<(), CacheError> {
        let cache = self.open(id).await?;
        cache.cleanup().await?;
        self.forget(id);
        info!(file = %id, "evicted");
        Ok(())
    }

    /// Drops the in-memory instance; persisted state is kept.
    pub fn forget(&self, id: &str) -> Option<Arc<ChunkCache>> {
        self.caches.write().remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use peerdrop_protocol::ChunkMetadata;

    fn registry(dir: &std::path::Path) -> (Arc<MemoryStore>, CacheRegistry) {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            files_dir: dir.to_path_buf(),
            ..CacheConfig::default()
        };
        (store.clone(), CacheRegistry::new(store, config))
    }

    fn meta(id: &str) -> ChunkMetadata {
        ChunkMetadata {
            id: id.into(),
            file_name: "f".into(),
            file_size: 8,
            chunk_size: 4,
            mime_type: None,
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn open_returns_shared_instance() {
        let dir = tempfile::tempdir().unwrap();
        let (_, registry) = registry(dir.path());
        let a = registry.open("x").await.unwrap();
        let b = registry.open("x").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("y").is_none());
    }

    #[tokio::test]
    async fn ids_lists_persisted_files() {
        let dir = tempfile::tempdir().unwrap();
        let (_, registry) = registry(dir.path());
        registry.open("b").await.unwrap().set_info(meta("b")).await.unwrap();
        registry.open("a").await.unwrap().set_info(meta("a")).await.unwrap();
        registry.open("unset").await.unwrap();
        assert_eq!(registry.ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn forget_keeps_state_and_evict_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let (store, registry) = registry(dir.path());
        let cache = registry.open("a").await.unwrap();
        cache.set_info(meta("a")).await.unwrap();
        cache.store_chunk(0, vec![1; 4]).await.unwrap();
        cache.flush().await.unwrap();

        registry.forget("a");
        let reopened = registry.open("a").await.unwrap();
        assert!(!Arc::ptr_eq(&cache, &reopened));
        assert_eq!(reopened.cached_keys(), vec![0]);

        registry.evict("a").await.unwrap();
        assert!(registry.get("a").is_none());
        assert!(store.file_ids().unwrap().is_empty());
        assert!(store.chunk_keys("a").unwrap().is_empty());
    }
}
