use std::path::PathBuf;

/// Tunables for a [`ChunkCache`](crate::ChunkCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory receiving merged files.
    pub files_dir: PathBuf,
    /// Queued chunks that trigger a batch commit.
    pub write_queue_capacity: usize,
    /// Files larger than this are merged chunk by chunk instead of in one
    /// buffer.
    pub stream_merge_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            files_dir: std::env::temp_dir().join("peerdrop").join("files"),
            write_queue_capacity: 16,
            stream_merge_threshold: 64 * 1024 * 1024,
        }
    }
}
