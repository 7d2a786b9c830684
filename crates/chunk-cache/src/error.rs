//! Error types for chunk storage and caches.

/// Errors from a [`ChunkStore`](crate::ChunkStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from [`ChunkCache`](crate::ChunkCache) operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no metadata set for {0}")]
    NoInfo(String),

    #[error("chunk {index} out of range (file has {count} chunks)")]
    ChunkOutOfRange { index: u64, count: u64 },

    #[error("chunk {0} missing during merge")]
    MissingChunk(u64),

    #[error("merged {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("merge already in progress")]
    MergeInProgress,

    #[error("blocking task failed: {0}")]
    Join(String),
}
