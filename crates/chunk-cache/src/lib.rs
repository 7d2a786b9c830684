//! Persistent chunk cache.
//!
//! Every file known to this peer, sent or received, gets a [`ChunkCache`]
//! keyed by its transfer id. Receivers fill it chunk by chunk, in any
//! order, and merge it into a single file once complete; senders attach
//! their source file and serve chunks straight from it. Progress survives
//! restarts: the missing-chunk set is always recomputed from what the
//! [`ChunkStore`] holds.

pub mod cache;
pub mod config;
pub mod error;
pub mod file;
pub mod registry;
pub mod sqlite;
pub mod store;

pub use cache::{CacheEvent, ChunkCache};
pub use config::CacheConfig;
pub use error::{CacheError, StoreError};
pub use file::{MaterializedFile, MergeStrategy};
pub use registry::CacheRegistry;
pub use sqlite::SqliteStore;
pub use store::{ChunkStore, FileLocation, FileRecord, MemoryStore};
