//! Storage Trait Definitions
//!
//! Abstract interfaces over the ordered key-value store backing the log.
//! The sequencer stages writes through these traits and commits them as one
//! unit; readers work against cloned snapshots.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("stored data is corrupt: {0}")]
    Corruption(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Key of one prefix-tree tile: the log version that wrote it and a counter
/// assigned in breadth-first split order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileId {
    pub version: u64,
    pub counter: u64,
}

impl TileId {
    pub fn new(version: u64, counter: u64) -> Self {
        Self { version, counter }
    }

    /// Storage key form, "version:counter".
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.version, self.counter)
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version, self.counter)
    }
}

/// Chunked log tree storage, keyed by chunk root index.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn batch_get(&self, ids: &[u64]) -> StorageResult<HashMap<u64, Vec<u8>>>;

    async fn batch_put(&self, chunks: &[(u64, Vec<u8>)]) -> StorageResult<()>;
}

/// Tiled prefix tree storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrefixStore: Send + Sync {
    async fn batch_get(&self, ids: &[TileId]) -> StorageResult<HashMap<TileId, Vec<u8>>>;

    async fn batch_put(&self, tiles: &[(TileId, Vec<u8>)]) -> StorageResult<()>;
}

/// Top-level store owned by the transparency tree core.
///
/// Implementations:
/// - `MemoryStore` - staged/committed maps for tests and demos
/// - `SqliteStore` - durable storage with pooled connections
#[async_trait]
pub trait TransparencyStore: Send + Sync {
    /// The log-chunk store sharing this store's staging semantics.
    fn log_store(&self) -> &dyn LogStore;

    /// The tile store sharing this store's staging semantics.
    fn prefix_store(&self) -> &dyn PrefixStore;

    /// Immutable snapshot of the committed state for a read handler.
    fn clone_reader(&self) -> Box<dyn TransparencyStore>;

    /// Persist every staged write atomically.
    async fn commit(&self) -> StorageResult<()>;

    /// Drop every staged write.
    async fn rollback(&self) -> StorageResult<()>;

    async fn get_tree_head(&self) -> StorageResult<Option<Vec<u8>>>;

    async fn put_tree_head(&self, head: &[u8]) -> StorageResult<()>;

    /// Fetch the stored index for each label, in request order.
    async fn batch_get_index(&self, labels: &[Vec<u8>]) -> StorageResult<Vec<Option<Vec<u8>>>>;

    async fn put_index(&self, label: &[u8], index: &[u8]) -> StorageResult<()>;

    async fn delete_index(&self, label: &[u8]) -> StorageResult<()>;

    async fn get_version(&self, label: &[u8], version: u32) -> StorageResult<Option<Vec<u8>>>;

    async fn put_version(&self, label: &[u8], version: u32, value: &[u8]) -> StorageResult<()>;

    async fn delete_version(&self, label: &[u8], version: u32) -> StorageResult<()>;

    /// Fetch one log entry; missing entries are an error, the log is dense.
    async fn get_entry(&self, pos: u64) -> StorageResult<Vec<u8>>;

    async fn put_entry(&self, pos: u64, entry: &[u8]) -> StorageResult<()>;

    async fn batch_get_entries(&self, positions: &[u64]) -> StorageResult<HashMap<u64, Vec<u8>>>;
}
