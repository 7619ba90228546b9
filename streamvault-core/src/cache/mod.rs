//! Media chunk cache.
//!
//! Defines chunk identity and buffers, the range index with LRU eviction
//! and disk spillover, and the persistent blob tier interface with a
//! file-based implementation.

pub mod chunk;
pub mod persist;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use async_trait::async_trait;
use bytes::Bytes;
pub use chunk::{Chunk, ChunkId, ChunkRecord, ObjectRef, compare_by_start};
pub use persist::FsBlobStore;
pub use store::{ChunkStore, FindOrCreate, Lookup};

/// Errors that can occur in the chunk cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An append would push a chunk buffer past its declared target length.
    /// Always an accounting bug upstream, never silently clipped.
    #[error(
        "Chunk overflow for {id}: buffered {buffered} + appended {appended} exceeds target {target}"
    )]
    Overflow {
        id: ChunkId,
        buffered: u64,
        appended: u64,
        target: u64,
    },

    /// A lookup, promotion, or cancellation referenced a record no longer
    /// present. Callers treat this as a race lost, not a failure.
    #[error("Chunk {id} not found in cache index")]
    NotFound { id: ChunkId },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent key/value tier holding bytes of completed chunks.
///
/// The record tuple is the durable key; `scan` rebuilds records from it on
/// startup. Reads racing deletions resolve to `Ok(None)` and are treated by
/// callers as a fresh cache miss.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persists a completed chunk's bytes.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the backing storage rejects the write
    async fn store(&self, record: &ChunkRecord, bytes: Bytes) -> Result<(), CacheError>;

    /// Loads a persisted chunk's bytes, or `None` if the blob is gone.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the backing storage fails to read
    async fn load(&self, record: &ChunkRecord) -> Result<Option<Bytes>, CacheError>;

    /// Deletes a persisted blob. Returns whether a blob was present.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the backing storage fails to delete
    async fn remove(&self, record: &ChunkRecord) -> Result<bool, CacheError>;

    /// Enumerates every persisted chunk for restore-on-startup.
    ///
    /// Entries that cannot be decoded are logged and skipped, never fatal.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the backing storage cannot be enumerated
    async fn scan(&self) -> Result<Vec<ChunkRecord>, CacheError>;
}
