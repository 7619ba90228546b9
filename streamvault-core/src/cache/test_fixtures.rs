//! Test fixtures for cache components
//!
//! In-memory `BlobStore` used by unit tests and integration scenarios that
//! exercise spillover and restore without touching the filesystem.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::chunk::ChunkRecord;
use super::{BlobStore, CacheError};

type BlobKey = (i64, i64, u64);

/// `BlobStore` backed by a sorted in-memory map. Scan order is the key
/// order, which keeps restore recency deterministic in tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<BlobKey, (ChunkRecord, Bytes)>>,
}

impl MemoryBlobStore {
    /// Creates an empty in-memory blob store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held.
    pub fn blob_count(&self) -> usize {
        self.blobs.lock().len()
    }

    fn key(record: &ChunkRecord) -> BlobKey {
        (record.object.group, record.object.object, record.start)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store(&self, record: &ChunkRecord, bytes: Bytes) -> Result<(), CacheError> {
        self.blobs
            .lock()
            .insert(Self::key(record), (*record, bytes));
        Ok(())
    }

    async fn load(&self, record: &ChunkRecord) -> Result<Option<Bytes>, CacheError> {
        Ok(self
            .blobs
            .lock()
            .get(&Self::key(record))
            .map(|(_, bytes)| bytes.clone()))
    }

    async fn remove(&self, record: &ChunkRecord) -> Result<bool, CacheError> {
        Ok(self.blobs.lock().remove(&Self::key(record)).is_some())
    }

    async fn scan(&self) -> Result<Vec<ChunkRecord>, CacheError> {
        Ok(self
            .blobs
            .lock()
            .values()
            .map(|(record, _)| *record)
            .collect())
    }
}
