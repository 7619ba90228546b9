//! Assembled cache service for dependency injection.
//!
//! Wires the chunk store, fetch queue, worker pool, and stream coordinator
//! together with one lifecycle: restore the persisted cache at startup,
//! serve ranged reads while running, drain the workers at shutdown. The
//! embedding process owns the instance and passes it to whatever serves
//! HTTP; there is no process-global cache state.

use std::sync::Arc;

use crate::cache::{ChunkStore, FsBlobStore};
use crate::config::StreamVaultConfig;
use crate::fetch::{FetchPool, FetchQueue};
use crate::source::MediaSource;
use crate::streaming::StreamCoordinator;
use crate::{BlobStore, Result};

/// A running streamvault instance: warm cache, worker pool, coordinator.
pub struct StreamVault {
    store: Arc<ChunkStore>,
    coordinator: StreamCoordinator,
    pool: FetchPool,
}

impl StreamVault {
    /// Starts a cache instance over the configured filesystem blob tier,
    /// restoring any chunks persisted by a previous run.
    ///
    /// # Errors
    ///
    /// - `StreamVaultError::Cache` - If the persisted cache cannot be
    ///   enumerated during restore
    pub async fn start(config: StreamVaultConfig, source: Arc<dyn MediaSource>) -> Result<Self> {
        let blobs = Arc::new(FsBlobStore::new(config.cache.blob_dir.clone()));
        Self::start_with_blobs(config, source, blobs).await
    }

    /// Starts a cache instance over an injected blob tier.
    ///
    /// # Errors
    ///
    /// - `StreamVaultError::Cache` - If the persisted cache cannot be
    ///   enumerated during restore
    pub async fn start_with_blobs(
        config: StreamVaultConfig,
        source: Arc<dyn MediaSource>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let store = Arc::new(ChunkStore::new(config.cache.clone(), blobs));
        store.restore_from_disk().await?;

        let queue = Arc::new(FetchQueue::new(config.fetch.queue_capacity));
        let pool = FetchPool::spawn(
            config.fetch.clone(),
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&source),
        );
        let coordinator = StreamCoordinator::new(
            config.fetch.clone(),
            Arc::clone(&store),
            queue,
            source,
        );
        Ok(Self {
            store,
            coordinator,
            pool,
        })
    }

    /// The stream coordinator serving ranged reads.
    pub fn coordinator(&self) -> &StreamCoordinator {
        &self.coordinator
    }

    /// The underlying chunk store.
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Gracefully drains the fetch queue and joins every worker.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}
