//! Download worker pool
//!
//! A fixed set of workers drains the fetch queue. Each job pulls
//! sub-chunks from the media source and appends them to its chunk, waking
//! readers at network granularity. A job ends by promoting its completed
//! chunk, or by cancelling the record when the source definitively fails
//! or the last interested reader disconnects. Either way, no indexed
//! record is left without an owning job or persisted bytes.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;

use super::queue::FetchQueue;
use super::FetchError;
use crate::cache::{CacheError, Chunk, ChunkStore};
use crate::config::FetchConfig;
use crate::source::{MediaSource, SourceError};

/// Fixed-size pool of download workers draining the shared queue.
pub struct FetchPool {
    queue: Arc<FetchQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl FetchPool {
    /// Spawns `config.workers` worker tasks over the given queue.
    pub fn spawn(
        config: FetchConfig,
        queue: Arc<FetchQueue>,
        store: Arc<ChunkStore>,
        source: Arc<dyn MediaSource>,
    ) -> Self {
        let workers = (0..config.workers)
            .map(|worker_id| {
                let config = config.clone();
                let queue = Arc::clone(&queue);
                let store = Arc::clone(&store);
                let source = Arc::clone(&source);
                tokio::spawn(async move {
                    tracing::debug!("Fetch worker {worker_id} started");
                    while let Some(queued) = queue.pop().await {
                        execute_job(&store, source.as_ref(), &config, &queued.job.chunk).await;
                    }
                    tracing::debug!("Fetch worker {worker_id} stopped");
                })
            })
            .collect();
        Self { queue, workers }
    }

    /// Closes the queue, lets pending jobs drain, and joins every worker.
    pub async fn shutdown(self) {
        self.queue.close();
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::warn!("Fetch worker panicked during shutdown: {err}");
            }
        }
    }
}

async fn execute_job(
    store: &ChunkStore,
    source: &dyn MediaSource,
    config: &FetchConfig,
    chunk: &Arc<Chunk>,
) {
    let record = *chunk.record();
    match fill_chunk(source, config, chunk).await {
        Ok(()) => match store.promote(chunk).await {
            Ok(()) => {
                tracing::debug!(
                    "Fetched chunk {} ({} bytes at {}+{})",
                    record.id,
                    record.length,
                    record.object,
                    record.start
                );
            }
            Err(err) => {
                tracing::error!("Failed to promote chunk {}: {err}", record.id);
                store.cancel(&record).await;
                chunk.abort();
            }
        },
        Err(FetchError::Cancelled { .. }) => {
            tracing::debug!("Fetch of chunk {} cancelled, no live requesters", record.id);
            store.cancel(&record).await;
            chunk.abort();
        }
        Err(FetchError::Cache(err @ CacheError::Overflow { .. })) => {
            // Accounting bug upstream; surface loudly, never clip.
            tracing::error!("Invariant violation filling chunk {}: {err}", record.id);
            store.cancel(&record).await;
            chunk.abort();
        }
        Err(err) => {
            tracing::warn!("Fetch of chunk {} failed: {err}", record.id);
            store.cancel(&record).await;
            chunk.abort();
        }
    }
}

/// Fills the chunk to its target length, retrying transient source errors
/// with exponential backoff. Each retry re-opens the source stream at the
/// current buffered offset.
async fn fill_chunk(
    source: &dyn MediaSource,
    config: &FetchConfig,
    chunk: &Chunk,
) -> Result<(), FetchError> {
    let mut attempt = 0u32;
    loop {
        match fill_attempt(source, config, chunk).await {
            Ok(()) => return Ok(()),
            Err(FetchError::Source(err)) if attempt < config.max_retries => {
                let backoff = config.retry_backoff * 2u32.pow(attempt);
                attempt += 1;
                tracing::warn!(
                    "Fetch attempt {attempt} for chunk {} failed, retrying in {backoff:?}: {err}",
                    chunk.record().id
                );
                tokio::time::sleep(backoff).await;
                if !chunk.has_live_requesters() {
                    return Err(FetchError::Cancelled {
                        id: chunk.record().id,
                    });
                }
            }
            Err(err) => return Err(err),
        }
    }
}

async fn fill_attempt(
    source: &dyn MediaSource,
    config: &FetchConfig,
    chunk: &Chunk,
) -> Result<(), FetchError> {
    let record = *chunk.record();
    let buffered = chunk.buffered_len();
    if buffered >= record.length {
        return Ok(());
    }

    let mut stream = source
        .fetch_range(
            record.object,
            record.start + buffered,
            record.length - buffered,
            config.net_chunk_size,
        )
        .await?;

    while let Some(sub_chunk) = stream.next().await {
        let sub_chunk = sub_chunk?;
        let remaining = record.length - chunk.buffered_len();
        if remaining == 0 {
            break;
        }
        // Clip the final sub-chunk so the buffer never exceeds the target.
        let sub_chunk = if sub_chunk.len() as u64 > remaining {
            sub_chunk.slice(..remaining as usize)
        } else {
            sub_chunk
        };
        chunk.append(&sub_chunk)?;
        if chunk.is_complete() {
            return Ok(());
        }
        if !chunk.has_live_requesters() {
            return Err(FetchError::Cancelled { id: record.id });
        }
    }

    if chunk.is_complete() {
        Ok(())
    } else {
        Err(FetchError::Source(SourceError::Fetch {
            object: record.object,
            offset: record.start + chunk.buffered_len(),
            reason: "sub-chunk stream ended before the range was filled".to_string(),
        }))
    }
}
