//! Bounded fetch queue and download worker pool.
//!
//! Fetch jobs fill exactly one chunk each. Requests enqueue jobs tagged
//! with their request id; a fixed set of workers drains the queue, pulls
//! sub-chunks from the media source, and appends them to the owning chunk
//! so readers see progress at network granularity.

pub mod queue;
pub mod worker;

pub use queue::{FetchJob, FetchQueue, QueuedJob};
pub use worker::FetchPool;

use crate::cache::{CacheError, ChunkId};
use crate::source::SourceError;

/// Identifies the streaming request that enqueued a job, so an abandoned
/// request can withdraw its not-yet-started work.
pub type RequestId = u64;

/// Errors terminating a fetch job or queue operation.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The last interested reader disconnected; the job winds down and the
    /// chunk is withdrawn from the index.
    #[error("Fetch of chunk {id} cancelled: no live requesters remain")]
    Cancelled { id: ChunkId },

    /// The queue was closed for shutdown.
    #[error("Fetch queue is shut down")]
    Shutdown,

    #[error("Media source error: {0}")]
    Source(#[from] SourceError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}
