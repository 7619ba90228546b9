//! Remote media source boundary.
//!
//! The cache core consumes the messaging backend through this seam: given
//! an object address and a byte offset, the source yields a finite lazy
//! sequence of byte sub-chunks. Wire formats and authentication live on
//! the other side of the trait.

#[cfg(any(test, feature = "test-utils"))]
pub mod simulated;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::cache::ObjectRef;
#[cfg(any(test, feature = "test-utils"))]
pub use simulated::SimulatedMediaSource;

/// Lazy sequence of byte sub-chunks produced by one `fetch_range` call.
///
/// Finite and not restartable mid-stream; resuming means a fresh
/// `fetch_range` call at the new offset. Any element may be a transient
/// I/O failure.
pub type SubChunkStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// Errors raised by the remote media source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Object {object} not found in media source")]
    NotFound { object: ObjectRef },

    #[error("Fetch failed for {object} at offset {offset}: {reason}")]
    Fetch {
        object: ObjectRef,
        offset: u64,
        reason: String,
    },
}

/// Read access to remote-hosted media objects.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Total byte length of an object, used to clip its last chunk.
    ///
    /// # Errors
    ///
    /// - `SourceError::NotFound` - If the object does not exist
    async fn object_size(&self, object: ObjectRef) -> Result<u64, SourceError>;

    /// Opens a sub-chunk stream over `[offset, offset + max_length)` of an
    /// object. `sub_chunk_size` is the requested network granularity;
    /// sources may yield smaller pieces.
    ///
    /// # Errors
    ///
    /// - `SourceError::NotFound` - If the object does not exist
    /// - `SourceError::Fetch` - If the transfer cannot be opened
    async fn fetch_range(
        &self,
        object: ObjectRef,
        offset: u64,
        max_length: u64,
        sub_chunk_size: u64,
    ) -> Result<SubChunkStream, SourceError>;
}
