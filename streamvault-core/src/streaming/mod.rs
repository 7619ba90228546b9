//! Range streaming over the chunk cache.
//!
//! The coordinator resolves a byte range into a sequence of reads against
//! the chunk store, triggering fetch jobs for missing ranges and yielding
//! bytes as they become available. The HTTP layer consumes the resulting
//! block sequence and frames it into a ranged response.

pub mod client;
pub mod coordinator;

pub use client::{ClientGuard, ClientHandle};
pub use coordinator::{RangeStream, StreamCoordinator};

use crate::cache::CacheError;
use crate::fetch::FetchError;
use crate::source::SourceError;

/// Errors surfaced to the caller of a streaming request.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Invalid range: start {start} > end {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("Range {start}-{end} exceeds object size {object_size}")]
    RangeExceedsObject {
        start: u64,
        end: u64,
        object_size: u64,
    },

    /// No chunk growth within the stall timeout; surfaced instead of
    /// letting the read hang indefinitely.
    #[error("Stream stalled waiting for data at position {pos}")]
    Stalled { pos: u64 },

    #[error("Media source error: {0}")]
    Source(#[from] SourceError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}
