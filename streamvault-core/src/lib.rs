//! Streamvault Core - media chunk caching and range streaming
//!
//! This crate provides the building blocks for serving HTTP range requests
//! over large remote-hosted media objects: a chunk cache with LRU eviction
//! and disk spillover, a bounded download worker pool, and a per-request
//! stream coordinator that shares one in-flight download among overlapping
//! readers.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod service;
pub mod source;
pub mod streaming;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use cache::{BlobStore, CacheError, ChunkStore, FsBlobStore, ObjectRef};
pub use config::StreamVaultConfig;
pub use fetch::{FetchError, FetchPool, FetchQueue};
pub use service::StreamVault;
pub use source::{MediaSource, SourceError};
pub use streaming::{ClientGuard, ClientHandle, StreamCoordinator, StreamingError};

/// Core errors that can bubble up from any streamvault subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StreamVaultError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Media source error: {0}")]
    Source(#[from] SourceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamVaultError>;
