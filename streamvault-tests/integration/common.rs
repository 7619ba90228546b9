//! Shared fixtures for integration tests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use streamvault_core::cache::test_fixtures::MemoryBlobStore;
use streamvault_core::config::StreamVaultConfig;
use streamvault_core::service::StreamVault;
use streamvault_core::source::SimulatedMediaSource;
use streamvault_core::streaming::RangeStream;
use streamvault_core::ObjectRef;

pub const OBJECT: ObjectRef = ObjectRef {
    group: -1001,
    object: 77,
};

/// A cache service over a simulated source and an in-memory blob tier.
pub struct Harness {
    pub vault: StreamVault,
    pub source: Arc<SimulatedMediaSource>,
}

/// Starts a service with the given chunk size and byte budget over an
/// in-memory blob tier.
pub async fn start_harness(
    source: SimulatedMediaSource,
    chunk_size: u64,
    max_cache_bytes: u64,
) -> Harness {
    let mut config = StreamVaultConfig::for_testing();
    config.cache.chunk_size = chunk_size;
    config.cache.max_cache_bytes = max_cache_bytes;
    config.fetch.net_chunk_size = 256 * 1024;

    let source = Arc::new(source);
    let vault = StreamVault::start_with_blobs(
        config,
        Arc::clone(&source) as _,
        Arc::new(MemoryBlobStore::new()) as _,
    )
    .await
    .expect("service should start over an empty blob tier");
    Harness { vault, source }
}

/// Drains a stream to completion, panicking on any stream error.
pub async fn collect(stream: &mut RangeStream) -> Bytes {
    let mut collected = Vec::new();
    while let Some(block) = stream.next_block().await.expect("stream error") {
        collected.extend_from_slice(&block);
    }
    Bytes::from(collected)
}

/// Polls `condition` until it holds or a generous timeout elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}
