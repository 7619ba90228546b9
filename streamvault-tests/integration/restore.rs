//! Warm-cache restore across service restarts.

use std::sync::Arc;

use streamvault_core::cache::Lookup;
use streamvault_core::config::StreamVaultConfig;
use streamvault_core::service::StreamVault;
use streamvault_core::source::SimulatedMediaSource;
use streamvault_core::streaming::ClientGuard;

use crate::common::{OBJECT, collect, wait_until};

fn restart_config(blob_dir: &std::path::Path) -> StreamVaultConfig {
    let mut config = StreamVaultConfig::for_testing();
    config.cache.chunk_size = 500_000;
    config.cache.max_cache_bytes = 10_000_000;
    config.cache.blob_dir = blob_dir.to_path_buf();
    config.fetch.net_chunk_size = 256 * 1024;
    config
}

#[tokio::test]
async fn test_restart_restores_lookups_and_bytes() {
    let blob_dir = tempfile::TempDir::new().unwrap();
    let config = restart_config(blob_dir.path());

    let source = Arc::new(SimulatedMediaSource::new());
    let data = source.add_seeded_object(OBJECT, 30, 1_500_000);

    // First run: stream the whole object and let every chunk persist.
    {
        let vault = StreamVault::start(config.clone(), Arc::clone(&source) as _)
            .await
            .unwrap();
        let (_guard, handle) = ClientGuard::connected();
        let mut stream = vault
            .coordinator()
            .stream_range(OBJECT, 0, 1_499_999, handle)
            .await
            .unwrap();
        assert_eq!(collect(&mut stream).await, data);

        let store = Arc::clone(vault.store());
        wait_until(move || {
            [0u64, 500_000, 1_000_000]
                .iter()
                .all(|pos| matches!(store.lookup(OBJECT, *pos), Some(Lookup::Persisted(_))))
        })
        .await;
        vault.shutdown().await;
    }

    // Second run over the same directory: the cache comes back warm.
    let fresh_source = Arc::new(SimulatedMediaSource::new());
    fresh_source.add_seeded_object(OBJECT, 30, 1_500_000);
    let vault = StreamVault::start(config, Arc::clone(&fresh_source) as _)
        .await
        .unwrap();

    assert_eq!(vault.store().record_count(), 3);
    for pos in [0u64, 250_000, 500_000, 999_999, 1_000_000, 1_499_999] {
        assert!(
            vault.store().lookup(OBJECT, pos).is_some(),
            "position {pos} should stay cached across restart"
        );
    }

    // A full re-read is served from disk alone: byte-exact, zero fetches.
    let (_guard, handle) = ClientGuard::connected();
    let mut stream = vault
        .coordinator()
        .stream_range(OBJECT, 0, 1_499_999, handle)
        .await
        .unwrap();
    assert_eq!(collect(&mut stream).await, data);
    assert!(fresh_source.fetch_log().is_empty());
    vault.shutdown().await;
}

#[tokio::test]
async fn test_restore_is_idempotent_across_repeated_restarts() {
    let blob_dir = tempfile::TempDir::new().unwrap();
    let config = restart_config(blob_dir.path());

    let source = Arc::new(SimulatedMediaSource::new());
    source.add_seeded_object(OBJECT, 31, 500_000);

    {
        let vault = StreamVault::start(config.clone(), Arc::clone(&source) as _)
            .await
            .unwrap();
        let (_guard, handle) = ClientGuard::connected();
        let mut stream = vault
            .coordinator()
            .stream_range(OBJECT, 0, 499_999, handle)
            .await
            .unwrap();
        collect(&mut stream).await;
        let store = Arc::clone(vault.store());
        wait_until(move || matches!(store.lookup(OBJECT, 0), Some(Lookup::Persisted(_)))).await;
        vault.shutdown().await;
    }

    // Restarting twice more neither loses nor duplicates records.
    for _ in 0..2 {
        let vault = StreamVault::start(config.clone(), Arc::clone(&source) as _)
            .await
            .unwrap();
        assert_eq!(vault.store().record_count(), 1);
        assert!(vault.store().lookup(OBJECT, 250_000).is_some());
        vault.shutdown().await;
    }
}
