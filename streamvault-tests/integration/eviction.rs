//! Byte-budget enforcement across streaming, spillover, and re-reads.

use std::time::Duration;

use streamvault_core::cache::Lookup;
use streamvault_core::source::SimulatedMediaSource;
use streamvault_core::streaming::ClientGuard;

use crate::common::{OBJECT, collect, start_harness, wait_until};

#[tokio::test]
async fn test_streaming_never_exceeds_byte_budget() {
    let source = SimulatedMediaSource::new();
    let data = source.add_seeded_object(OBJECT, 20, 4_000_000);
    // Budget fits two of the four 1 MB chunks.
    let harness = start_harness(source, 1_000_000, 2_000_000).await;

    let (_guard, handle) = ClientGuard::connected();
    let mut stream = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 0, 3_999_999, handle)
        .await
        .unwrap();
    assert_eq!(collect(&mut stream).await, data);

    // Wait for the trailing promotions to settle, then the budget holds.
    let store = harness.vault.store();
    wait_until(|| store.cached_bytes() <= 2_000_000).await;
    assert!(store.record_count() <= 2);

    // Early ranges were evicted; a re-read misses and fetches them again.
    assert!(store.lookup(OBJECT, 0).is_none());
    let fetches_before = harness.source.fetch_log().len();
    let (_guard, handle) = ClientGuard::connected();
    let mut stream = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 0, 999_999, handle)
        .await
        .unwrap();
    assert_eq!(collect(&mut stream).await, data.slice(0..1_000_000));
    assert!(harness.source.fetch_log().len() > fetches_before);
    harness.vault.shutdown().await;
}

#[tokio::test]
async fn test_active_chunk_survives_eviction_pressure() {
    let source = SimulatedMediaSource::with_latency(Duration::from_millis(20));
    let data = source.add_seeded_object(OBJECT, 21, 4_000_000);
    // Small side objects whose cached chunks pour budget pressure onto the
    // index while the main chunk is still filling.
    let side_objects: Vec<_> = (0..4)
        .map(|i| {
            let side = streamvault_core::ObjectRef::new(500, i);
            source.add_seeded_object(side, 100 + i as u64, 50_000);
            side
        })
        .collect();
    // Budget fits the single 4 MB chunk and nothing else.
    let harness = start_harness(source, 4_000_000, 4_000_000).await;

    let (_guard_a, handle_a) = ClientGuard::connected();
    let mut stream_a = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 0, 3_999_999, handle_a)
        .await
        .unwrap();
    let mut collected = stream_a.next_block().await.unwrap().unwrap().to_vec();

    // Cache the side objects; every registration runs the eviction loop
    // while the main chunk is over budget and still in flight.
    for side in side_objects {
        let (_guard, handle) = ClientGuard::connected();
        let mut stream = harness
            .vault
            .coordinator()
            .stream_range(side, 0, 49_999, handle)
            .await
            .unwrap();
        collect(&mut stream).await;
        assert!(
            harness.vault.store().lookup(OBJECT, 0).is_some(),
            "in-flight chunk must not be evicted"
        );
    }

    collected.extend_from_slice(&collect(&mut stream_a).await);
    assert_eq!(collected, data);
    harness.vault.shutdown().await;
}

#[tokio::test]
async fn test_eviction_prefers_least_recently_used_range() {
    let source = SimulatedMediaSource::new();
    source.add_seeded_object(OBJECT, 22, 3_000_000);
    let harness = start_harness(source, 1_000_000, 2_000_000).await;
    let store = harness.vault.store();

    // Cache chunks one and two.
    for start in [0u64, 1_000_000] {
        let (_guard, handle) = ClientGuard::connected();
        let mut stream = harness
            .vault
            .coordinator()
            .stream_range(OBJECT, start, start + 999_999, handle)
            .await
            .unwrap();
        collect(&mut stream).await;
    }
    wait_until(|| {
        matches!(store.lookup(OBJECT, 0), Some(Lookup::Persisted(_)))
            && matches!(store.lookup(OBJECT, 1_000_000), Some(Lookup::Persisted(_)))
    })
    .await;

    // Touch the first range, then cache a third chunk: the second range
    // is now the least recently used and must be the victim.
    assert!(store.lookup(OBJECT, 0).is_some());
    let (_guard, handle) = ClientGuard::connected();
    let mut stream = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 2_000_000, 2_999_999, handle)
        .await
        .unwrap();
    collect(&mut stream).await;

    wait_until(|| store.lookup(OBJECT, 1_000_000).is_none()).await;
    assert!(store.lookup(OBJECT, 0).is_some());
    assert!(store.lookup(OBJECT, 2_000_000).is_some());
    harness.vault.shutdown().await;
}
