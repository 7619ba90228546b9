//! End-to-end streaming scenarios over the assembled service.

use std::time::Duration;

use streamvault_core::cache::Lookup;
use streamvault_core::source::SimulatedMediaSource;
use streamvault_core::streaming::ClientGuard;

use crate::common::{OBJECT, collect, start_harness, wait_until};

const MIB: u64 = 1024 * 1024;

#[tokio::test]
async fn test_full_read_creates_two_chunks() {
    let source = SimulatedMediaSource::new();
    let data = source.add_seeded_object(OBJECT, 1, 10_000_000);
    let harness = start_harness(source, 5_000_000, 1024 * MIB).await;

    let (_guard, handle) = ClientGuard::connected();
    let mut stream = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 0, 9_999_999, handle)
        .await
        .unwrap();
    let collected = collect(&mut stream).await;

    assert_eq!(collected.len(), 10_000_000);
    assert_eq!(collected, data);

    // Exactly two records, aligned back to back, and one fetch job each.
    assert_eq!(harness.vault.store().record_count(), 2);
    assert_eq!(harness.source.fetches_at(OBJECT, 0), 1);
    assert_eq!(harness.source.fetches_at(OBJECT, 5_000_000), 1);
    assert_eq!(harness.source.fetch_log().len(), 2);
    harness.vault.shutdown().await;
}

#[tokio::test]
async fn test_overlapping_reader_joins_in_flight_chunk() {
    let source = SimulatedMediaSource::with_latency(Duration::from_millis(2));
    let data = source.add_seeded_object(OBJECT, 2, 10_000_000);
    let harness = start_harness(source, 5_000_000, 1024 * MIB).await;

    // Request A starts filling the chunk anchored at 1,000,000.
    let (_guard_a, handle_a) = ClientGuard::connected();
    let mut stream_a = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 1_000_000, 2_000_000, handle_a)
        .await
        .unwrap();
    let first = stream_a.next_block().await.unwrap().unwrap();
    assert!(!first.is_empty());

    // Request B lands inside A's still-filling chunk: cache hit, no second
    // fetch job, and correct bytes once the buffer passes its window.
    let (_guard_b, handle_b) = ClientGuard::connected();
    let mut stream_b = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 1_500_000, 1_600_000, handle_b)
        .await
        .unwrap();
    let collected_b = collect(&mut stream_b).await;
    assert_eq!(collected_b, data.slice(1_500_000..1_600_001));
    assert_eq!(harness.source.fetch_log().len(), 1);
    assert_eq!(harness.source.fetches_at(OBJECT, 1_000_000), 1);

    let collected_a = collect(&mut stream_a).await;
    assert_eq!(
        collected_a.len() + first.len(),
        1_000_001,
        "request A reads its full inclusive range"
    );
    harness.vault.shutdown().await;
}

#[tokio::test]
async fn test_sole_disconnected_requester_cancels_fetch() {
    let source = SimulatedMediaSource::with_latency(Duration::from_millis(10));
    source.add_seeded_object(OBJECT, 3, 10_000_000);
    let harness = start_harness(source, 5_000_000, 1024 * MIB).await;

    let (guard, handle) = ClientGuard::connected();
    let mut stream = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 0, 9_999_999, handle)
        .await
        .unwrap();
    stream.next_block().await.unwrap().unwrap();

    // The only interested reader walks away mid-fetch.
    guard.disconnect();
    assert!(stream.next_block().await.unwrap().is_none());
    drop(stream);

    // The job observes zero live requesters within a polling interval and
    // removes its record from the index.
    let store = harness.vault.store();
    wait_until(|| store.record_count() == 0).await;
    assert!(store.lookup(OBJECT, 0).is_none());
    harness.vault.shutdown().await;
}

#[tokio::test]
async fn test_fetch_error_leaves_fresh_miss() {
    let source = SimulatedMediaSource::new();
    source.add_seeded_object(OBJECT, 4, 10_000_000);
    // The source dies after 2 MiB of the 5 MiB chunk.
    source.inject_failure_at(OBJECT, 2 * MIB);
    let harness = start_harness(source, 5 * MIB, 1024 * MIB).await;

    let (_guard, handle) = ClientGuard::connected();
    let mut stream = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 0, 9_999_999, handle.clone())
        .await
        .unwrap();

    // Reads succeed up to the failure point.
    let mut collected = 0usize;
    while collected < 2 * MIB as usize {
        let block = stream.next_block().await.unwrap().unwrap();
        collected += block.len();
    }
    drop(stream);

    // After the job exhausts its retries, the record must vanish.
    let store = harness.vault.store();
    wait_until(|| store.lookup(OBJECT, 0).is_none()).await;

    // A fresh request observes a miss and triggers a brand new fetch job.
    let fetches_before = harness.source.fetch_log().len();
    harness.source.clear_failure(OBJECT);
    let (_guard2, handle2) = ClientGuard::connected();
    let mut retry_stream = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 0, 999_999, handle2)
        .await
        .unwrap();
    let collected = collect(&mut retry_stream).await;
    assert_eq!(collected.len(), 1_000_000);
    assert!(harness.source.fetch_log().len() > fetches_before);
    wait_until(|| matches!(store.lookup(OBJECT, 0), Some(Lookup::Persisted(_)))).await;
    harness.vault.shutdown().await;
}
