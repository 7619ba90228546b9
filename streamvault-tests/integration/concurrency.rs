//! Concurrent access properties: one downloader per range, monotonic
//! buffer visibility, and byte-exact reassembly from overlapping readers.

use std::sync::Arc;
use std::time::Duration;

use streamvault_core::cache::{FindOrCreate, Lookup};
use streamvault_core::source::SimulatedMediaSource;
use streamvault_core::streaming::ClientGuard;

use crate::common::{OBJECT, collect, start_harness, wait_until};

#[tokio::test]
async fn test_concurrent_first_readers_share_one_fetch_per_range() {
    let source = SimulatedMediaSource::with_latency(Duration::from_millis(1));
    let data = source.add_seeded_object(OBJECT, 10, 2_000_000);
    let harness = start_harness(source, 1_000_000, u64::MAX).await;

    // Eight requests race into an uncovered object at once.
    let mut readers = Vec::new();
    for _ in 0..8 {
        let coordinator_stream = {
            let (guard, handle) = ClientGuard::connected();
            let stream = harness
                .vault
                .coordinator()
                .stream_range(OBJECT, 0, 1_999_999, handle)
                .await
                .unwrap();
            (guard, stream)
        };
        readers.push(tokio::spawn(async move {
            let (_guard, mut stream) = coordinator_stream;
            collect(&mut stream).await
        }));
    }

    for reader in readers {
        let collected = reader.await.unwrap();
        assert_eq!(collected, data);
    }

    // Exactly one fetch job was ever created per chunk start.
    assert_eq!(harness.source.fetches_at(OBJECT, 0), 1);
    assert_eq!(harness.source.fetches_at(OBJECT, 1_000_000), 1);
    assert_eq!(harness.source.fetch_log().len(), 2);
    harness.vault.shutdown().await;
}

#[tokio::test]
async fn test_buffer_length_is_monotonic_under_concurrent_reads() {
    let source = SimulatedMediaSource::with_latency(Duration::from_millis(1));
    source.add_seeded_object(OBJECT, 11, 1_000_000);
    let harness = start_harness(source, 1_000_000, u64::MAX).await;

    let (_guard, handle) = ClientGuard::connected();
    let mut stream = harness
        .vault
        .coordinator()
        .stream_range(OBJECT, 0, 999_999, handle.clone())
        .await
        .unwrap();
    stream.next_block().await.unwrap().unwrap();

    let Some(Lookup::Filling(chunk)) = harness.vault.store().lookup(OBJECT, 0) else {
        panic!("chunk should still be filling");
    };

    // Several observers poll the buffer while the fetch job appends.
    let observers: Vec<_> = (0..4)
        .map(|_| {
            let chunk = Arc::clone(&chunk);
            tokio::spawn(async move {
                let mut last = 0;
                while !chunk.is_complete() && !chunk.is_aborted() {
                    let seen = chunk.buffered_len();
                    assert!(seen >= last, "buffer length must never shrink");
                    last = seen;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                assert!(chunk.buffered_len() >= last);
            })
        })
        .collect();

    for observer in observers {
        observer.await.unwrap();
    }
    collect(&mut stream).await;
    harness.vault.shutdown().await;
}

#[tokio::test]
async fn test_overlapping_small_reads_reassemble_byte_exact() {
    let source = SimulatedMediaSource::new();
    let data = source.add_seeded_object(OBJECT, 12, 1_500_000);
    let harness = start_harness(source, 400_000, u64::MAX).await;

    // Many small overlapping windows across the object, sequentially and
    // in parallel, all agree with the source.
    let mut windows = Vec::new();
    let mut start = 0u64;
    while start < 1_500_000 {
        let end = (start + 99_999).min(1_499_999);
        windows.push((start, end));
        start += 50_000;
    }

    let mut tasks = Vec::new();
    for (start, end) in windows {
        let (guard, handle) = ClientGuard::connected();
        let stream = harness
            .vault
            .coordinator()
            .stream_range(OBJECT, start, end, handle)
            .await
            .unwrap();
        let expected = data.slice(start as usize..=end as usize);
        tasks.push(tokio::spawn(async move {
            let _guard = guard;
            let mut stream = stream;
            assert_eq!(collect(&mut stream).await, expected, "window [{start}, {end}]");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    harness.vault.shutdown().await;
}

#[tokio::test]
async fn test_atomic_find_or_create_never_overlaps() {
    let source = SimulatedMediaSource::new();
    source.add_seeded_object(OBJECT, 13, 1_000_000);
    let harness = start_harness(source, 300_000, u64::MAX).await;
    let store = harness.vault.store();

    // Adjacent-but-distinct offsets race into an uncovered span; the
    // second registration must clip at the first one's start instead of
    // overlapping it.
    let (_guard, handle) = ClientGuard::connected();
    let FindOrCreate::Created(later) = store.find_or_create(OBJECT, 200_000, 1_000_000, &handle).await
    else {
        panic!("expected fresh chunk");
    };
    let FindOrCreate::Created(earlier) = store.find_or_create(OBJECT, 50_000, 1_000_000, &handle).await
    else {
        panic!("expected fresh chunk");
    };

    assert_eq!(later.record().start, 200_000);
    assert_eq!(earlier.record().start, 50_000);
    assert_eq!(
        earlier.record().end(),
        200_000,
        "second registration clips at the next record"
    );

    // Both were registered outside fetch jobs; withdraw them.
    store.cancel(later.record()).await;
    store.cancel(earlier.record()).await;
    wait_until(|| store.record_count() == 0).await;
    harness.vault.shutdown().await;
}
