//! Terminal-state cleanup: abandoned requests withdraw their queued jobs
//! and stalled reads surface errors instead of hanging.

use std::sync::Arc;
use std::time::Duration;

use streamvault_core::cache::test_fixtures::MemoryBlobStore;
use streamvault_core::cache::ChunkStore;
use streamvault_core::config::StreamVaultConfig;
use streamvault_core::fetch::FetchQueue;
use streamvault_core::source::SimulatedMediaSource;
use streamvault_core::streaming::{ClientGuard, StreamCoordinator, StreamingError};
use streamvault_core::ObjectRef;

const OBJECT: ObjectRef = ObjectRef {
    group: 42,
    object: 1,
};

/// A coordinator with no worker pool behind it: enqueued jobs never start,
/// which pins down the queue-withdrawal and stall behavior.
fn coordinator_without_workers(
    source: Arc<SimulatedMediaSource>,
    stall_timeout: Duration,
) -> (StreamCoordinator, Arc<ChunkStore>, Arc<FetchQueue>) {
    let mut config = StreamVaultConfig::for_testing();
    config.fetch.stall_timeout = stall_timeout;
    let store = Arc::new(ChunkStore::new(
        config.cache.clone(),
        Arc::new(MemoryBlobStore::new()) as _,
    ));
    let queue = Arc::new(FetchQueue::new(config.fetch.queue_capacity));
    let coordinator = StreamCoordinator::new(
        config.fetch.clone(),
        Arc::clone(&store),
        Arc::clone(&queue),
        source as _,
    );
    (coordinator, store, queue)
}

#[tokio::test]
async fn test_stalled_read_surfaces_error_and_cleans_up() {
    let source = Arc::new(SimulatedMediaSource::new());
    source.add_seeded_object(OBJECT, 40, 100_000);
    let (coordinator, store, queue) =
        coordinator_without_workers(Arc::clone(&source), Duration::from_millis(200));

    let (_guard, handle) = ClientGuard::connected();
    let mut stream = coordinator
        .stream_range(OBJECT, 0, 99_999, handle)
        .await
        .unwrap();

    // The job sits in the queue forever; the reader must not hang.
    assert!(matches!(
        stream.next_block().await,
        Err(StreamingError::Stalled { pos: 0 })
    ));

    // Terminal cleanup withdrew the request's queued job and its record.
    assert!(queue.is_empty());
    assert_eq!(store.record_count(), 0);
    assert!(store.lookup(OBJECT, 0).is_none());

    // The stream stays terminated afterwards.
    assert!(stream.next_block().await.unwrap().is_none());
}

#[tokio::test]
async fn test_dropped_stream_withdraws_queued_job() {
    let source = Arc::new(SimulatedMediaSource::new());
    source.add_seeded_object(OBJECT, 41, 100_000);
    let (coordinator, store, queue) =
        coordinator_without_workers(Arc::clone(&source), Duration::from_secs(30));

    let (_guard, handle) = ClientGuard::connected();
    let mut stream = coordinator
        .stream_range(OBJECT, 0, 99_999, handle)
        .await
        .unwrap();

    // Start the request in the background, then abandon it mid-wait.
    let reader = tokio::spawn(async move {
        let _ = stream.next_block().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.len(), 1);
    reader.abort();
    let _ = reader.await;

    // Dropping the stream withdraws the queued job; the record follows
    // once the spawned cleanup runs.
    assert!(queue.is_empty());
    for _ in 0..100 {
        if store.record_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn test_disconnect_before_first_block_creates_no_job() {
    let source = Arc::new(SimulatedMediaSource::new());
    source.add_seeded_object(OBJECT, 42, 100_000);
    let (coordinator, store, queue) =
        coordinator_without_workers(Arc::clone(&source), Duration::from_secs(30));

    let (guard, handle) = ClientGuard::connected();
    let mut stream = coordinator
        .stream_range(OBJECT, 0, 99_999, handle)
        .await
        .unwrap();

    // The caller is gone before the stream is ever polled: no chunk and
    // no fetch job may be created.
    guard.disconnect();
    assert!(stream.next_block().await.unwrap().is_none());
    assert!(queue.is_empty());
    assert_eq!(store.record_count(), 0);
    assert!(source.fetch_log().is_empty());
}
