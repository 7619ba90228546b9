//! Deterministic in-memory media source for tests and simulation
//!
//! Objects are registered up front (optionally generated from a seed),
//! fetches are logged for assertions about job creation, and failures can
//! be injected at byte positions to exercise the error paths.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{MediaSource, SourceError, SubChunkStream};
use crate::cache::ObjectRef;

/// Generates `len` reproducible pseudo-random bytes for `seed`.
pub fn deterministic_bytes(seed: u64, len: usize) -> Bytes {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    Bytes::from(data)
}

#[derive(Clone)]
struct SimObject {
    data: Bytes,
    fail_from: Option<u64>,
}

/// In-memory `MediaSource` with deterministic content, per-call logging,
/// and byte-position fault injection.
#[derive(Default)]
pub struct SimulatedMediaSource {
    objects: Mutex<HashMap<ObjectRef, SimObject>>,
    latency: Option<Duration>,
    fetch_log: Mutex<Vec<(ObjectRef, u64)>>,
}

impl SimulatedMediaSource {
    /// Creates an empty simulated source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source that sleeps `latency` before each yielded
    /// sub-chunk, giving concurrent readers room to interleave.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Registers an object with explicit content.
    pub fn add_object(&self, object: ObjectRef, data: Bytes) {
        self.objects.lock().insert(
            object,
            SimObject {
                data,
                fail_from: None,
            },
        );
    }

    /// Registers an object filled with seeded deterministic bytes and
    /// returns the content for byte-exactness assertions.
    pub fn add_seeded_object(&self, object: ObjectRef, seed: u64, len: usize) -> Bytes {
        let data = deterministic_bytes(seed, len);
        self.add_object(object, data.clone());
        data
    }

    /// Makes every fetch of `object` fail once it reaches byte `offset`.
    pub fn inject_failure_at(&self, object: ObjectRef, offset: u64) {
        if let Some(sim) = self.objects.lock().get_mut(&object) {
            sim.fail_from = Some(offset);
        }
    }

    /// Clears an injected failure so subsequent fetches succeed.
    pub fn clear_failure(&self, object: ObjectRef) {
        if let Some(sim) = self.objects.lock().get_mut(&object) {
            sim.fail_from = None;
        }
    }

    /// Every `(object, offset)` pair `fetch_range` was called with.
    pub fn fetch_log(&self) -> Vec<(ObjectRef, u64)> {
        self.fetch_log.lock().clone()
    }

    /// Number of `fetch_range` calls that started at `offset` of `object`.
    pub fn fetches_at(&self, object: ObjectRef, offset: u64) -> usize {
        self.fetch_log
            .lock()
            .iter()
            .filter(|(o, s)| *o == object && *s == offset)
            .count()
    }
}

#[async_trait]
impl MediaSource for SimulatedMediaSource {
    async fn object_size(&self, object: ObjectRef) -> Result<u64, SourceError> {
        let objects = self.objects.lock();
        let sim = objects.get(&object).ok_or(SourceError::NotFound { object })?;
        Ok(sim.data.len() as u64)
    }

    async fn fetch_range(
        &self,
        object: ObjectRef,
        offset: u64,
        max_length: u64,
        sub_chunk_size: u64,
    ) -> Result<SubChunkStream, SourceError> {
        self.fetch_log.lock().push((object, offset));
        let sim = self
            .objects
            .lock()
            .get(&object)
            .cloned()
            .ok_or(SourceError::NotFound { object })?;

        let end = (sim.data.len() as u64).min(offset + max_length);
        let latency = self.latency;
        let fail_from = sim.fail_from;
        let data = sim.data;
        let stream = futures::stream::unfold(Some(offset), move |state| {
            let data = data.clone();
            async move {
                let pos = state?;
                if pos >= end {
                    return None;
                }
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }
                if fail_from.is_some_and(|fail| pos >= fail) {
                    let err = SourceError::Fetch {
                        object,
                        offset: pos,
                        reason: "injected failure".to_string(),
                    };
                    return Some((Err(err), None));
                }
                let take = sub_chunk_size.min(end - pos);
                let sub = data.slice(pos as usize..(pos + take) as usize);
                Some((Ok(sub), Some(pos + take)))
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OBJECT: ObjectRef = ObjectRef {
        group: 1,
        object: 2,
    };

    #[test]
    fn test_deterministic_bytes_reproducible() {
        assert_eq!(deterministic_bytes(42, 128), deterministic_bytes(42, 128));
        assert_ne!(deterministic_bytes(42, 128), deterministic_bytes(43, 128));
    }

    #[tokio::test]
    async fn test_fetch_yields_sub_chunks() {
        let source = SimulatedMediaSource::new();
        let data = source.add_seeded_object(OBJECT, 7, 1000);

        let mut stream = source.fetch_range(OBJECT, 100, 500, 256).await.unwrap();
        let mut collected = Vec::new();
        while let Some(sub) = stream.next().await {
            collected.extend_from_slice(&sub.unwrap());
        }
        assert_eq!(collected, data.slice(100..600));
        assert_eq!(source.fetches_at(OBJECT, 100), 1);
    }

    #[tokio::test]
    async fn test_fetch_clips_to_object_end() {
        let source = SimulatedMediaSource::new();
        source.add_seeded_object(OBJECT, 7, 100);

        let mut stream = source.fetch_range(OBJECT, 80, 500, 64).await.unwrap();
        let sub = stream.next().await.unwrap().unwrap();
        assert_eq!(sub.len(), 20);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_ends_stream() {
        let source = SimulatedMediaSource::new();
        source.add_seeded_object(OBJECT, 7, 1000);
        source.inject_failure_at(OBJECT, 100);

        let mut stream = source.fetch_range(OBJECT, 0, 1000, 100).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());

        source.clear_failure(OBJECT);
        let mut stream = source.fetch_range(OBJECT, 0, 1000, 1000).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_object_is_not_found() {
        let source = SimulatedMediaSource::new();
        assert!(matches!(
            source.object_size(OBJECT).await,
            Err(SourceError::NotFound { .. })
        ));
        assert!(matches!(
            source.fetch_range(OBJECT, 0, 10, 10).await,
            Err(SourceError::NotFound { .. })
        ));
    }
}
