//! Range index, LRU accounting, and disk spillover for cached chunks
//!
//! `ChunkStore` owns every live chunk: records live in a per-object sorted
//! range index, recency is tracked across all objects for byte-budget
//! eviction, chunks still filling live in memory, and completed chunks
//! spill to the persistent blob tier.
//!
//! All index state sits behind one mutex that is never held across an
//! `.await`; blob I/O is always sequenced after the index mutation that
//! decided it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use super::chunk::{Chunk, ChunkId, ChunkRecord, ObjectRef, compare_by_start};
use super::{BlobStore, CacheError};
use crate::config::CacheConfig;
use crate::streaming::ClientHandle;

/// Result of a position lookup in the cache.
pub enum Lookup {
    /// The covering chunk is still being filled (or freshly completed but
    /// not yet promoted); readers follow its growth directly.
    Filling(Arc<Chunk>),
    /// The covering chunk's bytes live in the persistent tier.
    Persisted(ChunkRecord),
}

/// Result of an atomic find-or-create at a position.
pub enum FindOrCreate {
    /// A covering chunk already existed; no new fetch must be started.
    Existing(Lookup),
    /// A new record was registered; the caller owns enqueueing exactly one
    /// fetch job for it.
    Created(Arc<Chunk>),
}

struct StoreIndex {
    /// `group -> object -> records sorted by start`.
    ranges: HashMap<i64, HashMap<i64, Vec<ChunkRecord>>>,
    /// Recency over every indexed record, least-recently-used first.
    recency: LruCache<ChunkId, ChunkRecord>,
    /// Chunks still owned by a fetch job, exempt from eviction.
    filling: HashMap<ChunkId, Arc<Chunk>>,
    /// Running total of `record.length` over all indexed records, so an
    /// in-flight chunk already reserves its full eventual footprint.
    cached_bytes: u64,
}

impl StoreIndex {
    fn covering_record(&self, object: ObjectRef, pos: u64) -> Option<ChunkRecord> {
        let records = self.object_records(object)?;
        let idx = records.partition_point(|r| r.start <= pos);
        let candidate = records[..idx].last()?;
        candidate.covers(pos).then_some(*candidate)
    }

    fn object_records(&self, object: ObjectRef) -> Option<&Vec<ChunkRecord>> {
        self.ranges.get(&object.group)?.get(&object.object)
    }

    fn insert_sorted(&mut self, record: ChunkRecord) {
        let records = self
            .ranges
            .entry(record.object.group)
            .or_default()
            .entry(record.object.object)
            .or_default();
        if let Err(idx) = records.binary_search_by(|r| compare_by_start(r, &record)) {
            records.insert(idx, record);
        }
    }

    fn remove_record(&mut self, record: &ChunkRecord) {
        let Some(objects) = self.ranges.get_mut(&record.object.group) else {
            return;
        };
        if let Some(records) = objects.get_mut(&record.object.object) {
            if let Ok(idx) = records.binary_search_by(|r| compare_by_start(r, record)) {
                records.remove(idx);
            }
            if records.is_empty() {
                objects.remove(&record.object.object);
            }
        }
        if objects.is_empty() {
            self.ranges.remove(&record.object.group);
        }
    }

    /// Pops least-recently-used records until the byte total fits the
    /// budget, skipping records whose chunk a fetch job still owns.
    /// Returns the evicted records so their blobs can be deleted after the
    /// index lock is released.
    fn evict_over_budget(&mut self, max_cache_bytes: u64) -> Vec<ChunkRecord> {
        let mut evicted = Vec::new();
        let mut in_flight = Vec::new();
        while self.cached_bytes > max_cache_bytes {
            let Some((id, record)) = self.recency.pop_lru() else {
                break;
            };
            if self.filling.contains_key(&id) {
                in_flight.push((id, record));
                continue;
            }
            self.remove_record(&record);
            self.cached_bytes -= record.length;
            tracing::debug!(
                "Evicted chunk {} ({} bytes at {}+{})",
                id,
                record.length,
                record.object,
                record.start
            );
            evicted.push(record);
        }
        // Skipped in-flight records rejoin the recency list; they were
        // being read or written moments ago anyway.
        for (id, record) in in_flight {
            self.recency.put(id, record);
        }
        evicted
    }
}

/// The chunk cache: sorted range index + LRU + size-bounded disk spillover.
///
/// Explicitly constructed and injected into every component that needs it;
/// there is no process-global cache state.
pub struct ChunkStore {
    config: CacheConfig,
    blobs: Arc<dyn BlobStore>,
    index: Mutex<StoreIndex>,
}

impl ChunkStore {
    /// Creates an empty store over the given persistent tier.
    pub fn new(config: CacheConfig, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            config,
            blobs,
            index: Mutex::new(StoreIndex {
                ranges: HashMap::new(),
                recency: LruCache::unbounded(),
                filling: HashMap::new(),
                cached_bytes: 0,
            }),
        }
    }

    /// Finds the chunk covering `pos` within `object`, promoting it to
    /// most-recently-used. Returns `None` when no indexed range covers the
    /// position.
    pub fn lookup(&self, object: ObjectRef, pos: u64) -> Option<Lookup> {
        let mut index = self.index.lock();
        let record = index.covering_record(object, pos)?;
        index.recency.get(&record.id);
        match index.filling.get(&record.id) {
            Some(chunk) => Some(Lookup::Filling(Arc::clone(chunk))),
            None => Some(Lookup::Persisted(record)),
        }
    }

    /// Atomically resolves `pos` to an existing chunk or registers a new
    /// one, as a single index operation.
    ///
    /// A created record starts exactly at `pos`; its length is clipped by
    /// the configured chunk size, the object size, and the next indexed
    /// record's start, so two interleaved requests can never register
    /// overlapping ranges. The requester is registered before the chunk
    /// becomes visible. Registration may push the cache over its byte
    /// budget, in which case least-recently-used records are evicted
    /// before this call returns.
    pub async fn find_or_create(
        &self,
        object: ObjectRef,
        pos: u64,
        object_size: u64,
        requester: &ClientHandle,
    ) -> FindOrCreate {
        debug_assert!(pos < object_size, "position beyond object size");
        let (result, evicted) = {
            let mut index = self.index.lock();
            if let Some(record) = index.covering_record(object, pos) {
                index.recency.get(&record.id);
                let hit = match index.filling.get(&record.id) {
                    Some(chunk) => {
                        chunk.add_requester(requester.clone());
                        Lookup::Filling(Arc::clone(chunk))
                    }
                    None => Lookup::Persisted(record),
                };
                (FindOrCreate::Existing(hit), Vec::new())
            } else {
                let next_start = index
                    .object_records(object)
                    .map(|records| {
                        let idx = records.partition_point(|r| r.start <= pos);
                        records.get(idx).map_or(object_size, |r| r.start)
                    })
                    .unwrap_or(object_size);
                let length = self
                    .config
                    .chunk_size
                    .min(object_size - pos)
                    .min(next_start - pos);
                let record = ChunkRecord::new(object, pos, length);
                let chunk = Arc::new(Chunk::new(record));
                chunk.add_requester(requester.clone());

                index.insert_sorted(record);
                index.recency.put(record.id, record);
                index.filling.insert(record.id, Arc::clone(&chunk));
                index.cached_bytes += record.length;
                tracing::debug!(
                    "Registered chunk {} for {} at {}+{}",
                    record.id,
                    object,
                    record.start,
                    record.length
                );
                let evicted = index.evict_over_budget(self.config.max_cache_bytes);
                (FindOrCreate::Created(chunk), evicted)
            }
        };
        self.delete_blobs(evicted).await;
        result
    }

    /// Removes a record from the index, recency list, and whichever tier
    /// holds its bytes. Used when a fetch job is aborted or fails.
    ///
    /// A record that is no longer indexed is a race already lost; logged,
    /// never fatal.
    pub async fn cancel(&self, record: &ChunkRecord) {
        let removed = {
            let mut index = self.index.lock();
            if index.recency.pop(&record.id).is_none() {
                false
            } else {
                index.remove_record(record);
                index.filling.remove(&record.id);
                index.cached_bytes -= record.length;
                true
            }
        };
        if !removed {
            tracing::debug!("Cancel of chunk {} lost a race, ignoring", record.id);
            return;
        }
        tracing::debug!("Cancelled chunk {} at {}+{}", record.id, record.object, record.start);
        if let Err(err) = self.blobs.remove(record).await {
            tracing::warn!("Failed to delete blob for cancelled chunk {}: {err}", record.id);
        }
    }

    /// Moves a completed chunk's bytes into the persistent tier and drops
    /// the in-memory holder.
    ///
    /// A promotion that finds its record already gone (evicted or
    /// cancelled during the blob write) or not among the filling entries
    /// (double promotion) logs and backs out; it never fails fatally.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the persistent tier rejects the write
    pub async fn promote(&self, chunk: &Chunk) -> Result<(), CacheError> {
        let record = *chunk.record();
        let Some(bytes) = chunk.completed_bytes() else {
            tracing::error!(
                "Promote of incomplete chunk {} ({} of {} bytes)",
                record.id,
                chunk.buffered_len(),
                record.length
            );
            return Err(CacheError::NotFound { id: record.id });
        };

        self.blobs.store(&record, bytes).await?;

        let still_indexed = {
            let mut index = self.index.lock();
            if index.filling.remove(&record.id).is_none() {
                tracing::warn!(
                    "Promote of chunk {} found no in-memory entry, lost a race",
                    record.id
                );
            }
            index.recency.contains(&record.id)
        };
        if !still_indexed {
            // Evicted or cancelled while the blob write was in flight; the
            // fresh blob would be unreachable, so take it back out.
            tracing::warn!("Chunk {} vanished from index during promote", record.id);
            let _ = self.blobs.remove(&record).await;
        }
        Ok(())
    }

    /// Reads a persisted chunk's bytes. `None` means the blob raced away
    /// (eviction or cancellation); callers treat it as a fresh miss.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the persistent tier fails to read
    pub async fn load_persisted(&self, record: &ChunkRecord) -> Result<Option<Bytes>, CacheError> {
        self.blobs.load(record).await
    }

    /// Rebuilds the index from the persistent tier after a restart.
    ///
    /// Restored entries join the recency list in scan order (stable within
    /// a scan); an eviction pass afterwards re-establishes the byte budget
    /// in case the persisted set outgrew it. Returns the number of
    /// restored records.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the persistent tier cannot be enumerated
    pub async fn restore_from_disk(&self) -> Result<usize, CacheError> {
        let records = self.blobs.scan().await?;
        let (restored, evicted) = {
            let mut index = self.index.lock();
            let mut restored = 0;
            for record in records {
                if index.covering_record(record.object, record.start).is_some() {
                    tracing::warn!(
                        "Skipping persisted chunk {} overlapping an indexed range",
                        record.id
                    );
                    continue;
                }
                index.insert_sorted(record);
                index.recency.put(record.id, record);
                index.cached_bytes += record.length;
                restored += 1;
            }
            let evicted = index.evict_over_budget(self.config.max_cache_bytes);
            (restored, evicted)
        };
        self.delete_blobs(evicted).await;
        tracing::info!("Restored {restored} cached chunks from disk");
        Ok(restored)
    }

    /// Current total of `record.length` over all indexed records.
    pub fn cached_bytes(&self) -> u64 {
        self.index.lock().cached_bytes
    }

    /// Number of indexed records.
    pub fn record_count(&self) -> usize {
        self.index.lock().recency.len()
    }

    async fn delete_blobs(&self, records: Vec<ChunkRecord>) {
        for record in records {
            if let Err(err) = self.blobs.remove(&record).await {
                tracing::warn!("Failed to delete evicted blob {}: {err}", record.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_fixtures::MemoryBlobStore;
    use crate::streaming::ClientGuard;

    const OBJECT: ObjectRef = ObjectRef {
        group: 10,
        object: 20,
    };

    fn test_store(max_cache_bytes: u64, chunk_size: u64) -> (ChunkStore, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let config = CacheConfig {
            max_cache_bytes,
            chunk_size,
            ..CacheConfig::default()
        };
        (ChunkStore::new(config, Arc::clone(&blobs) as _), blobs)
    }

    async fn create_at(store: &ChunkStore, pos: u64, object_size: u64) -> Arc<Chunk> {
        let (_guard, handle) = ClientGuard::connected();
        match store.find_or_create(OBJECT, pos, object_size, &handle).await {
            FindOrCreate::Created(chunk) => chunk,
            FindOrCreate::Existing(_) => panic!("expected a fresh chunk at {pos}"),
        }
    }

    #[tokio::test]
    async fn test_lookup_misses_empty_store() {
        let (store, _) = test_store(1000, 100);
        assert!(store.lookup(OBJECT, 0).is_none());
    }

    #[tokio::test]
    async fn test_lookup_coverage_cases() {
        let (store, _) = test_store(10_000, 100);
        create_at(&store, 100, 10_000).await;
        create_at(&store, 300, 10_000).await;

        // Exact start, interior, and last-byte positions hit.
        for pos in [100, 150, 199, 300, 399] {
            assert!(store.lookup(OBJECT, pos).is_some(), "pos {pos} should hit");
        }
        // Before the first range, in the gap, and past the last range miss.
        for pos in [0, 99, 200, 299, 400, 5000] {
            assert!(store.lookup(OBJECT, pos).is_none(), "pos {pos} should miss");
        }
    }

    #[tokio::test]
    async fn test_find_or_create_returns_existing() {
        let (store, _) = test_store(10_000, 100);
        let chunk = create_at(&store, 0, 10_000).await;

        let (_guard, handle) = ClientGuard::connected();
        match store.find_or_create(OBJECT, 50, 10_000, &handle).await {
            FindOrCreate::Existing(Lookup::Filling(existing)) => {
                assert_eq!(existing.record(), chunk.record());
            }
            _ => panic!("second request must observe the first chunk"),
        }
    }

    #[tokio::test]
    async fn test_created_chunk_clips_to_object_size() {
        let (store, _) = test_store(10_000, 100);
        let chunk = create_at(&store, 950, 1000).await;
        assert_eq!(chunk.record().length, 50);
    }

    #[tokio::test]
    async fn test_created_chunk_clips_to_next_record() {
        let (store, _) = test_store(10_000, 100);
        create_at(&store, 200, 10_000).await;

        // An uncovered position just before an indexed range must not
        // produce an overlapping record.
        let chunk = create_at(&store, 170, 10_000).await;
        assert_eq!(chunk.record().start, 170);
        assert_eq!(chunk.record().length, 30);
    }

    #[tokio::test]
    async fn test_eviction_respects_byte_budget() {
        let (store, blobs) = test_store(250, 100);

        // Complete and promote three chunks of 100 bytes each.
        for i in 0..3 {
            let chunk = create_at(&store, i * 100, 10_000).await;
            chunk.append(&[0u8; 100]).unwrap();
            store.promote(&chunk).await.unwrap();
        }
        assert!(store.cached_bytes() <= 250);
        assert_eq!(store.record_count(), 2);

        // The least recently used range (start 0) was evicted from index
        // and blob tier alike.
        assert!(store.lookup(OBJECT, 0).is_none());
        assert!(store.lookup(OBJECT, 100).is_some());
        assert!(store.lookup(OBJECT, 200).is_some());
        assert_eq!(blobs.blob_count(), 2);
    }

    #[tokio::test]
    async fn test_lookup_refreshes_recency() {
        let (store, _) = test_store(250, 100);
        for i in 0..2 {
            let chunk = create_at(&store, i * 100, 10_000).await;
            chunk.append(&[0u8; 100]).unwrap();
            store.promote(&chunk).await.unwrap();
        }

        // Touch the older range, then push the budget: the untouched one
        // must be the victim.
        assert!(store.lookup(OBJECT, 0).is_some());
        let chunk = create_at(&store, 200, 10_000).await;
        chunk.append(&[0u8; 100]).unwrap();
        store.promote(&chunk).await.unwrap();

        assert!(store.lookup(OBJECT, 0).is_some());
        assert!(store.lookup(OBJECT, 100).is_none());
    }

    #[tokio::test]
    async fn test_filling_chunks_survive_budget_pressure() {
        let (store, _) = test_store(150, 100);
        let filling = create_at(&store, 0, 10_000).await;

        // Registering another chunk pushes the total to 200 > 150, but the
        // in-flight chunk must not be evicted.
        let second = create_at(&store, 100, 10_000).await;
        assert!(store.lookup(OBJECT, 0).is_some());
        assert!(store.lookup(OBJECT, 100).is_some());
        assert_eq!(store.cached_bytes(), 200);
        drop((filling, second));
    }

    #[tokio::test]
    async fn test_cancel_removes_record() {
        let (store, _) = test_store(10_000, 100);
        let chunk = create_at(&store, 0, 10_000).await;

        store.cancel(chunk.record()).await;
        assert!(store.lookup(OBJECT, 0).is_none());
        assert_eq!(store.cached_bytes(), 0);

        // Double cancel is a logged no-op.
        store.cancel(chunk.record()).await;
        assert_eq!(store.cached_bytes(), 0);
    }

    #[tokio::test]
    async fn test_promote_moves_bytes_to_blob_tier() {
        let (store, blobs) = test_store(10_000, 4);
        let chunk = create_at(&store, 0, 10_000).await;
        chunk.append(b"abcd").unwrap();

        store.promote(&chunk).await.unwrap();
        assert_eq!(blobs.blob_count(), 1);

        match store.lookup(OBJECT, 2) {
            Some(Lookup::Persisted(record)) => {
                let bytes = store.load_persisted(&record).await.unwrap().unwrap();
                assert_eq!(bytes.as_ref(), b"abcd");
            }
            _ => panic!("promoted chunk must resolve to the persistent tier"),
        }
    }

    #[tokio::test]
    async fn test_promote_incomplete_chunk_fails() {
        let (store, _) = test_store(10_000, 4);
        let chunk = create_at(&store, 0, 10_000).await;
        chunk.append(b"ab").unwrap();
        assert!(store.promote(&chunk).await.is_err());
    }

    #[tokio::test]
    async fn test_promote_after_cancel_removes_blob() {
        let (store, blobs) = test_store(10_000, 4);
        let chunk = create_at(&store, 0, 10_000).await;
        chunk.append(b"abcd").unwrap();

        store.cancel(chunk.record()).await;
        store.promote(&chunk).await.unwrap();

        // The record lost its index entry mid-promote; no orphan blob may
        // survive.
        assert_eq!(blobs.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_from_disk_reproduces_lookups() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let config = CacheConfig {
            max_cache_bytes: 10_000,
            chunk_size: 100,
            ..CacheConfig::default()
        };

        {
            let store = ChunkStore::new(config.clone(), Arc::clone(&blobs) as _);
            let (_guard, handle) = ClientGuard::connected();
            for pos in [0u64, 100, 300] {
                let FindOrCreate::Created(chunk) =
                    store.find_or_create(OBJECT, pos, 10_000, &handle).await
                else {
                    panic!("expected fresh chunk");
                };
                chunk.append(&[1u8; 100]).unwrap();
                store.promote(&chunk).await.unwrap();
            }
        }

        // "Restart": a fresh store over the same persistent tier.
        let store = ChunkStore::new(config, Arc::clone(&blobs) as _);
        assert!(store.lookup(OBJECT, 0).is_none());

        let restored = store.restore_from_disk().await.unwrap();
        assert_eq!(restored, 3);
        for pos in [0, 50, 100, 199, 300, 399] {
            assert!(store.lookup(OBJECT, pos).is_some(), "pos {pos} should hit");
        }
        for pos in [200, 299, 400] {
            assert!(store.lookup(OBJECT, pos).is_none(), "pos {pos} should miss");
        }
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Binary-search coverage lookup agrees with a linear scan over
            /// the registered records, for arbitrary range layouts.
            #[test]
            fn prop_lookup_agrees_with_linear_scan(
                starts in proptest::collection::btree_set(0u64..2_000, 1..8),
                probes in proptest::collection::vec(0u64..2_500, 1..32),
            ) {
                tokio_test::block_on(async move {
                    let (store, _blobs) = test_store(u64::MAX, 64);
                    let (_guard, handle) = ClientGuard::connected();
                    let mut records = Vec::new();
                    for start in starts {
                        if let FindOrCreate::Created(chunk) =
                            store.find_or_create(OBJECT, start, 100_000, &handle).await
                        {
                            records.push(*chunk.record());
                        }
                    }
                    for probe in probes {
                        let hit = store.lookup(OBJECT, probe).is_some();
                        let covered = records.iter().any(|r| r.covers(probe));
                        assert_eq!(hit, covered, "probe at {probe}");
                    }
                });
            }
        }
    }

    #[tokio::test]
    async fn test_restore_evicts_down_to_budget() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let generous = CacheConfig {
            max_cache_bytes: 10_000,
            chunk_size: 100,
            ..CacheConfig::default()
        };
        {
            let store = ChunkStore::new(generous, Arc::clone(&blobs) as _);
            let (_guard, handle) = ClientGuard::connected();
            for pos in [0u64, 100, 200] {
                let FindOrCreate::Created(chunk) =
                    store.find_or_create(OBJECT, pos, 10_000, &handle).await
                else {
                    panic!("expected fresh chunk");
                };
                chunk.append(&[1u8; 100]).unwrap();
                store.promote(&chunk).await.unwrap();
            }
        }

        // Restart with a smaller budget: restore must evict back down.
        let tight = CacheConfig {
            max_cache_bytes: 200,
            chunk_size: 100,
            ..CacheConfig::default()
        };
        let store = ChunkStore::new(tight, Arc::clone(&blobs) as _);
        store.restore_from_disk().await.unwrap();
        assert!(store.cached_bytes() <= 200);
        assert_eq!(blobs.blob_count(), 2);
    }
}
