//! Chunk identity and in-progress byte buffers
//!
//! A `ChunkRecord` describes one cached byte range of a remote object and is
//! immutable once created. A `Chunk` is the shared mutable holder that a fetch
//! job fills while concurrent readers observe its growth.

use std::fmt;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::Notify;

use super::CacheError;
use crate::streaming::ClientHandle;

/// Address of a remote object: the group it lives in (e.g. a conversation)
/// and its identifier within that group (e.g. a message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub group: i64,
    pub object: i64,
}

impl ObjectRef {
    /// Creates an object reference from group and object identifiers.
    pub fn new(group: i64, object: i64) -> Self {
        Self { group, object }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.object)
    }
}

/// Stable cache key for one chunk, derived from `(group, object, start)`.
///
/// The id is only an identity; range ordering always goes through
/// `ChunkRecord::start` (see `compare_by_start`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId([u8; 20]);

impl ChunkId {
    /// Derives the deterministic id for a chunk starting at `start` within
    /// the given object.
    pub fn derive(object: ObjectRef, start: u64) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(object.group.to_be_bytes());
        hasher.update(object.object.to_be_bytes());
        hasher.update(start.to_be_bytes());
        Self(hasher.finalize().into())
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Immutable metadata for one cached byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub object: ObjectRef,
    pub start: u64,
    pub length: u64,
}

impl ChunkRecord {
    /// Creates a record for the range `[start, start + length)` of `object`.
    pub fn new(object: ObjectRef, start: u64, length: u64) -> Self {
        debug_assert!(length > 0, "chunk length must be positive");
        Self {
            id: ChunkId::derive(object, start),
            object,
            start,
            length,
        }
    }

    /// First byte offset past the end of this range.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Whether `pos` falls inside `[start, start + length)`.
    pub fn covers(&self, pos: u64) -> bool {
        self.start <= pos && pos < self.end()
    }
}

/// Ordering comparator used by the sorted index and its binary search.
///
/// Records sort by `start` alone; `ChunkId` is identity, never ordering.
pub fn compare_by_start(a: &ChunkRecord, b: &ChunkRecord) -> std::cmp::Ordering {
    a.start.cmp(&b.start)
}

struct ChunkState {
    buffer: BytesMut,
    requesters: Vec<ClientHandle>,
    aborted: bool,
}

/// Mutable holder for one record's bytes while a fetch job fills it.
///
/// The owning fetch job is the sole writer; readers copy slices out and
/// suspend on `wait_for_growth` until the buffer passes their position.
/// Once the chunk is promoted to the persistent tier the in-memory holder
/// is dropped from the store, but readers still holding a handle keep
/// reading the completed buffer.
pub struct Chunk {
    record: ChunkRecord,
    state: Mutex<ChunkState>,
    growth: Notify,
}

impl Chunk {
    /// Creates an empty chunk for `record`.
    pub fn new(record: ChunkRecord) -> Self {
        Self {
            record,
            state: Mutex::new(ChunkState {
                buffer: BytesMut::with_capacity(record.length as usize),
                requesters: Vec::new(),
                aborted: false,
            }),
            growth: Notify::new(),
        }
    }

    /// The immutable record this chunk fills.
    pub fn record(&self) -> &ChunkRecord {
        &self.record
    }

    /// Bytes buffered so far.
    pub fn buffered_len(&self) -> u64 {
        self.state.lock().buffer.len() as u64
    }

    /// Whether the buffer has reached the record's target length.
    pub fn is_complete(&self) -> bool {
        self.buffered_len() >= self.record.length
    }

    /// Whether the owning fetch job gave up on this chunk.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Appends fetched bytes and wakes every waiting reader.
    ///
    /// # Errors
    ///
    /// - `CacheError::Overflow` - If the append would push the buffer past
    ///   the record's target length. The buffer is left untouched but
    ///   waiters are still woken so they can observe the abort that follows.
    pub fn append(&self, sub_chunk: &[u8]) -> Result<(), CacheError> {
        let result = {
            let mut state = self.state.lock();
            let buffered = state.buffer.len() as u64;
            if buffered + sub_chunk.len() as u64 > self.record.length {
                Err(CacheError::Overflow {
                    id: self.record.id,
                    buffered,
                    appended: sub_chunk.len() as u64,
                    target: self.record.length,
                })
            } else {
                state.buffer.extend_from_slice(sub_chunk);
                Ok(())
            }
        };
        self.growth.notify_waiters();
        result
    }

    /// Marks the chunk as abandoned by its fetch job and wakes all readers.
    ///
    /// Woken readers observe no new data plus the abort flag, re-run their
    /// lookup, and see the record's disappearance as a fresh cache miss.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            state.aborted = true;
            state.requesters.clear();
        }
        self.growth.notify_waiters();
    }

    /// Suspends until the buffer grows past `seen_len`, completes, or the
    /// chunk is aborted.
    ///
    /// Wakeup registration happens before the state re-check, so an append
    /// racing this call is never missed; calling on an already-complete or
    /// already-grown chunk returns immediately.
    pub async fn wait_for_growth(&self, seen_len: u64) {
        let notified = self.growth.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let state = self.state.lock();
            let buffered = state.buffer.len() as u64;
            if buffered > seen_len || buffered >= self.record.length || state.aborted {
                return;
            }
        }
        notified.await;
    }

    /// Copies out up to `max` buffered bytes beginning at `offset` within
    /// the chunk, or `None` if the buffer has not reached `offset` yet.
    pub fn copy_range(&self, offset: u64, max: u64) -> Option<Bytes> {
        let state = self.state.lock();
        let buffered = state.buffer.len() as u64;
        if offset >= buffered {
            return None;
        }
        let take = (buffered - offset).min(max) as usize;
        let offset = offset as usize;
        Some(Bytes::copy_from_slice(&state.buffer[offset..offset + take]))
    }

    /// Snapshot of the full buffer once complete, for promotion to the
    /// persistent tier.
    pub fn completed_bytes(&self) -> Option<Bytes> {
        let state = self.state.lock();
        if (state.buffer.len() as u64) < self.record.length {
            return None;
        }
        Some(Bytes::copy_from_slice(&state.buffer))
    }

    /// Registers a reader as interested in this chunk's progress.
    pub fn add_requester(&self, handle: ClientHandle) {
        self.state.lock().requesters.push(handle);
    }

    /// Polls each registered requester's liveness, pruning dead ones.
    ///
    /// Returns `false` once no connected requester remains, which tells the
    /// owning fetch job to wind down.
    pub fn has_live_requesters(&self) -> bool {
        let mut state = self.state.lock();
        state.requesters.retain(ClientHandle::is_connected);
        !state.requesters.is_empty()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("record", &self.record)
            .field("buffered", &self.buffered_len())
            .finish()
    }
}
