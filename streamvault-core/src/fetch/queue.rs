//! Bounded FIFO queue of fetch jobs
//!
//! Submission blocks while the queue is full so load cannot build up an
//! unbounded job backlog. A request that terminates withdraws its own
//! not-yet-started jobs; jobs already handed to a worker are left to wind
//! down through requester-liveness instead.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{FetchError, RequestId};
use crate::cache::Chunk;

/// One unit of download work: fill this chunk from the media source.
#[derive(Clone)]
pub struct FetchJob {
    pub chunk: Arc<Chunk>,
}

/// A job waiting in the queue, tagged with the request that submitted it.
pub struct QueuedJob {
    pub request_id: RequestId,
    pub job: FetchJob,
}

struct QueueState {
    jobs: VecDeque<QueuedJob>,
    closed: bool,
}

/// Shared FIFO between streaming requests and the worker pool.
pub struct FetchQueue {
    state: Mutex<QueueState>,
    jobs_available: Notify,
    space_available: Notify,
    capacity: usize,
}

impl FetchQueue {
    /// Creates a queue holding at most `capacity` pending jobs.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "queue capacity must be positive");
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            jobs_available: Notify::new(),
            space_available: Notify::new(),
            capacity,
        }
    }

    /// Enqueues a job, suspending while the queue is full.
    ///
    /// # Errors
    ///
    /// - `FetchError::Shutdown` - If the queue was closed
    pub async fn push(&self, request_id: RequestId, job: FetchJob) -> Result<(), FetchError> {
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(FetchError::Shutdown);
                }
                if state.jobs.len() < self.capacity {
                    state.jobs.push_back(QueuedJob { request_id, job });
                    drop(state);
                    self.jobs_available.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Dequeues the oldest job, suspending while the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.jobs_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(queued) = state.jobs.pop_front() {
                    drop(state);
                    self.space_available.notify_one();
                    return Some(queued);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Withdraws every not-yet-started job submitted by `request_id` and
    /// returns them so the caller can release their chunks.
    pub fn cancel_pending(&self, request_id: RequestId) -> Vec<FetchJob> {
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock();
            let jobs = std::mem::take(&mut state.jobs);
            for queued in jobs {
                if queued.request_id == request_id {
                    removed.push(queued.job);
                } else {
                    state.jobs.push_back(queued);
                }
            }
        }
        for _ in &removed {
            self.space_available.notify_one();
        }
        removed
    }

    /// Closes the queue: pending jobs still drain, new pushes fail, and
    /// idle workers see `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.jobs_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    /// Number of jobs currently waiting.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Whether no jobs are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
