//! Priority queue of pending jobs.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{HoplonError, Result};
use crate::job::{Job, Priority};

struct Queued(Arc<Job>);

impl Queued {
    fn key(&self) -> Reverse<(Priority, u64)> {
        Reverse((self.0.priority(), self.0.sequence()))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

struct QueueState {
    heap: BinaryHeap<Queued>,
    closed: bool,
}

/// Blocking priority queue: `High` before `Low`, then arrival order.
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("len", &self.len()).finish()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        JobQueue {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue a job. Fails once the queue is closed.
    pub fn submit(&self, job: Arc<Job>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HoplonError::closed("job queue is closed"));
        }
        log::trace!("queued {job}");
        state.heap.push(Queued(job));
        self.available.notify_one();
        Ok(())
    }

    /// Pop the next job, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout or once the queue is closed and empty.
    pub fn next_job(&self, timeout: Duration) -> Option<Arc<Job>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(Queued(job)) = state.heap.pop() {
                return Some(job);
            }
            if state.closed {
                return None;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return state.heap.pop().map(|Queued(job)| job);
            }
        }
    }

    fn collect<F>(&self, filter: F) -> Vec<Arc<Job>>
    where
        F: Fn(&Job) -> bool,
    {
        let state = self.state.lock();
        let mut jobs: Vec<&Queued> = state.heap.iter().filter(|q| filter(&q.0)).collect();
        jobs.sort_by(|a, b| b.cmp(a));
        jobs.into_iter().map(|q| Arc::clone(&q.0)).collect()
    }

    /// Waiting jobs for `requester`, in processing order.
    pub fn list_by_requester(&self, requester: &str) -> Vec<Arc<Job>> {
        self.collect(|job| job.requester() == requester)
    }

    /// Waiting jobs for `index`, in processing order.
    pub fn list_by_index(&self, index: &str) -> Vec<Arc<Job>> {
        self.collect(|job| job.index() == index)
    }

    /// Every waiting job, in processing order.
    pub fn all_jobs(&self) -> Vec<Arc<Job>> {
        self.collect(|_| true)
    }

    pub fn count_for_requester(&self, requester: &str) -> usize {
        self.state
            .lock()
            .heap
            .iter()
            .filter(|q| q.0.requester() == requester)
            .count()
    }

    pub fn count_for_index(&self, index: &str) -> usize {
        self.state
            .lock()
            .heap
            .iter()
            .filter(|q| q.0.index() == index)
            .count()
    }

    pub fn has_jobs_for_index(&self, index: &str) -> bool {
        self.state.lock().heap.iter().any(|q| q.0.index() == index)
    }

    /// Drop every waiting job for `index`. Returns the removed jobs.
    pub fn clear_jobs_for_index(&self, index: &str) -> Vec<Arc<Job>> {
        let mut state = self.state.lock();
        let (removed, kept): (Vec<Queued>, Vec<Queued>) = std::mem::take(&mut state.heap)
            .into_iter()
            .partition(|q| q.0.index() == index);
        state.heap = kept.into_iter().collect();
        removed.into_iter().map(|Queued(job)| job).collect()
    }

    /// Drop every waiting job. Returns the removed jobs.
    pub fn clear(&self) -> Vec<Arc<Job>> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.heap)
            .into_iter()
            .map(|Queued(job)| job)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// Reject new jobs and wake every waiting consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
