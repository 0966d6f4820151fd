//! Units of asynchronous indexing work.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::lifecycle::now_millis;

pub mod queue;

pub use queue::JobQueue;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Job priority. `High` sorts before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => f.write_str("HIGH"),
            Priority::Low => f.write_str("LOW"),
        }
    }
}

/// What a job does to its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Fetch the content and add, replace or delete its documents.
    Update,
    /// Delete the documents of the content.
    Delete,
    /// Remove every document from the index.
    Clear,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Update => f.write_str("UPDATE"),
            JobKind::Delete => f.write_str("DELETE"),
            JobKind::Clear => f.write_str("CLEAR"),
        }
    }
}

/// A group of jobs submitted together.
#[derive(Debug)]
pub struct Batch {
    id: String,
    total: usize,
    completed: AtomicUsize,
    started: AtomicBool,
}

impl Batch {
    pub fn new<S: Into<String>>(id: S, total: usize) -> Self {
        Batch {
            id: id.into(),
            total,
            completed: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.completed() >= self.total
    }

    /// Returns true for the first caller only.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// Count one job done. Returns true when this was the last one.
    pub(crate) fn complete_one(&self) -> bool {
        self.completed.fetch_add(1, Ordering::AcqRel) + 1 == self.total
    }
}

/// One unit of indexing work against one index.
///
/// A job is shared between the queue, the worker and whoever polls its
/// status; its outcome is written once by the worker.
#[derive(Debug)]
pub struct Job {
    id: String,
    kind: JobKind,
    content_id: Option<String>,
    index: String,
    requester: String,
    priority: Priority,
    params: BTreeMap<String, String>,
    created: u64,
    sequence: u64,
    batch: Option<Arc<Batch>>,
    finished: AtomicBool,
    success: AtomicBool,
    error: Mutex<Option<String>>,
}

impl Job {
    fn build(
        kind: JobKind,
        content_id: Option<String>,
        index: &str,
        requester: &str,
        priority: Priority,
    ) -> Self {
        let created = now_millis();
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::AcqRel);
        let id = format!(
            "{created}-{}-{kind}-{index}-{requester}-{priority}-{sequence}",
            content_id.as_deref().unwrap_or("")
        );
        Job {
            id,
            kind,
            content_id,
            index: index.to_string(),
            requester: requester.to_string(),
            priority,
            params: BTreeMap::new(),
            created,
            sequence,
            batch: None,
            finished: AtomicBool::new(false),
            success: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Index (add, replace or delete) one piece of content.
    pub fn update(content_id: &str, index: &str, requester: &str, priority: Priority) -> Self {
        Job::build(
            JobKind::Update,
            Some(content_id.to_string()),
            index,
            requester,
            priority,
        )
    }

    /// Remove the documents of one piece of content.
    pub fn delete(content_id: &str, index: &str, requester: &str, priority: Priority) -> Self {
        Job::build(
            JobKind::Delete,
            Some(content_id.to_string()),
            index,
            requester,
            priority,
        )
    }

    /// Remove every document from `index`.
    pub fn clear(index: &str, requester: &str, priority: Priority) -> Self {
        Job::build(JobKind::Clear, None, index, requester, priority)
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_batch(mut self, batch: Arc<Batch>) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn content_id(&self) -> Option<&str> {
        self.content_id.as_deref()
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn requester(&self) -> &str {
        &self.requester
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Creation time in wall-clock millis.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Arrival order, used to keep the queue stable within a priority.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn batch(&self) -> Option<&Arc<Batch>> {
        self.batch.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_success(&self) -> bool {
        self.success.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub(crate) fn succeed(&self) {
        self.success.store(true, Ordering::Release);
        self.finished.store(true, Ordering::Release);
    }

    pub(crate) fn fail<S: Into<String>>(&self, message: S) {
        *self.error.lock() = Some(message.into());
        self.success.store(false, Ordering::Release);
        self.finished.store(true, Ordering::Release);
    }

    /// Serialisable snapshot for status reports.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id.clone(),
            kind: self.kind,
            content_id: self.content_id.clone(),
            index: self.index.clone(),
            requester: self.requester.clone(),
            priority: self.priority,
            created: self.created,
            finished: self.is_finished(),
            success: self.is_success(),
            error: self.error(),
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} job", self.kind)?;
        if let Some(content_id) = &self.content_id {
            write!(f, " for {content_id}")?;
        }
        write!(f, " on {} ({})", self.index, self.priority)
    }
}

/// Point-in-time view of a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub kind: JobKind,
    pub content_id: Option<String>,
    pub index: String,
    pub requester: String,
    pub priority: Priority,
    pub created: u64,
    pub finished: bool,
    pub success: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::High < Priority::Low);
    }

    #[test]
    fn test_job_identity_and_outcome() {
        let job = Job::update("doc-1", "books", "tester", Priority::Low);
        assert!(job.id().contains("doc-1"));
        assert!(job.id().contains("books"));
        assert!(job.id().contains("tester"));
        assert!(!job.is_finished());

        job.fail("fetch failed");
        assert!(job.is_finished());
        assert!(!job.is_success());
        assert_eq!(job.error().as_deref(), Some("fetch failed"));

        let status = job.status();
        assert_eq!(status.kind, JobKind::Update);
        assert_eq!(status.error.as_deref(), Some("fetch failed"));
    }

    #[test]
    fn test_sequence_is_increasing() {
        let first = Job::clear("a", "r", Priority::High);
        let second = Job::clear("a", "r", Priority::High);
        assert!(first.sequence() < second.sequence());
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_batch_completion() {
        let batch = Batch::new("b", 2);
        assert!(batch.mark_started());
        assert!(!batch.mark_started());
        assert!(!batch.complete_one());
        assert!(batch.complete_one());
        assert!(batch.is_finished());
    }
}
