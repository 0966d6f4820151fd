//! Background workers that drain the job queue.
//!
//! Each worker thread loops on [`JobQueue::next_job`]. A job is resolved
//! through the content [`Pipeline`] and applied to its [`ManagedIndex`];
//! failures are recorded on the job and in the [`ErrorLog`], never raised.
//! When a poll times out the worker runs maintenance over the open indexes:
//! refresh, commit, compaction of long-idle indexes and the open cap.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;

use crate::error::{HoplonError, Result};
use crate::job::{Job, JobKind, JobQueue};
use crate::lifecycle::{ManagedIndex, now_millis};
use crate::listener::IndexListener;
use crate::pipeline::{Content, Pipeline};
use crate::registry::IndexRegistry;

/// Attempts at a write that keeps landing on a closing index.
const WRITE_ATTEMPTS: usize = 3;

/// Capacity of the completion channel.
const COMPLETIONS_CAPACITY: usize = 1024;

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Bounded wait for the next job.
    pub poll_interval: Duration,
    /// Idle time after which an index is compacted.
    pub compact_after: Duration,
    /// Failed jobs remembered per index.
    pub max_errors_per_index: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            threads: 1,
            poll_interval: Duration::from_secs(1),
            compact_after: Duration::from_secs(30 * 60),
            max_errors_per_index: 100,
        }
    }
}

/// Failed jobs per index, oldest dropped first.
#[derive(Debug)]
pub struct ErrorLog {
    max_per_index: usize,
    by_index: Mutex<AHashMap<String, VecDeque<Arc<Job>>>>,
}

impl ErrorLog {
    pub fn new(max_per_index: usize) -> Self {
        ErrorLog {
            max_per_index: max_per_index.max(1),
            by_index: Mutex::new(AHashMap::new()),
        }
    }

    pub fn record(&self, job: Arc<Job>) {
        let mut by_index = self.by_index.lock();
        let errors = by_index.entry(job.index().to_string()).or_default();
        if errors.len() == self.max_per_index {
            errors.pop_front();
        }
        errors.push_back(job);
    }

    pub fn for_index(&self, index: &str) -> Vec<Arc<Job>> {
        self.by_index
            .lock()
            .get(index)
            .map(|errors| errors.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn for_requester(&self, requester: &str) -> Vec<Arc<Job>> {
        let by_index = self.by_index.lock();
        let mut jobs: Vec<Arc<Job>> = by_index
            .values()
            .flatten()
            .filter(|job| job.requester() == requester)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.sequence());
        jobs
    }

    pub fn clear_index(&self, index: &str) {
        self.by_index.lock().remove(index);
    }
}

struct WorkerContext {
    queue: Arc<JobQueue>,
    registry: Arc<IndexRegistry>,
    pipeline: Arc<Pipeline>,
    listener: Arc<dyn IndexListener>,
    errors: Arc<ErrorLog>,
    config: WorkerConfig,
    completions: Sender<Arc<Job>>,
    /// `last_used` of each index when it was last compacted.
    compacted: Mutex<AHashMap<String, u64>>,
}

impl WorkerContext {
    fn process(&self, job: &Arc<Job>) {
        if let Some(batch) = job.batch() {
            if batch.mark_started() {
                self.listener.start_batch(batch);
            }
        }
        self.listener.start_job(job);

        match self.execute(job) {
            Ok(()) => job.succeed(),
            Err(e) => {
                let message = e.to_string();
                job.fail(message.as_str());
                self.listener.error(job, &message);
                self.errors.record(Arc::clone(job));
            }
        }
        self.listener.end_job(job);

        let batch_done = job.batch().map(|batch| batch.complete_one());
        self.after_job(job, batch_done);

        if let Err(TrySendError::Full(_)) = self.completions.try_send(Arc::clone(job)) {
            log::trace!("completion channel full; dropped notice for {job}");
        }
    }

    fn execute(&self, job: &Job) -> Result<()> {
        let index = self.registry.get_or_open(job.index())?;
        match job.kind() {
            JobKind::Clear => self.apply(&index, || index.clear_index()),
            JobKind::Delete => {
                let id = job
                    .content_id()
                    .ok_or_else(|| HoplonError::invalid_argument(format!("{job} has no content id")))?;
                let rule = Content::deleted(id).delete_rule();
                self.apply(&index, || index.delete_documents(&rule))
            }
            JobKind::Update => {
                let content = self.pipeline.fetch(job)?;
                let rule = content.delete_rule();
                if content.deleted {
                    return self.apply(&index, || index.delete_documents(&rule));
                }
                let docs = self.pipeline.content_to_documents(&content, job.params())?;
                if docs.is_empty() {
                    self.listener.warn(job, "content produced no documents");
                }
                self.apply(&index, || index.update_documents(Some(&rule), docs.clone()))
            }
        }
    }

    /// Run a write, reopening and retrying if it lands on a closing index.
    fn apply<F>(&self, index: &ManagedIndex, mut write: F) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
    {
        for _ in 0..WRITE_ATTEMPTS {
            if write()? {
                return Ok(());
            }
            index.open()?;
        }
        Err(HoplonError::Closing(index.id().to_string()))
    }

    fn after_job(&self, job: &Job, batch_done: Option<bool>) {
        if let Some(index) = self.registry.get(job.index()) {
            let refresh = match batch_done {
                Some(done) => done,
                None => job.is_success(),
            };
            if refresh {
                if let Err(e) = index.maybe_refresh() {
                    self.listener.warn(job, &format!("refresh failed: {e}"));
                }
            }
            if !self.queue.has_jobs_for_index(job.index()) {
                if let Err(e) = index.maybe_commit() {
                    self.listener.warn(job, &format!("commit failed: {e}"));
                }
            }
        }

        if let (Some(batch), Some(true)) = (job.batch(), batch_done) {
            self.listener.end_batch(batch);
        }
        self.registry.enforce_cap();
    }

    fn maintain(&self) {
        self.registry.enforce_cap();

        let compact_after = self.config.compact_after.as_millis() as u64;
        for index in self.registry.open_indexes() {
            if !self.queue.is_empty() {
                // real work arrived
                return;
            }
            if let Err(e) = index.maybe_refresh() {
                log::warn!("refresh of index {} failed: {e}", index.id());
            }
            if let Err(e) = index.maybe_commit() {
                log::warn!("commit of index {} failed: {e}", index.id());
            }

            let last_used = index.last_used();
            let idle = now_millis().saturating_sub(last_used) >= compact_after;
            let already = self.compacted.lock().get(index.id()) == Some(&last_used);
            if idle && !already {
                match index.compact() {
                    Ok(_) => {
                        self.compacted
                            .lock()
                            .insert(index.id().to_string(), index.last_used());
                    }
                    Err(e) => log::warn!("compaction of index {} failed: {e}", index.id()),
                }
            }
        }
    }

    fn run(&self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            match self.queue.next_job(self.config.poll_interval) {
                Some(job) => self.process(&job),
                None if self.queue.is_closed() => break,
                None => {
                    if running.load(Ordering::Acquire) {
                        self.maintain();
                    }
                }
            }
        }
    }
}

/// A pool of worker threads over one queue.
pub struct Worker {
    context: Arc<WorkerContext>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    completed: Receiver<Arc<Job>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.context.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Worker {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: Arc<IndexRegistry>,
        pipeline: Arc<Pipeline>,
        listener: Arc<dyn IndexListener>,
        errors: Arc<ErrorLog>,
        config: WorkerConfig,
    ) -> Self {
        let (completions, completed) = bounded(COMPLETIONS_CAPACITY);
        Worker {
            context: Arc::new(WorkerContext {
                queue,
                registry,
                pipeline,
                listener,
                errors,
                config,
                completions,
                compacted: Mutex::new(AHashMap::new()),
            }),
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
            completed,
        }
    }

    /// Spawn the worker threads.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(HoplonError::invalid_operation("worker already running"));
        }

        let mut handles = self.handles.lock();
        for worker_id in 0..self.context.config.threads.max(1) {
            let context = Arc::clone(&self.context);
            let running = Arc::clone(&self.running);
            let spawned = thread::Builder::new()
                .name(format!("hoplon-worker-{worker_id}"))
                .spawn(move || context.run(&running));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.running.store(false, Ordering::Release);
                    return Err(e.into());
                }
            }
        }
        log::info!("started {} worker thread(s)", handles.len());
        Ok(())
    }

    /// Stop the threads after their current job and wait for them.
    pub fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let mut handles = self.handles.lock();
        let mut panicked = 0;
        while let Some(handle) = handles.pop() {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(HoplonError::other(format!("{panicked} worker thread(s) panicked")));
        }
        log::info!("workers stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Jobs as they finish. Notices are dropped while the channel is full.
    pub fn completions(&self) -> Receiver<Arc<Job>> {
        self.completed.clone()
    }

    /// Run one job on the calling thread.
    pub fn process(&self, job: &Arc<Job>) {
        self.context.process(job);
    }

    /// Run one maintenance pass on the calling thread.
    pub fn maintain(&self) {
        self.context.maintain();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                log::error!("{e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Batch, Priority};
    use crate::lifecycle::LifecycleOptions;
    use crate::listener::NoOpListener;
    use crate::pipeline::{JSON_MEDIA_TYPE, MemoryContentFetcher};
    use crate::query::{Query, SearchPaging};
    use crate::registry::MemoryEngineFactory;

    struct Fixture {
        fetcher: Arc<MemoryContentFetcher>,
        queue: Arc<JobQueue>,
        registry: Arc<IndexRegistry>,
        errors: Arc<ErrorLog>,
        worker: Worker,
    }

    fn fixture(config: WorkerConfig) -> Fixture {
        let fetcher = Arc::new(MemoryContentFetcher::new());
        let queue = Arc::new(JobQueue::new());
        let registry = IndexRegistry::new(
            Arc::new(MemoryEngineFactory::default()),
            LifecycleOptions {
                wait_interval: Duration::from_millis(10),
            },
            10,
        );
        let errors = Arc::new(ErrorLog::new(config.max_errors_per_index));
        let worker = Worker::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::new(Pipeline::new(fetcher.clone())),
            Arc::new(NoOpListener),
            Arc::clone(&errors),
            config,
        );
        Fixture {
            fetcher,
            queue,
            registry,
            errors,
            worker,
        }
    }

    fn count(registry: &IndexRegistry, index: &str) -> u64 {
        registry
            .get_or_open(index)
            .unwrap()
            .search(&Query::All, SearchPaging::default())
            .unwrap()
            .total_hits
    }

    #[test]
    fn test_update_replaces_documents_of_same_content() {
        let f = fixture(WorkerConfig::default());
        f.fetcher
            .put(Content::new("c1", JSON_MEDIA_TYPE, r#"[{"v": "1"}, {"v": "2"}]"#));

        let job = Arc::new(Job::update("c1", "idx", "tester", Priority::Low));
        f.worker.process(&job);
        assert!(job.is_success(), "{:?}", job.error());
        assert_eq!(count(&f.registry, "idx"), 2);

        f.fetcher.put(Content::new("c1", JSON_MEDIA_TYPE, r#"{"v": "3"}"#));
        let job = Arc::new(Job::update("c1", "idx", "tester", Priority::Low));
        f.worker.process(&job);
        assert_eq!(count(&f.registry, "idx"), 1);

        f.fetcher.remove("c1");
        let job = Arc::new(Job::update("c1", "idx", "tester", Priority::Low));
        f.worker.process(&job);
        assert!(job.is_success());
        assert_eq!(count(&f.registry, "idx"), 0);
    }

    #[test]
    fn test_failures_are_recorded_not_raised() {
        let f = fixture(WorkerConfig::default());
        f.fetcher.put(Content::new("bad", JSON_MEDIA_TYPE, "not json"));

        let job = Arc::new(Job::update("bad", "idx", "tester", Priority::High));
        f.worker.process(&job);
        assert!(job.is_finished());
        assert!(!job.is_success());
        assert!(job.error().unwrap().contains("Build"));
        assert_eq!(f.errors.for_index("idx").len(), 1);
        assert_eq!(f.errors.for_requester("tester").len(), 1);
    }

    #[test]
    fn test_error_log_is_bounded() {
        let log = ErrorLog::new(2);
        for i in 0..3 {
            log.record(Arc::new(Job::update(&i.to_string(), "idx", "r", Priority::Low)));
        }
        let kept: Vec<_> = log
            .for_index("idx")
            .iter()
            .map(|j| j.content_id().unwrap().to_string())
            .collect();
        assert_eq!(kept, vec!["1", "2"]);
    }

    #[test]
    fn test_batch_refreshes_once_complete() {
        let f = fixture(WorkerConfig::default());
        for id in ["a", "b"] {
            f.fetcher.put(Content::new(id, JSON_MEDIA_TYPE, r#"{"x": "1"}"#));
        }
        let batch = Arc::new(Batch::new("batch", 2));
        let first = Arc::new(Job::update("a", "idx", "r", Priority::Low).with_batch(batch.clone()));
        let second = Arc::new(Job::update("b", "idx", "r", Priority::Low).with_batch(batch.clone()));
        f.queue.submit(Arc::clone(&second)).unwrap();

        // more work queued for the index, mid-batch: neither refresh nor commit
        f.worker.process(&first);
        let index = f.registry.get("idx").unwrap();
        assert_eq!(index.state(), crate::lifecycle::IndexState::Dirty);

        let next = f.queue.next_job(Duration::from_millis(10)).unwrap();
        f.worker.process(&next);
        assert!(batch.is_finished());
        assert_eq!(count(&f.registry, "idx"), 2);
    }

    #[test]
    fn test_threads_drain_queue_and_report_completions() {
        let f = fixture(WorkerConfig {
            poll_interval: Duration::from_millis(20),
            ..WorkerConfig::default()
        });
        f.fetcher.put(Content::new("c", JSON_MEDIA_TYPE, r#"{"x": "1"}"#));
        let completions = f.worker.completions();

        f.worker.start().unwrap();
        assert!(f.worker.start().is_err());
        f.queue
            .submit(Arc::new(Job::update("c", "idx", "r", Priority::Low)))
            .unwrap();

        let done = completions.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(done.is_success());
        f.worker.stop().unwrap();
        assert!(!f.worker.is_running());
        assert_eq!(count(&f.registry, "idx"), 1);
    }

    #[test]
    fn test_maintenance_commits_dirty_indexes() {
        let f = fixture(WorkerConfig::default());
        let index = f.registry.get_or_open("idx").unwrap();
        index
            .update_documents(None, vec![crate::document::Document::builder().add_field("a", "b").build()])
            .unwrap();

        f.worker.maintain();
        assert_eq!(index.state(), crate::lifecycle::IndexState::Clean);
        let commits = index.engine().list_commits().unwrap();
        assert_eq!(commits.last().unwrap().doc_count, 1);
    }

    fn write_segment(index: &ManagedIndex, value: &str) {
        let doc = crate::document::Document::builder().add_field("v", value).build();
        index.update_documents(None, vec![doc]).unwrap();
        index.commit().unwrap();
    }

    fn segment_files(index: &ManagedIndex) -> usize {
        index
            .engine()
            .storage()
            .list_files()
            .unwrap()
            .iter()
            .filter(|name| name.starts_with("seg_"))
            .count()
    }

    fn last_generation(index: &ManagedIndex) -> u64 {
        index.engine().list_commits().unwrap().last().unwrap().generation
    }

    #[test]
    fn test_maintenance_yields_to_queued_jobs() {
        let f = fixture(WorkerConfig::default());
        let indexes: Vec<_> = ["a", "b"]
            .iter()
            .map(|id| {
                let index = f.registry.get_or_open(id).unwrap();
                let doc = crate::document::Document::builder().add_field("id", *id).build();
                index.update_documents(None, vec![doc]).unwrap();
                index
            })
            .collect();
        f.queue
            .submit(Arc::new(Job::update("c", "other", "r", Priority::Low)))
            .unwrap();

        f.worker.maintain();
        for index in &indexes {
            assert_eq!(index.state(), crate::lifecycle::IndexState::Dirty, "{}", index.id());
        }

        f.queue.next_job(Duration::from_millis(10)).unwrap();
        f.worker.maintain();
        for index in &indexes {
            assert_eq!(index.state(), crate::lifecycle::IndexState::Clean, "{}", index.id());
        }
    }

    #[test]
    fn test_compaction_waits_for_idle_threshold() {
        let f = fixture(WorkerConfig {
            compact_after: Duration::from_secs(60 * 60),
            ..WorkerConfig::default()
        });
        let index = f.registry.get_or_open("idx").unwrap();
        for value in ["1", "2", "3"] {
            write_segment(&index, value);
        }
        assert_eq!(segment_files(&index), 3);

        f.worker.maintain();
        assert_eq!(segment_files(&index), 3);
    }

    #[test]
    fn test_compaction_runs_once_per_idle_period() {
        let f = fixture(WorkerConfig {
            compact_after: Duration::ZERO,
            ..WorkerConfig::default()
        });
        let index = f.registry.get_or_open("idx").unwrap();
        for value in ["1", "2", "3"] {
            write_segment(&index, value);
        }

        // already compacted since the last use
        f.worker
            .context
            .compacted
            .lock()
            .insert("idx".to_string(), index.last_used());
        f.worker.maintain();
        assert_eq!(segment_files(&index), 3);

        // a new use starts a new idle period
        thread::sleep(Duration::from_millis(5));
        write_segment(&index, "4");
        f.worker.maintain();
        assert_eq!(segment_files(&index), 1);
        let generation = last_generation(&index);
        assert_eq!(
            f.worker.context.compacted.lock().get("idx"),
            Some(&index.last_used())
        );

        f.worker.maintain();
        assert_eq!(last_generation(&index), generation);
        assert_eq!(count(&f.registry, "idx"), 4);
    }
}
