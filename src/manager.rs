//! The composition root: queue, registry, workers and the public API.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hoplon::config::HoplonConfig;
//! use hoplon::job::Priority;
//! use hoplon::manager::IndexManager;
//! use hoplon::pipeline::{Content, MemoryContentFetcher, JSON_MEDIA_TYPE};
//! use hoplon::query::{Query, SearchPaging};
//!
//! # fn main() -> hoplon::error::Result<()> {
//! let fetcher = Arc::new(MemoryContentFetcher::new());
//! fetcher.put(Content::new("doc-1", JSON_MEDIA_TYPE, r#"{"title": "hello"}"#));
//!
//! let manager = IndexManager::in_memory(HoplonConfig::default(), fetcher)?;
//! manager.start()?;
//! manager.submit("doc-1", "books", Priority::High, "me", Default::default())?;
//!
//! let results = manager.query("books", &Query::term("title", "hello"), SearchPaging::default())?;
//! println!("{} hits", results.total_hits);
//! manager.shutdown()?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;

use crate::config::HoplonConfig;
use crate::document::{DeleteRule, Document};
use crate::error::{HoplonError, Result};
use crate::job::{Batch, Job, JobQueue, Priority};
use crate::lifecycle::{ManagedIndex, SearcherLease};
use crate::listener::{IndexListener, LogListener};
use crate::pipeline::{ContentFetcher, Pipeline};
use crate::query::{Query, SearchPaging, SearchResults};
use crate::registry::{EngineFactory, IndexRegistry, MemoryEngineFactory};
use crate::worker::{ErrorLog, Worker};

pub struct IndexManager {
    config: HoplonConfig,
    queue: Arc<JobQueue>,
    registry: Arc<IndexRegistry>,
    errors: Arc<ErrorLog>,
    worker: Worker,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .field("registry", &self.registry)
            .finish()
    }
}

impl IndexManager {
    /// Wire a manager together. Workers start with [`IndexManager::start`].
    pub fn new(
        config: HoplonConfig,
        factory: Arc<dyn EngineFactory>,
        pipeline: Pipeline,
        listener: Arc<dyn IndexListener>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(JobQueue::new());
        let registry = IndexRegistry::new(
            factory,
            config.lifecycle_options(),
            config.max_open_indexes,
        );
        let errors = Arc::new(ErrorLog::new(config.max_errors_per_index));
        let worker = Worker::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::new(pipeline),
            listener,
            Arc::clone(&errors),
            config.worker_config(),
        );

        Ok(IndexManager {
            config,
            queue,
            registry,
            errors,
            worker,
            shut_down: AtomicBool::new(false),
        })
    }

    /// In-memory indexes, JSON content and a logging listener.
    pub fn in_memory(config: HoplonConfig, fetcher: Arc<dyn ContentFetcher>) -> Result<Self> {
        let factory = Arc::new(MemoryEngineFactory::new(config.engine_config()));
        Self::new(config, factory, Pipeline::new(fetcher), Arc::new(LogListener))
    }

    pub fn start(&self) -> Result<()> {
        self.worker.start()
    }

    pub fn config(&self) -> &HoplonConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Finished jobs as they complete.
    pub fn completions(&self) -> Receiver<Arc<Job>> {
        self.worker.completions()
    }

    fn enqueue(&self, job: Job) -> Result<Arc<Job>> {
        let job = Arc::new(job);
        self.queue.submit(Arc::clone(&job))?;
        Ok(job)
    }

    /// Queue the content for (re)indexing. Returns the job to poll.
    pub fn submit(
        &self,
        content_id: &str,
        index: &str,
        priority: Priority,
        requester: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Arc<Job>> {
        self.enqueue(Job::update(content_id, index, requester, priority).with_params(params))
    }

    /// Queue removal of the content's documents.
    pub fn submit_delete(
        &self,
        content_id: &str,
        index: &str,
        priority: Priority,
        requester: &str,
    ) -> Result<Arc<Job>> {
        self.enqueue(Job::delete(content_id, index, requester, priority))
    }

    /// Queue one job per content id. The index is refreshed once the whole
    /// batch has run.
    pub fn submit_batch<S: AsRef<str>>(
        &self,
        content_ids: &[S],
        index: &str,
        priority: Priority,
        requester: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Vec<Arc<Job>>> {
        if content_ids.is_empty() {
            return Ok(Vec::new());
        }
        let batch = Arc::new(Batch::new(
            format!("{index}-{requester}-{}", crate::lifecycle::now_millis()),
            content_ids.len(),
        ));
        content_ids
            .iter()
            .map(|id| {
                self.enqueue(
                    Job::update(id.as_ref(), index, requester, priority)
                        .with_params(params.clone())
                        .with_batch(Arc::clone(&batch)),
                )
            })
            .collect()
    }

    /// Drop every queued job for `index`, then queue a clear.
    pub fn clear(&self, index: &str, requester: &str, priority: Priority) -> Result<Arc<Job>> {
        let dropped = self.queue.clear_jobs_for_index(index);
        if !dropped.is_empty() {
            log::info!("dropped {} queued job(s) for index {index}", dropped.len());
        }
        self.enqueue(Job::clear(index, requester, priority))
    }

    /// Waiting jobs of `requester`.
    pub fn status_by_requester(&self, requester: &str) -> Vec<Arc<Job>> {
        self.queue.list_by_requester(requester)
    }

    /// Waiting jobs of `index`.
    pub fn status_by_index(&self, index: &str) -> Vec<Arc<Job>> {
        self.queue.list_by_index(index)
    }

    pub fn status_all(&self) -> Vec<Arc<Job>> {
        self.queue.all_jobs()
    }

    pub fn errors_by_requester(&self, requester: &str) -> Vec<Arc<Job>> {
        self.errors.for_requester(requester)
    }

    pub fn errors_by_index(&self, index: &str) -> Vec<Arc<Job>> {
        self.errors.for_index(index)
    }

    pub fn count_for_requester(&self, requester: &str) -> usize {
        self.queue.count_for_requester(requester)
    }

    pub fn count_for_index(&self, index: &str) -> usize {
        self.queue.count_for_index(index)
    }

    pub fn has_jobs_for_index(&self, index: &str) -> bool {
        self.queue.has_jobs_for_index(index)
    }

    /// Search `index` with a leased searcher.
    pub fn query(&self, index: &str, query: &Query, paging: SearchPaging) -> Result<SearchResults> {
        self.registry.get_or_open(index)?.search(query, paging)
    }

    /// Search several indexes as one.
    ///
    /// One searcher is booked per index before any of them is searched, so
    /// the result reflects a single moment. Every booked searcher is released
    /// whatever happens. Hits carry the id of their index.
    pub fn query_many<S: AsRef<str>>(
        &self,
        indexes: &[S],
        query: &Query,
        paging: SearchPaging,
    ) -> Result<SearchResults> {
        let mut booked: Vec<(Arc<ManagedIndex>, SearcherLease)> = Vec::with_capacity(indexes.len());
        let mut outcome = Ok(());
        for id in indexes.iter().map(|id| id.as_ref()) {
            if booked.iter().any(|(index, _)| index.id() == id) {
                continue;
            }
            let lease = self
                .registry
                .get_or_open(id)
                .and_then(|index| index.book_searcher().map(|lease| (index, lease)));
            match lease {
                Ok(pair) => booked.push(pair),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        // enough hits from every index to fill the requested page
        let window = SearchPaging::new(1, paging.offset().saturating_add(paging.page_size));
        let parts = outcome.and_then(|()| {
            booked
                .iter()
                .map(|(index, lease)| Ok((index.id().to_string(), lease.search(query, window)?)))
                .collect::<Result<Vec<_>>>()
        });

        let mut released = Ok(());
        for (index, lease) in booked {
            if let Err(e) = index.release_searcher(lease) {
                log::warn!("failed to release searcher of index {}: {e}", index.id());
                released = released.and(Err(e));
            }
        }

        let parts = parts?;
        released?;
        Ok(SearchResults::merge(parts, paging))
    }

    fn write<F>(&self, index: &str, write: F) -> Result<()>
    where
        F: FnOnce(&ManagedIndex) -> Result<bool>,
    {
        let managed = self.registry.get_or_open(index)?;
        if write(&managed)? {
            Ok(())
        } else {
            Err(HoplonError::Closing(index.to_string()))
        }
    }

    /// Apply a write directly, bypassing the queue.
    pub fn update_documents(
        &self,
        index: &str,
        rule: Option<&DeleteRule>,
        docs: Vec<Document>,
    ) -> Result<()> {
        self.write(index, |managed| managed.update_documents(rule, docs))
    }

    pub fn delete_documents(&self, index: &str, rule: &DeleteRule) -> Result<()> {
        self.write(index, |managed| managed.delete_documents(rule))
    }

    pub fn clear_index(&self, index: &str) -> Result<()> {
        self.write(index, |managed| managed.clear_index())
    }

    /// Commit `index` now. Returns whether anything was committed.
    pub fn commit(&self, index: &str) -> Result<bool> {
        self.registry.get_or_open(index)?.commit()
    }

    /// Millis of the last use of `index`, open or not.
    pub fn last_used(&self, index: &str) -> Result<Option<u64>> {
        self.registry.last_used(index)
    }

    /// Empty the queue, stop the workers, then stop every open index.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let dropped = self.queue.clear();
        if !dropped.is_empty() {
            log::warn!("shutdown dropped {} queued job(s)", dropped.len());
        }
        self.queue.close();

        let workers = self.worker.stop();
        let indexes = self.registry.stop_all();
        log::info!("index manager shut down");
        workers.and(indexes)
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Term;
    use crate::pipeline::{Content, JSON_MEDIA_TYPE, MemoryContentFetcher};
    use std::time::Duration;

    fn manager(fetcher: Arc<MemoryContentFetcher>) -> IndexManager {
        let config = HoplonConfig {
            poll_interval_ms: 20,
            wait_interval_ms: 10,
            ..HoplonConfig::default()
        };
        IndexManager::in_memory(config, fetcher).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = HoplonConfig {
            max_open_indexes: 0,
            ..HoplonConfig::default()
        };
        assert!(IndexManager::in_memory(config, Arc::new(MemoryContentFetcher::new())).is_err());
    }

    #[test]
    fn test_status_lists_waiting_jobs() {
        let manager = manager(Arc::new(MemoryContentFetcher::new()));
        manager
            .submit("a", "idx", Priority::Low, "alice", BTreeMap::new())
            .unwrap();
        manager
            .submit("b", "other", Priority::Low, "bob", BTreeMap::new())
            .unwrap();

        assert_eq!(manager.status_by_requester("alice").len(), 1);
        assert_eq!(manager.status_by_index("other").len(), 1);
        assert_eq!(manager.status_all().len(), 2);
        assert!(manager.has_jobs_for_index("idx"));

        let clear = manager.clear("idx", "alice", Priority::High).unwrap();
        let waiting = manager.status_by_index("idx");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id(), clear.id());
    }

    #[test]
    fn test_submit_and_query() {
        let fetcher = Arc::new(MemoryContentFetcher::new());
        fetcher.put(Content::new("d1", JSON_MEDIA_TYPE, r#"{"title": "rust"}"#));
        let manager = manager(fetcher);
        let completions = manager.completions();
        manager.start().unwrap();

        let job = manager
            .submit("d1", "idx", Priority::High, "me", BTreeMap::new())
            .unwrap();
        let done = completions.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(done.id(), job.id());
        assert!(job.is_success());

        let results = manager
            .query("idx", &Query::term("title", "rust"), SearchPaging::default())
            .unwrap();
        assert_eq!(results.total_hits, 1);
        manager.shutdown().unwrap();
    }

    #[test]
    fn test_direct_writes_surface_errors() {
        let manager = manager(Arc::new(MemoryContentFetcher::new()));
        let doc = Document::builder().add_field("id", "1").build();
        manager.update_documents("idx", None, vec![doc]).unwrap();
        assert!(manager.commit("idx").unwrap());

        let rule = DeleteRule::Term(Term::new("id", "1"));
        manager.delete_documents("idx", &rule).unwrap();
        manager.commit("idx").unwrap();
        let results = manager
            .query("idx", &Query::All, SearchPaging::default())
            .unwrap();
        assert_eq!(results.total_hits, 0);
    }

    #[test]
    fn test_query_many_merges_indexes() {
        let manager = manager(Arc::new(MemoryContentFetcher::new()));
        for (index, ids) in [("a", vec!["1", "2"]), ("b", vec!["3"])] {
            let docs = ids
                .into_iter()
                .map(|id| Document::builder().add_field("id", id).build())
                .collect();
            manager.update_documents(index, None, docs).unwrap();
            manager.commit(index).unwrap();
        }

        let results = manager
            .query_many(&["a", "b", "a"], &Query::All, SearchPaging::default())
            .unwrap();
        assert_eq!(results.total_hits, 3);
        let from_b: Vec<_> = results
            .hits
            .iter()
            .filter(|hit| hit.index.as_deref() == Some("b"))
            .collect();
        assert_eq!(from_b.len(), 1);

        let page = manager
            .query_many(&["a", "b"], &Query::All, SearchPaging::new(2, 2))
            .unwrap();
        assert_eq!(page.hits.len(), 1);

        let none: [&str; 0] = [];
        assert_eq!(
            manager
                .query_many(&none, &Query::All, SearchPaging::default())
                .unwrap()
                .total_hits,
            0
        );
    }

    #[test]
    fn test_query_many_survives_eviction_while_booking() {
        let config = HoplonConfig {
            max_open_indexes: 1,
            wait_interval_ms: 10,
            ..HoplonConfig::default()
        };
        let manager = IndexManager::in_memory(config, Arc::new(MemoryContentFetcher::new())).unwrap();
        for index in ["a", "b"] {
            let doc = Document::builder().add_field("id", index).build();
            manager.update_documents(index, None, vec![doc]).unwrap();
            manager.commit(index).unwrap();
        }

        // booking b evicts a while a's searcher is still held
        let results = manager
            .query_many(&["a", "b"], &Query::All, SearchPaging::default())
            .unwrap();
        assert_eq!(results.total_hits, 2);
        assert_eq!(manager.registry().open_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let manager = manager(Arc::new(MemoryContentFetcher::new()));
        manager.shutdown().unwrap();
        manager.shutdown().unwrap();
        assert!(
            manager
                .submit("a", "idx", Priority::Low, "me", BTreeMap::new())
                .is_err()
        );
    }
}
