//! Per-index lifecycle: the state machine that arbitrates writers,
//! committers, readers and searchers of one index.
//!
//! # States
//!
//! - [`IndexState::Clean`]: writer open, readers reflect every change.
//! - [`IndexState::Dirty`]: writer open, changes not yet visible or durable.
//! - [`IndexState::Closing`]: `stop` is draining in-flight work. New writes
//!   and commits are rejected; readers wait for the close to finish.
//! - [`IndexState::Closed`]: writer and lease managers released. Any access
//!   reopens the index transparently.
//!
//! # Arbitration
//!
//! Two counters, `writing` and `committing`, track in-flight operations. A
//! write waits while a commit runs (or is waiting to run); a commit waits
//! until no write is running. Both counters are never positive at the same
//! time. Tickets are released on drop, so a failed or panicking operation
//! cannot leave the index blocked.
//!
//! Waits use a condition variable in bounded slices and always re-check the
//! state, so a missed wake-up costs at most one slice.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::document::{DeleteRule, Document};
use crate::engine::{IndexEngine, IndexReader, IndexWriter, LAST_COMMIT_DATE, OpenMode};
use crate::error::{HoplonError, Result};
use crate::lease::{Leasable, Lease, LeaseFactory, LeaseManager};
use crate::query::{Query, SearchPaging, SearchResults};
use crate::search::IndexSearcher;

/// A lease on a reader generation.
pub type ReaderLease = Lease<Arc<dyn IndexReader>>;

/// A lease on a searcher generation.
pub type SearcherLease = Lease<IndexSearcher>;

static NEXT_ACCESS_TICK: AtomicU64 = AtomicU64::new(1);

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Lifecycle state of a [`ManagedIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IndexState {
    Clean = 0,
    Dirty = 1,
    Closing = 2,
    Closed = 3,
}

impl IndexState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => IndexState::Clean,
            1 => IndexState::Dirty,
            2 => IndexState::Closing,
            _ => IndexState::Closed,
        }
    }

    /// Whether a writer is open in this state.
    pub fn is_open(self) -> bool {
        matches!(self, IndexState::Clean | IndexState::Dirty)
    }
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexState::Clean => "CLEAN",
            IndexState::Dirty => "DIRTY",
            IndexState::Closing => "CLOSING",
            IndexState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Tuning for a [`ManagedIndex`].
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Length of one bounded wait slice.
    pub wait_interval: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        LifecycleOptions {
            wait_interval: Duration::from_millis(100),
        }
    }
}

/// Notified when an index opens or finishes closing.
pub trait LifecycleHook: Send + Sync {
    fn index_opened(&self, id: &str);
    fn index_closed(&self, id: &str);
}

/// Snapshot of the arbitration counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitrationCounters {
    pub writing: usize,
    pub committing: usize,
}

struct Inner {
    state: IndexState,
    writer: Option<Arc<dyn IndexWriter>>,
    readers: Option<Arc<LeaseManager<Arc<dyn IndexReader>>>>,
    searchers: Option<Arc<LeaseManager<IndexSearcher>>>,
    writing: usize,
    committing: usize,
    commit_waiters: usize,
}

struct ReaderSource {
    writer: Arc<dyn IndexWriter>,
}

impl LeaseFactory<Arc<dyn IndexReader>> for ReaderSource {
    fn refresh_if_needed(
        &self,
        current: &Arc<dyn IndexReader>,
    ) -> Result<Option<Arc<dyn IndexReader>>> {
        if self.writer.generation() == current.as_ref().generation() {
            return Ok(None);
        }
        Ok(Some(self.writer.open_reader()?))
    }
}

struct SearcherSource {
    writer: Arc<dyn IndexWriter>,
}

impl LeaseFactory<IndexSearcher> for SearcherSource {
    fn refresh_if_needed(&self, current: &IndexSearcher) -> Result<Option<IndexSearcher>> {
        if self.writer.generation() == current.reader().generation() {
            return Ok(None);
        }
        Ok(Some(IndexSearcher::new(self.writer.open_reader()?)))
    }
}

/// Releases a `writing` slot on drop.
struct WriteTicket<'a> {
    index: &'a ManagedIndex,
    writer: Arc<dyn IndexWriter>,
    applied: bool,
}

impl Drop for WriteTicket<'_> {
    fn drop(&mut self) {
        let mut inner = self.index.inner.lock();
        inner.writing -= 1;
        if self.applied && inner.state == IndexState::Clean {
            self.index.set_state(&mut inner, IndexState::Dirty);
        }
        self.index.changed.notify_all();
    }
}

/// Releases a `committing` slot on drop.
struct CommitTicket<'a> {
    index: &'a ManagedIndex,
    writer: Arc<dyn IndexWriter>,
}

impl Drop for CommitTicket<'_> {
    fn drop(&mut self) {
        let mut inner = self.index.inner.lock();
        inner.committing -= 1;
        self.index.changed.notify_all();
    }
}

/// One index under lifecycle management.
pub struct ManagedIndex {
    id: String,
    engine: Arc<dyn IndexEngine>,
    options: LifecycleOptions,
    inner: Mutex<Inner>,
    changed: Condvar,
    state: AtomicU8,
    last_used: AtomicU64,
    access_tick: AtomicU64,
    opens: AtomicU64,
    hook: Option<Weak<dyn LifecycleHook>>,
}

impl std::fmt::Debug for ManagedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedIndex")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("last_used", &self.last_used())
            .finish()
    }
}

impl ManagedIndex {
    /// Create a closed index over `engine`. It opens on first use.
    pub fn new<S: Into<String>>(
        id: S,
        engine: Arc<dyn IndexEngine>,
        options: LifecycleOptions,
    ) -> Self {
        ManagedIndex {
            id: id.into(),
            engine,
            options,
            inner: Mutex::new(Inner {
                state: IndexState::Closed,
                writer: None,
                readers: None,
                searchers: None,
                writing: 0,
                committing: 0,
                commit_waiters: 0,
            }),
            changed: Condvar::new(),
            state: AtomicU8::new(IndexState::Closed as u8),
            last_used: AtomicU64::new(0),
            access_tick: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            hook: None,
        }
    }

    /// Attach the hook notified on open and close.
    pub fn with_hook(mut self, hook: Weak<dyn LifecycleHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> &Arc<dyn IndexEngine> {
        &self.engine
    }

    /// Current state, read without locking.
    pub fn state(&self) -> IndexState {
        IndexState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Millis of the last access or commit (recovered from the last commit
    /// on open).
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    /// Ordering key for least-recently-used eviction.
    pub fn lru_key(&self) -> (u64, u64) {
        (self.last_used(), self.access_tick.load(Ordering::Acquire))
    }

    /// How many times a writer was opened for this index.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> ArbitrationCounters {
        let inner = self.inner.lock();
        ArbitrationCounters {
            writing: inner.writing,
            committing: inner.committing,
        }
    }

    /// Leases not yet released on the current reader and searcher managers.
    pub fn outstanding_leases(&self) -> usize {
        let inner = self.inner.lock();
        inner.readers.as_ref().map_or(0, |m| m.outstanding())
            + inner.searchers.as_ref().map_or(0, |m| m.outstanding())
    }

    /// Record an access for LRU ordering.
    pub fn touch(&self) {
        self.last_used.fetch_max(now_millis(), Ordering::AcqRel);
        self.access_tick.store(
            NEXT_ACCESS_TICK.fetch_add(1, Ordering::AcqRel),
            Ordering::Release,
        );
    }

    fn set_state(&self, inner: &mut Inner, state: IndexState) {
        if inner.state != state {
            log::trace!("index {}: {} -> {}", self.id, inner.state, state);
        }
        inner.state = state;
        self.state.store(state as u8, Ordering::Release);
    }

    fn wait(&self, inner: &mut MutexGuard<'_, Inner>) {
        self.changed.wait_for(inner, self.options.wait_interval);
    }

    fn open_writer_with_retry(&self) -> Result<Arc<dyn IndexWriter>> {
        match self.engine.open_writer(OpenMode::CreateOrAppend) {
            Err(HoplonError::FormatTooOld { found, minimum }) => {
                log::warn!(
                    "index {} has format {found} (minimum {minimum}); deleting and recreating",
                    self.id
                );
                let failed = self.engine.delete_index_files()?;
                if !failed.is_empty() {
                    log::warn!("index {}: could not delete {:?}", self.id, failed);
                }
                self.engine
                    .open_writer(OpenMode::CreateOrAppend)
                    .map_err(|e| HoplonError::open(&self.id, format!("after wiping index: {e}")))
            }
            other => other,
        }
    }

    fn open_locked(&self, inner: &mut Inner, mode: OpenMode) -> Result<()> {
        let writer = match mode {
            OpenMode::Create => self.engine.open_writer(OpenMode::Create)?,
            _ => self.open_writer_with_retry()?,
        };

        let managers = writer.open_reader().and_then(|reader| {
            let searcher_reader = writer.open_reader()?;
            let readers = LeaseManager::new(
                reader,
                Box::new(ReaderSource {
                    writer: Arc::clone(&writer),
                }),
            );
            let searchers = LeaseManager::new(
                IndexSearcher::new(searcher_reader),
                Box::new(SearcherSource {
                    writer: Arc::clone(&writer),
                }),
            );
            Ok((readers, searchers))
        });
        let (readers, searchers) = match managers {
            Ok(managers) => managers,
            Err(e) => {
                if let Err(close_err) = writer.close() {
                    log::warn!("index {}: failed to close writer: {close_err}", self.id);
                }
                return Err(e);
            }
        };

        match self.engine.list_commits() {
            Ok(commits) => {
                if let Some(date) = commits.last().and_then(|c| c.last_commit_date()) {
                    self.last_used.fetch_max(date, Ordering::AcqRel);
                }
            }
            Err(e) => log::warn!("index {}: cannot read commits: {e}", self.id),
        }

        inner.writer = Some(writer);
        inner.readers = Some(Arc::new(readers));
        inner.searchers = Some(Arc::new(searchers));
        self.set_state(inner, IndexState::Clean);
        self.opens.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_all();

        log::info!("opened index {} ({:?})", self.id, mode);
        if let Some(hook) = self.hook.as_ref().and_then(Weak::upgrade) {
            hook.index_opened(&self.id);
        }
        Ok(())
    }

    /// Wait out a close in progress and reopen if closed.
    fn ensure_open_locked(&self, inner: &mut MutexGuard<'_, Inner>) -> Result<()> {
        loop {
            match inner.state {
                IndexState::Clean | IndexState::Dirty => return Ok(()),
                IndexState::Closing => self.wait(inner),
                IndexState::Closed => return self.open_locked(inner, OpenMode::CreateOrAppend),
            }
        }
    }

    /// Open the index if it is closed.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_open_locked(&mut inner)?;
        drop(inner);
        self.touch();
        Ok(())
    }

    fn begin_write(&self) -> Result<Option<WriteTicket<'_>>> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                IndexState::Closing => return Ok(None),
                IndexState::Closed => {
                    self.open_locked(&mut inner, OpenMode::CreateOrAppend)?;
                    continue;
                }
                IndexState::Clean | IndexState::Dirty => {}
            }
            if inner.committing == 0 && inner.commit_waiters == 0 {
                break;
            }
            self.wait(&mut inner);
        }

        let writer = inner
            .writer
            .clone()
            .ok_or_else(|| HoplonError::closed(format!("index {} has no writer", self.id)))?;
        inner.writing += 1;
        debug_assert_eq!(inner.committing, 0);
        drop(inner);

        self.touch();
        Ok(Some(WriteTicket {
            index: self,
            writer,
            applied: false,
        }))
    }

    fn begin_commit(&self, wait_for_running: bool) -> Result<Option<CommitTicket<'_>>> {
        let mut inner = self.inner.lock();
        if !inner.state.is_open() || (!wait_for_running && inner.committing > 0) {
            return Ok(None);
        }

        inner.commit_waiters += 1;
        let admitted = loop {
            if !inner.state.is_open() {
                break false;
            }
            if inner.writing == 0 && inner.committing == 0 {
                break true;
            }
            self.wait(&mut inner);
        };
        inner.commit_waiters -= 1;

        if !admitted {
            self.changed.notify_all();
            return Ok(None);
        }

        let writer = inner
            .writer
            .clone()
            .ok_or_else(|| HoplonError::closed(format!("index {} has no writer", self.id)))?;
        inner.committing += 1;
        debug_assert_eq!(inner.writing, 0);

        Ok(Some(CommitTicket { index: self, writer }))
    }

    /// Run one write under a single `writing` ticket.
    ///
    /// Returns `Ok(false)` if the index is closing.
    fn run_write<F>(&self, write: F) -> Result<bool>
    where
        F: FnOnce(&dyn IndexWriter) -> Result<()>,
    {
        let Some(mut ticket) = self.begin_write()? else {
            log::debug!("index {} is closing; write rejected", self.id);
            return Ok(false);
        };
        write(ticket.writer.as_ref())?;
        ticket.applied = true;
        Ok(true)
    }

    /// Apply an optional delete rule and insert `docs` as one batch.
    ///
    /// A term rule is applied as an atomic update by key. A query rule deletes
    /// first, then adds. Returns `Ok(false)` if the index is closing.
    pub fn update_documents(&self, rule: Option<&DeleteRule>, docs: Vec<Document>) -> Result<bool> {
        self.run_write(|writer| match rule {
            Some(DeleteRule::Term(term)) => writer.update_documents(term, docs),
            Some(rule @ DeleteRule::Query(_)) => {
                writer.delete_documents(rule)?;
                writer.add_documents(docs)
            }
            None => writer.add_documents(docs),
        })
    }

    /// Delete the documents selected by `rule`.
    pub fn delete_documents(&self, rule: &DeleteRule) -> Result<bool> {
        self.run_write(|writer| writer.delete_documents(rule).map(|_| ()))
    }

    /// Remove every document.
    ///
    /// If the engine cannot delete everything through the writer, the index
    /// is stopped, its files are wiped best-effort and a fresh index is
    /// created in their place.
    ///
    /// Failing to open the index (a lock held elsewhere, a corrupt commit)
    /// is returned as is and never leads to a wipe.
    pub fn clear_index(&self) -> Result<bool> {
        let Some(mut ticket) = self.begin_write()? else {
            log::debug!("index {} is closing; clear rejected", self.id);
            return Ok(false);
        };
        match ticket.writer.delete_all() {
            Ok(()) => {
                ticket.applied = true;
                Ok(true)
            }
            Err(e) => {
                drop(ticket);
                log::warn!("index {}: delete-all failed ({e}); wiping files", self.id);
                self.wipe_and_recreate()
            }
        }
    }

    fn wipe_and_recreate(&self) -> Result<bool> {
        if let Err(e) = self.stop() {
            log::warn!("index {}: stop before wipe failed: {e}", self.id);
        }

        let mut inner = self.inner.lock();
        while inner.state == IndexState::Closing {
            self.wait(&mut inner);
        }
        if inner.state != IndexState::Closed {
            // reopened by another caller in the meantime
            drop(inner);
            return self.run_write(|writer| writer.delete_all());
        }

        let failed = self.engine.delete_index_files()?;
        if !failed.is_empty() {
            log::warn!("index {}: could not delete {:?}", self.id, failed);
        }
        self.open_locked(&mut inner, OpenMode::Create)?;
        drop(inner);

        self.touch();
        Ok(true)
    }

    fn commit_writer(&self, writer: &dyn IndexWriter) -> Result<bool> {
        if !(writer.has_deletions() || writer.has_uncommitted_changes() || writer.has_pending_merges())
        {
            return Ok(false);
        }

        let now = now_millis();
        let mut data = BTreeMap::new();
        data.insert(LAST_COMMIT_DATE.to_string(), now.to_string());
        writer.set_commit_data(data);

        let generation = writer.commit()?;
        self.touch();
        log::debug!("index {} committed generation {generation}", self.id);
        Ok(true)
    }

    /// Swap in fresh reader and searcher generations; mark clean if no write
    /// slipped in meanwhile.
    fn refresh_managers(
        &self,
        writer: &Arc<dyn IndexWriter>,
        readers: &LeaseManager<Arc<dyn IndexReader>>,
        searchers: &LeaseManager<IndexSearcher>,
    ) -> Result<bool> {
        let before = writer.generation();

        let refreshed = readers
            .maybe_refresh()
            .and_then(|r| searchers.maybe_refresh().map(|s| r || s));
        match refreshed {
            Ok(_) => {}
            Err(HoplonError::Closed(_)) if !self.is_open() => return Ok(false),
            Err(e) => return Err(e),
        }

        let mut inner = self.inner.lock();
        if inner.state == IndexState::Dirty && writer.generation() == before {
            self.set_state(&mut inner, IndexState::Clean);
        }
        Ok(true)
    }

    /// Commit if there is anything to commit and no commit is running.
    ///
    /// Stamps `lastCommitDate` into the commit metadata, then refreshes.
    pub fn maybe_commit(&self) -> Result<bool> {
        self.commit_inner(false)
    }

    /// Commit, waiting for a running commit to finish first.
    pub fn commit(&self) -> Result<bool> {
        self.commit_inner(true)
    }

    fn commit_inner(&self, wait_for_running: bool) -> Result<bool> {
        if !self.is_open() {
            return Ok(false);
        }
        let committed = {
            let Some(ticket) = self.begin_commit(wait_for_running)? else {
                return Ok(false);
            };
            self.commit_writer(ticket.writer.as_ref())?
        };
        if committed {
            self.refresh_inner()?;
        }
        Ok(committed)
    }

    /// Make recent changes visible to new leases without a durable commit.
    ///
    /// No-op unless the index is dirty.
    pub fn maybe_refresh(&self) -> Result<bool> {
        if self.state() != IndexState::Dirty {
            return Ok(false);
        }
        self.refresh_inner()
    }

    fn refresh_inner(&self) -> Result<bool> {
        let (writer, readers, searchers) = {
            let inner = self.inner.lock();
            if !inner.state.is_open() {
                return Ok(false);
            }
            match (&inner.writer, &inner.readers, &inner.searchers) {
                (Some(w), Some(r), Some(s)) => (Arc::clone(w), Arc::clone(r), Arc::clone(s)),
                _ => return Ok(false),
            }
        };
        self.refresh_managers(&writer, &readers, &searchers)
    }

    /// Merge the index down to one segment and commit.
    pub fn compact(&self) -> Result<bool> {
        let compacted = {
            let Some(ticket) = self.begin_commit(true)? else {
                return Ok(false);
            };
            ticket.writer.force_merge(1)?;
            self.commit_writer(ticket.writer.as_ref())?
        };
        if compacted {
            log::info!("compacted index {}", self.id);
            self.refresh_inner()?;
        }
        Ok(compacted)
    }

    /// Lease the current reader, reopening the index if it is closed.
    pub fn book_reader(&self) -> Result<ReaderLease> {
        let mut inner = self.inner.lock();
        self.ensure_open_locked(&mut inner)?;
        let lease = inner
            .readers
            .as_ref()
            .ok_or_else(|| HoplonError::closed(format!("index {} has no readers", self.id)))?
            .acquire()?;
        drop(inner);
        self.touch();
        Ok(lease)
    }

    /// Return a reader lease.
    ///
    /// A lease booked before the index was closed (and perhaps reopened) is
    /// released through its own generation.
    pub fn release_reader(&self, lease: ReaderLease) -> Result<()> {
        let manager = self.inner.lock().readers.clone();
        release_lease(manager, lease)
    }

    /// Lease the current searcher, reopening the index if it is closed.
    pub fn book_searcher(&self) -> Result<SearcherLease> {
        let mut inner = self.inner.lock();
        self.ensure_open_locked(&mut inner)?;
        let lease = inner
            .searchers
            .as_ref()
            .ok_or_else(|| HoplonError::closed(format!("index {} has no searchers", self.id)))?
            .acquire()?;
        drop(inner);
        self.touch();
        Ok(lease)
    }

    /// Return a searcher lease.
    ///
    /// A lease booked before the index was closed (and perhaps reopened) is
    /// released through its own generation.
    pub fn release_searcher(&self, lease: SearcherLease) -> Result<()> {
        let manager = self.inner.lock().searchers.clone();
        release_lease(manager, lease)
    }

    /// Book a searcher, run `query` and release the searcher.
    pub fn search(&self, query: &Query, paging: SearchPaging) -> Result<SearchResults> {
        let searcher = self.book_searcher()?;
        let results = searcher.search(query, paging);
        self.release_searcher(searcher)?;
        results
    }

    /// Drain in-flight work, commit if needed and close.
    ///
    /// New writes and commits are rejected from the moment this is called.
    /// Outstanding leases stay valid until released. Calling `stop` on a
    /// closed index is a no-op; a concurrent second call waits for the first.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                IndexState::Closed => return Ok(()),
                IndexState::Closing => self.wait(&mut inner),
                IndexState::Clean | IndexState::Dirty => break,
            }
        }

        self.set_state(&mut inner, IndexState::Closing);
        self.changed.notify_all();
        while inner.writing > 0 || inner.committing > 0 {
            self.wait(&mut inner);
        }

        let writer = inner.writer.take();
        let readers = inner.readers.take();
        let searchers = inner.searchers.take();
        drop(inner);

        let mut first_error = None;
        if let Some(writer) = writer {
            if let Err(e) = self.commit_writer(writer.as_ref()) {
                log::error!("index {}: final commit failed: {e}", self.id);
                first_error.get_or_insert(e);
            }
            if let Err(e) = writer.close() {
                first_error.get_or_insert(e);
            }
        }
        for result in [
            readers.map_or(Ok(()), |m| m.close()),
            searchers.map_or(Ok(()), |m| m.close()),
        ] {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        let mut inner = self.inner.lock();
        self.set_state(&mut inner, IndexState::Closed);
        self.changed.notify_all();
        drop(inner);

        log::info!("closed index {}", self.id);
        if let Some(hook) = self.hook.as_ref().and_then(Weak::upgrade) {
            hook.index_closed(&self.id);
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn release_lease<T: Leasable>(manager: Option<Arc<LeaseManager<T>>>, lease: Lease<T>) -> Result<()> {
    match manager {
        Some(manager) if manager.issued(&lease) => manager.release(lease),
        _ => lease.release(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Term;
    use crate::engine::segment::{SegmentEngine, SegmentEngineConfig};
    use crate::storage::memory::MemoryStorage;

    fn index() -> ManagedIndex {
        let engine = SegmentEngine::new(
            Arc::new(MemoryStorage::default()),
            SegmentEngineConfig::default(),
        );
        ManagedIndex::new(
            "test",
            Arc::new(engine),
            LifecycleOptions {
                wait_interval: Duration::from_millis(10),
            },
        )
    }

    fn doc(id: &str) -> Document {
        Document::builder().add_field("id", id).build()
    }

    #[test]
    fn test_starts_closed_and_opens_on_write() {
        let index = index();
        assert_eq!(index.state(), IndexState::Closed);

        assert!(index.update_documents(None, vec![doc("1")]).unwrap());
        assert_eq!(index.state(), IndexState::Dirty);
        assert_eq!(index.open_count(), 1);
    }

    #[test]
    fn test_refresh_makes_writes_visible_and_clean() {
        let index = index();
        index.open().unwrap();
        assert_eq!(index.state(), IndexState::Clean);

        index.update_documents(None, vec![doc("1")]).unwrap();
        let stale = index.book_reader().unwrap();
        assert_eq!(stale.doc_count(), 0);

        assert!(index.maybe_refresh().unwrap());
        assert_eq!(index.state(), IndexState::Clean);
        assert!(!index.maybe_refresh().unwrap());

        let fresh = index.book_reader().unwrap();
        assert_eq!(fresh.doc_count(), 1);

        index.release_reader(stale).unwrap();
        index.release_reader(fresh).unwrap();
    }

    #[test]
    fn test_maybe_commit_stamps_last_commit_date() {
        let index = index();
        index.open().unwrap();
        assert!(!index.maybe_commit().unwrap());

        index.update_documents(None, vec![doc("1")]).unwrap();
        let before = now_millis();
        assert!(index.maybe_commit().unwrap());
        assert_eq!(index.state(), IndexState::Clean);

        let commits = index.engine().list_commits().unwrap();
        let stamped = commits.last().and_then(|c| c.last_commit_date()).unwrap();
        assert!(stamped >= before);
        assert!(index.last_used() >= stamped);
    }

    #[test]
    fn test_update_by_term_is_applied_as_one_batch() {
        let index = index();
        index.update_documents(None, vec![doc("1"), doc("2")]).unwrap();

        let rule = DeleteRule::Term(Term::new("id", "1"));
        let replacement = Document::builder()
            .add_field("id", "1")
            .add_field("v", "2")
            .build();
        index
            .update_documents(Some(&rule), vec![replacement])
            .unwrap();
        index.maybe_refresh().unwrap();

        let results = index
            .search(&Query::term("v", "2"), SearchPaging::default())
            .unwrap();
        assert_eq!(results.total_hits, 1);
        let all = index.search(&Query::All, SearchPaging::default()).unwrap();
        assert_eq!(all.total_hits, 2);
    }

    #[test]
    fn test_stop_commits_and_reopen_recovers() {
        let index = index();
        index.update_documents(None, vec![doc("1")]).unwrap();

        index.stop().unwrap();
        assert_eq!(index.state(), IndexState::Closed);
        // stopping twice is harmless
        index.stop().unwrap();

        let reader = index.book_reader().unwrap();
        assert_eq!(reader.doc_count(), 1);
        assert_eq!(index.open_count(), 2);
        index.release_reader(reader).unwrap();
    }

    #[test]
    fn test_lease_survives_stop() {
        let index = index();
        index.update_documents(None, vec![doc("1")]).unwrap();
        index.maybe_refresh().unwrap();

        let searcher = index.book_searcher().unwrap();
        index.stop().unwrap();

        let results = searcher.search(&Query::All, SearchPaging::default()).unwrap();
        assert_eq!(results.total_hits, 1);
        // release after close is a no-op
        index.release_searcher(searcher).unwrap();
    }

    #[test]
    fn test_lease_from_previous_open_releases_after_reopen() {
        let index = index();
        index.update_documents(None, vec![doc("1")]).unwrap();
        index.maybe_refresh().unwrap();

        let searcher = index.book_searcher().unwrap();
        let reader = Arc::clone(searcher.reader());
        index.stop().unwrap();
        index.open().unwrap();

        let results = searcher.search(&Query::All, SearchPaging::default()).unwrap();
        assert_eq!(results.total_hits, 1);
        index.release_searcher(searcher).unwrap();
        assert!(reader.is_closed());

        // the reopened searchers are untouched
        assert_eq!(index.outstanding_leases(), 0);
        let again = index.search(&Query::All, SearchPaging::default()).unwrap();
        assert_eq!(again.total_hits, 1);
    }

    #[test]
    fn test_clear_index_removes_everything() {
        let index = index();
        index.update_documents(None, vec![doc("1"), doc("2")]).unwrap();
        index.commit().unwrap();

        assert!(index.clear_index().unwrap());
        index.commit().unwrap();
        let results = index.search(&Query::All, SearchPaging::default()).unwrap();
        assert_eq!(results.total_hits, 0);
    }

    #[test]
    fn test_compact_merges_and_commits() {
        let index = index();
        for i in 0..5 {
            index.update_documents(None, vec![doc(&i.to_string())]).unwrap();
            index.maybe_refresh().unwrap();
        }
        assert!(index.compact().unwrap());
        let results = index.search(&Query::All, SearchPaging::default()).unwrap();
        assert_eq!(results.total_hits, 5);
    }

    #[test]
    fn test_write_and_commit_counters_return_to_zero_after_failure() {
        let index = index();
        index.open().unwrap();

        let result = index.run_write(|_| Err(HoplonError::index("boom")));
        assert!(result.is_err());
        assert_eq!(
            index.counters(),
            ArbitrationCounters {
                writing: 0,
                committing: 0
            }
        );
        // a failed write does not dirty the index
        assert_eq!(index.state(), IndexState::Clean);
    }
}
