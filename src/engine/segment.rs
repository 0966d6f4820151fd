//! Segment engine: immutable segment files plus a versioned commit point.
//!
//! Directory layout:
//!
//! - `seg_<n>.dat`: one immutable batch of documents. A small binary header
//!   (magic, format, doc count, payload length, CRC32) precedes a JSON
//!   payload.
//! - `commit_<gen>.json`: the commit point. It lists the live segments with
//!   their deletion bitmaps and carries the user data map. Only the latest
//!   commit point is kept.
//! - `write.lock`: held by the single open writer.
//!
//! Uncommitted documents live in memory. Near-real-time readers see them
//! because `open_reader` snapshots the writer state directly.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bit_vec::BitVec;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::document::{DeleteRule, Document, Term};
use crate::engine::{IndexCommit, IndexEngine, IndexReader, IndexWriter, OpenMode};
use crate::error::{HoplonError, Result};
use crate::storage::{Storage, StorageLock};

/// Current on-disk format.
pub const FORMAT: u32 = 2;

/// Oldest format this engine can read.
pub const MIN_FORMAT: u32 = 2;

/// Name of the writer lock file.
pub const WRITE_LOCK: &str = "write.lock";

/// Magic number for segment files ("HSEG").
const SEGMENT_MAGIC: u32 = 0x4853_4547;

const COMMIT_PREFIX: &str = "commit_";
const COMMIT_SUFFIX: &str = ".json";
const SEGMENT_PREFIX: &str = "seg_";
const SEGMENT_SUFFIX: &str = ".dat";

/// Configuration for [`SegmentEngine`].
#[derive(Debug, Clone)]
pub struct SegmentEngineConfig {
    /// More segments than this count as a pending merge.
    pub max_segments: usize,
}

impl Default for SegmentEngineConfig {
    fn default() -> Self {
        SegmentEngineConfig { max_segments: 10 }
    }
}

#[derive(Debug, Deserialize)]
struct FormatVersion {
    format: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentEntry {
    name: String,
    doc_count: u32,
    #[serde(default)]
    deletions: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitPoint {
    format: u32,
    generation: u64,
    version: u64,
    next_segment: u64,
    doc_count: u64,
    segments: Vec<SegmentEntry>,
    #[serde(default)]
    user_data: BTreeMap<String, String>,
}

fn commit_file_name(generation: u64) -> String {
    format!("{COMMIT_PREFIX}{generation}{COMMIT_SUFFIX}")
}

fn parse_numbered(name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()
}

fn write_segment(storage: &dyn Storage, name: &str, docs: &[Document]) -> Result<()> {
    let payload = serde_json::to_vec(docs)?;

    let mut output = storage.create_output(name)?;
    output.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
    output.write_u32::<LittleEndian>(FORMAT)?;
    output.write_u32::<LittleEndian>(docs.len() as u32)?;
    output.write_u64::<LittleEndian>(payload.len() as u64)?;
    output.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    output.write_all(&payload)?;
    output.close()
}

fn read_segment(storage: &dyn Storage, name: &str) -> Result<Vec<Document>> {
    let corrupt = |e: std::io::Error| HoplonError::corrupt(format!("{name}: {e}"));

    let mut input = storage.open_input(name)?;
    let magic = input.read_u32::<LittleEndian>().map_err(corrupt)?;
    if magic != SEGMENT_MAGIC {
        return Err(HoplonError::corrupt(format!(
            "{name}: bad magic {magic:#010x}"
        )));
    }

    let format = input.read_u32::<LittleEndian>().map_err(corrupt)?;
    if format < MIN_FORMAT {
        return Err(HoplonError::FormatTooOld {
            found: format,
            minimum: MIN_FORMAT,
        });
    }

    let doc_count = input.read_u32::<LittleEndian>().map_err(corrupt)? as usize;
    let len = input.read_u64::<LittleEndian>().map_err(corrupt)?;
    let expected_crc = input.read_u32::<LittleEndian>().map_err(corrupt)?;

    if len > input.size()? {
        return Err(HoplonError::corrupt(format!("{name}: truncated payload")));
    }
    let mut payload = vec![0u8; len as usize];
    input.read_exact(&mut payload).map_err(corrupt)?;

    if crc32fast::hash(&payload) != expected_crc {
        return Err(HoplonError::corrupt(format!("{name}: checksum mismatch")));
    }

    let docs: Vec<Document> = serde_json::from_slice(&payload)
        .map_err(|e| HoplonError::corrupt(format!("{name}: {e}")))?;
    if docs.len() != doc_count {
        return Err(HoplonError::corrupt(format!(
            "{name}: expected {doc_count} documents, found {}",
            docs.len()
        )));
    }

    Ok(docs)
}

/// An engine storing an index as segment files in one [`Storage`].
#[derive(Debug)]
pub struct SegmentEngine {
    storage: Arc<dyn Storage>,
    config: SegmentEngineConfig,
}

impl SegmentEngine {
    pub fn new(storage: Arc<dyn Storage>, config: SegmentEngineConfig) -> Self {
        SegmentEngine { storage, config }
    }

    fn commit_generations(&self) -> Result<Vec<u64>> {
        let mut generations: Vec<u64> = self
            .storage
            .list_files()?
            .iter()
            .filter_map(|name| parse_numbered(name, COMMIT_PREFIX, COMMIT_SUFFIX))
            .collect();
        generations.sort_unstable();
        Ok(generations)
    }

    fn read_commit_point(&self, generation: u64) -> Result<CommitPoint> {
        let name = commit_file_name(generation);
        let mut input = self.storage.open_input(&name)?;
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;

        let version: FormatVersion = serde_json::from_slice(&bytes)
            .map_err(|e| HoplonError::corrupt(format!("{name}: {e}")))?;
        if version.format < MIN_FORMAT {
            return Err(HoplonError::FormatTooOld {
                found: version.format,
                minimum: MIN_FORMAT,
            });
        }
        if version.format > FORMAT {
            return Err(HoplonError::corrupt(format!(
                "{name}: unknown format {}",
                version.format
            )));
        }

        serde_json::from_slice(&bytes).map_err(|e| HoplonError::corrupt(format!("{name}: {e}")))
    }

    fn latest_commit_point(&self) -> Result<Option<CommitPoint>> {
        match self.commit_generations()?.last() {
            Some(&generation) => Ok(Some(self.read_commit_point(generation)?)),
            None => Ok(None),
        }
    }

    fn load_state(&self, point: CommitPoint) -> Result<WriterState> {
        let mut segments = Vec::with_capacity(point.segments.len());

        for entry in point.segments {
            let docs = read_segment(self.storage.as_ref(), &entry.name)?;
            if docs.len() != entry.doc_count as usize {
                return Err(HoplonError::corrupt(format!(
                    "{}: commit expects {} documents, segment has {}",
                    entry.name,
                    entry.doc_count,
                    docs.len()
                )));
            }

            let deletions = match entry.deletions {
                Some(bytes) => {
                    let mut bits = BitVec::from_bytes(&bytes);
                    if bits.len() < docs.len() {
                        return Err(HoplonError::corrupt(format!(
                            "{}: deletion bitmap too short",
                            entry.name
                        )));
                    }
                    bits.truncate(docs.len());
                    bits
                }
                None => BitVec::from_elem(docs.len(), false),
            };

            segments.push(SegmentData {
                name: entry.name,
                docs: Arc::new(docs),
                deletions: Arc::new(deletions),
                persisted: true,
            });
        }

        Ok(WriterState {
            segments,
            pending: Vec::new(),
            next_segment: point.next_segment,
            commit_generation: point.generation,
            user_data: point.user_data,
            version: point.version,
            committed_version: point.version,
            deleted_since_commit: false,
        })
    }

    /// Fresh state that will not reuse any file name found in the directory.
    fn empty_state(&self) -> Result<WriterState> {
        let files = self.storage.list_files()?;
        let last_commit = files
            .iter()
            .filter_map(|n| parse_numbered(n, COMMIT_PREFIX, COMMIT_SUFFIX))
            .max()
            .unwrap_or(0);
        let next_segment = files
            .iter()
            .filter_map(|n| parse_numbered(n, SEGMENT_PREFIX, SEGMENT_SUFFIX))
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);

        Ok(WriterState {
            segments: Vec::new(),
            pending: Vec::new(),
            next_segment,
            commit_generation: last_commit,
            user_data: BTreeMap::new(),
            version: 0,
            committed_version: 0,
            deleted_since_commit: false,
        })
    }
}

impl IndexEngine for SegmentEngine {
    fn index_exists(&self) -> Result<bool> {
        Ok(!self.commit_generations()?.is_empty())
    }

    fn open_writer(&self, mode: OpenMode) -> Result<Arc<dyn IndexWriter>> {
        let lock = self.storage.obtain_lock(WRITE_LOCK)?;

        let (state, initial_commit) = match mode {
            OpenMode::Create => (self.empty_state()?, true),
            OpenMode::Append => match self.latest_commit_point()? {
                Some(point) => (self.load_state(point)?, false),
                None => return Err(HoplonError::index("no index found in directory")),
            },
            OpenMode::CreateOrAppend => match self.latest_commit_point()? {
                Some(point) => (self.load_state(point)?, false),
                None => (self.empty_state()?, true),
            },
        };

        let writer = SegmentWriter {
            storage: Arc::clone(&self.storage),
            config: self.config.clone(),
            state: Mutex::new(state),
            lock: Mutex::new(Some(lock)),
            closed: AtomicBool::new(false),
        };

        if initial_commit {
            writer.commit()?;
        }

        Ok(Arc::new(writer))
    }

    fn list_commits(&self) -> Result<Vec<IndexCommit>> {
        self.commit_generations()?
            .into_iter()
            .map(|generation| {
                let point = self.read_commit_point(generation)?;
                Ok(IndexCommit {
                    generation: point.generation,
                    user_data: point.user_data,
                    doc_count: point.doc_count,
                })
            })
            .collect()
    }

    fn delete_index_files(&self) -> Result<Vec<String>> {
        // never wipe under a live writer
        let _lock = self.storage.obtain_lock(WRITE_LOCK)?;
        let mut failed = Vec::new();

        for name in self.storage.list_files()? {
            if name == WRITE_LOCK {
                continue;
            }
            if let Err(e) = self.storage.delete_file(&name) {
                log::warn!("failed to delete index file {name}: {e}");
                failed.push(name);
            }
        }

        Ok(failed)
    }

    fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }
}

#[derive(Debug, Clone)]
struct SegmentData {
    name: String,
    docs: Arc<Vec<Document>>,
    deletions: Arc<BitVec>,
    persisted: bool,
}

impl SegmentData {
    fn live_count(&self) -> usize {
        self.deletions.iter().filter(|deleted| !deleted).count()
    }
}

#[derive(Debug)]
struct WriterState {
    segments: Vec<SegmentData>,
    pending: Vec<Document>,
    next_segment: u64,
    commit_generation: u64,
    user_data: BTreeMap<String, String>,
    version: u64,
    committed_version: u64,
    deleted_since_commit: bool,
}

impl WriterState {
    fn allocate_segment_name(&mut self) -> String {
        let name = format!("{SEGMENT_PREFIX}{}{SEGMENT_SUFFIX}", self.next_segment);
        self.next_segment += 1;
        name
    }

    /// Turn buffered documents into an in-memory segment.
    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let docs = std::mem::take(&mut self.pending);
        let name = self.allocate_segment_name();
        self.segments.push(SegmentData {
            name,
            deletions: Arc::new(BitVec::from_elem(docs.len(), false)),
            docs: Arc::new(docs),
            persisted: false,
        });
    }

    fn delete_matching<F: Fn(&Document) -> bool>(&mut self, pred: F) -> u64 {
        let mut removed = 0u64;

        for segment in &mut self.segments {
            let hits: Vec<usize> = segment
                .docs
                .iter()
                .enumerate()
                .filter(|(i, doc)| !segment.deletions.get(*i).unwrap_or(true) && pred(*doc))
                .map(|(i, _)| i)
                .collect();

            if !hits.is_empty() {
                removed += hits.len() as u64;
                let bits = Arc::make_mut(&mut segment.deletions);
                for i in hits {
                    bits.set(i, true);
                }
            }
        }

        let before = self.pending.len();
        self.pending.retain(|doc| !pred(doc));
        removed += (before - self.pending.len()) as u64;

        if removed > 0 {
            self.deleted_since_commit = true;
            self.version += 1;
        }
        removed
    }

    /// Merge every segment into a single one holding only live documents.
    fn merge_all(&mut self) {
        self.flush_pending();

        let docs: Vec<Document> = self
            .segments
            .iter()
            .flat_map(|segment| {
                segment
                    .docs
                    .iter()
                    .enumerate()
                    .filter(move |(i, _)| !segment.deletions.get(*i).unwrap_or(true))
                    .map(|(_, doc)| doc.clone())
            })
            .collect();

        self.segments.clear();
        if !docs.is_empty() {
            let name = self.allocate_segment_name();
            self.segments.push(SegmentData {
                name,
                deletions: Arc::new(BitVec::from_elem(docs.len(), false)),
                docs: Arc::new(docs),
                persisted: false,
            });
        }
        self.version += 1;
    }

    fn live_count(&self) -> u64 {
        let committed: usize = self.segments.iter().map(SegmentData::live_count).sum();
        (committed + self.pending.len()) as u64
    }
}

/// The writer of a [`SegmentEngine`] index.
#[derive(Debug)]
pub struct SegmentWriter {
    storage: Arc<dyn Storage>,
    config: SegmentEngineConfig,
    state: Mutex<WriterState>,
    lock: Mutex<Option<Box<dyn StorageLock>>>,
    closed: AtomicBool,
}

impl SegmentWriter {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(HoplonError::closed("index writer is closed"))
        } else {
            Ok(())
        }
    }

    /// Delete files no longer referenced by the commit point. Best effort.
    fn remove_unreferenced(&self, state: &WriterState) {
        let live: HashSet<&str> = state.segments.iter().map(|s| s.name.as_str()).collect();
        let current_commit = commit_file_name(state.commit_generation);

        let files = match self.storage.list_files() {
            Ok(files) => files,
            Err(e) => {
                log::warn!("failed to list index files after commit: {e}");
                return;
            }
        };

        for name in files {
            let stale_commit = name.starts_with(COMMIT_PREFIX) && name != current_commit;
            let stale_segment =
                name.starts_with(SEGMENT_PREFIX) && !live.contains(name.as_str());
            if stale_commit || stale_segment {
                if let Err(e) = self.storage.delete_file(&name) {
                    log::warn!("failed to delete stale index file {name}: {e}");
                }
            }
        }
    }
}

impl IndexWriter for SegmentWriter {
    fn add_documents(&self, docs: Vec<Document>) -> Result<()> {
        self.ensure_open()?;
        if docs.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.pending.extend(docs);
        state.version += 1;
        Ok(())
    }

    fn update_documents(&self, term: &Term, docs: Vec<Document>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.delete_matching(|doc| doc.contains_term(term));
        if !docs.is_empty() {
            state.pending.extend(docs);
            state.version += 1;
        }
        Ok(())
    }

    fn delete_documents(&self, rule: &DeleteRule) -> Result<u64> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        Ok(state.delete_matching(|doc| rule.matches(doc)))
    }

    fn delete_all(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.segments.clear();
        state.pending.clear();
        state.deleted_since_commit = true;
        state.version += 1;
        Ok(())
    }

    fn has_uncommitted_changes(&self) -> bool {
        let state = self.state.lock();
        state.version != state.committed_version
    }

    fn has_deletions(&self) -> bool {
        self.state.lock().deleted_since_commit
    }

    fn has_pending_merges(&self) -> bool {
        let state = self.state.lock();
        let pending_segment = usize::from(!state.pending.is_empty());
        state.segments.len() + pending_segment > self.config.max_segments
    }

    fn set_commit_data(&self, data: BTreeMap<String, String>) {
        self.state.lock().user_data = data;
    }

    fn commit(&self) -> Result<u64> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        state.flush_pending();
        if state.segments.len() > self.config.max_segments {
            state.merge_all();
        }

        for segment in state.segments.iter_mut().filter(|s| !s.persisted) {
            write_segment(self.storage.as_ref(), &segment.name, &segment.docs)?;
            segment.persisted = true;
        }

        let generation = state.commit_generation + 1;
        let point = CommitPoint {
            format: FORMAT,
            generation,
            version: state.version,
            next_segment: state.next_segment,
            doc_count: state.live_count(),
            segments: state
                .segments
                .iter()
                .map(|s| SegmentEntry {
                    name: s.name.clone(),
                    doc_count: s.docs.len() as u32,
                    deletions: s.deletions.any().then(|| s.deletions.to_bytes()),
                })
                .collect(),
            user_data: state.user_data.clone(),
        };

        let name = commit_file_name(generation);
        let temp_name = format!("{name}.tmp");
        let mut output = self.storage.create_output(&temp_name)?;
        output.write_all(&serde_json::to_vec_pretty(&point)?)?;
        output.close()?;
        self.storage.rename_file(&temp_name, &name)?;
        self.storage.sync()?;

        state.commit_generation = generation;
        state.committed_version = state.version;
        state.deleted_since_commit = false;

        self.remove_unreferenced(&state);
        log::debug!("committed generation {generation} ({} docs)", point.doc_count);

        Ok(generation)
    }

    fn force_merge(&self, max_segments: usize) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let count = state.segments.len() + usize::from(!state.pending.is_empty());
        if count > max_segments.max(1) {
            state.merge_all();
        }
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.state.lock().version
    }

    fn open_reader(&self) -> Result<Arc<dyn IndexReader>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.flush_pending();

        let views = state
            .segments
            .iter()
            .map(|s| SegmentView {
                docs: Arc::clone(&s.docs),
                deletions: Arc::clone(&s.deletions),
            })
            .collect();

        Ok(Arc::new(SegmentReader::new(state.version, views)))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut lock) = self.lock.lock().take() {
            lock.release()?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct SegmentView {
    docs: Arc<Vec<Document>>,
    deletions: Arc<BitVec>,
}

/// A point-in-time snapshot of a [`SegmentWriter`].
#[derive(Debug)]
pub struct SegmentReader {
    generation: u64,
    views: Vec<SegmentView>,
    bases: Vec<u64>,
    max_doc: u64,
    doc_count: u64,
    closed: AtomicBool,
}

impl SegmentReader {
    fn new(generation: u64, views: Vec<SegmentView>) -> Self {
        let mut bases = Vec::with_capacity(views.len());
        let mut max_doc = 0u64;
        let mut doc_count = 0u64;
        for view in &views {
            bases.push(max_doc);
            max_doc += view.docs.len() as u64;
            doc_count += view.deletions.iter().filter(|d| !d).count() as u64;
        }

        SegmentReader {
            generation,
            views,
            bases,
            max_doc,
            doc_count,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(HoplonError::closed(format!(
                "index reader generation {} is closed",
                self.generation
            )))
        } else {
            Ok(())
        }
    }

    fn locate(&self, doc_id: u64) -> Option<(usize, usize)> {
        if doc_id >= self.max_doc {
            return None;
        }
        let segment = self.bases.partition_point(|base| *base <= doc_id) - 1;
        Some((segment, (doc_id - self.bases[segment]) as usize))
    }
}

impl IndexReader for SegmentReader {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn doc_count(&self) -> u64 {
        self.doc_count
    }

    fn max_doc(&self) -> u64 {
        self.max_doc
    }

    fn is_deleted(&self, doc_id: u64) -> bool {
        match self.locate(doc_id) {
            Some((segment, local)) => self.views[segment].deletions.get(local).unwrap_or(true),
            None => true,
        }
    }

    fn document(&self, doc_id: u64) -> Result<Option<Document>> {
        self.ensure_open()?;
        if self.is_deleted(doc_id) {
            return Ok(None);
        }
        Ok(self
            .locate(doc_id)
            .and_then(|(segment, local)| self.views[segment].docs.get(local).cloned()))
    }

    fn live_documents(&self) -> Result<Vec<(u64, Document)>> {
        self.ensure_open()?;
        let mut live = Vec::with_capacity(self.doc_count as usize);
        for (view, base) in self.views.iter().zip(&self.bases) {
            for (i, doc) in view.docs.iter().enumerate() {
                if !view.deletions.get(i).unwrap_or(true) {
                    live.push((base + i as u64, doc.clone()));
                }
            }
        }
        Ok(live)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::{FileStorage, FileStorageConfig};
    use crate::storage::memory::MemoryStorage;
    use tempfile::TempDir;

    fn doc(id: &str) -> Document {
        Document::builder().add_field("id", id).build()
    }

    fn memory_engine() -> (MemoryStorage, SegmentEngine) {
        let storage = MemoryStorage::default();
        let engine = SegmentEngine::new(Arc::new(storage.clone()), SegmentEngineConfig::default());
        (storage, engine)
    }

    #[test]
    fn test_create_commit_and_reopen() {
        let (_storage, engine) = memory_engine();
        assert!(!engine.index_exists().unwrap());

        let writer = engine.open_writer(OpenMode::CreateOrAppend).unwrap();
        assert!(engine.index_exists().unwrap());

        writer.add_documents(vec![doc("1"), doc("2")]).unwrap();
        assert!(writer.has_uncommitted_changes());

        let mut data = BTreeMap::new();
        data.insert("lastCommitDate".to_string(), "42".to_string());
        writer.set_commit_data(data);
        writer.commit().unwrap();
        assert!(!writer.has_uncommitted_changes());
        writer.close().unwrap();

        let writer = engine.open_writer(OpenMode::Append).unwrap();
        let reader = writer.open_reader().unwrap();
        assert_eq!(reader.doc_count(), 2);

        let commits = engine.list_commits().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].last_commit_date(), Some(42));
        assert_eq!(commits[0].doc_count, 2);
    }

    #[test]
    fn test_near_real_time_reader_sees_uncommitted_docs() {
        let (_storage, engine) = memory_engine();
        let writer = engine.open_writer(OpenMode::Create).unwrap();

        let before = writer.open_reader().unwrap();
        writer.add_documents(vec![doc("1")]).unwrap();
        let after = writer.open_reader().unwrap();

        assert_eq!(before.doc_count(), 0);
        assert_eq!(after.doc_count(), 1);
        assert!(after.generation() > before.generation());
        assert_eq!(after.document(0).unwrap(), Some(doc("1")));
    }

    #[test]
    fn test_update_by_term_replaces_documents() {
        let (_storage, engine) = memory_engine();
        let writer = engine.open_writer(OpenMode::Create).unwrap();

        writer.add_documents(vec![doc("1")]).unwrap();
        writer.commit().unwrap();

        let replacement = Document::builder()
            .add_field("id", "1")
            .add_field("title", "second")
            .build();
        writer
            .update_documents(&Term::new("id", "1"), vec![replacement.clone()])
            .unwrap();
        assert!(writer.has_deletions());

        let reader = writer.open_reader().unwrap();
        assert_eq!(reader.doc_count(), 1);
        let live = reader.live_documents().unwrap();
        assert_eq!(live[0].1, replacement);
    }

    #[test]
    fn test_deletions_survive_commit() {
        let (_storage, engine) = memory_engine();
        let writer = engine.open_writer(OpenMode::Create).unwrap();
        writer.add_documents(vec![doc("1"), doc("2"), doc("3")]).unwrap();
        writer.commit().unwrap();

        let removed = writer
            .delete_documents(&DeleteRule::Term(Term::new("id", "2")))
            .unwrap();
        assert_eq!(removed, 1);
        writer.commit().unwrap();
        writer.close().unwrap();

        let writer = engine.open_writer(OpenMode::Append).unwrap();
        let reader = writer.open_reader().unwrap();
        assert_eq!(reader.doc_count(), 2);
        assert_eq!(reader.max_doc(), 3);
        assert!(reader.is_deleted(1));
    }

    #[test]
    fn test_only_latest_commit_is_kept() {
        let (storage, engine) = memory_engine();
        let writer = engine.open_writer(OpenMode::Create).unwrap();
        for i in 0..3 {
            writer.add_documents(vec![doc(&i.to_string())]).unwrap();
            writer.commit().unwrap();
        }

        let commits: Vec<String> = storage
            .list_files()
            .unwrap()
            .into_iter()
            .filter(|n| n.starts_with(COMMIT_PREFIX))
            .collect();
        assert_eq!(commits, vec!["commit_4.json".to_string()]);
    }

    #[test]
    fn test_merge_when_too_many_segments() {
        let storage = MemoryStorage::default();
        let engine = SegmentEngine::new(
            Arc::new(storage.clone()),
            SegmentEngineConfig { max_segments: 2 },
        );
        let writer = engine.open_writer(OpenMode::Create).unwrap();

        for i in 0..4 {
            writer.add_documents(vec![doc(&i.to_string())]).unwrap();
            writer.open_reader().unwrap();
        }
        assert!(writer.has_pending_merges());

        writer.commit().unwrap();
        assert!(!writer.has_pending_merges());
        assert_eq!(writer.open_reader().unwrap().doc_count(), 4);
    }

    #[test]
    fn test_second_writer_fails_with_lock_error() {
        let (_storage, engine) = memory_engine();
        let _writer = engine.open_writer(OpenMode::Create).unwrap();

        match engine.open_writer(OpenMode::CreateOrAppend) {
            Err(HoplonError::LockFailed(name)) => assert_eq!(name, WRITE_LOCK),
            other => panic!("expected LockFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_old_format_is_rejected() {
        let (storage, engine) = memory_engine();
        let mut output = storage.create_output("commit_1.json").unwrap();
        output
            .write_all(br#"{"format": 1, "segments": "legacy"}"#)
            .unwrap();
        output.close().unwrap();

        match engine.open_writer(OpenMode::CreateOrAppend) {
            Err(HoplonError::FormatTooOld { found, minimum }) => {
                assert_eq!(found, 1);
                assert_eq!(minimum, MIN_FORMAT);
            }
            other => panic!("expected FormatTooOld, got {other:?}"),
        }

        // the lock was released by the failed open
        let writer = engine.open_writer(OpenMode::Create).unwrap();
        assert!(!storage.file_exists("commit_1.json"));
        writer.close().unwrap();
    }

    #[test]
    fn test_garbage_commit_is_corrupt() {
        let (storage, engine) = memory_engine();
        let mut output = storage.create_output("commit_1.json").unwrap();
        output.write_all(b"not json").unwrap();
        output.close().unwrap();

        assert!(matches!(
            engine.open_writer(OpenMode::Append),
            Err(HoplonError::Corrupt(_))
        ));
    }

    #[test]
    fn test_delete_index_files_requires_the_write_lock() {
        let (storage, engine) = memory_engine();
        let writer = engine.open_writer(OpenMode::Create).unwrap();
        writer.add_documents(vec![doc("1")]).unwrap();
        writer.commit().unwrap();
        let files = storage.list_files().unwrap();

        assert!(matches!(
            engine.delete_index_files(),
            Err(HoplonError::LockFailed(_))
        ));
        assert_eq!(storage.list_files().unwrap(), files);

        writer.close().unwrap();
        let failed = engine.delete_index_files().unwrap();
        assert!(failed.is_empty());
        assert!(storage.list_files().unwrap().is_empty());
        assert!(!engine.index_exists().unwrap());
        // the lock was released again
        engine.open_writer(OpenMode::Create).unwrap();
    }

    #[test]
    fn test_closed_reader_refuses_access() {
        let (_storage, engine) = memory_engine();
        let writer = engine.open_writer(OpenMode::Create).unwrap();
        writer.add_documents(vec![doc("1")]).unwrap();
        let reader = writer.open_reader().unwrap();

        reader.close().unwrap();
        assert!(reader.is_closed());
        assert!(matches!(reader.document(0), Err(HoplonError::Closed(_))));
    }

    #[test]
    fn test_file_backed_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage =
            FileStorage::new(temp_dir.path(), FileStorageConfig::new(temp_dir.path())).unwrap();
        let engine = SegmentEngine::new(Arc::new(storage), SegmentEngineConfig::default());

        let writer = engine.open_writer(OpenMode::CreateOrAppend).unwrap();
        writer.add_documents(vec![doc("a"), doc("b")]).unwrap();
        writer.commit().unwrap();
        writer.close().unwrap();
        assert!(!temp_dir.path().join(WRITE_LOCK).exists());

        let writer = engine.open_writer(OpenMode::CreateOrAppend).unwrap();
        assert_eq!(writer.open_reader().unwrap().doc_count(), 2);
    }
}
