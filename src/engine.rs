//! Capability set of the wrapped storage/search engine.
//!
//! The lifecycle layer never depends on a concrete engine. It only needs a
//! way to open a writer over a directory, to take near-real-time reader
//! snapshots from that writer, and to inspect or wipe the directory. One
//! concrete engine ships with the crate: [`segment::SegmentEngine`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::{DeleteRule, Document, Term};
use crate::error::Result;
use crate::storage::Storage;

pub mod segment;

/// Commit metadata key holding the wall-clock millis of the last commit.
pub const LAST_COMMIT_DATE: &str = "lastCommitDate";

/// How a writer treats an existing index in its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Discard whatever is there and start an empty index.
    Create,
    /// Open the existing index, or create one if none exists.
    CreateOrAppend,
    /// Open the existing index; fail if there is none.
    Append,
}

/// A durable commit point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCommit {
    pub generation: u64,
    pub user_data: BTreeMap<String, String>,
    pub doc_count: u64,
}

impl IndexCommit {
    /// The `lastCommitDate` stamped into this commit, if any.
    pub fn last_commit_date(&self) -> Option<u64> {
        self.user_data
            .get(LAST_COMMIT_DATE)
            .and_then(|v| v.parse().ok())
    }
}

/// An engine bound to one index directory.
pub trait IndexEngine: Send + Sync + std::fmt::Debug {
    /// Whether the directory holds a readable commit.
    fn index_exists(&self) -> Result<bool>;

    /// Open the single writer for this directory.
    ///
    /// Fails with `LockFailed` if another writer holds the directory,
    /// `FormatTooOld` if the index was written by an unsupported format and
    /// `Corrupt` if it cannot be decoded.
    fn open_writer(&self, mode: OpenMode) -> Result<Arc<dyn IndexWriter>>;

    /// All commit points in the directory, oldest first.
    fn list_commits(&self) -> Result<Vec<IndexCommit>>;

    /// Best-effort raw wipe of the index files.
    ///
    /// Returns the names of the files that could not be deleted. A failure to
    /// delete one file never stops the wipe of the others.
    fn delete_index_files(&self) -> Result<Vec<String>>;

    /// The directory this engine works in.
    fn storage(&self) -> Arc<dyn Storage>;
}

/// The single writer of an index.
///
/// Methods take `&self`; implementations are safe to call from many threads
/// at once, and every call is applied atomically with respect to readers.
pub trait IndexWriter: Send + Sync + std::fmt::Debug {
    /// Add documents as one batch.
    fn add_documents(&self, docs: Vec<Document>) -> Result<()>;

    /// Atomically delete every document containing `term` and add `docs`.
    fn update_documents(&self, term: &Term, docs: Vec<Document>) -> Result<()>;

    /// Delete the documents selected by `rule`. Returns how many were removed.
    fn delete_documents(&self, rule: &DeleteRule) -> Result<u64>;

    /// Delete every document.
    fn delete_all(&self) -> Result<()>;

    /// Whether anything changed since the last commit.
    fn has_uncommitted_changes(&self) -> bool;

    /// Whether deletions were applied since the last commit.
    fn has_deletions(&self) -> bool;

    /// Whether the segment layout warrants a merge.
    fn has_pending_merges(&self) -> bool;

    /// Replace the user data written with the next commit.
    fn set_commit_data(&self, data: BTreeMap<String, String>);

    /// Make all changes durable. Returns the new commit generation.
    fn commit(&self) -> Result<u64>;

    /// Merge down to at most `max_segments` segments.
    fn force_merge(&self, max_segments: usize) -> Result<()>;

    /// Monotonic version of the writer's in-memory state.
    ///
    /// Increases with every change. Readers opened from the writer report
    /// the version they were taken at.
    fn generation(&self) -> u64;

    /// Take a near-real-time snapshot including uncommitted changes.
    fn open_reader(&self) -> Result<Arc<dyn IndexReader>>;

    /// Close the writer and release the directory lock.
    ///
    /// Uncommitted changes are discarded.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// An immutable snapshot of an index.
pub trait IndexReader: Send + Sync + std::fmt::Debug {
    /// Writer version this snapshot was taken at.
    fn generation(&self) -> u64;

    /// Number of live documents.
    fn doc_count(&self) -> u64;

    /// Number of document slots, deleted ones included.
    fn max_doc(&self) -> u64;

    fn is_deleted(&self, doc_id: u64) -> bool;

    /// Load a stored document. Fails with `Closed` once the reader is closed.
    fn document(&self, doc_id: u64) -> Result<Option<Document>>;

    /// Every live document with its id. Fails with `Closed` once closed.
    fn live_documents(&self) -> Result<Vec<(u64, Document)>>;

    /// Release the snapshot. Closing twice is a no-op.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
