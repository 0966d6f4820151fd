//! Query execution over one reader generation.

use std::cmp::Ordering;
use std::sync::Arc;

use rayon::prelude::*;

use crate::engine::IndexReader;
use crate::error::Result;
use crate::lease::Leasable;
use crate::query::{Query, SearchHit, SearchPaging, SearchResults};

/// A searcher bound to a single reader generation.
#[derive(Debug, Clone)]
pub struct IndexSearcher {
    reader: Arc<dyn IndexReader>,
}

impl IndexSearcher {
    pub fn new(reader: Arc<dyn IndexReader>) -> Self {
        IndexSearcher { reader }
    }

    pub fn reader(&self) -> &Arc<dyn IndexReader> {
        &self.reader
    }

    /// Run `query` and return the requested page, best score first.
    ///
    /// Ties are broken by document id so paging is stable.
    pub fn search(&self, query: &Query, paging: SearchPaging) -> Result<SearchResults> {
        let mut matches: Vec<SearchHit> = self
            .reader
            .live_documents()?
            .into_par_iter()
            .filter_map(|(doc_id, doc)| {
                query.score(&doc).map(|score| SearchHit {
                    doc_id,
                    score,
                    document: Some(doc),
                    index: None,
                })
            })
            .collect();

        matches.par_sort_unstable_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.doc_id.cmp(&b.doc_id))
        });

        let total_hits = matches.len() as u64;
        let max_score = matches.first().map(|hit| hit.score).unwrap_or(0.0);
        let hits = matches
            .into_iter()
            .skip(paging.offset())
            .take(paging.page_size)
            .collect();

        Ok(SearchResults {
            hits,
            total_hits,
            max_score,
        })
    }

    /// Number of live documents matching `query`.
    pub fn count(&self, query: &Query) -> Result<u64> {
        Ok(self
            .reader
            .live_documents()?
            .par_iter()
            .filter(|(_, doc)| query.matches(doc))
            .count() as u64)
    }
}

impl Leasable for IndexSearcher {
    fn generation(&self) -> u64 {
        self.reader.generation()
    }

    fn close(&self) -> Result<()> {
        self.reader.close()
    }
}

impl Leasable for Arc<dyn IndexReader> {
    fn generation(&self) -> u64 {
        self.as_ref().generation()
    }

    fn close(&self) -> Result<()> {
        self.as_ref().close()
    }
}
