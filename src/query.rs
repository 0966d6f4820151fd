//! Minimal query model executed by [`crate::search::IndexSearcher`].
//!
//! Queries are boolean combinations of exact terms and prefixes over
//! multi-valued string fields. The score of a hit is the number of leaf
//! clauses it satisfies, which is enough to rank `Or` queries sensibly.

use serde::{Deserialize, Serialize};

use crate::document::{Document, Term};

/// A query over documents.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Query {
    /// Matches every live document.
    All,
    /// Matches documents containing the exact term.
    Term(Term),
    /// Matches documents with a value of `field` starting with `prefix`.
    Prefix { field: String, prefix: String },
    /// Matches documents matching every clause.
    And(Vec<Query>),
    /// Matches documents matching at least one clause.
    Or(Vec<Query>),
}

impl Query {
    /// Shorthand for an exact term query.
    pub fn term<F: Into<String>, V: Into<String>>(field: F, value: V) -> Self {
        Query::Term(Term::new(field, value))
    }

    /// Shorthand for a prefix query.
    pub fn prefix<F: Into<String>, P: Into<String>>(field: F, prefix: P) -> Self {
        Query::Prefix {
            field: field.into(),
            prefix: prefix.into(),
        }
    }

    /// Whether `doc` matches this query.
    pub fn matches(&self, doc: &Document) -> bool {
        self.score(doc).is_some()
    }

    /// Score `doc`, or `None` when it does not match.
    pub fn score(&self, doc: &Document) -> Option<f32> {
        match self {
            Query::All => Some(1.0),
            Query::Term(term) => doc.contains_term(term).then_some(1.0),
            Query::Prefix { field, prefix } => doc
                .get_values(field)
                .iter()
                .any(|v| v.starts_with(prefix.as_str()))
                .then_some(1.0),
            Query::And(clauses) => {
                let mut total = 0.0;
                for clause in clauses {
                    total += clause.score(doc)?;
                }
                Some(total)
            }
            Query::Or(clauses) => {
                let total: f32 = clauses.iter().filter_map(|c| c.score(doc)).sum();
                let any = clauses.iter().any(|c| c.matches(doc));
                any.then_some(total)
            }
        }
    }
}

/// One page of a result list. Pages are numbered from 1.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SearchPaging {
    pub page: usize,
    pub page_size: usize,
}

impl SearchPaging {
    pub fn new(page: usize, page_size: usize) -> Self {
        SearchPaging { page, page_size }
    }

    /// Index of the first hit on this page.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

impl Default for SearchPaging {
    fn default() -> Self {
        SearchPaging {
            page: 1,
            page_size: 10,
        }
    }
}

/// A search hit containing a document and its score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// The document ID within the searched generation.
    pub doc_id: u64,
    /// The relevance score.
    pub score: f32,
    /// The stored document.
    pub document: Option<Document>,
    /// The index the hit came from, set on multi-index results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

/// Search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    /// The hits on the requested page.
    pub hits: Vec<SearchHit>,
    /// Total number of matching documents.
    pub total_hits: u64,
    /// Maximum score across all matches.
    pub max_score: f32,
}

impl SearchResults {
    pub fn empty() -> Self {
        SearchResults {
            hits: Vec::new(),
            total_hits: 0,
            max_score: 0.0,
        }
    }

    /// Merge per-index results into one page.
    ///
    /// Each part must hold at least the first `paging.offset() +
    /// paging.page_size` hits of its index. Hits are tagged with their index
    /// and ordered by score, then by position of the index in `parts`, then
    /// by document id.
    pub fn merge(parts: Vec<(String, SearchResults)>, paging: SearchPaging) -> SearchResults {
        let mut total_hits = 0;
        let mut max_score: f32 = 0.0;
        let mut hits = Vec::new();

        for (position, (index, results)) in parts.into_iter().enumerate() {
            total_hits += results.total_hits;
            if results.total_hits > 0 {
                max_score = max_score.max(results.max_score);
            }
            hits.extend(results.hits.into_iter().map(|mut hit| {
                hit.index = Some(index.clone());
                (position, hit)
            }));
        }

        hits.sort_by(|(pa, a), (pb, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(pa.cmp(pb))
                .then(a.doc_id.cmp(&b.doc_id))
        });

        SearchResults {
            hits: hits
                .into_iter()
                .map(|(_, hit)| hit)
                .skip(paging.offset())
                .take(paging.page_size)
                .collect(),
            total_hits,
            max_score,
        }
    }
}
