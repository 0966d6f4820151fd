//! # Hoplon
//!
//! Index lifecycle and concurrency middleware for embedded full-text indices.
//!
//! ## Features
//!
//! - Per-index state machine arbitrating writers, committers and readers
//! - Reference-counted reader and searcher generations
//! - Near-real-time refresh and durable commits
//! - Priority job queue with background workers
//! - Bounded set of open indices with least-recently-used eviction
//! - Pluggable storage backends and content pipelines

pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod job;
pub mod lease;
pub mod lifecycle;
pub mod listener;
pub mod manager;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod search;
pub mod storage;
pub mod worker;

pub mod prelude {
    pub use crate::config::HoplonConfig;
    pub use crate::document::{DeleteRule, Document, Term};
    pub use crate::error::{HoplonError, Result};
    pub use crate::job::{Job, JobKind, Priority};
    pub use crate::lifecycle::{IndexState, ManagedIndex};
    pub use crate::manager::IndexManager;
    pub use crate::query::{Query, SearchPaging, SearchResults};
    pub use crate::registry::IndexRegistry;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
