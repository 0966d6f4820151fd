//! Error types for the Hoplon library.
//!
//! All errors are represented by the [`HoplonError`] enum. Failures raised on
//! synchronous calls (queries, direct writes, commits, `stop`) are returned to
//! the caller as a `HoplonError`. Failures raised inside the background worker
//! are rendered to a string and recorded on the job instead.
//!
//! # Examples
//!
//! ```
//! use hoplon::error::{HoplonError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(HoplonError::invalid_argument("Invalid input"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Hoplon operations.
#[derive(Error, Debug)]
pub enum HoplonError {
    /// I/O errors (file operations, directory listing, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The index data on disk could not be decoded.
    #[error("Corrupt index: {0}")]
    Corrupt(String),

    /// Another writer (in this process or another one) owns the index.
    #[error("Lock already held: {0}")]
    LockFailed(String),

    /// The on-disk index was written by an unsupported older format.
    #[error("Index format too old: found {found}, minimum supported is {minimum}")]
    FormatTooOld { found: u32, minimum: u32 },

    /// Opening an index failed for good.
    #[error("Failed to open index {index}: {reason}")]
    Open { index: String, reason: String },

    /// The handle (reader, writer, index) has already been closed.
    #[error("Closed: {0}")]
    Closed(String),

    /// The index is shutting down and refuses new work.
    #[error("Index {0} is closing")]
    Closing(String),

    /// Invalid operation (misuse of the API)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Content could not be fetched.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Content could not be translated into the intermediate form.
    #[error("Translate error: {0}")]
    Translate(String),

    /// The intermediate form could not be transformed.
    #[error("Transform error: {0}")]
    Transform(String),

    /// Engine documents could not be built.
    #[error("Build error: {0}")]
    Build(String),

    /// Query-related errors
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with HoplonError.
pub type Result<T> = std::result::Result<T, HoplonError>;

impl HoplonError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        HoplonError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        HoplonError::Storage(msg.into())
    }

    /// Create a new corruption error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        HoplonError::Corrupt(msg.into())
    }

    /// Create a new closed error.
    pub fn closed<S: Into<String>>(msg: S) -> Self {
        HoplonError::Closed(msg.into())
    }

    /// Create a new fetch error.
    pub fn fetch<S: Into<String>>(msg: S) -> Self {
        HoplonError::Fetch(msg.into())
    }

    /// Create a new translate error.
    pub fn translate<S: Into<String>>(msg: S) -> Self {
        HoplonError::Translate(msg.into())
    }

    /// Create a new transform error.
    pub fn transform<S: Into<String>>(msg: S) -> Self {
        HoplonError::Transform(msg.into())
    }

    /// Create a new build error.
    pub fn build<S: Into<String>>(msg: S) -> Self {
        HoplonError::Build(msg.into())
    }

    /// Create a new query error.
    pub fn query<S: Into<String>>(msg: S) -> Self {
        HoplonError::Query(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        HoplonError::Other(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        HoplonError::InvalidConfig(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        HoplonError::InvalidOperation(format!("Invalid argument: {}", msg.into()))
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        HoplonError::InvalidOperation(msg.into())
    }

    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        HoplonError::Other(format!("Not found: {}", msg.into()))
    }

    /// Wrap a failure to open the given index.
    pub fn open<S: Into<String>>(index: &str, reason: S) -> Self {
        HoplonError::Open {
            index: index.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error must abort an open attempt without any retry.
    pub fn is_fatal_open(&self) -> bool {
        matches!(self, HoplonError::LockFailed(_) | HoplonError::Corrupt(_))
    }
}
