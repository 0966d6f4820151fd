//! Storage abstraction layer for Hoplon.
//!
//! Every index lives in a flat "directory" of named files. The engine only
//! talks to that directory through the [`Storage`] trait, so the same engine
//! can run on disk or fully in memory.
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage rooted at one directory
//! - Write lock implemented as an exclusively created lock file
//!
//! ## MemoryStorage
//! - In-memory storage for tests and throwaway indices
//! - Clones share files and locks, so a reopened engine sees earlier commits
//!
//! # Example
//!
//! ```
//! use hoplon::storage::{StorageConfig, StorageFactory};
//! use hoplon::storage::memory::MemoryStorageConfig;
//!
//! # fn main() -> hoplon::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//! assert!(!storage.file_exists("commit_1.json"));
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::{HoplonError, Result};

pub mod file;
pub mod memory;

/// A trait for storage backends that can store and retrieve named files.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing file of that name.
    ///
    /// The contents become visible once the returned output is closed.
    ///
    /// # Example
    ///
    /// ```
    /// use hoplon::storage::memory::{MemoryStorage, MemoryStorageConfig};
    /// use hoplon::storage::Storage;
    /// use std::io::{Read, Write};
    ///
    /// # fn main() -> hoplon::error::Result<()> {
    /// let storage = MemoryStorage::new(MemoryStorageConfig::default());
    ///
    /// let mut output = storage.create_output("seg_1.dat")?;
    /// output.write_all(b"segment bytes")?;
    /// output.close()?;
    ///
    /// let mut input = storage.open_input("seg_1.dat")?;
    /// let mut buffer = Vec::new();
    /// input.read_to_end(&mut buffer)?;
    /// assert_eq!(buffer, b"segment bytes");
    /// # Ok(())
    /// # }
    /// ```
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file succeeds.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Rename a file, replacing the destination if it exists.
    ///
    /// Used for atomic publication: write to a temporary name, then rename it
    /// so that readers never observe a partially written file.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Sync all pending writes to the underlying medium.
    fn sync(&self) -> Result<()>;

    /// Obtain an exclusive named lock.
    ///
    /// Fails with [`StorageError::LockFailed`] (surfaced as
    /// [`HoplonError::LockFailed`]) when the lock is already held, either by
    /// another handle in this process or by another process.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush, sync and publish the output.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }
}

/// A lock on a resource in storage. Dropping the lock releases it.
pub trait StorageLock: Send + Sync + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock. Releasing twice is a no-op.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Configuration for storage backends.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// File-based storage configuration (includes path)
    File(file::FileStorageConfig),

    /// Memory-based storage configuration
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// A factory for creating storage instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a new storage instance with the given configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => {
                let storage = memory::MemoryStorage::new(mem_config);
                Ok(Arc::new(storage))
            }
            StorageConfig::File(file_config) => {
                let path = file_config.path.clone();
                let storage = file::FileStorage::new(&path, file_config)?;
                Ok(Arc::new(storage))
            }
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// Permission denied.
    PermissionDenied(String),

    /// I/O error.
    IoError(String),

    /// Lock acquisition failed.
    LockFailed(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::PermissionDenied(name) => write!(f, "Permission denied: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for HoplonError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockFailed(name) => HoplonError::LockFailed(name),
            other => HoplonError::storage(other.to_string()),
        }
    }
}

impl StorageError {
    /// Classify an `io::Error` raised while touching `name`.
    pub fn from_io(name: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::FileNotFound(name.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                StorageError::PermissionDenied(name.to_string())
            }
            _ => StorageError::IoError(format!("{name}: {err}")),
        }
    }
}
