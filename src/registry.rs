//! Process-wide set of managed indexes with a cap on how many stay open.
//!
//! The registry owns one [`ManagedIndex`] per index id for the lifetime of
//! the registry. Closing an index only removes it from the *open* set, so a
//! later reference reopens the same core instead of racing a second one for
//! the write lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};

use crate::engine::IndexEngine;
use crate::engine::segment::{SegmentEngine, SegmentEngineConfig};
use crate::error::{HoplonError, Result};
use crate::lifecycle::{IndexState, LifecycleHook, LifecycleOptions, ManagedIndex};
use crate::storage::file::FileStorageConfig;
use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
use crate::storage::{StorageConfig, StorageFactory};

/// Builds the engine for an index id.
pub trait EngineFactory: Send + Sync {
    fn create_engine(&self, id: &str) -> Result<Arc<dyn IndexEngine>>;
}

/// Keeps every index in memory. Reopening an id sees its earlier data.
#[derive(Debug, Default)]
pub struct MemoryEngineFactory {
    storages: Mutex<AHashMap<String, MemoryStorage>>,
    storage_config: MemoryStorageConfig,
    engine_config: SegmentEngineConfig,
}

impl MemoryEngineFactory {
    pub fn new(engine_config: SegmentEngineConfig) -> Self {
        MemoryEngineFactory {
            engine_config,
            ..Default::default()
        }
    }

    /// The shared storage behind `id`, created on first use.
    pub fn storage(&self, id: &str) -> MemoryStorage {
        self.storages
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| MemoryStorage::new(self.storage_config.clone()))
            .clone()
    }
}

impl EngineFactory for MemoryEngineFactory {
    fn create_engine(&self, id: &str) -> Result<Arc<dyn IndexEngine>> {
        Ok(Arc::new(SegmentEngine::new(
            Arc::new(self.storage(id)),
            self.engine_config.clone(),
        )))
    }
}

/// One sub-directory per index id under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryEngineFactory {
    root: PathBuf,
    engine_config: SegmentEngineConfig,
}

impl DirectoryEngineFactory {
    pub fn new<P: AsRef<Path>>(root: P, engine_config: SegmentEngineConfig) -> Self {
        DirectoryEngineFactory {
            root: root.as_ref().to_path_buf(),
            engine_config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl EngineFactory for DirectoryEngineFactory {
    fn create_engine(&self, id: &str) -> Result<Arc<dyn IndexEngine>> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(HoplonError::invalid_argument(format!(
                "index id {id:?} is not a valid directory name"
            )));
        }
        let storage =
            StorageFactory::create(StorageConfig::File(FileStorageConfig::new(self.root.join(id))))?;
        Ok(Arc::new(SegmentEngine::new(
            storage,
            self.engine_config.clone(),
        )))
    }
}

/// Registry of managed indexes with least-recently-used eviction.
pub struct IndexRegistry {
    factory: Arc<dyn EngineFactory>,
    options: LifecycleOptions,
    max_open: usize,
    indexes: RwLock<AHashMap<String, Arc<ManagedIndex>>>,
    open: Mutex<AHashSet<String>>,
    evicting: Mutex<()>,
    this: Weak<IndexRegistry>,
}

impl std::fmt::Debug for IndexRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexRegistry")
            .field("max_open", &self.max_open)
            .field("open", &self.open_count())
            .finish()
    }
}

impl IndexRegistry {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        options: LifecycleOptions,
        max_open: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| IndexRegistry {
            factory,
            options,
            max_open: max_open.max(1),
            indexes: RwLock::new(AHashMap::new()),
            open: Mutex::new(AHashSet::new()),
            evicting: Mutex::new(()),
            this: this.clone(),
        })
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Return the core for `id`, creating it with `open_fn` if none exists.
    ///
    /// At most one core per id is ever created. The core is opened and
    /// touched, then the open cap is enforced.
    pub fn get_or_create<F>(&self, id: &str, open_fn: F) -> Result<Arc<ManagedIndex>>
    where
        F: FnOnce() -> Result<Arc<dyn IndexEngine>>,
    {
        let existing = self.indexes.read().get(id).cloned();
        let index = match existing {
            Some(index) => index,
            None => {
                let mut indexes = self.indexes.write();
                match indexes.get(id) {
                    Some(index) => Arc::clone(index),
                    None => {
                        let engine = open_fn()?;
                        let hook: Weak<dyn LifecycleHook> = self.this.clone();
                        let index = Arc::new(
                            ManagedIndex::new(id, engine, self.options.clone()).with_hook(hook),
                        );
                        indexes.insert(id.to_string(), Arc::clone(&index));
                        log::debug!("registered index {id}");
                        index
                    }
                }
            }
        };

        let newly_opened = !index.is_open();
        index.open()?;
        if newly_opened {
            self.enforce_cap_protecting(Some(id));
        }
        Ok(index)
    }

    /// Return the core for `id`, building its engine with the registry's
    /// factory if needed.
    pub fn get_or_open(&self, id: &str) -> Result<Arc<ManagedIndex>> {
        self.get_or_create(id, || self.factory.create_engine(id))
    }

    /// The core for `id` if one was ever created, open or not.
    pub fn get(&self, id: &str) -> Option<Arc<ManagedIndex>> {
        self.indexes.read().get(id).cloned()
    }

    /// Mark `id` as open.
    pub fn add(&self, id: &str) {
        self.open.lock().insert(id.to_string());
    }

    /// Mark `id` as no longer open.
    pub fn remove(&self, id: &str) -> bool {
        self.open.lock().remove(id)
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    pub fn open_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.open.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of the open cores.
    pub fn open_indexes(&self) -> Vec<Arc<ManagedIndex>> {
        let ids = self.open_ids();
        let indexes = self.indexes.read();
        ids.iter().filter_map(|id| indexes.get(id).cloned()).collect()
    }

    /// Stop least-recently-used cores until no more than the cap are open.
    pub fn enforce_cap(&self) {
        self.enforce_cap_protecting(None);
    }

    fn enforce_cap_protecting(&self, protected: Option<&str>) {
        let _guard = self.evicting.lock();
        loop {
            let open = self.open_indexes();
            if open.len() <= self.max_open {
                return;
            }

            let candidates: Vec<&Arc<ManagedIndex>> = open
                .iter()
                .filter(|index| index.state().is_open() && Some(index.id()) != protected)
                .collect();
            let idle = candidates
                .iter()
                .filter(|index| index.outstanding_leases() == 0)
                .min_by_key(|index| index.lru_key());
            let victim = idle.or_else(|| candidates.iter().min_by_key(|index| index.lru_key()));

            let Some(victim) = victim else {
                return;
            };
            log::info!(
                "evicting index {} ({} open, cap {})",
                victim.id(),
                open.len(),
                self.max_open
            );
            if let Err(e) = victim.stop() {
                log::error!("failed to stop evicted index {}: {e}", victim.id());
            }
            // stop normally removes it through the hook
            if victim.state() == IndexState::Closed {
                self.remove(victim.id());
            }
        }
    }

    /// Millis of the last use of `id`.
    ///
    /// For an open index this is the live value. Otherwise it is the
    /// `lastCommitDate` of the latest commit on disk, if any.
    pub fn last_used(&self, id: &str) -> Result<Option<u64>> {
        let engine = match self.get(id) {
            Some(index) if index.is_open() => return Ok(Some(index.last_used())),
            Some(index) => Arc::clone(index.engine()),
            None => self.factory.create_engine(id)?,
        };
        if !engine.index_exists()? {
            return Ok(None);
        }
        Ok(engine
            .list_commits()?
            .last()
            .and_then(|commit| commit.last_commit_date()))
    }

    /// Stop every open core. Returns the first error.
    pub fn stop_all(&self) -> Result<()> {
        let mut first_error = None;
        for index in self.open_indexes() {
            if let Err(e) = index.stop() {
                log::error!("failed to stop index {}: {e}", index.id());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl LifecycleHook for IndexRegistry {
    fn index_opened(&self, id: &str) {
        self.add(id);
    }

    fn index_closed(&self, id: &str) {
        self.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use std::time::Duration;

    fn registry(max_open: usize) -> Arc<IndexRegistry> {
        IndexRegistry::new(
            Arc::new(MemoryEngineFactory::default()),
            LifecycleOptions {
                wait_interval: Duration::from_millis(10),
            },
            max_open,
        )
    }

    #[test]
    fn test_single_core_per_id() {
        let registry = registry(10);
        let a = registry.get_or_open("a").unwrap();
        let again = registry.get_or_open("a").unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(registry.open_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn test_concurrent_first_access_creates_one_core() {
        let registry = registry(10);
        let cores: Vec<Arc<ManagedIndex>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| registry.get_or_open("shared").unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(cores.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cores[0].open_count(), 1);
    }

    #[test]
    fn test_stop_removes_from_open_set() {
        let registry = registry(10);
        let a = registry.get_or_open("a").unwrap();
        a.stop().unwrap();
        assert_eq!(registry.open_count(), 0);
        assert!(registry.get("a").is_some());

        // reopening goes through the same core
        let again = registry.get_or_open("a").unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(registry.open_count(), 1);
    }

    #[test]
    fn test_eviction_prefers_unleased() {
        let registry = registry(2);
        let a = registry.get_or_open("a").unwrap();
        let lease = a.book_searcher().unwrap();
        registry.get_or_open("b").unwrap();
        registry.get_or_open("c").unwrap();

        // a is least recently used but still leased
        assert!(a.is_open());
        assert_eq!(registry.open_ids(), vec!["a".to_string(), "c".to_string()]);
        a.release_searcher(lease).unwrap();
    }

    #[test]
    fn test_last_used_survives_close() {
        let registry = registry(10);
        assert_eq!(registry.last_used("missing").unwrap(), None);

        let a = registry.get_or_open("a").unwrap();
        a.update_documents(None, vec![Document::builder().add_field("id", "1").build()])
            .unwrap();
        a.commit().unwrap();
        let live = registry.last_used("a").unwrap().unwrap();

        a.stop().unwrap();
        let recovered = registry.last_used("a").unwrap().unwrap();
        assert!(recovered <= live);
        assert!(recovered > 0);
    }

    #[test]
    fn test_directory_factory_rejects_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DirectoryEngineFactory::new(dir.path(), SegmentEngineConfig::default());
        assert!(factory.create_engine("../escape").is_err());
        assert!(factory.create_engine("ok").is_ok());
        assert!(dir.path().join("ok").is_dir());
    }
}
