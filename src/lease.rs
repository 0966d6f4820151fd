//! Reference-counted, near-real-time handle management.
//!
//! A [`LeaseManager`] hands out [`Lease`]s on the *current generation* of
//! some handle type (an index reader or a searcher). Each generation carries
//! a reference count. The manager itself holds one reference on the current
//! generation, and every outstanding lease holds one more.
//!
//! When [`LeaseManager::maybe_refresh`] finds a newer generation it swaps the
//! current pointer and drops the manager's reference on the old generation.
//! The old generation is physically closed when its count reaches zero,
//! i.e. once the last borrower releases it. The current generation can never
//! reach zero while it is current, so it is never closed underneath callers.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! use hoplon::error::Result;
//! use hoplon::lease::{Leasable, LeaseFactory, LeaseManager};
//!
//! #[derive(Debug)]
//! struct Snapshot(u64);
//!
//! impl Leasable for Snapshot {
//!     fn generation(&self) -> u64 { self.0 }
//!     fn close(&self) -> Result<()> { Ok(()) }
//! }
//!
//! struct Source(Arc<AtomicU64>);
//!
//! impl LeaseFactory<Snapshot> for Source {
//!     fn refresh_if_needed(&self, current: &Snapshot) -> Result<Option<Snapshot>> {
//!         let latest = self.0.load(Ordering::SeqCst);
//!         Ok((latest != current.0).then(|| Snapshot(latest)))
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let version = Arc::new(AtomicU64::new(1));
//! let manager = LeaseManager::new(Snapshot(1), Box::new(Source(version.clone())));
//!
//! let old = manager.acquire()?;
//! version.store(2, Ordering::SeqCst);
//! assert!(manager.maybe_refresh()?);
//!
//! // The old lease still works; new leases see the new generation.
//! assert_eq!(old.generation(), 1);
//! assert_eq!(manager.acquire()?.generation(), 2);
//! manager.release(old)?;
//! # Ok(())
//! # }
//! ```

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{HoplonError, Result};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// A handle that can be leased: it has a generation and can be closed.
pub trait Leasable: Send + Sync + std::fmt::Debug {
    /// Monotonic generation of the snapshot this handle exposes.
    fn generation(&self) -> u64;

    /// Physically release the handle. Called exactly once per generation.
    fn close(&self) -> Result<()>;
}

/// Produces newer generations for a [`LeaseManager`].
pub trait LeaseFactory<T>: Send + Sync {
    /// Return a newer handle if `current` is stale, `None` otherwise.
    fn refresh_if_needed(&self, current: &T) -> Result<Option<T>>;
}

#[derive(Debug)]
struct Generation<T: Leasable> {
    value: T,
    refs: AtomicUsize,
    closed: AtomicBool,
    outstanding: Arc<AtomicUsize>,
}

impl<T: Leasable> Generation<T> {
    fn new(value: T, outstanding: Arc<AtomicUsize>) -> Self {
        Generation {
            value,
            // the manager's own hold while this generation is current
            refs: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            outstanding,
        }
    }

    fn incref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn decref(&self) -> Result<()> {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close()
        } else {
            Ok(())
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::trace!("closing generation {}", self.value.generation());
        self.value.close()
    }
}

/// A borrowed generation. Dropping the lease releases it.
#[derive(Debug)]
pub struct Lease<T: Leasable> {
    generation: Arc<Generation<T>>,
    manager_id: u64,
    released: bool,
}

impl<T: Leasable> Lease<T> {
    /// Generation of the leased handle.
    pub fn generation(&self) -> u64 {
        self.generation.value.generation()
    }

    /// Release the lease through its own generation, whichever manager
    /// issued it.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.generation.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.generation.decref()
    }
}

impl<T: Leasable> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.generation.value
    }
}

impl<T: Leasable> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            log::warn!("failed to close released generation: {e}");
        }
    }
}

/// Issues reference-counted leases over the current generation of `T`.
pub struct LeaseManager<T: Leasable> {
    id: u64,
    current: Mutex<Option<Arc<Generation<T>>>>,
    refresh_lock: Mutex<()>,
    outstanding: Arc<AtomicUsize>,
    factory: Box<dyn LeaseFactory<T>>,
}

impl<T: Leasable> std::fmt::Debug for LeaseManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("id", &self.id)
            .field("current_generation", &self.current_generation())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl<T: Leasable> LeaseManager<T> {
    /// Create a manager whose first generation is `initial`.
    pub fn new(initial: T, factory: Box<dyn LeaseFactory<T>>) -> Self {
        let outstanding = Arc::new(AtomicUsize::new(0));
        LeaseManager {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            current: Mutex::new(Some(Arc::new(Generation::new(
                initial,
                Arc::clone(&outstanding),
            )))),
            refresh_lock: Mutex::new(()),
            outstanding,
            factory,
        }
    }

    /// Lease the current generation.
    pub fn acquire(&self) -> Result<Lease<T>> {
        let current = self.current.lock();
        let generation = current
            .as_ref()
            .ok_or_else(|| HoplonError::closed("lease manager is closed"))?;

        // incremented under the slot lock so a concurrent swap cannot close it
        generation.incref();
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        Ok(Lease {
            generation: Arc::clone(generation),
            manager_id: self.id,
            released: false,
        })
    }

    /// Return a lease obtained from this manager.
    ///
    /// Fails with `InvalidOperation` if the lease came from another manager.
    /// A superseded generation is closed when its last lease is released.
    pub fn release(&self, mut lease: Lease<T>) -> Result<()> {
        if !self.issued(&lease) {
            return Err(HoplonError::invalid_operation(format!(
                "lease of generation {} was not issued by this manager",
                lease.generation()
            )));
        }
        lease.release_inner()
    }

    /// Whether `lease` was issued by this manager.
    pub fn issued(&self, lease: &Lease<T>) -> bool {
        lease.manager_id == self.id
    }

    /// Swap in a newer generation if the factory has one.
    ///
    /// Returns whether the current generation changed. Generations never go
    /// backwards: a candidate that is not newer than the current one is
    /// closed and ignored.
    pub fn maybe_refresh(&self) -> Result<bool> {
        let _refreshing = self.refresh_lock.lock();

        let current = self
            .current
            .lock()
            .clone()
            .ok_or_else(|| HoplonError::closed("lease manager is closed"))?;

        let Some(candidate) = self.factory.refresh_if_needed(&current.value)? else {
            return Ok(false);
        };

        if candidate.generation() <= current.value.generation() {
            candidate.close()?;
            return Ok(false);
        }

        let next = Arc::new(Generation::new(candidate, Arc::clone(&self.outstanding)));
        let next_generation = next.value.generation();
        let previous = self
            .current
            .lock()
            .as_mut()
            .map(|existing| std::mem::replace(existing, Arc::clone(&next)));

        let Some(previous) = previous else {
            next.close()?;
            return Err(HoplonError::closed("lease manager is closed"));
        };

        log::trace!(
            "lease manager {} moved from generation {} to {}",
            self.id,
            previous.value.generation(),
            next_generation
        );

        // drop the manager's hold; closes now unless borrowers remain
        previous.decref()?;
        Ok(true)
    }

    /// Generation currently handed out by `acquire`, if not closed.
    pub fn current_generation(&self) -> Option<u64> {
        self.current
            .lock()
            .as_ref()
            .map(|generation| generation.value.generation())
    }

    /// Number of leases not yet released, across all generations.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.current.lock().is_none()
    }

    /// Stop issuing leases and drop the manager's hold on the current generation.
    ///
    /// Outstanding leases stay valid; the generation is closed when the last
    /// one is released. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let _refreshing = self.refresh_lock.lock();
        let current = self.current.lock().take();
        match current {
            Some(generation) => generation.decref(),
            None => Ok(()),
        }
    }
}

impl<T: Leasable> Drop for LeaseManager<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to close lease manager {}: {e}", self.id);
        }
    }
}
