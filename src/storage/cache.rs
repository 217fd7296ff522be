//! Reference-counted resource cache.
//!
//! Resources are keyed by `u64` and loaded through a [`CacheBackend`]. Each
//! `acquire` bumps a reference count and each `release` drops it; when the
//! count reaches zero the backend's finalizer runs and the entry is removed,
//! so the next `acquire` loads the resource from scratch. There is no
//! retention policy: the capacity is a hard ceiling on resident entries, and
//! a miss that would exceed it fails with [`StorageError::CacheFull`].
//!
//! Loads and finalizers run outside the bookkeeping lock. While a key is
//! being loaded or finalized it is marked in-flight and other callers for the
//! same key wait on a condition variable, so at most one backend call per key
//! is ever running.

use crate::storage::error::{StorageError, StorageResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Loads resources on a miss and finalizes them when their last reference
/// is released.
pub trait CacheBackend: Send + Sync {
    type Resource: Send + Sync;

    /// Produce the resource for `key`. May perform I/O and fail.
    fn load(&self, key: u64) -> StorageResult<Self::Resource>;

    /// Called once when the resource leaves the cache, and for every
    /// resident resource on shutdown.
    fn finalize(&self, resource: &Self::Resource) -> StorageResult<()>;
}

struct CacheState<T> {
    entries: HashMap<u64, Arc<T>>,
    references: HashMap<u64, usize>,
    in_flight: HashSet<u64>,
    /// Resident entries plus reservations held by in-flight loads.
    count: usize,
}

pub struct ResourceCache<B: CacheBackend> {
    backend: B,
    state: Mutex<CacheState<B::Resource>>,
    settled: Condvar,
    capacity: usize,
}

impl<B: CacheBackend> ResourceCache<B> {
    /// Create a cache holding at most `capacity` resources (0 = unlimited).
    pub fn new(backend: B, capacity: usize) -> Self {
        Self {
            backend,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                references: HashMap::new(),
                in_flight: HashSet::new(),
                count: 0,
            }),
            settled: Condvar::new(),
            capacity,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn acquire(&self, key: u64) -> StorageResult<Arc<B::Resource>> {
        let mut state = self.state.lock();
        loop {
            if state.in_flight.contains(&key) {
                self.settled.wait(&mut state);
                continue;
            }

            if let Some(resource) = state.entries.get(&key).cloned() {
                *state.references.entry(key).or_insert(0) += 1;
                return Ok(resource);
            }

            if self.capacity > 0 && state.count >= self.capacity {
                return Err(StorageError::CacheFull {
                    capacity: self.capacity,
                });
            }

            state.count += 1;
            state.in_flight.insert(key);
            break;
        }
        drop(state);

        let loaded = self.backend.load(key);

        let mut state = self.state.lock();
        state.in_flight.remove(&key);
        let result = match loaded {
            Ok(resource) => {
                let resource = Arc::new(resource);
                state.entries.insert(key, resource.clone());
                state.references.insert(key, 1);
                Ok(resource)
            }
            Err(e) => {
                state.count -= 1;
                Err(e)
            }
        };
        drop(state);
        self.settled.notify_all();

        result
    }

    pub fn release(&self, key: u64) -> StorageResult<()> {
        let mut state = self.state.lock();
        let remaining = match state.references.get_mut(&key) {
            Some(refs) => {
                *refs -= 1;
                *refs
            }
            None => {
                return Err(StorageError::ProtocolViolation(format!(
                    "release of key {key} which is not held"
                )));
            }
        };
        if remaining > 0 {
            return Ok(());
        }

        state.references.remove(&key);
        let resource = state.entries.remove(&key);
        // Keep the slot reserved and the key in flight until the finalizer
        // is done, so nobody reloads stale bytes underneath it.
        state.in_flight.insert(key);
        drop(state);

        let finalized = match &resource {
            Some(resource) => self.backend.finalize(resource),
            None => Ok(()),
        };

        let mut state = self.state.lock();
        state.in_flight.remove(&key);
        state.count -= 1;
        drop(state);
        self.settled.notify_all();

        finalized
    }

    /// Finalize every resident resource. The bookkeeping is left in place;
    /// the cache must not be used afterwards.
    pub fn shutdown(&self) -> StorageResult<()> {
        let resident = self.resident();
        let mut first_error = None;
        for resource in &resident {
            if let Err(e) = self.backend.finalize(resource) {
                log::error!("Failed to finalize cached resource on shutdown: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Snapshot of the resources currently resident.
    pub fn resident(&self) -> Vec<Arc<B::Resource>> {
        self.state.lock().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn references(&self, key: u64) -> usize {
        self.state
            .lock()
            .references
            .get(&key)
            .copied()
            .unwrap_or(0)
    }
}
