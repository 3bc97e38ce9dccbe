//! Registry of lazily-created exclusive locks, one per key.
//!
//! Locks are never removed, so the registry grows with the number of
//! distinct keys seen over the process lifetime.

use dashmap::DashMap;
use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key async mutual exclusion. Distinct keys never contend.
#[derive(Debug)]
pub struct KeyedMutex<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

/// Exclusive access to one key, released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`, creating its lock on first use.
    pub async fn acquire<Q>(&self, key: &Q) -> KeyGuard
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        // the shard guard must be released before awaiting the lock
        let lock = match self.locks.get(key) {
            Some(lock) => Arc::clone(lock.value()),
            None => Arc::clone(self.locks.entry(key.to_owned()).or_default().value()),
        };
        KeyGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of keys a lock has been created for.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}
