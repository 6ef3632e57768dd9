//! One mutex per registry key.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Table of per-key locks.
///
/// Locks are created on demand and dropped again once nobody holds or waits
/// for them, so the table only ever contains keys in use.
#[derive(Debug)]
pub(crate) struct KeyLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// The key leaves the table again even if `f` panics.
    pub fn with_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let lock = self
            .locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let held = Held {
            locks: self,
            key,
            lock,
        };
        let _guard: MutexGuard<'_, ()> = held.lock.lock();
        f()
    }

    fn release(&self, key: &K, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        // One reference in the table, one held by the caller.
        if Arc::strong_count(lock) == 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Releases a key's table entry on drop, after its mutex guard is gone.
struct Held<'a, K: Eq + Hash + Clone> {
    locks: &'a KeyLocks<K>,
    key: &'a K,
    lock: Arc<Mutex<()>>,
}

impl<K: Eq + Hash + Clone> Drop for Held<'_, K> {
    fn drop(&mut self) {
        self.locks.release(self.key, &self.lock);
    }
}
