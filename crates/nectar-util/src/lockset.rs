//! Exclusive locks keyed by value.
//!
//! A [`LockSet`] hands out at most one guard per key at a time. It exists so
//! that expensive per-resource work (reading one extent from disk) can be
//! serialised per resource without serialising unrelated resources behind a
//! single mutex.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Condvar, Mutex};

/// A set of exclusive locks, one per key.
#[derive(Debug, Default)]
pub struct LockSet<K: Eq + Hash + Copy + Debug> {
    held: Mutex<HashSet<K>>,
    unlocked: Condvar,
}

/// RAII guard for one key; releases and wakes waiters on drop.
#[derive(Debug)]
pub struct LockSetGuard<'a, K: Eq + Hash + Copy + Debug> {
    set: &'a LockSet<K>,
    key: K,
}

impl<K: Eq + Hash + Copy + Debug> LockSet<K> {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            unlocked: Condvar::new(),
        }
    }

    /// Acquire the lock for `key`, blocking while another guard holds it.
    pub fn lock(&self, key: K) -> LockSetGuard<'_, K> {
        let mut held = self.held.lock().unwrap();
        while held.contains(&key) {
            held = self.unlocked.wait(held).unwrap();
        }
        held.insert(key);
        LockSetGuard { set: self, key }
    }

    /// Acquire the lock for `key` only if it is free.
    pub fn try_lock(&self, key: K) -> Option<LockSetGuard<'_, K>> {
        let mut held = self.held.lock().unwrap();
        if held.contains(&key) {
            return None;
        }
        held.insert(key);
        Some(LockSetGuard { set: self, key })
    }

    /// Number of keys currently locked.
    pub fn len(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Copy + Debug> LockSetGuard<'_, K> {
    pub fn key(&self) -> K {
        self.key
    }
}

impl<K: Eq + Hash + Copy + Debug> Drop for LockSetGuard<'_, K> {
    fn drop(&mut self) {
        let mut held = self.set.held.lock().unwrap();
        held.remove(&self.key);
        // Waiters for any key share the condvar, so wake them all
        self.set.unlocked.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_excludes() {
        let set = LockSet::new();
        let g = set.lock(7u64);
        assert!(set.try_lock(7).is_none());
        drop(g);
        assert!(set.try_lock(7).is_some());
    }

    #[test]
    fn test_distinct_keys_are_independent() {
        let set = LockSet::new();
        let _a = set.lock(1u64);
        let _b = set.lock(2u64);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_blocked_waiter_resumes() {
        let set = Arc::new(LockSet::new());
        let entered = Arc::new(AtomicUsize::new(0));

        let g = set.lock(42u64);
        let waiter = {
            let set = set.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let _g = set.lock(42u64);
                entered.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        drop(g);
        waiter.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_many_threads_one_key() {
        let set = Arc::new(LockSet::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = set.clone();
            let inside = inside.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _g = set.lock(0u64);
                    let now = inside.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(now, 0, "two guards alive for one key");
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
