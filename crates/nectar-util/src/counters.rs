//! Process-wide monotonic event counters.
//!
//! Every interesting event in the engine bumps a named counter; the analyzer
//! thread snapshots the whole sink for its periodic report. Counter names are
//! `'static` string literals so registration is free and lock-free reads stay
//! on the fast path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// A sink of named monotonic counters.
///
/// Cloning is not supported; share via `Arc`. Counters are created on first
/// use and never removed.
#[derive(Debug, Default)]
pub struct Counters {
    slots: DashMap<&'static str, AtomicU64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `name` by one.
    #[inline]
    pub fn count(&self, name: &'static str) {
        self.add(name, 1);
    }

    /// Increment `name` by `n`.
    #[inline]
    pub fn add(&self, name: &'static str, n: u64) {
        self.slots
            .entry(name)
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of `name`, zero if never counted.
    pub fn get(&self, name: &str) -> u64 {
        self.slots
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of all counters, sorted by name for stable report output.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.slots
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect()
    }
}
