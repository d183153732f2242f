//! Lock-free statistics counters, readable without the cache mutex.
//!
//! A small bank of plain `AtomicU64`s sits alongside the mutex-protected
//! state for metrics that call sites want to poll cheaply and often:
//! updated inline with the operation they describe, never requiring the
//! write lock.
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    transferred_bytes: Vec<AtomicU64>,
    peak_cache_memory: AtomicU64,
    reclaimed_memory: AtomicU64,
}

impl Stats {
    pub(crate) fn new(num_classes: u32) -> Self {
        Self {
            transferred_bytes: (0..num_classes).map(|_| AtomicU64::new(0)).collect(),
            peak_cache_memory: AtomicU64::new(0),
            reclaimed_memory: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_transfer(&self, class: u32, n: u64) {
        if let Some(counter) = self.transferred_bytes.get(class as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn transferred_bytes(&self, class: u32) -> u64 {
        self.transferred_bytes
            .get(class as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Folds `bytes` into the running high-water mark via a CAS loop (the
    /// usual lock-free max-update idiom — `fetch_max` isn't stable on
    /// `AtomicU64` for all targets this crate supports, so it's spelled out).
    pub(crate) fn note_cache_memory(&self, bytes: u64) {
        let mut cur = self.peak_cache_memory.load(Ordering::Relaxed);
        while bytes > cur {
            match self.peak_cache_memory.compare_exchange_weak(
                cur,
                bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub(crate) fn peak_cache_memory(&self) -> u64 {
        self.peak_cache_memory.load(Ordering::Relaxed)
    }

    pub(crate) fn note_reclaimed(&self, bytes: u64) {
        self.reclaimed_memory.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn reclaimed_memory(&self) -> u64 {
        self.reclaimed_memory.load(Ordering::Relaxed)
    }
}
