//! Buffer pool: slab allocation of fixed-size byte cells.
//!
//! A bin's payload (and, when present, its hole list) is stored as a
//! singly-linked chain of [`Cell`]s. Payload bytes live behind `AtomicU8`
//! rather than a plain array: a `Cell` is reachable from any thread that has
//! walked an access-locked path to it, so the single mutex-holding writer
//! extending a partially-filled cell needs interior mutability to do so
//! soundly without `unsafe`. Byte stores/loads use `Relaxed` ordering —
//! ordering between a writer's update and a reader's view is established
//! once, at the bin-header `status` word (see `bin.rs`), not per byte.
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::arena::Arena;
use crate::config::{CELL_LEN, GROUP_LEN};

/// Sentinel `next` value meaning "last cell in its chain".
pub(crate) const NO_NEXT: u32 = u32::MAX;

pub(crate) struct Cell {
    pub(crate) payload: [AtomicU8; CELL_LEN],
    pub(crate) next: AtomicU32,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            payload: std::array::from_fn(|_| AtomicU8::new(0)),
            next: AtomicU32::new(NO_NEXT),
        }
    }
}

impl Cell {
    pub(crate) fn read_byte(&self, pos: usize) -> u8 {
        self.payload[pos].load(Ordering::Relaxed)
    }

    pub(crate) fn write_byte(&self, pos: usize, value: u8) {
        self.payload[pos].store(value, Ordering::Relaxed);
    }

    pub(crate) fn next(&self) -> Option<u32> {
        match self.next.load(Ordering::Relaxed) {
            NO_NEXT => None,
            n => Some(n),
        }
    }

    pub(crate) fn set_next(&self, next: Option<u32>) {
        self.next
            .store(next.unwrap_or(NO_NEXT), Ordering::Relaxed);
    }
}

/// Slab allocator for [`Cell`]s. Free-list and counters are only ever
/// touched by the mutex-holding writer; concurrent readers only dereference
/// cells they reached through an access-locked path, via the same `Arc`
/// this pool shares with its owning [`crate::cache::Cache`] (see
/// [`BufferPool::arena_handle`]) — never through the pool itself, which
/// normally lives behind the cache mutex.
pub(crate) struct BufferPool {
    arena: Arc<Arena<Cell>>,
    free: Vec<u32>,
    allocated: u64,
    peak_allocated: u64,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self::with_arena(Arc::new(Arena::new()))
    }

    pub(crate) fn with_arena(arena: Arc<Arena<Cell>>) -> Self {
        Self {
            arena,
            free: Vec::new(),
            allocated: 0,
            peak_allocated: 0,
        }
    }

    pub(crate) fn arena(&self) -> &Arena<Cell> {
        &self.arena
    }

    /// A clone of the `Arc` backing this pool's storage, for a caller (the
    /// owning `Cache`) that wants to dereference cells without the pool's
    /// own lock.
    pub(crate) fn arena_handle(&self) -> Arc<Arena<Cell>> {
        self.arena.clone()
    }

    /// Allocates one cell, growing the slab by a whole group when the free
    /// list is exhausted. Returns `None` only to model an out-of-memory
    /// condition under test; the default allocator never fails.
    pub(crate) fn get(&mut self) -> Option<u32> {
        if self.free.is_empty() {
            let base = self.arena.grow();
            self.free.extend((base..base + GROUP_LEN as u32).rev());
        }
        let idx = self.free.pop()?;
        self.allocated += 1;
        self.peak_allocated = self.peak_allocated.max(self.allocated);
        Some(idx)
    }

    /// Releases a whole chain of cells back to the free list, resetting each
    /// cell's `next` link and clearing its payload bytes so a later `get`
    /// doesn't observe stale content.
    pub(crate) fn release_chain(&mut self, head: u32) {
        let mut cur = Some(head);
        while let Some(idx) = cur {
            let cell = self.arena.get(idx);
            cur = cell.next();
            cell.set_next(None);
            for b in cell.payload.iter() {
                b.store(0, Ordering::Relaxed);
            }
            self.free.push(idx);
            self.allocated -= 1;
        }
    }

    pub(crate) fn allocated(&self) -> u64 {
        self.allocated
    }

    pub(crate) fn peak_allocated(&self) -> u64 {
        self.peak_allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn get_then_release_round_trips_through_free_list() {
        let mut pool = BufferPool::new();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.allocated(), 2);
        pool.release_chain(a);
        assert_eq!(pool.allocated(), 1);
        let c = pool.get().unwrap();
        assert_eq!(c, a, "freed cell should be recycled before growing again");
    }

    #[test_log::test]
    fn peak_allocated_tracks_the_high_water_mark() {
        let mut pool = BufferPool::new();
        let cells: Vec<u32> = (0..40).map(|_| pool.get().unwrap()).collect();
        assert_eq!(pool.peak_allocated(), 40);
        for c in &cells {
            pool.release_chain(*c);
        }
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.peak_allocated(), 40);
    }

    #[test_log::test]
    fn release_chain_follows_next_links() {
        let mut pool = BufferPool::new();
        let head = pool.get().unwrap();
        let tail = pool.get().unwrap();
        pool.arena().get(head).set_next(Some(tail));
        assert_eq!(pool.allocated(), 2);
        pool.release_chain(head);
        assert_eq!(pool.allocated(), 0);
    }
}
