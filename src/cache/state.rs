//! Mutex-protected cache state: the two object pools, the segment tree
//! root, and the MRU reclaim lists. Everything in here is only ever
//! touched while the cache's single `Mutex<CacheState>` is held.
//!
//! Each pool's backing [`Arena`] is wrapped in an `Arc` and also handed to
//! [`crate::cache::Cache`] as a plain, un-mutexed field (see
//! `Cache::segments_arena` and friends) — that shared ownership is what
//! lets `trace_path`'s reader-side descent dereference segments and bins
//! without ever taking the cache mutex; only the free-list bookkeeping
//! below requires it.
use std::sync::Arc;

use crate::arena::Arena;
use crate::bin::BinHeader;
use crate::cell::BufferPool;
use crate::config::{Config, GROUP_LEN};
use crate::mru::ReclaimListHead;
use crate::segment::Segment;

/// Slab allocator for [`Segment`]s, structurally identical to
/// [`BufferPool`] but specialized for the tree-node pool (§4.1): same
/// free-list-plus-groups allocation strategy, same `allocated`/
/// `peak_allocated` bookkeeping.
pub(crate) struct SegmentPool {
    arena: Arc<Arena<Segment>>,
    free: Vec<u32>,
    allocated: u64,
    peak_allocated: u64,
}

impl SegmentPool {
    fn new() -> Self {
        Self::with_arena(Arc::new(Arena::new()))
    }

    fn with_arena(arena: Arc<Arena<Segment>>) -> Self {
        Self {
            arena,
            free: Vec::new(),
            allocated: 0,
            peak_allocated: 0,
        }
    }

    pub(crate) fn arena(&self) -> &Arena<Segment> {
        &self.arena
    }

    pub(crate) fn arena_handle(&self) -> Arc<Arena<Segment>> {
        self.arena.clone()
    }

    pub(crate) fn get(&mut self) -> Option<u32> {
        if self.free.is_empty() {
            let base = self.arena.grow();
            self.free.extend((base..base + GROUP_LEN as u32).rev());
        }
        let idx = self.free.pop()?;
        self.arena.get(idx).meta.lock().unwrap().reset();
        self.allocated += 1;
        self.peak_allocated = self.peak_allocated.max(self.allocated);
        Some(idx)
    }

    /// Returns a segment to the free list. Caller must ensure it is fully
    /// detached: `container = None`, off both reclaim lists, `access_ctl`
    /// at zero, and every child slot null.
    pub(crate) fn release(&mut self, idx: u32) {
        let seg = self.arena.get(idx);
        {
            let meta = seg.meta.lock().unwrap();
            debug_assert!(meta.container.is_none());
            debug_assert!(meta.on_reclaim_list.is_none());
        }
        debug_assert_eq!(seg.lock_count(), 0);
        for i in 0..crate::config::NUM_CHILDREN {
            seg.set_child(i, crate::slot::RawSlot::Null);
        }
        seg.meta.lock().unwrap().reset();
        drop(seg);
        self.free.push(idx);
        self.allocated -= 1;
    }

    pub(crate) fn allocated(&self) -> u64 {
        self.allocated
    }

    pub(crate) fn peak_allocated(&self) -> u64 {
        self.peak_allocated
    }
}

/// Slab allocator for [`BinHeader`]s (§3: "the first cell of a bin", here
/// its own small pooled object — see the adaptation note in `bin.rs`).
pub(crate) struct BinPool {
    arena: Arc<Arena<BinHeader>>,
    free: Vec<u32>,
    allocated: u64,
}

impl BinPool {
    fn new() -> Self {
        Self::with_arena(Arc::new(Arena::new()))
    }

    fn with_arena(arena: Arc<Arena<BinHeader>>) -> Self {
        Self {
            arena,
            free: Vec::new(),
            allocated: 0,
        }
    }

    pub(crate) fn arena(&self) -> &Arena<BinHeader> {
        &self.arena
    }

    pub(crate) fn arena_handle(&self) -> Arc<Arena<BinHeader>> {
        self.arena.clone()
    }

    pub(crate) fn get(&mut self) -> Option<u32> {
        if self.free.is_empty() {
            let base = self.arena.grow();
            self.free.extend((base..base + GROUP_LEN as u32).rev());
        }
        let idx = self.free.pop()?;
        self.arena.get(idx).reset();
        self.allocated += 1;
        Some(idx)
    }

    pub(crate) fn release(&mut self, idx: u32) {
        self.arena.get(idx).reset();
        self.free.push(idx);
        self.allocated -= 1;
    }

    pub(crate) fn allocated(&self) -> u64 {
        self.allocated
    }
}

pub(crate) struct CacheState {
    pub(crate) segments: SegmentPool,
    pub(crate) bins: BinPool,
    pub(crate) bufs: BufferPool,
    pub(crate) root: Option<u32>,
    pub(crate) reclaim_data: ReclaimListHead,
    pub(crate) reclaim_segs: ReclaimListHead,
    pub(crate) config: Config,
    pub(crate) all_reclaimable_data_locked: bool,
    pub(crate) max_codestream_id: i64,
    /// Simulated allocation-failure switch, flipped by tests exercising
    /// the "allocator returns null" paths (§8 scenario 6). Never set by
    /// normal operation.
    pub(crate) fail_next_alloc: bool,
    /// Per-class default preservation rules installed by
    /// `Cache::preserve_class_stream`: `(class, None)` preserves every
    /// stream's bins of that class; `(class, Some(stream))` preserves only
    /// that one stream. Consulted by `add_to_bin` when deciding whether a
    /// newly created path should start out preserved.
    pub(crate) default_preserve_rules: Vec<(u32, Option<u64>)>,
}

impl CacheState {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            segments: SegmentPool::new(),
            bins: BinPool::new(),
            bufs: BufferPool::new(),
            root: None,
            reclaim_data: ReclaimListHead::default(),
            reclaim_segs: ReclaimListHead::default(),
            config,
            all_reclaimable_data_locked: false,
            max_codestream_id: -1,
            fail_next_alloc: false,
            default_preserve_rules: Vec::new(),
        }
    }

    pub(crate) fn should_default_preserve(&self, class: u32, stream: u64) -> bool {
        self.default_preserve_rules
            .iter()
            .any(|&(c, s)| c == class && (s.is_none() || s == Some(stream)))
    }

    /// `get()` on the segment pool honoring the simulated allocation
    /// failure switch used by tests.
    pub(crate) fn get_segment(&mut self) -> Option<u32> {
        if self.fail_next_alloc {
            self.fail_next_alloc = false;
            return None;
        }
        self.segments.get()
    }

    pub(crate) fn get_bin(&mut self) -> Option<u32> {
        if self.fail_next_alloc {
            self.fail_next_alloc = false;
            return None;
        }
        self.bins.get()
    }
}
