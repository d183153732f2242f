//! Cache engine (§4.5): the public API surface.
//!
//! `Cache` owns the mutex-protected pools and tree (`CacheState`) plus a
//! small bank of lock-free statistics counters. Every pool's backing arena
//! is also held here as a plain `Arc` (see `Inner`), which is what lets
//! reader operations (`trace_path`, `Reader::read`) dereference segments
//! and bins without ever touching the mutex on their common path.
pub(crate) mod state;
pub(crate) mod stats;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::arena::Arena;
use crate::bin::{self, BinHeader, Mark};
use crate::cell::Cell;
use crate::config::{
    Config, CELL_BYTES, MAIN_HEADER_CLASS, METADATA_CLASS, NUM_CHILDREN, TILE_HEADER_CLASS,
};
use crate::error::{Error, Result};
use crate::segment::{NodeRole, ReclaimList, Segment};
use crate::slot::RawSlot;
use crate::walker::{self, Walker};

use state::CacheState;
use stats::Stats;

struct Inner {
    state: Mutex<CacheState>,
    segments: Arc<Arena<Segment>>,
    bins: Arc<Arena<BinHeader>>,
    bufs: Arc<Arena<Cell>>,
    stats: Stats,
}

/// A concurrent, in-memory cache of JPIP-style data-bins (§1–§4). Cheap to
/// clone: every clone shares the same tree, pools and mutex through `Arc`.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

/// `BIN_DELETED` / `BIN_AUGMENTED` / `BIN_MARKED` flags, as returned by
/// [`Cache::mark_bin`] and carried on [`ScanEntry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinFlags {
    pub deleted: bool,
    pub augmented: bool,
    pub marked: bool,
}

/// Outcome of [`Cache::mark_bin`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BinMarkInfo {
    pub flags: BinFlags,
    pub length: u32,
    pub is_complete: bool,
}

/// One bin reported by [`Cache::scan_bins`].
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub class: u32,
    pub bin: u64,
    pub length: u32,
    pub is_complete: bool,
    pub flags: BinFlags,
}

impl Cache {
    /// Creates a new, empty cache with the given configuration.
    pub fn new(config: Config) -> Self {
        let state = CacheState::new(config);
        let segments = state.segments.arena_handle();
        let bins = state.bins.arena_handle();
        let bufs = state.bufs.arena_handle();
        let num_classes = state.config.num_classes;
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                segments,
                bins,
                bufs,
                stats: Stats::new(num_classes),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forces the next pool allocation (segment, bin header, or buffer
    /// cell) to fail, as if memory were exhausted. Consumed after one use.
    #[doc(hidden)]
    pub fn inject_alloc_failure(&self) {
        self.lock().fail_next_alloc = true;
    }

    /// Collapses the tile-header alias onto the main-header class (§4.3,
    /// §6): `class == TILE_HEADER_CLASS` becomes `MAIN_HEADER_CLASS` with
    /// `bin += 1`, reserving bin 0 of the main-header class for the main
    /// header itself.
    fn normalize(class: u32, bin: u64) -> (u32, u64) {
        if class == TILE_HEADER_CLASS {
            (MAIN_HEADER_CLASS, bin + 1)
        } else {
            (class, bin)
        }
    }

    fn note_memory(&self, state: &CacheState) {
        let bytes = state.bufs.allocated() * CELL_BYTES as u64
            + state.segments.allocated() * std::mem::size_of::<Segment>() as u64
            + state.bins.allocated() * std::mem::size_of::<BinHeader>() as u64;
        self.inner.stats.note_cache_memory(bytes);
    }

    /// §4.5 `add_to_bin`. Merges `[offset, offset + data.len())` into the
    /// bin, growing/creating the path as needed. Returns whether the full
    /// content was added; `false` means an allocation failure left the bin
    /// DELETED.
    #[allow(clippy::too_many_arguments)]
    pub fn add_to_bin(
        &self,
        class: u32,
        stream: u64,
        bin_id: u64,
        data: &[u8],
        offset: u32,
        is_complete: bool,
        mark_if_augmented: bool,
        add_as_most_recent: bool,
    ) -> bool {
        let (class, bin_id) = Self::normalize(class, bin_id);
        let mut state = self.lock();

        let l_max = bin::l_max();
        let mut data = data;
        let mut is_complete = is_complete;
        if offset as u64 + data.len() as u64 > l_max as u64 {
            let allowed = l_max.saturating_sub(offset).min(data.len() as u32);
            data = &data[..allowed as usize];
            is_complete = false;
        }

        let force_preserve = state.should_default_preserve(class, stream);
        let Some((leaf, slot)) = walker::make_path(&mut state, class, stream, bin_id, force_preserve)
        else {
            return false;
        };
        state.max_codestream_id = state.max_codestream_id.max(stream as i64);

        let existing = state.segments.arena().get(leaf).child(slot);
        let bin_idx = match existing {
            RawSlot::Ref { index, erasable: false } => index,
            _ => {
                let Some(idx) = state.get_bin() else {
                    walker::unlock(&mut state, leaf);
                    return false;
                };
                state
                    .segments
                    .arena()
                    .get(leaf)
                    .set_child(slot, RawSlot::Ref { index: idx, erasable: false });
                let seg = state.segments.arena().get(leaf);
                let mut meta = seg.meta.lock().unwrap();
                meta.num_descendants += 1;
                meta.num_non_null += 1;
                if !meta.preserve_bit(slot) {
                    meta.num_reclaimable_bins += 1;
                }
                idx
            }
        };

        let header = state.bins.arena().get(bin_idx);
        let prev_status = header.load_status();
        let success = match bin::add_range(&mut state.bufs, &header, data, offset, is_complete) {
            Some(outcome) => {
                if mark_if_augmented && outcome.augmented && prev_status.m == Mark::None {
                    let non_empty = outcome.new_l > 0 || outcome.new_hole_head.is_some();
                    bin::set_mark(
                        &header,
                        if non_empty { Mark::AugmentedMarked } else { Mark::Marked },
                    );
                    drop(header);
                    if let Some(root) = walker::nearest_stream_root(&state, leaf) {
                        walker::adjust_mark_count(&state, root, class, 1);
                    }
                } else {
                    drop(header);
                }
                self.inner.stats.record_transfer(class, data.len() as u64);
                self.note_memory(&state);
                true
            }
            None => {
                bin::force_deleted(&mut state.bufs, &header, prev_status.l);
                let was_marked = prev_status.m.is_marked_at_all();
                drop(header);
                if !was_marked {
                    if let Some(root) = walker::nearest_stream_root(&state, leaf) {
                        walker::adjust_mark_count(&state, root, class, 1);
                    }
                }
                false
            }
        };

        // kdu_cache.cpp's `add_as_most_recent`: bump the leaf to the MRU
        // head of the reclaimable-data list immediately, rather than
        // waiting for whatever unlock eventually touches it. Only
        // meaningful if the leaf is already eligible for reclaim (it holds
        // some other non-preserved, erasable bin) — a bin just created here
        // is never itself erasable yet.
        if add_as_most_recent {
            let on_list = state.segments.arena().get(leaf).meta.lock().unwrap().on_reclaim_list;
            if on_list == Some(ReclaimList::Data) {
                let arena = state.segments.arena();
                state.reclaim_data.push_front(arena, leaf, ReclaimList::Data);
            }
        }

        walker::unlock(&mut state, leaf);
        success
    }

    /// §4.5 `delete_bin`. No-op if the bin doesn't exist.
    pub fn delete_bin(&self, class: u32, stream: u64, bin_id: u64, mark_if_non_empty: bool) {
        let (class, bin_id) = Self::normalize(class, bin_id);
        let mut state = self.lock();
        let Some((leaf, slot)) = walker::find_leaf(&state, class, stream, bin_id) else {
            return;
        };
        self.delete_bin_at(&mut state, leaf, slot, class, mark_if_non_empty);
    }

    /// Applies delete semantics to one already-located bin slot: tags it
    /// erasable and updates the mark-count bookkeeping, then runs the
    /// unlock duties immediately if no reader currently holds a lock on
    /// the leaf (the common case, since the caller already excludes every
    /// other writer via the cache mutex).
    fn delete_bin_at(
        &self,
        state: &mut CacheState,
        leaf: u32,
        slot: usize,
        class: u32,
        mark_if_non_empty: bool,
    ) {
        let value = state.segments.arena().get(leaf).child(slot);
        let RawSlot::Ref { index, erasable: false } = value else {
            return;
        };
        let header = state.bins.arena().get(index);
        let status = header.load_status();
        let non_empty = status.l > 0 || status.f;
        let was_marked = status.m.is_marked_at_all();
        if mark_if_non_empty && (non_empty || was_marked) {
            bin::set_mark(&header, Mark::DeletedMarked);
        } else if status.m == Mark::Marked {
            // previously MARKED but still empty: transitions back to none.
            bin::set_mark(&header, Mark::None);
        }
        let became_marked = header.load_status().m.is_marked_at_all();
        drop(header);

        state
            .segments
            .arena()
            .get(leaf)
            .set_child(slot, RawSlot::Ref { index, erasable: true });
        {
            let seg = state.segments.arena().get(leaf);
            let mut meta = seg.meta.lock().unwrap();
            meta.num_erasable += 1;
            meta.num_descendants = meta.num_descendants.saturating_sub(1);
            meta.num_reclaimable_bins = meta.num_reclaimable_bins.saturating_sub(1);
        }
        if became_marked && !was_marked {
            if let Some(root) = walker::nearest_stream_root(state, leaf) {
                walker::adjust_mark_count(state, root, class, 1);
            }
        } else if !became_marked && was_marked {
            if let Some(root) = walker::nearest_stream_root(state, leaf) {
                walker::adjust_mark_count(state, root, class, -1);
            }
        }
        if state.segments.arena().get(leaf).lock_count() == 0 {
            walker::run_unlock_duties(state, leaf);
        }
    }

    /// §4.5 `delete_stream_class`: applies delete semantics to every bin
    /// under `(stream, class)`.
    pub fn delete_stream_class(&self, class: u32, stream: u64, mark_if_non_empty: bool) {
        let (class, _) = Self::normalize(class, 0);
        let mut state = self.lock();
        let Some(root) = walker::find_stream_root(&state, stream) else {
            return;
        };
        let class_root = {
            let seg = state.segments.arena().get(root);
            seg.meta.lock().unwrap().classes[class as usize].get(Ordering::Acquire)
        };
        if let RawSlot::Ref { index, erasable: false } = class_root {
            self.delete_all_in_subtree(&mut state, index, class, mark_if_non_empty);
        }
    }

    fn delete_all_in_subtree(
        &self,
        state: &mut CacheState,
        idx: u32,
        class: u32,
        mark_if_non_empty: bool,
    ) {
        let is_leaf = state.segments.arena().get(idx).meta.lock().unwrap().is_leaf();
        if is_leaf {
            for slot in 0..NUM_CHILDREN {
                let value = state.segments.arena().get(idx).child(slot);
                if matches!(value, RawSlot::Ref { erasable: false, .. }) {
                    self.delete_bin_at(state, idx, slot, class, mark_if_non_empty);
                }
            }
            return;
        }
        for slot in 0..NUM_CHILDREN {
            if let RawSlot::Ref { index, erasable: false } = state.segments.arena().get(idx).child(slot) {
                self.delete_all_in_subtree(state, index, class, mark_if_non_empty);
            }
        }
    }

    /// §4.5 `mark_bin`.
    pub fn mark_bin(&self, class: u32, stream: u64, bin_id: u64, mark_state: bool) -> BinMarkInfo {
        let (class, bin_id) = Self::normalize(class, bin_id);
        let mut state = self.lock();
        let Some((leaf, slot)) = walker::find_leaf(&state, class, stream, bin_id) else {
            return BinMarkInfo::default();
        };
        let value = state.segments.arena().get(leaf).child(slot);
        match value {
            RawSlot::Null => BinMarkInfo::default(),
            RawSlot::CEmpty => BinMarkInfo {
                flags: BinFlags::default(),
                length: 0,
                is_complete: true,
            },
            RawSlot::Deleted => {
                state.segments.arena().get(leaf).set_child(slot, RawSlot::Null);
                {
                    let seg = state.segments.arena().get(leaf);
                    let mut meta = seg.meta.lock().unwrap();
                    meta.num_non_null = meta.num_non_null.saturating_sub(1);
                }
                if let Some(root) = walker::nearest_stream_root(&state, leaf) {
                    walker::adjust_mark_count(&state, root, class, -1);
                }
                BinMarkInfo {
                    flags: BinFlags {
                        deleted: true,
                        augmented: false,
                        marked: true,
                    },
                    length: 0,
                    is_complete: false,
                }
            }
            RawSlot::Ref { index, erasable: false } => {
                let header = state.bins.arena().get(index);
                let status = header.load_status();
                let non_empty = status.l > 0 || status.f;
                if mark_state && non_empty && status.m == Mark::None {
                    bin::set_mark(&header, Mark::Marked);
                    drop(header);
                    if let Some(root) = walker::nearest_stream_root(&state, leaf) {
                        walker::adjust_mark_count(&state, root, class, 1);
                    }
                    return BinMarkInfo {
                        flags: BinFlags {
                            deleted: false,
                            augmented: false,
                            marked: true,
                        },
                        length: status.l,
                        is_complete: status.is_complete(),
                    };
                }
                BinMarkInfo {
                    flags: BinFlags {
                        deleted: status.m == Mark::DeletedMarked,
                        augmented: status.m == Mark::AugmentedMarked,
                        marked: status.m.is_marked_at_all(),
                    },
                    length: status.l,
                    is_complete: status.is_complete(),
                }
            }
            RawSlot::Ref { erasable: true, .. } => BinMarkInfo::default(),
        }
    }

    /// §4.5 `stream_class_marked`.
    pub fn stream_class_marked(&self, class: Option<u32>, stream: u64) -> bool {
        let state = self.lock();
        let Some(root) = walker::find_stream_root(&state, stream) else {
            return false;
        };
        let seg = state.segments.arena().get(root);
        let meta = seg.meta.lock().unwrap();
        match class {
            Some(c) => meta.mark_counts[c as usize].load(Ordering::Relaxed) != 0,
            None => (0..state.config.num_classes)
                .filter(|&c| c != METADATA_CLASS)
                .any(|c| meta.mark_counts[c as usize].load(Ordering::Relaxed) != 0),
        }
    }

    /// §4.5 `preserve_bin`: forces a path to exist and sets `preserve` on
    /// every ancestor slot. Returns `false` on allocation failure.
    pub fn preserve_bin(&self, class: u32, stream: u64, bin_id: u64) -> bool {
        let (class, bin_id) = Self::normalize(class, bin_id);
        let mut state = self.lock();
        match walker::make_path(&mut state, class, stream, bin_id, true) {
            Some((leaf, _)) => {
                walker::unlock(&mut state, leaf);
                true
            }
            None => false,
        }
    }

    /// §4.5 `preserve_class_stream`: installs a default-preserve rule
    /// consulted by future `add_to_bin` calls for matching (class, stream)
    /// pairs. `stream = None` matches every stream.
    pub fn preserve_class_stream(&self, class: u32, stream: Option<u64>) {
        let (class, _) = Self::normalize(class, 0);
        let mut state = self.lock();
        state.default_preserve_rules.push((class, stream));
    }

    /// §4.5 `touch_bin`: trace-only, moving every node on the path to the
    /// MRU head of whichever reclaim list it's currently on.
    pub fn touch_bin(&self, class: u32, stream: u64, bin_id: u64) -> bool {
        let (class, bin_id) = Self::normalize(class, bin_id);
        let Some(path) =
            walker::trace_path(&self.inner.segments, &self.inner.state, class, stream, bin_id)
        else {
            return false;
        };
        let mut state = self.lock();
        for entry in &path.stack {
            let on_list = state.segments.arena().get(entry.seg).meta.lock().unwrap().on_reclaim_list;
            match on_list {
                Some(ReclaimList::Data) => {
                    let arena = state.segments.arena();
                    state.reclaim_data.push_front(arena, entry.seg, ReclaimList::Data);
                }
                Some(ReclaimList::Segs) => {
                    let arena = state.segments.arena();
                    state.reclaim_segs.push_front(arena, entry.seg, ReclaimList::Segs);
                }
                None => {}
            }
        }
        path.unwind_all(&mut state);
        true
    }

    /// §4.5 `set_all_marks` / `clear_all_marks`: a full recursive pass
    /// clearing `BIN_DELETED`/`SEG_DELETED` sentinels and normalizing
    /// every bin's `M` to `Marked` (if `mark_state`) or `None`, then
    /// recomputing every stream-root's `mark_counts` from scratch.
    pub fn set_all_marks(&self, mark_state: bool) {
        let mut state = self.lock();
        if let Some(root) = state.root {
            normalize_stream_roots(&mut state, root, mark_state);
        }
    }

    pub fn clear_all_marks(&self) {
        self.set_all_marks(false);
    }

    /// §4.5 `set_preferred_memory_limit`.
    pub fn set_preferred_memory_limit(&self, bytes: u64) {
        self.lock().config.preferred_memory_limit = bytes;
    }

    /// §4.5 `trim_to_preferred_memory_limit`.
    pub fn trim_to_preferred_memory_limit(&self) {
        let mut state = self.lock();
        let threshold = state.config.auto_trim_buf_threshold();
        if threshold == 0 {
            return;
        }
        let current = state.bufs.allocated();
        if current > threshold {
            self.reclaim_locked(&mut state, threshold);
        }
    }

    /// §4.5 `reclaim_data_bufs(n)`: reclaims buffers until at most `n`
    /// cells remain allocated, or the reclaimable-data list is exhausted.
    pub fn reclaim_data_bufs(&self, n: u64) {
        let mut state = self.lock();
        self.reclaim_locked(&mut state, n);
    }

    fn reclaim_locked(&self, state: &mut CacheState, target: u64) {
        let before = state.bufs.allocated();
        let mut locked_aside: Vec<u32> = Vec::new();
        loop {
            if state.bufs.allocated() <= target {
                break;
            }
            let arena = state.segments.arena();
            let Some(leaf) = state.reclaim_data.pop_back(arena, ReclaimList::Data) else {
                state.all_reclaimable_data_locked = true;
                break;
            };
            if state.segments.arena().get(leaf).lock_count() > 0 {
                locked_aside.push(leaf);
                continue;
            }
            for slot in 0..NUM_CHILDREN {
                let seg = state.segments.arena().get(leaf);
                let preserved = seg.meta.lock().unwrap().preserve_bit(slot);
                if preserved {
                    continue;
                }
                if let RawSlot::Ref { index, erasable: false } = seg.child(slot) {
                    seg.set_child(slot, RawSlot::Ref { index, erasable: true });
                    let mut meta = seg.meta.lock().unwrap();
                    meta.num_erasable += 1;
                    meta.num_descendants = meta.num_descendants.saturating_sub(1);
                    meta.num_reclaimable_bins = meta.num_reclaimable_bins.saturating_sub(1);
                }
            }
            state.segments.arena().get(leaf).acquire();
            walker::unlock(state, leaf);
        }
        for idx in locked_aside {
            let arena = state.segments.arena();
            state.reclaim_data.push_front(arena, idx, ReclaimList::Data);
        }
        let after = state.bufs.allocated();
        self.inner
            .stats
            .note_reclaimed(before.saturating_sub(after) * CELL_BYTES as u64);
    }

    /// §6 `scan_bins`, simplified to a full-subtree snapshot of one
    /// `(stream, class)` rather than the original's resumable
    /// filtered cursor (`trace_next`'s `bin0_only`/`preserved_only`/
    /// `skip_unmarked`/`skip_meta` flags) — see DESIGN.md.
    pub fn scan_bins(&self, class: u32, stream: u64) -> Vec<ScanEntry> {
        let is_tile_header_query = class == TILE_HEADER_CLASS;
        let (internal_class, _) = Self::normalize(class, 0);
        let state = self.lock();
        let mut out = Vec::new();
        let Some(root) = walker::find_stream_root(&state, stream) else {
            return out;
        };
        let class_root = {
            let seg = state.segments.arena().get(root);
            seg.meta.lock().unwrap().classes[internal_class as usize].get(Ordering::Acquire)
        };
        if let RawSlot::Ref { index, erasable: false } = class_root {
            collect_bins(&state, index, internal_class, &mut out);
        }
        if is_tile_header_query {
            out.retain(|e| e.bin > 0);
            for e in &mut out {
                e.class = TILE_HEADER_CLASS;
                e.bin -= 1;
            }
        }
        out
    }

    /// Opens a new read cursor sharing this cache's tree.
    pub fn reader(&self) -> Reader {
        Reader {
            cache: self.clone(),
            scope: None,
            last_stream: None,
        }
    }

    pub fn get_peak_cache_memory(&self) -> u64 {
        self.inner.stats.peak_cache_memory()
    }

    pub fn get_reclaimed_memory(&self) -> u64 {
        self.inner.stats.reclaimed_memory()
    }

    pub fn get_transferred_bytes(&self, class: u32) -> u64 {
        self.inner.stats.transferred_bytes(class)
    }

    pub fn get_max_codestream_id(&self) -> i64 {
        self.lock().max_codestream_id
    }
}

fn normalize_tree(state: &CacheState, idx: u32, mark_state: bool) -> u32 {
    let is_leaf = state.segments.arena().get(idx).meta.lock().unwrap().is_leaf();
    let mut count = 0u32;
    for slot in 0..NUM_CHILDREN {
        let value = state.segments.arena().get(idx).child(slot);
        match value {
            RawSlot::Deleted => {
                state.segments.arena().get(idx).set_child(slot, RawSlot::Null);
                let seg = state.segments.arena().get(idx);
                let mut meta = seg.meta.lock().unwrap();
                meta.num_non_null = meta.num_non_null.saturating_sub(1);
            }
            RawSlot::Ref { index, erasable: false } if is_leaf => {
                let header = state.bins.arena().get(index);
                let status = header.load_status();
                let non_empty = status.l > 0 || status.f;
                let new_m = if mark_state && non_empty { Mark::Marked } else { Mark::None };
                if new_m != status.m {
                    bin::set_mark(&header, new_m);
                }
                if new_m != Mark::None {
                    count += 1;
                }
            }
            RawSlot::Ref { index, erasable: false } => {
                count += normalize_tree(state, index, mark_state);
            }
            _ => {}
        }
    }
    count
}

fn normalize_stream_roots(state: &CacheState, idx: u32, mark_state: bool) {
    let role = state.segments.arena().get(idx).meta.lock().unwrap().role;
    if role == NodeRole::StreamRoot {
        let num_classes = state.config.num_classes;
        for c in 0..num_classes {
            let child = state.segments.arena().get(idx).meta.lock().unwrap().classes[c as usize]
                .get(Ordering::Acquire);
            let count = match child {
                RawSlot::Ref { index, erasable: false } => normalize_tree(state, index, mark_state),
                _ => 0,
            };
            state.segments.arena().get(idx).meta.lock().unwrap().mark_counts[c as usize]
                .store(count, Ordering::Relaxed);
        }
        return;
    }
    for slot in 0..NUM_CHILDREN {
        if let RawSlot::Ref { index, erasable: false } = state.segments.arena().get(idx).child(slot) {
            normalize_stream_roots(state, index, mark_state);
        }
    }
}

fn collect_bins(state: &CacheState, idx: u32, class: u32, out: &mut Vec<ScanEntry>) {
    let (is_leaf, base, shift) = {
        let seg = state.segments.arena().get(idx);
        let meta = seg.meta.lock().unwrap();
        (meta.is_leaf(), meta.base_id, meta.shift)
    };
    for slot in 0..NUM_CHILDREN {
        let value = state.segments.arena().get(idx).child(slot);
        if is_leaf {
            let bin_id = base + slot as u64;
            match value {
                RawSlot::Ref { index, erasable: false } => {
                    let header = state.bins.arena().get(index);
                    let status = header.load_status();
                    out.push(ScanEntry {
                        class,
                        bin: bin_id,
                        length: status.l,
                        is_complete: status.is_complete(),
                        flags: BinFlags {
                            deleted: status.m == Mark::DeletedMarked,
                            augmented: status.m == Mark::AugmentedMarked,
                            marked: status.m.is_marked_at_all(),
                        },
                    });
                }
                RawSlot::CEmpty => out.push(ScanEntry {
                    class,
                    bin: bin_id,
                    length: 0,
                    is_complete: true,
                    flags: BinFlags::default(),
                }),
                RawSlot::Deleted => out.push(ScanEntry {
                    class,
                    bin: bin_id,
                    length: 0,
                    is_complete: false,
                    flags: BinFlags {
                        deleted: true,
                        augmented: false,
                        marked: true,
                    },
                }),
                _ => {}
            }
        } else if let RawSlot::Ref { index, erasable: false } = value {
            collect_bins(state, index, class, out);
        } else if value == RawSlot::Deleted {
            // An un-instantiated subtree lost to a failed growth attempt:
            // report one sentinel entry for the whole range rather than
            // fabricating a record per never-allocated bin underneath it.
            let bin_id = base + (slot as u64) * (1u64 << shift);
            out.push(ScanEntry {
                class,
                bin: bin_id,
                length: 0,
                is_complete: false,
                flags: BinFlags {
                    deleted: true,
                    augmented: false,
                    marked: true,
                },
            });
        }
    }
}

struct ScopeState {
    walker: Walker,
    length: u32,
    is_complete: bool,
    pos: u32,
}

/// A per-caller read cursor (§4.5's `set_read_scope`/`seek`/`read` family,
/// §6's reader surface). Holds one access-lock chain alive on the scoped
/// bin's path for as long as the scope is active; changing or dropping the
/// scope unwinds it, which may trigger deferred erasure exactly as any
/// other unlock would.
pub struct Reader {
    cache: Cache,
    scope: Option<ScopeState>,
    last_stream: Option<u64>,
}

impl Reader {
    /// §4.5/§6 `set_read_scope`. Returns the bin's current contiguous
    /// length (0 if absent). Requesting the tile-header alias before any
    /// prior scope was set on that stream is a developer error.
    pub fn set_read_scope(&mut self, class: u32, stream: u64, bin_id: u64) -> Result<u32> {
        if class == TILE_HEADER_CLASS && self.last_stream != Some(stream) {
            return Err(Error::ReadScopeNotSet);
        }
        let (class, bin_id) = Cache::normalize(class, bin_id);
        self.close_scope();
        self.last_stream = Some(stream);
        match walker::trace_path(
            &self.cache.inner.segments,
            &self.cache.inner.state,
            class,
            stream,
            bin_id,
        ) {
            Some(path) => {
                let entry = path.leaf().expect("trace_path leaves a leaf entry on success");
                let value = self.cache.inner.segments.get(entry.seg).child(entry.slot);
                let (length, is_complete) = match value {
                    RawSlot::Ref { index, erasable: false } => {
                        let status = self.cache.inner.bins.get(index).load_status();
                        (status.l, status.is_complete())
                    }
                    RawSlot::CEmpty => (0, true),
                    _ => (0, false),
                };
                self.scope = Some(ScopeState { walker: path, length, is_complete, pos: 0 });
                Ok(length)
            }
            None => {
                self.scope = None;
                Ok(0)
            }
        }
    }

    fn close_scope(&mut self) {
        if let Some(scope) = self.scope.take() {
            let mut state = self.cache.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            scope.walker.unwind_all(&mut state);
        }
    }

    /// §6 `get_bin_length`.
    pub fn get_bin_length(&self) -> u32 {
        self.scope.as_ref().map_or(0, |s| s.length)
    }

    /// Whether the scoped bin's current contents are known-complete.
    pub fn is_complete(&self) -> bool {
        self.scope.as_ref().is_some_and(|s| s.is_complete)
    }

    /// §6 `seek`.
    pub fn seek(&mut self, offset: u32) {
        if let Some(scope) = &mut self.scope {
            scope.pos = offset;
        }
    }

    /// §6 `get_pos`.
    pub fn get_pos(&self) -> u32 {
        self.scope.as_ref().map_or(0, |s| s.pos)
    }

    /// §6 `read`. Copies up to `buf.len()` bytes starting at the current
    /// position, advances the position, and returns the number copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some(scope) = &mut self.scope else {
            return 0;
        };
        let entry = scope.walker.leaf().expect("a live scope always holds its leaf entry");
        let value = self.cache.inner.segments.get(entry.seg).child(entry.slot);
        let RawSlot::Ref { index, erasable: false } = value else {
            return 0;
        };
        let header = self.cache.inner.bins.get(index);
        let bytes = bin::read_range(&self.cache.inner.bufs, &header, scope.pos, buf.len());
        let n = bytes.len();
        buf[..n].copy_from_slice(&bytes);
        scope.pos += n as u32;
        n
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close_scope();
    }
}
