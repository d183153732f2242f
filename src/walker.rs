//! Path walker and the access-lock protocol (§4.4).
//!
//! The walker is the only code that descends the segment tree. Writers call
//! [`make_path`] holding the cache mutex for the whole operation; readers
//! call [`trace_path`] holding no lock at all, synchronizing purely through
//! per-node `access_ctl` increments plus a re-read-and-verify of the parent
//! slot (the same acquire/verify/retry shape as a seqlock reader). Dropping
//! the last lock on a node (`unwind`) is the sole trigger for the "unlock
//! duties" described below, and is the only place erasure and MRU-list
//! maintenance happen.
use crate::arena::Arena;
use crate::bin::{self, Mark};
use crate::cache::state::CacheState;
use crate::config::{NUM_CHILDREN, SHIFT_STEP, STREAM_CLASS_SENTINEL};
use crate::segment::{NodeRole, ReclaimList, Segment, SegmentMeta};
use crate::slot::RawSlot;

/// One entry of a walker's path stack: the segment visited, and whether
/// this walk incremented its `access_ctl` (readers always do; writers only
/// need to track it so `unwind` knows what to release).
pub(crate) struct PathEntry {
    pub(crate) seg: u32,
    pub(crate) slot: usize,
}

/// An in-progress traversal. Writers build one inside `make_path` and
/// discard it once the leaf is reached (the mutex is held throughout, so
/// there is nothing to unwind asynchronously). Readers keep one alive for
/// as long as they hold locks on the path, then call `unwind_all`.
#[derive(Default)]
pub(crate) struct Walker {
    pub(crate) stack: Vec<PathEntry>,
}

impl Walker {
    pub(crate) fn leaf(&self) -> Option<&PathEntry> {
        self.stack.last()
    }

    /// Releases every lock this walker holds, from the leaf back to the
    /// root, running unlock duties wherever a release brings a node's
    /// counter to zero.
    pub(crate) fn unwind_all(mut self, state: &mut CacheState) {
        while let Some(entry) = self.stack.pop() {
            unlock(state, entry.seg);
        }
    }
}

/// Grows the tree upward until `root` covers `target_id`, inserting new
/// stream-nav (or class-nav) nodes above it. Returns the new root index, or
/// `None` on simulated allocation failure (in which case the old root has
/// `container_deleted` latched, per §4.4's CONTAINER_DELETED rule).
fn grow_upward(
    state: &mut CacheState,
    mut root: u32,
    target_id: u64,
    stream_id: i64,
    class_id: u32,
) -> Option<u32> {
    loop {
        let covers = state
            .segments
            .arena()
            .get(root)
            .meta
            .lock()
            .unwrap()
            .covers(target_id);
        if covers {
            return Some(root);
        }
        let Some(new_idx) = state.get_segment() else {
            state
                .segments
                .arena()
                .get(root)
                .meta
                .lock()
                .unwrap()
                .container_deleted = true;
            return None;
        };
        let (old_shift, old_base, old_container_deleted) = {
            let seg = state.segments.arena().get(root);
            let meta = seg.meta.lock().unwrap();
            (meta.shift, meta.base_id, meta.container_deleted)
        };
        {
            let new_seg = state.segments.arena().get(new_idx);
            let mut meta = new_seg.meta.lock().unwrap();
            meta.role = if stream_id < 0 {
                NodeRole::StreamNav
            } else {
                NodeRole::ClassNav
            };
            meta.shift = old_shift + SHIFT_STEP;
            meta.stream_id = stream_id;
            meta.class_id = class_id;
            meta.base_id = old_base - (old_base % (NUM_CHILDREN as u64 << meta.shift).max(1));
            meta.container = None;
            meta.container_deleted = old_container_deleted;
            drop(meta);
            new_seg.set_child(0, RawSlot::Ref {
                index: root,
                erasable: false,
            });
            if old_container_deleted {
                for i in 1..NUM_CHILDREN {
                    new_seg.set_child(i, RawSlot::Deleted);
                }
            }
        }
        {
            let old_seg = state.segments.arena().get(root);
            let mut meta = old_seg.meta.lock().unwrap();
            meta.container = Some(new_idx);
            meta.pos_in_container = 0;
        }
        root = new_idx;
    }
}

/// Writer-context path build (§4.4 `make_path`). Creates any missing node
/// along the way, growing the tree upward first if `stream` doesn't fit
/// under the current root. Returns the leaf segment index and the bin slot
/// within it, or `None` on allocation failure.
pub(crate) fn make_path(
    state: &mut CacheState,
    class: u32,
    stream: u64,
    bin: u64,
    force_preserve: bool,
) -> Option<(u32, usize)> {
    if state.root.is_none() {
        let idx = state.get_segment()?;
        let seg = state.segments.arena().get(idx);
        let mut meta = seg.meta.lock().unwrap();
        meta.role = NodeRole::StreamNav;
        meta.shift = SHIFT_STEP;
        meta.stream_id = -1;
        meta.class_id = STREAM_CLASS_SENTINEL;
        meta.base_id = 0;
        drop(meta);
        state.root = Some(idx);
    }

    let root = grow_upward(state, state.root.unwrap(), stream, -1, STREAM_CLASS_SENTINEL)?;
    state.root = Some(root);

    let mut cur = root;
    let mut ancestors = vec![cur];
    // descend stream-nav levels until a stream-root is reached
    loop {
        let (shift, role) = {
            let seg = state.segments.arena().get(cur);
            let meta = seg.meta.lock().unwrap();
            (meta.shift, meta.role)
        };
        if role == NodeRole::StreamRoot {
            break;
        }
        let slot_idx = {
            let seg = state.segments.arena().get(cur);
            seg.meta.lock().unwrap().slot_for(stream)
        };
        let child = state.segments.arena().get(cur).child(slot_idx);
        let child = clear_sentinel_or_tag(state, cur, slot_idx, child);
        let next = match child {
            RawSlot::Ref { index, .. } => index,
            RawSlot::Null => {
                let new_idx = state.get_segment()?;
                let seg = state.segments.arena().get(new_idx);
                let mut meta = seg.meta.lock().unwrap();
                if shift == SHIFT_STEP {
                    meta.role = NodeRole::StreamRoot;
                    meta.shift = 0;
                    meta.stream_id = stream as i64;
                    meta.class_id = STREAM_CLASS_SENTINEL;
                    meta.base_id = stream;
                } else {
                    meta.role = NodeRole::StreamNav;
                    meta.shift = shift - SHIFT_STEP;
                    meta.stream_id = -1;
                    meta.class_id = STREAM_CLASS_SENTINEL;
                    let parent_base = state
                        .segments
                        .arena()
                        .get(cur)
                        .meta
                        .lock()
                        .unwrap()
                        .base_id;
                    meta.base_id = parent_base + (slot_idx as u64) * (1u64 << meta.shift);
                }
                meta.container = Some(cur);
                meta.pos_in_container = slot_idx as u32;
                drop(meta);
                let parent = state.segments.arena().get(cur);
                parent.set_child(slot_idx, RawSlot::Ref {
                    index: new_idx,
                    erasable: false,
                });
                parent.meta.lock().unwrap().num_descendants += 1;
                parent.meta.lock().unwrap().num_non_null += 1;
                new_idx
            }
            _ => unreachable!("stream-nav descent must not see a leaf sentinel"),
        };
        state.segments.arena().get(next).acquire();
        ancestors.push(next);
        cur = next;
    }

    // `cur` is now a stream-root. Select/create the class-nav root.
    let existing_class_root = {
        let seg = state.segments.arena().get(cur);
        let meta = seg.meta.lock().unwrap();
        meta.classes[class as usize].get(std::sync::atomic::Ordering::Acquire)
    };
    let class_root = match existing_class_root {
        RawSlot::Ref { index, .. } => index,
        _ => {
            let new_idx = state.get_segment()?;
            let seg = state.segments.arena().get(new_idx);
            let mut meta = seg.meta.lock().unwrap();
            meta.role = NodeRole::ClassNav;
            meta.shift = 0;
            meta.stream_id = cur_stream_id(state, cur);
            meta.class_id = class;
            meta.base_id = 0;
            meta.container = Some(cur);
            meta.pos_in_container = class;
            drop(meta);
            let parent = state.segments.arena().get(cur);
            parent.meta.lock().unwrap().classes[class as usize]
                .set(RawSlot::Ref { index: new_idx, erasable: false }, std::sync::atomic::Ordering::Release);
            new_idx
        }
    };
    state.segments.arena().get(class_root).acquire();
    ancestors.push(class_root);
    cur = class_root;

    // Grow the class-nav subtree upward if `bin` overflows its current range.
    let grown = grow_upward(state, cur, bin, cur_stream_id(state, cur), class)?;
    if grown != cur {
        // Re-home the stream-root's classes[] pointer onto the new subtree
        // root, and register the walker's lock on it instead.
        let stream_root = state
            .segments
            .arena()
            .get(grown)
            .meta
            .lock()
            .unwrap()
            .container
            .expect("grow_upward keeps the stream-root linked as container of the new root's base child");
        let seg = state.segments.arena().get(stream_root);
        seg.meta.lock().unwrap().classes[class as usize]
            .set(RawSlot::Ref { index: grown, erasable: false }, std::sync::atomic::Ordering::Release);
        state.segments.arena().get(grown).acquire();
        ancestors.push(grown);
        cur = grown;
    }

    // Descend class-nav levels to the leaf.
    loop {
        let (shift, is_leaf) = {
            let seg = state.segments.arena().get(cur);
            let meta = seg.meta.lock().unwrap();
            (meta.shift, meta.is_leaf())
        };
        if is_leaf {
            break;
        }
        let slot_idx = {
            let seg = state.segments.arena().get(cur);
            seg.meta.lock().unwrap().slot_for(bin)
        };
        let child = state.segments.arena().get(cur).child(slot_idx);
        let child = clear_sentinel_or_tag(state, cur, slot_idx, child);
        let next = match child {
            RawSlot::Ref { index, .. } => index,
            RawSlot::Null => {
                let new_idx = state.get_segment()?;
                let seg = state.segments.arena().get(new_idx);
                let mut meta = seg.meta.lock().unwrap();
                meta.role = NodeRole::ClassNav;
                meta.shift = shift - SHIFT_STEP;
                meta.stream_id = cur_stream_id(state, cur);
                meta.class_id = class;
                let parent_base = state
                    .segments
                    .arena()
                    .get(cur)
                    .meta
                    .lock()
                    .unwrap()
                    .base_id;
                meta.base_id = parent_base + (slot_idx as u64) * (1u64 << meta.shift);
                meta.container = Some(cur);
                meta.pos_in_container = slot_idx as u32;
                drop(meta);
                let parent = state.segments.arena().get(cur);
                parent.set_child(slot_idx, RawSlot::Ref { index: new_idx, erasable: false });
                let mut pm = parent.meta.lock().unwrap();
                pm.num_descendants += 1;
                pm.num_non_null += 1;
                new_idx
            }
            _ => unreachable!("class-nav descent must not see a bin sentinel above the leaf"),
        };
        state.segments.arena().get(next).acquire();
        ancestors.push(next);
        cur = next;
    }

    let leaf = cur;
    let slot_idx = {
        let seg = state.segments.arena().get(leaf);
        seg.meta.lock().unwrap().slot_for(bin)
    };
    // Untag the target bin slot if it was erasure-tagged.
    let existing = state.segments.arena().get(leaf).child(slot_idx);
    if existing.is_erasable() {
        state.segments.arena().get(leaf).set_child(slot_idx, existing.untagged());
        let seg = state.segments.arena().get(leaf);
        let mut meta = seg.meta.lock().unwrap();
        meta.num_erasable -= 1;
        meta.num_descendants += 1;
    }

    if force_preserve {
        for &a in &ancestors {
            let seg = state.segments.arena().get(a);
            let mut meta = seg.meta.lock().unwrap();
            if !meta.preserve_bit(slot_idx) {
                meta.set_preserve_bit(slot_idx);
            }
        }
    }

    // make_path holds the mutex for its whole duration: release the
    // temporary descent locks it took on interior ancestors (only the
    // leaf's lock is meaningful to a writer, which never blocks on
    // access_ctl itself).
    for a in ancestors.into_iter().rev() {
        if a != leaf {
            release_descent_lock(state, a);
        }
    }

    Some((leaf, slot_idx))
}

fn cur_stream_id(state: &CacheState, seg_idx: u32) -> i64 {
    state
        .segments
        .arena()
        .get(seg_idx)
        .meta
        .lock()
        .unwrap()
        .stream_id
}

/// Clears a `SEG_DELETED` sentinel (reporting it consumed) and strips the
/// erasure tag from a live pointer encountered mid-descent, per step 3 of
/// `make_path`.
fn clear_sentinel_or_tag(state: &mut CacheState, container: u32, slot: usize, value: RawSlot) -> RawSlot {
    match value {
        RawSlot::Deleted => {
            let seg = state.segments.arena().get(container);
            seg.set_child(slot, RawSlot::Null);
            let mut meta = seg.meta.lock().unwrap();
            meta.num_non_null = meta.num_non_null.saturating_sub(1);
            RawSlot::Null
        }
        RawSlot::Ref { index, erasable: true } => {
            let seg = state.segments.arena().get(container);
            let untagged = RawSlot::Ref { index, erasable: false };
            seg.set_child(slot, untagged);
            let mut meta = seg.meta.lock().unwrap();
            meta.num_erasable = meta.num_erasable.saturating_sub(1);
            meta.num_descendants += 1;
            untagged
        }
        other => other,
    }
}

/// Releases a lock taken purely to traverse through an interior node during
/// `make_path`, which (since the whole operation runs under the mutex) can
/// safely run unlock duties inline rather than deferring.
fn release_descent_lock(state: &mut CacheState, idx: u32) {
    let count = state.segments.arena().get(idx).lock_count();
    if count == 0 {
        return;
    }
    state.segments.arena().get(idx).release_to_zero_under_mutex();
    if state.segments.arena().get(idx).lock_count() == 0 {
        run_unlock_duties(state, idx);
    }
}

/// Reader-context path trace (§4.4 `trace_path`). Descends purely through
/// `segments`/`bins` (no mutex held) acquiring one lock per level and
/// re-verifying the parent slot; the cache mutex is only ever taken on the
/// rare `lock_failed` recovery path below, never on the common-case
/// descent. Returns a `Walker` holding one lock per level down to the
/// leaf, or `None` if the path doesn't (yet) exist or a sentinel/
/// erasure-tagged entry was encountered (readers must not follow those).
pub(crate) fn trace_path(
    segments: &Arena<Segment>,
    state_mutex: &std::sync::Mutex<CacheState>,
    class: u32,
    stream: u64,
    bin: u64,
) -> Option<Walker> {
    'restart: loop {
        let mut walker = Walker::default();
        let root = state_mutex.lock().unwrap().root?;
        if !acquire_and_verify(segments, state_mutex, None, 0, root) {
            continue 'restart;
        }
        walker.stack.push(PathEntry { seg: root, slot: 0 });
        let mut cur = root;

        loop {
            let (role, shift, base) = {
                let seg = segments.get(cur);
                let meta = seg.meta.lock().unwrap();
                (meta.role, meta.shift, meta.base_id)
            };
            if role == NodeRole::StreamRoot {
                let slot_idx = class as usize;
                let child = segments
                    .get(cur)
                    .meta
                    .lock()
                    .unwrap()
                    .classes[slot_idx]
                    .get(std::sync::atomic::Ordering::Acquire);
                let RawSlot::Ref { index: next, erasable: false } = child else {
                    walker.unwind_all_locked(state_mutex);
                    return None;
                };
                if !acquire_and_verify_class(segments, state_mutex, cur, slot_idx, next) {
                    continue 'restart;
                }
                walker.stack.push(PathEntry { seg: next, slot: slot_idx });
                cur = next;
                continue;
            }

            let is_leaf = segments.get(cur).meta.lock().unwrap().is_leaf();
            let id = if role == NodeRole::StreamNav { stream } else { bin };
            let slot_idx = (((id - base) >> shift) & (NUM_CHILDREN as u64 - 1)) as usize;
            if is_leaf {
                walker.stack.last_mut().unwrap().slot = slot_idx;
                return Some(walker);
            }
            let child = segments.get(cur).child(slot_idx);
            let RawSlot::Ref { index: next, erasable: false } = child else {
                walker.unwind_all_locked(state_mutex);
                return None;
            };
            if !acquire_and_verify(segments, state_mutex, Some(cur), slot_idx, next) {
                continue 'restart;
            }
            walker.stack.push(PathEntry { seg: next, slot: slot_idx });
            cur = next;
        }
    }
}

impl Walker {
    fn unwind_all_locked(self, state_mutex: &std::sync::Mutex<CacheState>) {
        let mut state = state_mutex.lock().unwrap();
        self.unwind_all(&mut state);
    }
}

/// Acquires a lock on `target` then re-reads `parent`'s slot to confirm it
/// still points at `target`; this is the seqlock-style verify step that
/// lets descent avoid the cache mutex in the common case. On mismatch, the
/// lock just taken is released via `lock_failed` (which does take the
/// mutex) and the whole trace restarts from the root.
fn acquire_and_verify(
    segments: &Arena<Segment>,
    state_mutex: &std::sync::Mutex<CacheState>,
    parent: Option<u32>,
    parent_slot: usize,
    target: u32,
) -> bool {
    segments.get(target).acquire();
    if let Some(p) = parent {
        let current = segments.get(p).child(parent_slot);
        if current != (RawSlot::Ref { index: target, erasable: false }) {
            let mut state = state_mutex.lock().unwrap();
            lock_failed(&mut state, segments, target);
            return false;
        }
    }
    true
}

fn acquire_and_verify_class(
    segments: &Arena<Segment>,
    state_mutex: &std::sync::Mutex<CacheState>,
    stream_root: u32,
    class: usize,
    target: u32,
) -> bool {
    segments.get(target).acquire();
    let current = segments
        .get(stream_root)
        .meta
        .lock()
        .unwrap()
        .classes[class]
        .get(std::sync::atomic::Ordering::Acquire);
    if current != (RawSlot::Ref { index: target, erasable: false }) {
        let mut state = state_mutex.lock().unwrap();
        lock_failed(&mut state, segments, target);
        return false;
    }
    true
}

/// Invoked when a reader's pointer re-verify fails: the lock it just took
/// on `target` is released (possibly running unlock duties) under the
/// mutex, which the caller already holds. `segments` is the same shared
/// arena the caller was descending through; `CacheState`'s own pool holds
/// the identical `Arc`, so either handle reaches the same segment.
fn lock_failed(state: &mut CacheState, segments: &Arena<Segment>, target: u32) {
    segments.get(target).release_to_zero_under_mutex();
    if segments.get(target).lock_count() == 0 {
        run_unlock_duties(state, target);
    }
}

/// Drops one lock on `seg`, running unlock duties if this brings it to
/// zero. Mirrors `unwind`'s per-node behavior; used by both reader unwind
/// and writer descent-lock release.
pub(crate) fn unlock(state: &mut CacheState, seg: u32) {
    if state.segments.arena().get(seg).try_release_above_zero() {
        return;
    }
    state.segments.arena().get(seg).release_to_zero_under_mutex();
    if state.segments.arena().get(seg).lock_count() == 0 {
        run_unlock_duties(state, seg);
    }
}

/// The three unlock duties run whenever a node's `access_ctl` is brought to
/// zero under the mutex (§4.4). Also called directly by writer operations
/// (`Cache::delete_bin` and friends) right after tagging a slot erasable,
/// when no reader currently holds a lock on the node — in that case the
/// collapse can happen immediately rather than waiting for some later
/// unlock to trigger it.
pub(crate) fn run_unlock_duties(state: &mut CacheState, idx: u32) {
    erase_erasables(state, idx);
    maybe_become_reclaimable(state, idx);
    maybe_become_erasable(state, idx);
}

fn erase_erasables(state: &mut CacheState, idx: u32) {
    let is_leaf = {
        let meta = state.segments.arena().get(idx).meta.lock().unwrap();
        if meta.num_erasable == 0 {
            return;
        }
        meta.is_leaf()
    };
    let stream_root = nearest_stream_root(state, idx);
    for slot in 0..NUM_CHILDREN {
        let value = state.segments.arena().get(idx).child(slot);
        if !value.is_erasable() {
            continue;
        }
        if is_leaf {
            erase_bin(state, idx, slot, value, stream_root);
        } else {
            erase_subtree(state, idx, slot, value, stream_root);
        }
    }
}

fn erase_bin(state: &mut CacheState, container: u32, slot: usize, value: RawSlot, stream_root: Option<u32>) {
    let RawSlot::Ref { index: bin_idx, .. } = value else { return };
    let header = state.bins.arena().get(bin_idx);
    let status = header.load_status();
    let was_marked = status.m.is_marked_at_all();
    // A fully-known-empty bin (L==0, final byte known) becomes CEMPTY; a
    // deleted-but-marked bin keeps a SEG_DELETED-style sentinel so the mark
    // survives; anything else collapses to NULL. Either way the header's
    // own payload/hole cells and pooled slot are freed here — nothing
    // downstream needs the pooled `BinHeader` object once erased.
    let new_slot = if status.is_complete() && status.l == 0 {
        RawSlot::CEmpty
    } else if status.m.is_deleted() {
        RawSlot::Deleted
    } else {
        RawSlot::Null
    };
    bin::release_all(&mut state.bufs, &header);
    drop(header);
    state.bins.release(bin_idx);
    let seg = state.segments.arena().get(container);
    seg.set_child(slot, new_slot);
    {
        let mut meta = seg.meta.lock().unwrap();
        meta.num_erasable = meta.num_erasable.saturating_sub(1);
        if new_slot == RawSlot::Null {
            meta.num_non_null = meta.num_non_null.saturating_sub(1);
        }
    }
    if was_marked {
        if let Some(root) = stream_root {
            adjust_mark_count(state, root, class_of(state, container), -1);
        }
    }
}

fn erase_subtree(state: &mut CacheState, container: u32, slot: usize, value: RawSlot, stream_root: Option<u32>) {
    let RawSlot::Ref { index: child_idx, .. } = value else { return };
    let num_collapsed = recycle_subtree(state, child_idx);
    let seg = state.segments.arena().get(container);
    if num_collapsed > 0 {
        seg.set_child(slot, RawSlot::Deleted);
    } else {
        seg.set_child(slot, RawSlot::Null);
    }
    let mut meta = seg.meta.lock().unwrap();
    meta.num_erasable = meta.num_erasable.saturating_sub(1);
    if num_collapsed == 0 {
        meta.num_non_null = meta.num_non_null.saturating_sub(1);
    }
    drop(meta);
    if num_collapsed > 0 {
        // invariant 8: collapsing N marked entries into one SEG_DELETED
        // sentinel removes N-1 marks from the class's count, net -N+1.
        if let Some(root) = stream_root {
            adjust_mark_count(state, root, class_of(state, container), -(num_collapsed as i64) + 1);
        }
    }
}

/// Recursively frees a whole subtree rooted at `idx`, returning the exact
/// number of marked elements found within it — a marked bin counts 1, a
/// nested `SEG_DELETED` sentinel (itself already a collapse of one or more
/// marks) counts 1 — so the caller can apply invariant 8's precise
/// `-num_collapsed+1` adjustment to the class's mark count.
fn recycle_subtree(state: &mut CacheState, idx: u32) -> u32 {
    let is_leaf = state.segments.arena().get(idx).meta.lock().unwrap().is_leaf();
    let mut num_marks = 0u32;
    for slot in 0..NUM_CHILDREN {
        let value = state.segments.arena().get(idx).child(slot);
        match value {
            RawSlot::Deleted => num_marks += 1,
            RawSlot::Ref { index, .. } if is_leaf => {
                let header = state.bins.arena().get(index);
                if header.load_status().m.is_marked_at_all() {
                    num_marks += 1;
                }
                bin::release_all(&mut state.bufs, &header);
                drop(header);
                state.bins.release(index);
            }
            RawSlot::Ref { index, .. } => {
                num_marks += recycle_subtree(state, index);
            }
            _ => {}
        }
    }
    {
        let seg = state.segments.arena().get(idx);
        for slot in 0..NUM_CHILDREN {
            seg.set_child(slot, RawSlot::Null);
        }
        let mut meta = seg.meta.lock().unwrap();
        meta.container = None;
        meta.reclaim_prev = None;
        meta.reclaim_next = None;
        meta.on_reclaim_list = None;
    }
    state.segments.release(idx);
    num_marks
}

/// Writer-context lookup that descends an existing path without creating
/// anything and without touching `access_ctl` — safe because the caller
/// already holds the cache mutex, which already excludes every other
/// writer and every `lock_failed` recovery. Mirrors `trace_path`'s descent
/// shape exactly, minus the lock-acquire/verify dance that only matters
/// when no mutex is held.
pub(crate) fn find_leaf(state: &CacheState, class: u32, stream: u64, bin: u64) -> Option<(u32, usize)> {
    let mut cur = state.root?;
    loop {
        let (role, shift, base) = {
            let seg = state.segments.arena().get(cur);
            let meta = seg.meta.lock().unwrap();
            (meta.role, meta.shift, meta.base_id)
        };
        if role == NodeRole::StreamRoot {
            let slot_idx = class as usize;
            let child = state
                .segments
                .arena()
                .get(cur)
                .meta
                .lock()
                .unwrap()
                .classes[slot_idx]
                .get(std::sync::atomic::Ordering::Acquire);
            let RawSlot::Ref { index, erasable: false } = child else {
                return None;
            };
            cur = index;
            continue;
        }
        let id = if role == NodeRole::StreamNav { stream } else { bin };
        let (is_leaf, covers) = {
            let seg = state.segments.arena().get(cur);
            let meta = seg.meta.lock().unwrap();
            (meta.is_leaf(), meta.covers(id))
        };
        if !covers {
            return None;
        }
        let slot_idx = (((id - base) >> shift) & (NUM_CHILDREN as u64 - 1)) as usize;
        if is_leaf {
            return Some((cur, slot_idx));
        }
        let child = state.segments.arena().get(cur).child(slot_idx);
        let RawSlot::Ref { index, erasable: false } = child else {
            return None;
        };
        cur = index;
    }
}

/// Locates the stream-root for `stream` without creating anything, for
/// queries (`stream_class_marked`) that only need the per-class mark
/// counts and never touch a specific bin.
pub(crate) fn find_stream_root(state: &CacheState, stream: u64) -> Option<u32> {
    let mut cur = state.root?;
    loop {
        let (role, shift, base, covers) = {
            let seg = state.segments.arena().get(cur);
            let meta = seg.meta.lock().unwrap();
            (meta.role, meta.shift, meta.base_id, meta.covers(stream))
        };
        if role == NodeRole::StreamRoot {
            return Some(cur);
        }
        if !covers {
            return None;
        }
        let slot_idx = (((stream - base) >> shift) & (NUM_CHILDREN as u64 - 1)) as usize;
        let child = state.segments.arena().get(cur).child(slot_idx);
        let RawSlot::Ref { index, erasable: false } = child else {
            return None;
        };
        cur = index;
    }
}

pub(crate) fn class_of(state: &CacheState, mut idx: u32) -> u32 {
    loop {
        let seg = state.segments.arena().get(idx);
        let meta = seg.meta.lock().unwrap();
        if meta.class_id != STREAM_CLASS_SENTINEL {
            return meta.class_id;
        }
        match meta.container {
            Some(c) => {
                drop(meta);
                idx = c;
            }
            None => return 0,
        }
    }
}

pub(crate) fn nearest_stream_root(state: &CacheState, mut idx: u32) -> Option<u32> {
    loop {
        let seg = state.segments.arena().get(idx);
        let meta = seg.meta.lock().unwrap();
        if meta.is_stream_root() {
            return Some(idx);
        }
        match meta.container {
            Some(c) => {
                drop(meta);
                idx = c;
            }
            None => return None,
        }
    }
}

pub(crate) fn adjust_mark_count(state: &CacheState, stream_root: u32, class: u32, delta: i64) {
    let seg = state.segments.arena().get(stream_root);
    let meta = seg.meta.lock().unwrap();
    let counter = &meta.mark_counts[class as usize];
    if delta >= 0 {
        counter.fetch_add(delta as u32, std::sync::atomic::Ordering::Relaxed);
    } else {
        counter.fetch_sub((-delta) as u32, std::sync::atomic::Ordering::Relaxed);
    }
}

fn maybe_become_reclaimable(state: &mut CacheState, idx: u32) {
    let (is_leaf, reclaimable_bins) = {
        let seg = state.segments.arena().get(idx);
        let meta = seg.meta.lock().unwrap();
        (meta.is_leaf(), meta.num_reclaimable_bins)
    };
    if is_leaf && reclaimable_bins > 0 {
        let arena = state.segments.arena();
        state.reclaim_data.push_front(arena, idx, ReclaimList::Data);
    }
}

fn maybe_become_erasable(state: &mut CacheState, idx: u32) {
    let (num_descendants, preserve_empty, container, num_non_null) = {
        let seg = state.segments.arena().get(idx);
        let meta = seg.meta.lock().unwrap();
        (meta.num_descendants, meta.preserve == 0, meta.container, meta.num_non_null)
    };
    if num_descendants != 0 || !preserve_empty || container.is_none() {
        return;
    }
    let container = container.unwrap();
    if num_non_null == 0 {
        make_erasable(state, container, idx);
    } else {
        let arena = state.segments.arena();
        state.reclaim_segs.push_front(arena, idx, ReclaimList::Segs);
    }
}

/// Collapses `idx` into an erasure-tagged pointer in its container's slot,
/// then recursively invokes the container's unlock duties so the collapse
/// can keep propagating upward. The root is never erased (it has no
/// container, so `maybe_become_erasable` never reaches here for it).
fn make_erasable(state: &mut CacheState, container: u32, idx: u32) {
    {
        let arena = state.segments.arena();
        state.reclaim_segs.remove(arena, idx, ReclaimList::Segs);
        state.reclaim_data.remove(arena, idx, ReclaimList::Data);
    }
    let pos = state.segments.arena().get(idx).meta.lock().unwrap().pos_in_container;
    let cseg = state.segments.arena().get(container);
    cseg.set_child(pos as usize, RawSlot::Ref { index: idx, erasable: true });
    {
        let mut cmeta = cseg.meta.lock().unwrap();
        cmeta.num_erasable += 1;
        cmeta.num_descendants = cmeta.num_descendants.saturating_sub(1);
    }
    drop(cseg);
    cseg_recurse_unlock(state, container);
}

fn cseg_recurse_unlock(state: &mut CacheState, container: u32) {
    state.segments.arena().get(container).acquire();
    unlock(state, container);
}
