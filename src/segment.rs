//! Segment tree nodes.
//!
//! A `Segment` plays one of three roles (§3: stream-nav, stream-root,
//! class-nav), distinguished by fields rather than by Rust type, exactly as
//! the cache's own design calls for ("map the overlay union to a tagged
//! container whose discriminant is enforced by accessors, not by
//! reinterpreting raw memory" — Design Notes). Concretely: `role` is the
//! discriminant, and the stream-root's `classes`/`mark_counts` overlay gets
//! its own fixed-size fields rather than aliasing the `children` array the
//! other two roles use, which is what lets this crate avoid `unsafe`
//! altogether.
//!
//! Every `Segment` is split into a lock-free "hot" half (`access_ctl`,
//! `children`) that readers dereference without the cache mutex, and a
//! `Mutex<SegmentMeta>` "cold" half for fields only ever touched by the
//! mutex-holding writer (addressing, counters, reclaim-list links). This
//! mirrors the general pattern of giving atomics to exactly the fields that
//! need lock-free publication and nothing else.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::config::{MAX_CLASSES, NUM_CHILDREN, STREAM_CLASS_SENTINEL};
use crate::slot::{new_children, RawSlot, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum NodeRole {
    #[default]
    StreamNav,
    StreamRoot,
    ClassNav,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReclaimList {
    Data,
    Segs,
}

pub(crate) struct SegmentMeta {
    pub(crate) role: NodeRole,
    /// Non-negative multiple of 7; `0` means this node's `children` hold
    /// leaves directly (bin references, for a class-nav; stream-roots for
    /// a stream-nav).
    pub(crate) shift: u32,
    /// `-1` for stream-nav nodes, per the node-kind discriminant rule.
    pub(crate) stream_id: i64,
    /// `STREAM_CLASS_SENTINEL` (255) for stream-nav/stream-root nodes.
    pub(crate) class_id: u32,
    pub(crate) base_id: u64,
    pub(crate) container: Option<u32>,
    pub(crate) pos_in_container: u32,

    pub(crate) num_descendants: u32,
    pub(crate) num_non_null: u32,
    pub(crate) num_erasable: u32,
    pub(crate) num_reclaimable_bins: u32,

    pub(crate) preserve: u128,
    pub(crate) container_deleted: bool,
    pub(crate) on_reclaim_list: Option<ReclaimList>,
    pub(crate) reclaim_prev: Option<u32>,
    pub(crate) reclaim_next: Option<u32>,

    /// Stream-root overlay: `classes[c]` is the root of class `c`'s
    /// class-nav subtree; `mark_counts[c]` the running count of marked
    /// elements (bins with `M != 0`, plus collapsed `SEG_DELETED`
    /// sentinels) reachable under it. Unused outside `NodeRole::StreamRoot`.
    pub(crate) classes: [Slot; MAX_CLASSES],
    pub(crate) mark_counts: [AtomicU32; MAX_CLASSES],
}

impl Default for SegmentMeta {
    fn default() -> Self {
        Self {
            role: NodeRole::default(),
            shift: 0,
            stream_id: -1,
            class_id: STREAM_CLASS_SENTINEL,
            base_id: 0,
            container: None,
            pos_in_container: 0,
            num_descendants: 0,
            num_non_null: 0,
            num_erasable: 0,
            num_reclaimable_bins: 0,
            preserve: 0,
            container_deleted: false,
            on_reclaim_list: None,
            reclaim_prev: None,
            reclaim_next: None,
            classes: std::array::from_fn(|_| Slot::null()),
            mark_counts: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

impl SegmentMeta {
    pub(crate) fn is_leaf(&self) -> bool {
        self.role == NodeRole::ClassNav && self.shift == 0
    }

    pub(crate) fn is_stream_root(&self) -> bool {
        self.role == NodeRole::StreamRoot
    }

    pub(crate) fn preserve_bit(&self, slot: usize) -> bool {
        (self.preserve >> slot) & 1 != 0
    }

    pub(crate) fn set_preserve_bit(&mut self, slot: usize) {
        self.preserve |= 1 << slot;
    }

    /// Slot index addressed by `id` at this node, per §4.3 step 5.
    pub(crate) fn slot_for(&self, id: u64) -> usize {
        (((id - self.base_id) >> self.shift) & (NUM_CHILDREN as u64 - 1)) as usize
    }

    /// `true` if this node already covers `id` in its addressable range.
    pub(crate) fn covers(&self, id: u64) -> bool {
        id >= self.base_id && (id - self.base_id) >> self.shift < NUM_CHILDREN as u64
    }

    pub(crate) fn reset(&mut self) {
        *self = SegmentMeta::default();
    }
}

pub(crate) struct Segment {
    pub(crate) access_ctl: AtomicU32,
    pub(crate) children: [Slot; NUM_CHILDREN],
    pub(crate) meta: Mutex<SegmentMeta>,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            access_ctl: AtomicU32::new(0),
            children: new_children(),
            meta: Mutex::new(SegmentMeta::default()),
        }
    }
}

impl Segment {
    pub(crate) fn lock_count(&self) -> u32 {
        self.access_ctl.load(Ordering::Acquire)
    }

    /// Reader-side acquire: increments the lock depth.
    pub(crate) fn acquire(&self) -> u32 {
        self.access_ctl.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the lock depth without the mutex, as long as doing so
    /// would not bring it to zero. Returns `true` if the decrement
    /// happened this way; `false` means the caller must take the mutex
    /// first (see the access-lock discipline in `walker.rs`).
    pub(crate) fn try_release_above_zero(&self) -> bool {
        loop {
            let cur = self.access_ctl.load(Ordering::Acquire);
            if cur <= 1 {
                return false;
            }
            if self
                .access_ctl
                .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Drops the lock depth to zero. Must only be called while the cache
    /// mutex is held.
    pub(crate) fn release_to_zero_under_mutex(&self) {
        self.access_ctl.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn child(&self, idx: usize) -> RawSlot {
        self.children[idx].get(Ordering::Acquire)
    }

    pub(crate) fn set_child(&self, idx: usize, value: RawSlot) {
        self.children[idx].set(value, Ordering::Release);
    }

    pub(crate) fn compare_exchange_child(
        &self,
        idx: usize,
        current: RawSlot,
        new: RawSlot,
    ) -> Result<RawSlot, RawSlot> {
        self.children[idx].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn slot_for_matches_spec_formula() {
        let mut meta = SegmentMeta::default();
        meta.base_id = 256;
        meta.shift = 7;
        assert_eq!(meta.slot_for(256), 0);
        assert_eq!(meta.slot_for(256 + 127 * 128), 127);
        assert!(meta.covers(256 + 127 * 128));
        assert!(!meta.covers(256 + 128 * 128));
    }

    #[test_log::test]
    fn preserve_bits_are_independent() {
        let mut meta = SegmentMeta::default();
        meta.set_preserve_bit(3);
        meta.set_preserve_bit(100);
        assert!(meta.preserve_bit(3));
        assert!(meta.preserve_bit(100));
        assert!(!meta.preserve_bit(4));
    }

    #[test_log::test]
    fn try_release_above_zero_refuses_the_final_decrement() {
        let seg = Segment::default();
        seg.acquire();
        seg.acquire();
        assert!(seg.try_release_above_zero());
        assert_eq!(seg.lock_count(), 1);
        assert!(!seg.try_release_above_zero());
        assert_eq!(seg.lock_count(), 1, "must not touch the last lock without the mutex");
    }
}
