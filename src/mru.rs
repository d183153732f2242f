//! The two MRU reclaim lists.
//!
//! `reclaimable-data` holds leaves with at least one non-preserved,
//! non-empty bin buffer; `reclaimable-segs` holds any other node eligible
//! for full erasure. Both are ordinary intrusive doubly-linked lists
//! threaded through each segment's `reclaim_prev`/`reclaim_next` (kept in
//! its mutex-guarded `SegmentMeta`, since only the mutex-holding writer
//! ever walks or splices these lists). Head insertion + tail eviction gives
//! MRU order without a separate timestamp or counter, the same shape as an
//! ordinary LRU/MRU descriptor list.
use crate::arena::Arena;
use crate::segment::{ReclaimList, Segment};

#[derive(Debug, Default)]
pub(crate) struct ReclaimListHead {
    head: Option<u32>,
    tail: Option<u32>,
}

impl ReclaimListHead {
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn tail(&self) -> Option<u32> {
        self.tail
    }

    /// Unlinks `idx` from this list if it is currently linked anywhere in
    /// it, leaving its own `reclaim_prev`/`reclaim_next` cleared. No-op if
    /// the segment isn't on this list.
    pub(crate) fn remove(&mut self, arena: &Arena<Segment>, idx: u32, which: ReclaimList) {
        let (prev, next, on_this_list) = {
            let seg = arena.get(idx);
            let meta = seg.meta.lock().unwrap();
            (meta.reclaim_prev, meta.reclaim_next, meta.on_reclaim_list == Some(which))
        };
        if !on_this_list {
            return;
        }
        match prev {
            Some(p) => arena.get(p).meta.lock().unwrap().reclaim_next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena.get(n).meta.lock().unwrap().reclaim_prev = prev,
            None => self.tail = prev,
        }
        let seg = arena.get(idx);
        let mut meta = seg.meta.lock().unwrap();
        meta.reclaim_prev = None;
        meta.reclaim_next = None;
        meta.on_reclaim_list = None;
    }

    /// Inserts `idx` at the MRU head. If it is already linked elsewhere on
    /// this same list it is unlinked first, so `push_front` also serves as
    /// "touch".
    pub(crate) fn push_front(&mut self, arena: &Arena<Segment>, idx: u32, which: ReclaimList) {
        self.remove(arena, idx, which);
        let old_head = self.head;
        {
            let seg = arena.get(idx);
            let mut meta = seg.meta.lock().unwrap();
            meta.reclaim_prev = None;
            meta.reclaim_next = old_head;
            meta.on_reclaim_list = Some(which);
        }
        if let Some(h) = old_head {
            arena.get(h).meta.lock().unwrap().reclaim_prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    /// Detaches and returns the LRU tail entry, if any.
    pub(crate) fn pop_back(&mut self, arena: &Arena<Segment>, which: ReclaimList) -> Option<u32> {
        let tail = self.tail?;
        self.remove(arena, tail, which);
        Some(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    #[test_log::test]
    fn push_front_then_pop_back_is_fifo_for_a_single_chain() {
        let arena: Arena<Segment> = Arena::new();
        let base = arena.grow();
        let mut list = ReclaimListHead::default();
        list.push_front(&arena, base, ReclaimList::Segs);
        list.push_front(&arena, base + 1, ReclaimList::Segs);
        list.push_front(&arena, base + 2, ReclaimList::Segs);
        // MRU head is base+2; LRU tail (popped first) is base.
        assert_eq!(list.pop_back(&arena, ReclaimList::Segs), Some(base));
        assert_eq!(list.pop_back(&arena, ReclaimList::Segs), Some(base + 1));
        assert_eq!(list.pop_back(&arena, ReclaimList::Segs), Some(base + 2));
        assert!(list.is_empty());
    }

    #[test_log::test]
    fn touching_an_entry_moves_it_back_to_the_head() {
        let arena: Arena<Segment> = Arena::new();
        let base = arena.grow();
        let mut list = ReclaimListHead::default();
        list.push_front(&arena, base, ReclaimList::Data);
        list.push_front(&arena, base + 1, ReclaimList::Data);
        list.push_front(&arena, base, ReclaimList::Data); // touch
        assert_eq!(list.pop_back(&arena, ReclaimList::Data), Some(base + 1));
        assert_eq!(list.pop_back(&arena, ReclaimList::Data), Some(base));
    }
}
