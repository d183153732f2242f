//! Bin header and incremental byte-range writer.
//!
//! A `BinHeader` is the fully-atomic status word plus the two list heads
//! (payload cells, hole-list cells) for one data-bin. Unlike the C original,
//! where the header overlays the first payload cell, this crate gives each
//! bin its own small header object allocated from its own arena and
//! addressed by the leaf's bin slot; `payload_head`/`hole_head` then point
//! into the (separate) cell pool. This keeps every field that needs
//! lock-free publication (`status`, the two list heads) behind its own
//! atomic without reinterpreting cell memory, at the cost of one extra
//! arena slot per bin — documented as a deliberate adaptation in DESIGN.md.
use std::sync::atomic::{AtomicU32, Ordering};

use crate::arena::Arena;
use crate::cell::{BufferPool, Cell, NO_NEXT};
use crate::config::L_MAX;

const L_MASK: u32 = (1 << 28) - 1;
const M_SHIFT: u32 = 28;
const M_MASK: u32 = 0b11 << M_SHIFT;
const F_BIT: u32 = 1 << 30;
const H_BIT: u32 = 1 << 31;

/// The `M` (marking) field of a bin's status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mark {
    None,
    DeletedMarked,
    AugmentedMarked,
    Marked,
}

impl Mark {
    fn encode(self) -> u32 {
        (match self {
            Mark::None => 0,
            Mark::DeletedMarked => 1,
            Mark::AugmentedMarked => 2,
            Mark::Marked => 3,
        }) << M_SHIFT
    }

    fn decode(raw: u32) -> Self {
        match (raw & M_MASK) >> M_SHIFT {
            0 => Mark::None,
            1 => Mark::DeletedMarked,
            2 => Mark::AugmentedMarked,
            _ => Mark::Marked,
        }
    }

    pub(crate) fn is_deleted(self) -> bool {
        matches!(self, Mark::DeletedMarked)
    }

    pub(crate) fn is_marked_at_all(self) -> bool {
        !matches!(self, Mark::None)
    }
}

/// Decoded view of a bin's 32-bit status word.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Status {
    pub(crate) l: u32,
    pub(crate) m: Mark,
    pub(crate) f: bool,
    pub(crate) h: bool,
}

impl Status {
    fn encode(self) -> u32 {
        (self.l & L_MASK) | self.m.encode() | (self.f as u32) << 30 | (self.h as u32) << 31
    }

    fn decode(raw: u32) -> Self {
        Status {
            l: raw & L_MASK,
            m: Mark::decode(raw),
            f: raw & F_BIT != 0,
            h: raw & H_BIT != 0,
        }
    }

    pub(crate) fn is_complete(self) -> bool {
        self.f && !self.h
    }
}

pub(crate) struct BinHeader {
    status: AtomicU32,
    payload_head: AtomicU32,
    hole_head: AtomicU32,
}

impl Default for BinHeader {
    fn default() -> Self {
        Self {
            status: AtomicU32::new(0),
            payload_head: AtomicU32::new(NO_NEXT),
            hole_head: AtomicU32::new(NO_NEXT),
        }
    }
}

impl BinHeader {
    /// Reader-side entry point: acquire-load the status word. Everything
    /// else about the bin (payload bytes, hole list) is safe to read
    /// afterwards without further synchronization, because the writer
    /// publishes list-head updates strictly before this store (see
    /// `commit` below).
    pub(crate) fn load_status(&self) -> Status {
        Status::decode(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn payload_head(&self) -> Option<u32> {
        match self.payload_head.load(Ordering::Relaxed) {
            NO_NEXT => None,
            h => Some(h),
        }
    }

    fn hole_head(&self) -> Option<u32> {
        match self.hole_head.load(Ordering::Relaxed) {
            NO_NEXT => None,
            h => Some(h),
        }
    }

    /// Returns this header to its just-allocated state, for recycling back
    /// into the bin pool's free list.
    pub(crate) fn reset(&self) {
        self.payload_head.store(NO_NEXT, Ordering::Relaxed);
        self.hole_head.store(NO_NEXT, Ordering::Relaxed);
        self.status.store(0, Ordering::Relaxed);
    }

    /// Writer-side: publish new list heads, then release-store `status`.
    /// Must only be called by the mutex-holding writer.
    fn commit(&self, payload_head: Option<u32>, hole_head: Option<u32>, status: Status) {
        self.payload_head
            .store(payload_head.unwrap_or(NO_NEXT), Ordering::Relaxed);
        self.hole_head
            .store(hole_head.unwrap_or(NO_NEXT), Ordering::Relaxed);
        self.status.store(status.encode(), Ordering::Release);
    }
}

/// One disjoint filled byte range, `[start, lim)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    start: u32,
    lim: u32,
}

fn read_hole_list(arena: &Arena<Cell>, head: Option<u32>) -> Vec<Hole> {
    let Some(head) = head else {
        return Vec::new();
    };
    let words = read_u32_chain(arena, head);
    let mut holes = Vec::new();
    let mut i = 0;
    while i + 1 < words.len() {
        let start = words[i];
        let lim = words[i + 1];
        if start == 0 && lim == 0 {
            break;
        }
        holes.push(Hole { start, lim });
        i += 2;
    }
    holes
}

fn read_u32_chain(arena: &Arena<Cell>, head: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut cur = Some(head);
    let mut buf = [0u8; 4];
    let mut n = 0;
    while let Some(idx) = cur {
        let cell = arena.get(idx);
        for i in 0..crate::config::CELL_LEN {
            buf[n] = cell.read_byte(i);
            n += 1;
            if n == 4 {
                out.push(u32::from_le_bytes(buf));
                n = 0;
            }
        }
        cur = cell.next();
    }
    out
}

fn write_u32_chain(pool: &mut BufferPool, words: &[u32]) -> Option<u32> {
    if words.is_empty() {
        return None;
    }
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    write_byte_chain(pool, &bytes)
}

fn write_byte_chain(pool: &mut BufferPool, bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() {
        return None;
    }
    let mut head: Option<u32> = None;
    let mut prev: Option<u32> = None;
    let mut i = 0;
    while i < bytes.len() {
        let idx = pool.get()?;
        if head.is_none() {
            head = Some(idx);
        }
        if let Some(p) = prev {
            pool.arena().get(p).set_next(Some(idx));
        }
        let cell = pool.arena().get(idx);
        let n = (bytes.len() - i).min(crate::config::CELL_LEN);
        for (j, b) in bytes[i..i + n].iter().enumerate() {
            cell.write_byte(j, *b);
        }
        i += n;
        prev = Some(idx);
    }
    head
}

/// Outcome of folding a newly-written range into the existing hole list,
/// driving the bin-marking transition in `add_to_bin`.
pub(crate) struct MergeOutcome {
    pub(crate) new_l: u32,
    pub(crate) new_hole_head: Option<u32>,
    pub(crate) augmented: bool,
    pub(crate) intersects_with_existing: bool,
}

/// Copies `data` into the bin at `[offset, offset + data.len())`, merging it
/// into the existing hole list, and commits the new status. Direct
/// transcription of the hole-merge loop described for `add_to_bin`:
/// existing pairs entirely below the new range are kept as-is, the first
/// overlapping/abutting pair (and any subsequent ones) are folded into the
/// new range, and if the folded range now touches or exceeds the current
/// `L` prefix, `L` is extended instead of a hole being recorded.
///
/// Returns `None` on simulated allocation failure, leaving the bin
/// untouched so the caller can apply the DELETED-rollback rule itself.
#[allow(clippy::too_many_arguments)]
pub(crate) fn add_range(
    pool: &mut BufferPool,
    header: &BinHeader,
    data: &[u8],
    offset: u32,
    is_complete: bool,
) -> Option<MergeOutcome> {
    let before = header.load_status();
    let holes = read_hole_list(pool.arena(), header.hole_head());

    let range_start = offset;
    let range_lim = offset + data.len() as u32;
    // New content is anything beyond the already-known contiguous prefix;
    // rewrites strictly within it never trip the augmented transition.
    let augmented = range_lim > before.l;

    // Splice data into the payload chain at `offset`.
    let new_payload_head = splice_payload(pool, header.payload_head(), offset, data)?;

    let mut merged_start = range_start;
    let mut merged_lim = range_lim;
    let mut out: Vec<Hole> = Vec::new();
    let mut i = 0;
    // existing pairs entirely below the new range pass through untouched
    while i < holes.len() && holes[i].lim < merged_start {
        out.push(holes[i]);
        i += 1;
    }
    // fold every overlapping-or-abutting pair into the growing merged range
    let mut intersects_with_existing = false;
    while i < holes.len() && holes[i].start <= merged_lim {
        intersects_with_existing = true;
        merged_start = merged_start.min(holes[i].start);
        merged_lim = merged_lim.max(holes[i].lim);
        i += 1;
    }

    let mut new_l = before.l;
    if merged_start <= new_l {
        // touches (or is within) the contiguous prefix: absorb it, then
        // keep absorbing any further pairs the extended prefix now reaches
        new_l = new_l.max(merged_lim);
        while i < holes.len() && holes[i].start <= new_l {
            new_l = new_l.max(holes[i].lim);
            i += 1;
        }
    } else {
        out.push(Hole {
            start: merged_start,
            lim: merged_lim,
        });
    }
    // remaining higher pairs copy straight through
    while i < holes.len() {
        out.push(holes[i]);
        i += 1;
    }

    let mut words: Vec<u32> = Vec::with_capacity(out.len() * 2 + 1);
    for h in &out {
        words.push(h.start);
        words.push(h.lim);
    }
    let new_hole_head = if out.is_empty() {
        None
    } else {
        write_u32_chain(pool, &words)
    };
    if let Some(old) = header.hole_head() {
        pool.release_chain(old);
    }

    let new_status = Status {
        l: new_l,
        m: before.m,
        f: before.f || is_complete,
        h: new_hole_head.is_some(),
    };
    header.commit(Some(new_payload_head), new_hole_head, new_status);

    Some(MergeOutcome {
        new_l,
        new_hole_head,
        augmented,
        intersects_with_existing,
    })
}

fn splice_payload(
    pool: &mut BufferPool,
    head: Option<u32>,
    offset: u32,
    data: &[u8],
) -> Option<u32> {
    let mut existing = read_byte_chain(pool.arena(), head);
    let end = offset as usize + data.len();
    if existing.len() < end {
        existing.resize(end, 0);
    }
    existing[offset as usize..end].copy_from_slice(data);
    if let Some(old) = head {
        pool.release_chain(old);
    }
    write_byte_chain(pool, &existing)
}

fn read_byte_chain(arena: &Arena<Cell>, head: Option<u32>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cur = head;
    while let Some(idx) = cur {
        let cell = arena.get(idx);
        for i in 0..crate::config::CELL_LEN {
            out.push(cell.read_byte(i));
        }
        cur = cell.next();
    }
    out
}

/// Reads `n` bytes starting at `offset` out of the bin's payload. Caller is
/// responsible for only requesting bytes within the known-contiguous prefix
/// (or otherwise-known-present ranges); this just walks the chain. Takes
/// the cell arena directly (not the mutex-guarded `BufferPool`) so readers
/// holding only an access lock, never the cache mutex, can call it.
pub(crate) fn read_range(arena: &Arena<Cell>, header: &BinHeader, offset: u32, n: usize) -> Vec<u8> {
    let bytes = read_byte_chain(arena, header.payload_head());
    let start = offset as usize;
    let end = (start + n).min(bytes.len());
    if start >= bytes.len() {
        Vec::new()
    } else {
        bytes[start..end].to_vec()
    }
}

/// Forces the bin to a DELETED, hole-free state, reverting `L` to
/// `prev_l` and freeing the hole list. Applied on simulated write failure
/// or explicit deletion.
pub(crate) fn force_deleted(pool: &mut BufferPool, header: &BinHeader, prev_l: u32) {
    if let Some(h) = header.hole_head() {
        pool.release_chain(h);
    }
    let before = header.load_status();
    header.commit(
        header.payload_head(),
        None,
        Status {
            l: prev_l,
            m: Mark::DeletedMarked,
            f: before.f,
            h: false,
        },
    );
}

/// Releases every cell owned by this bin (payload and hole list). Called
/// when a bin is erased for good (not just marked deleted).
pub(crate) fn release_all(pool: &mut BufferPool, header: &BinHeader) {
    if let Some(p) = header.payload_head() {
        pool.release_chain(p);
    }
    if let Some(h) = header.hole_head() {
        pool.release_chain(h);
    }
}

pub(crate) fn set_mark(header: &BinHeader, mark: Mark) {
    let before = header.load_status();
    header.commit(
        header.payload_head(),
        header.hole_head(),
        Status { m: mark, ..before },
    );
}

pub(crate) fn l_max() -> u32 {
    L_MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn add_range_on_empty_bin_sets_length_and_complete() {
        let mut pool = BufferPool::new();
        let header = BinHeader::default();
        let outcome = add_range(&mut pool, &header, b"HELLO", 0, true).unwrap();
        assert_eq!(outcome.new_l, 5);
        assert!(outcome.augmented);
        let status = header.load_status();
        assert!(status.is_complete());
        assert_eq!(status.l, 5);
        assert_eq!(read_range(pool.arena(), &header, 0, 5), b"HELLO");
    }

    #[test_log::test]
    fn out_of_order_fill_merges_into_contiguous_prefix() {
        let mut pool = BufferPool::new();
        let header = BinHeader::default();
        add_range(&mut pool, &header, b"world", 5, false).unwrap();
        let status = header.load_status();
        assert_eq!(status.l, 0);
        assert!(status.h);
        add_range(&mut pool, &header, b"hello", 0, true).unwrap();
        let status = header.load_status();
        assert_eq!(status.l, 10);
        assert!(status.is_complete());
        assert_eq!(read_range(pool.arena(), &header, 0, 10), b"helloworld");
    }

    #[test_log::test]
    fn hole_merge_coalesces_three_disjoint_ranges() {
        let mut pool = BufferPool::new();
        let header = BinHeader::default();
        add_range(&mut pool, &header, b"AAAA", 0, false).unwrap();
        add_range(&mut pool, &header, b"CCCC", 8, false).unwrap();
        add_range(&mut pool, &header, b"BBBB", 4, false).unwrap();
        let status = header.load_status();
        assert_eq!(status.l, 12);
        assert!(!status.h, "fully contiguous bin should carry no hole list");
    }

    #[test_log::test]
    fn force_deleted_reverts_length_and_clears_holes() {
        let mut pool = BufferPool::new();
        let header = BinHeader::default();
        add_range(&mut pool, &header, b"AAAA", 0, false).unwrap();
        force_deleted(&mut pool, &header, 0);
        let status = header.load_status();
        assert_eq!(status.l, 0);
        assert!(status.m.is_deleted());
        assert!(!status.h);
    }
}
