//! Tagged child-array entries.
//!
//! The cache's tree nodes store 128-entry arrays whose slots are either a
//! valid reference, one of a handful of sentinels, or an "erasure-tagged"
//! live reference (Design Notes: "express as a typed smart index, keep
//! arithmetic on raw pointer values out of the public interface"). Rather
//! than reinterpreting raw pointers this crate encodes the same alternatives
//! as a small integer packed into an `AtomicU32`, decoded into the
//! `RawSlot` enum below wherever code needs to branch on it.
//!
//! Encoding (mirrors the sentinel table in the external-interfaces section):
//! - `0` — null.
//! - `1` — `BIN_DELETED` / `SEG_DELETED` sentinel; which one it means is a
//!   property of the node holding the slot (leaf vs interior), not of the
//!   encoding.
//! - `2` — `BIN_CEMPTY` sentinel (only ever written into leaf bin slots).
//! - `3 + 2*index` — a valid reference to arena index `index`.
//! - `3 + 2*index + 1` — the same reference, erasure-tagged.
use std::sync::atomic::{AtomicU32, Ordering};

const NULL: u32 = 0;
const DELETED: u32 = 1;
const CEMPTY: u32 = 2;
const BASE: u32 = 3;

/// A decoded child-array entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawSlot {
    Null,
    /// `BIN_DELETED` on a leaf's bin array, `SEG_DELETED` on an interior
    /// node's child array.
    Deleted,
    /// `BIN_CEMPTY`; only meaningful on a leaf's bin array.
    CEmpty,
    /// A reference to arena index `index`. `erasable` is the erasure tag.
    Ref { index: u32, erasable: bool },
}

impl RawSlot {
    fn encode(self) -> u32 {
        match self {
            RawSlot::Null => NULL,
            RawSlot::Deleted => DELETED,
            RawSlot::CEmpty => CEMPTY,
            RawSlot::Ref { index, erasable } => BASE + index * 2 + erasable as u32,
        }
    }

    fn decode(raw: u32) -> Self {
        match raw {
            NULL => RawSlot::Null,
            DELETED => RawSlot::Deleted,
            CEMPTY => RawSlot::CEmpty,
            _ => {
                let rest = raw - BASE;
                RawSlot::Ref {
                    index: rest / 2,
                    erasable: rest % 2 == 1,
                }
            }
        }
    }

    pub(crate) fn is_null(self) -> bool {
        matches!(self, RawSlot::Null)
    }

    pub(crate) fn is_sentinel(self) -> bool {
        matches!(self, RawSlot::Deleted | RawSlot::CEmpty)
    }

    pub(crate) fn index(self) -> Option<u32> {
        match self {
            RawSlot::Ref { index, .. } => Some(index),
            _ => None,
        }
    }

    pub(crate) fn is_erasable(self) -> bool {
        matches!(self, RawSlot::Ref { erasable: true, .. })
    }

    pub(crate) fn tagged(self) -> RawSlot {
        match self {
            RawSlot::Ref { index, .. } => RawSlot::Ref {
                index,
                erasable: true,
            },
            other => other,
        }
    }

    pub(crate) fn untagged(self) -> RawSlot {
        match self {
            RawSlot::Ref { index, .. } => RawSlot::Ref {
                index,
                erasable: false,
            },
            other => other,
        }
    }
}

/// One atomic child-array entry.
#[derive(Debug)]
pub(crate) struct Slot(AtomicU32);

impl Slot {
    pub(crate) const fn null() -> Self {
        Slot(AtomicU32::new(NULL))
    }

    pub(crate) fn get(&self, order: Ordering) -> RawSlot {
        RawSlot::decode(self.0.load(order))
    }

    pub(crate) fn set(&self, value: RawSlot, order: Ordering) {
        self.0.store(value.encode(), order);
    }

    /// Atomically replaces the slot's contents iff it still equals
    /// `current`, returning whether the swap happened. Used by the
    /// path walker's pointer re-verify step.
    pub(crate) fn compare_exchange(
        &self,
        current: RawSlot,
        new: RawSlot,
        success: Ordering,
        failure: Ordering,
    ) -> Result<RawSlot, RawSlot> {
        match self
            .0
            .compare_exchange(current.encode(), new.encode(), success, failure)
        {
            Ok(v) => Ok(RawSlot::decode(v)),
            Err(v) => Err(RawSlot::decode(v)),
        }
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::null()
    }
}

pub(crate) fn new_children() -> [Slot; crate::config::NUM_CHILDREN] {
    std::array::from_fn(|_| Slot::null())
}
