//! Slab storage shared between the buffer pool and the segment pool.
//!
//! Both pools need to hand out references that readers can dereference
//! without holding the cache mutex, while the mutex-holding writer is free
//! to grow the backing storage. `Arena<T>` gives both without `unsafe`: it
//! never moves or drops an already-handed-out element (elements are only
//! ever recycled through a free-list kept by the owning pool, never by
//! shrinking the arena), so cloning the `Arc` around a storage group and
//! indexing into it is always sound.
use std::sync::{Arc, RwLock};

use crate::config::GROUP_LEN;

type Group<T> = Arc<[T; GROUP_LEN]>;

pub(crate) struct Arena<T> {
    groups: RwLock<Vec<Group<T>>>,
}

impl<T: Default> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
        }
    }

    /// Appends one freshly `Default`-initialized group and returns the base
    /// index of its first slot. Must be called by code already holding the
    /// cache mutex; growth is not itself lock-free.
    pub(crate) fn grow(&self) -> u32 {
        let mut groups = self.groups.write().unwrap_or_else(|e| e.into_inner());
        let base = groups.len() * GROUP_LEN;
        groups.push(Arc::new(std::array::from_fn(|_| T::default())));
        base as u32
    }

    pub(crate) fn capacity(&self) -> u32 {
        let groups = self.groups.read().unwrap_or_else(|e| e.into_inner());
        (groups.len() * GROUP_LEN) as u32
    }

    /// Clones the `Arc` covering `index`'s group, giving the caller an
    /// independently-owned handle it can hold (and index into) without any
    /// lock, even across a later `grow`.
    pub(crate) fn group_of(&self, index: u32) -> Group<T> {
        let groups = self.groups.read().unwrap_or_else(|e| e.into_inner());
        groups[index as usize / GROUP_LEN].clone()
    }

    /// Returns a handle dereferencing to the element at `index`, keeping its
    /// owning group alive for as long as the handle lives — safe to hold
    /// across a later `grow` on a different group, with no lock held.
    pub(crate) fn get(&self, index: u32) -> ArenaRef<T> {
        ArenaRef {
            group: self.group_of(index),
            local: index as usize % GROUP_LEN,
        }
    }
}

/// A handle to one arena element, keeping the `Arc`-owned group it lives in
/// alive. Derefs to `&T`; elements are never mutated through `&mut T` (they
/// expose interior mutability themselves where needed), so no `DerefMut`.
pub(crate) struct ArenaRef<T> {
    group: Group<T>,
    local: usize,
}

impl<T> std::ops::Deref for ArenaRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.group[self.local]
    }
}
