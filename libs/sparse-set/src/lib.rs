// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A sparse set: a dense/sparse index pair giving O(1) insert/remove/has and
//! contiguous iteration over a dense array of entity IDs.
//!
//! This crate only manages the *index* structure (`sparse` + `dense`). The
//! component pool (in the `ecs` crate) pairs a `SparseSet` with a parallel
//! byte blob so that `data[i]` always holds the payload for `dense[i]`.
//!
//! Invariants maintained by this type:
//! - `dense.len() == count()`
//! - for every present `e`, `dense[sparse[e] - 1] == e`
//! - indices outside `[0, sparse.len())` are reported absent

/// `sparse[e]` storage value for a dense index: `idx + 1`, so `0` can mean
/// absent. Dense indices never approach `u32::MAX` in practice (they are
/// bounded by the live entity count), so this is an invariant, not a
/// fallible conversion.
#[allow(clippy::cast_possible_truncation)]
fn dense_slot(idx: usize) -> u32 {
    idx as u32 + 1
}

#[derive(Debug, Default, Clone)]
pub struct SparseSet {
    /// `sparse[e]` is `dense_index + 1` for present entities, `0` for absent.
    sparse: Vec<u32>,
    /// Dense, compact array of present entity IDs.
    dense: Vec<u32>,
}

/// Result of a [`SparseSet::remove`] that swapped the last dense element into
/// the removed slot. The component pool uses this to perform the matching
/// swap-remove on its parallel byte blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapRemoved {
    /// The dense index that was vacated (and into which the last element,
    /// if any, was moved).
    pub removed_index: usize,
    /// The entity that used to occupy the last dense slot, if it is not the
    /// entity being removed. `None` when removing the last element.
    pub moved_entity: Option<u32>,
}

impl SparseSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn grow_sparse_for(&mut self, entity: u32) {
        let needed = entity as usize + 1;
        if self.sparse.len() < needed {
            self.sparse.resize(needed.next_power_of_two().max(16), 0);
        }
    }

    #[inline]
    #[must_use]
    pub fn has(&self, entity: u32) -> bool {
        self.sparse
            .get(entity as usize)
            .is_some_and(|&slot| slot != 0)
    }

    /// Index into the dense array for `entity`, if present.
    #[inline]
    #[must_use]
    pub fn dense_index(&self, entity: u32) -> Option<usize> {
        self.sparse
            .get(entity as usize)
            .copied()
            .filter(|&slot| slot != 0)
            .map(|slot| slot as usize - 1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    #[must_use]
    pub fn dense(&self) -> &[u32] {
        &self.dense
    }

    /// Insert `entity`, returning its dense index. If already present,
    /// returns the existing index and does nothing else.
    pub fn insert(&mut self, entity: u32) -> usize {
        if let Some(idx) = self.dense_index(entity) {
            return idx;
        }
        self.grow_sparse_for(entity);
        let idx = self.dense.len();
        self.dense.push(entity);
        self.sparse[entity as usize] = dense_slot(idx);
        idx
    }

    /// Remove `entity` via swap-with-last. Returns `None` if absent.
    pub fn remove(&mut self, entity: u32) -> Option<SwapRemoved> {
        let idx = self.dense_index(entity)?;
        let last_idx = self.dense.len() - 1;
        let moved_entity = if idx != last_idx {
            let last = self.dense[last_idx];
            self.dense[idx] = last;
            self.sparse[last as usize] = dense_slot(idx);
            Some(last)
        } else {
            None
        };
        self.dense.pop();
        self.sparse[entity as usize] = 0;
        Some(SwapRemoved {
            removed_index: idx,
            moved_entity,
        })
    }

    pub fn clear(&mut self) {
        for &e in &self.dense {
            self.sparse[e as usize] = 0;
        }
        self.dense.clear();
    }
}
