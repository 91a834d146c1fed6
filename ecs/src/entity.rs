// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lock-free entity ID allocator: a Treiber-stack free list layered over a
//! monotonic counter.
//!
//! `EntityId` is a dense `u32` with `0` reserved as the "none" sentinel.
//! IDs carry no generation — callers must not reference an entity across
//! an explicit `destroy` (see `SPEC_FULL.md` §9 for the re-architecture
//! note this crate deliberately does not adopt).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use ecs_spin::Backoff;

pub type EntityId = u32;

/// Reserved "none"/sentinel entity ID.
pub const NONE: EntityId = 0;

const EMPTY: u32 = u32::MAX;

/// Lock-free free list plus monotonic counter.
///
/// The free list's link array (`free_next`) is a growable index, which
/// cannot be resized lock-free without hazard pointers; this crate instead
/// takes a brief write lock only on the rare growth path and a read lock
/// (cheap, shared, never starves the CAS fast path) on every push/pop. The
/// push/pop protocol itself is the textbook lock-free Treiber stack.
pub struct EntityAllocator {
    free_next: RwLock<Vec<AtomicU32>>,
    free_list_head: AtomicU32,
    next_fresh: AtomicU32,
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            free_next: RwLock::new(Vec::new()),
            free_list_head: AtomicU32::new(EMPTY),
            next_fresh: AtomicU32::new(1), // 0 is reserved for NONE
        }
    }

    /// Allocates an entity ID: pops the free list if non-empty, otherwise
    /// hands out a fresh ID from the monotonic counter. Safe to call
    /// concurrently from any thread, including from inside a system.
    ///
    /// # Panics
    /// Panics if the internal free-list lock is poisoned (a panic occurred
    /// while another thread held it).
    pub fn create(&self) -> EntityId {
        let mut backoff = Backoff::new();
        loop {
            let head = self.free_list_head.load(Ordering::Acquire);
            if head == EMPTY {
                return self.next_fresh.fetch_add(1, Ordering::Relaxed);
            }
            let next = {
                let guard = self.free_next.read().unwrap();
                guard[head as usize].load(Ordering::Acquire)
            };
            match self.free_list_head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return head,
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Returns `e` to the free list for future reuse. Destroying an ID that
    /// was never created, or destroying it twice, is a contract violation
    /// left undefined by design (the caller's invariant to uphold).
    ///
    /// # Panics
    /// Panics if the internal free-list lock is poisoned (a panic occurred
    /// while another thread held it).
    pub fn destroy(&self, e: EntityId) {
        self.ensure_capacity(e as usize + 1);
        let mut backoff = Backoff::new();
        loop {
            let head = self.free_list_head.load(Ordering::Acquire);
            {
                let guard = self.free_next.read().unwrap();
                guard[e as usize].store(head, Ordering::Release);
            }
            match self.free_list_head.compare_exchange_weak(
                head,
                e,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => backoff.spin(),
            }
        }
    }

    fn ensure_capacity(&self, needed: usize) {
        if self.free_next.read().unwrap().len() >= needed {
            return;
        }
        let mut guard = self.free_next.write().unwrap();
        if guard.len() < needed {
            let new_len = needed.next_power_of_two().max(16);
            guard.resize_with(new_len, || AtomicU32::new(EMPTY));
        }
    }
}
