// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-lane deferred structural-mutation log.
//!
//! Add/Remove/Destroy issued while a tick is in progress are appended here
//! instead of applied immediately. `Add` payloads are carved out of a
//! chunked bump arena so the pointer handed back to the caller (to
//! initialise in place) stays valid until the next sync — unlike a plain
//! growable `Vec<u8>`, appending to this arena never moves bytes that were
//! already handed out.

use crate::component::ComponentId;
use crate::config;
use crate::entity::EntityId;

struct SlotPtr(*mut u8);

// SAFETY: the pointer addresses memory owned by this same `CommandBuffer`'s
// arena. It is only read back (never aliased mutably) by the single thread
// performing the drain, which happens-after every lane's append via the
// buffer's own mutex.
unsafe impl Send for SlotPtr {}

pub(crate) enum Command {
    Destroy(EntityId),
    Add {
        entity: EntityId,
        component: ComponentId,
        ptr: SlotPtr,
        len: usize,
    },
    Remove(EntityId, ComponentId),
}

/// A chunked bump allocator: allocations never move once handed out, only
/// `reset` reclaims space (retaining the largest chunk for future reuse).
struct Arena {
    chunks: Vec<Box<[u8]>>,
    cursor: usize,
}

impl Arena {
    fn new(initial_capacity: usize) -> Self {
        Self {
            chunks: vec![vec![0u8; initial_capacity.max(1)].into_boxed_slice()],
            cursor: 0,
        }
    }

    fn alloc(&mut self, len: usize) -> *mut u8 {
        let current = self.chunks.last().expect("arena always has one chunk");
        if self.cursor + len > current.len() {
            let new_size = current.len().max(len).next_power_of_two();
            self.chunks.push(vec![0u8; new_size].into_boxed_slice());
            self.cursor = 0;
        }
        let chunk = self.chunks.last_mut().expect("just ensured a chunk exists");
        // SAFETY: `cursor + len <= chunk.len()` by construction above.
        let ptr = unsafe { chunk.as_mut_ptr().add(self.cursor) };
        self.cursor += len;
        ptr
    }

    fn reset(&mut self) {
        if self.chunks.len() > 1 {
            let largest = self
                .chunks
                .drain(..)
                .max_by_key(|c| c.len())
                .expect("at least one chunk");
            self.chunks.push(largest);
        }
        self.cursor = 0;
    }
}

pub(crate) struct CommandBuffer {
    commands: Vec<Command>,
    arena: Arena,
}

impl CommandBuffer {
    pub(crate) fn new() -> Self {
        Self {
            commands: Vec::with_capacity(config::COMMAND_BUFFER_INITIAL_CAPACITY),
            arena: Arena::new(config::COMMAND_DATA_INITIAL_CAPACITY),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn push_destroy(&mut self, entity: EntityId) {
        self.commands.push(Command::Destroy(entity));
    }

    pub(crate) fn push_remove(&mut self, entity: EntityId, component: ComponentId) {
        self.commands.push(Command::Remove(entity, component));
    }

    /// Stages an `Add`, returning a zero-initialised pointer of `len` bytes
    /// for the caller to fill in. Valid until this buffer's next
    /// [`CommandBuffer::reset`].
    pub(crate) fn push_add(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        len: usize,
    ) -> *mut u8 {
        let ptr = self.arena.alloc(len);
        self.commands.push(Command::Add {
            entity,
            component,
            ptr: SlotPtr(ptr),
            len,
        });
        ptr
    }

    pub(crate) fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// # Safety
    /// The returned slice aliases the buffer's arena; callers must not
    /// retain it past the next mutation of this buffer.
    pub(crate) unsafe fn payload_of(cmd: &Command) -> Option<&[u8]> {
        match cmd {
            Command::Add { ptr, len, .. } => Some(std::slice::from_raw_parts(ptr.0, *len)),
            _ => None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.commands.clear();
        self.arena.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_pointer_survives_further_allocations_until_reset() {
        let mut buf = CommandBuffer::new();
        let p1 = buf.push_add(1, 0, 4);
        unsafe {
            p1.copy_from(42u32.to_le_bytes().as_ptr(), 4);
        }
        // Force growth past the initial chunk.
        for i in 0..10_000u32 {
            let p = buf.push_add(i, 0, 4);
            unsafe {
                p.copy_from(i.to_le_bytes().as_ptr(), 4);
            }
        }
        // p1 must still read back 42 even though many more allocations
        // (and at least one chunk growth) happened after it.
        let value = unsafe { u32::from_le_bytes(std::slice::from_raw_parts(p1, 4).try_into().unwrap()) };
        assert_eq!(value, 42);
    }

    #[test]
    fn reset_clears_commands_and_arena_cursor() {
        let mut buf = CommandBuffer::new();
        buf.push_destroy(1);
        buf.push_add(2, 0, 4);
        assert!(!buf.is_empty());
        buf.reset();
        assert!(buf.is_empty());
    }
}
