// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compile-time tunables. Everything here is a `pub const`; nothing in this
//! module is mutable at runtime — runtime-tunable knobs (worker count, queue
//! capacity, lane count) live on [`crate::executor::TaskExecutor`] and
//! [`crate::Ecs::set_task_callbacks`] instead.

/// Width of every [`bitset::Bitset`] keyed by component ID.
pub const MAX_COMPONENTS: usize = 256;

/// Maximum number of systems a single [`crate::Ecs`] can register.
pub const MAX_SYSTEMS: usize = 1024;

/// Upper bound on the lane count passed to
/// [`crate::Ecs::set_task_callbacks`].
pub const MAX_LANES: usize = 1024;

/// Initial command count reserved in a freshly grown
/// [`crate::command::CommandBuffer`].
pub const COMMAND_BUFFER_INITIAL_CAPACITY: usize = 64;

/// Initial byte capacity of a command buffer's `Add` payload arena.
pub const COMMAND_DATA_INITIAL_CAPACITY: usize = 1024;

/// Initial entity count reserved in a lane's scratch match buffer.
pub const SCRATCH_INITIAL_CAPACITY: usize = 64;

/// Ring capacity used by [`job_pool::JobPool::new`] when the caller passes
/// `0`.
pub const POOL_DEFAULT_QUEUE_CAPACITY: usize = job_pool::config::DEFAULT_CAPACITY;

/// Assumed cache line size, used to pad hot atomics against false sharing.
pub const CACHE_LINE_BYTES: usize = 64;

static_assertions::const_assert!(MAX_COMPONENTS % 64 == 0);
static_assertions::const_assert!(MAX_SYSTEMS % 64 == 0);
