// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A parallel entity-component-system runtime: systems declare the
//! components they read and write, the stage builder groups them into
//! conflict-free execution stages, and the progress driver shards each
//! stage's matched entities across worker lanes backed by a pluggable
//! [`TaskExecutor`].
//!
//! See [`config`] for compile-time tunables and [`error`] for the
//! recoverable error surface. Precondition violations (out-of-range IDs,
//! registry exhaustion, cyclic `after` edges) panic rather than return a
//! `Result` — see `SPEC_FULL.md` §7 for the full taxonomy this mirrors.

mod command;
pub mod component;
pub mod config;
pub mod driver;
pub mod entity;
pub mod error;
pub mod executor;
pub mod stage;
pub mod system;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use command::{Command, CommandBuffer};
use component::{ComponentId, ComponentPool};
use entity::{EntityAllocator, EntityId};
use executor::{Task, TaskExecutor};
use stage::{Stage, StageBuilder};
use system::{SysId, SystemRegistry, UserData};

pub use driver::SystemView;
pub use entity::NONE as ENTITY_NONE;
pub use error::Status;

struct Pools {
    pools: RwLock<Vec<RwLock<ComponentPool>>>,
}

impl Pools {
    fn new() -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        self.pools.read().unwrap().len()
    }

    fn register(&self, elem_size: usize) -> ComponentId {
        let mut guard = self.pools.write().unwrap();
        assert!(
            guard.len() < config::MAX_COMPONENTS,
            "component registry exhausted: more than MAX_COMPONENTS ({}) components registered",
            config::MAX_COMPONENTS
        );
        guard.push(RwLock::new(ComponentPool::new(elem_size)));
        guard.len() - 1
    }

    fn with<R>(&self, c: ComponentId, f: impl FnOnce(&ComponentPool) -> R) -> R {
        let outer = self.pools.read().unwrap();
        let pool = outer
            .get(c)
            .unwrap_or_else(|| panic!("component id {c} out of range"));
        f(&pool.read().unwrap())
    }

    fn with_mut<R>(&self, c: ComponentId, f: impl FnOnce(&mut ComponentPool) -> R) -> R {
        let outer = self.pools.read().unwrap();
        let pool = outer
            .get(c)
            .unwrap_or_else(|| panic!("component id {c} out of range"));
        f(&mut pool.write().unwrap())
    }
}

struct LaneState {
    lane_count: usize,
    command_buffers: Vec<Arc<Mutex<CommandBuffer>>>,
    scratch: Vec<Arc<Mutex<Vec<EntityId>>>>,
}

impl LaneState {
    fn with_lane_count(lane_count: usize) -> Self {
        Self {
            lane_count,
            command_buffers: (0..lane_count)
                .map(|_| Arc::new(Mutex::new(CommandBuffer::new())))
                .collect(),
            scratch: (0..lane_count)
                .map(|_| {
                    Arc::new(Mutex::new(Vec::with_capacity(
                        config::SCRATCH_INITIAL_CAPACITY,
                    )))
                })
                .collect(),
        }
    }
}

/// A parallel ECS instance. Cheaply shareable behind an `Arc` (every
/// public method takes `&self`); the only interior-mutable state living
/// outside locks/atomics is the thread-local lane index each task
/// publishes for the duration of its call (see [`driver`]).
pub struct Ecs {
    entities: EntityAllocator,
    pools: Pools,
    systems: SystemRegistry,
    stages: Mutex<StageBuilder>,
    lanes: RwLock<LaneState>,
    executor: RwLock<Option<Arc<dyn TaskExecutor>>>,
    in_progress: AtomicBool,
}

impl Default for Ecs {
    fn default() -> Self {
        Self::new()
    }
}

impl Ecs {
    #[must_use]
    pub fn new() -> Self {
        tracing::debug!("ecs instance created");
        Self {
            entities: EntityAllocator::new(),
            pools: Pools::new(),
            systems: SystemRegistry::new(),
            stages: Mutex::new(StageBuilder::new()),
            lanes: RwLock::new(LaneState::with_lane_count(1)),
            executor: RwLock::new(None),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Configures the task executor and lane count used by `progress`/
    /// `run_system`. `lane_count` is clamped to `[1, MAX_LANES]`.
    ///
    /// # Panics
    /// Panics if an internal lock is poisoned.
    pub fn set_task_callbacks(&self, executor: Arc<dyn TaskExecutor>, lane_count: usize) {
        let lane_count = lane_count.clamp(1, config::MAX_LANES);
        *self.executor.write().unwrap() = Some(executor);
        *self.lanes.write().unwrap() = LaneState::with_lane_count(lane_count);
        tracing::debug!(lane_count, "task callbacks configured");
    }

    // ---- entities ---------------------------------------------------

    /// # Panics
    /// Panics if an internal lock is poisoned.
    #[must_use]
    pub fn create(&self) -> EntityId {
        self.entities.create()
    }

    /// Destroys `e`, immediately if no tick is in progress, otherwise
    /// deferred to the current lane's command buffer.
    ///
    /// # Panics
    /// Panics if called mid-tick from a thread with no published lane
    /// (i.e. not running inside a system's task), or if an internal lock
    /// is poisoned.
    pub fn destroy(&self, e: EntityId) {
        if self.in_progress.load(Ordering::Acquire) {
            let lane = driver::current_lane()
                .expect("destroy() called mid-tick without an active lane context");
            self.lane_buffer(lane).lock().unwrap().push_destroy(e);
        } else {
            self.destroy_immediate(e);
        }
    }

    fn destroy_immediate(&self, e: EntityId) {
        debug_assert!(
            !self.in_progress.load(Ordering::Acquire),
            "destroy_immediate invoked while a tick is in progress"
        );
        let n = self.pools.len();
        for c in 0..n {
            self.pools.with_mut(c, |p| {
                p.remove(e);
            });
        }
        self.entities.destroy(e);
    }

    // ---- components ---------------------------------------------------

    /// # Panics
    /// Panics if more than [`config::MAX_COMPONENTS`] components have
    /// already been registered on this `Ecs`.
    pub fn register_component(&self, elem_size_bytes: usize) -> ComponentId {
        self.pools.register(elem_size_bytes)
    }

    /// Returns a pointer to `e`'s payload for component `c`, inserting a
    /// zero-initialised one if absent. Deferred (staged in the current
    /// lane's arena) if a tick is in progress; the returned pointer is
    /// valid until the next stage sync in that case.
    ///
    /// # Panics
    /// Panics if called mid-tick from a thread with no published lane, if
    /// `c` is out of range, or if an internal lock is poisoned.
    pub fn add(&self, e: EntityId, c: ComponentId) -> *mut u8 {
        if self.in_progress.load(Ordering::Acquire) {
            let lane = driver::current_lane()
                .expect("add() called mid-tick without an active lane context");
            let elem_size = self.pools.with(c, ComponentPool::elem_size);
            self.lane_buffer(lane).lock().unwrap().push_add(e, c, elem_size)
        } else {
            self.pools.with_mut(c, |p| p.add(e).as_mut_ptr())
        }
    }

    /// # Panics
    /// Panics if called mid-tick from a thread with no published lane, if
    /// `c` is out of range, or if an internal lock is poisoned.
    pub fn remove(&self, e: EntityId, c: ComponentId) {
        if self.in_progress.load(Ordering::Acquire) {
            let lane = driver::current_lane()
                .expect("remove() called mid-tick without an active lane context");
            self.lane_buffer(lane).lock().unwrap().push_remove(e, c);
        } else {
            self.pools.with_mut(c, |p| {
                p.remove(e);
            });
        }
    }

    /// Returns a pointer to `e`'s payload for `c`, or null if absent.
    /// Always immediate — reads are permitted at any time.
    ///
    /// # Panics
    /// Panics if `c` is out of range, or if an internal lock is poisoned.
    #[must_use]
    pub fn get(&self, e: EntityId, c: ComponentId) -> *mut u8 {
        self.pools
            .with_mut(c, |p| p.get(e).map_or(std::ptr::null_mut(), <[u8]>::as_mut_ptr))
    }

    /// # Panics
    /// Panics if `c` is out of range, or if an internal lock is poisoned.
    #[must_use]
    pub fn has(&self, e: EntityId, c: ComponentId) -> bool {
        self.pools.with(c, |p| p.has(e))
    }

    // ---- systems ---------------------------------------------------
    //
    // Every method below but `sys_create` takes a `SysId` returned by an
    // earlier `sys_create` call on this same `Ecs`; each carries the same
    // `# Panics` contract (out-of-range `s`/`s_dep`, or a poisoned internal
    // registry lock) rather than repeating the sentence on every method.

    pub fn sys_create<F>(&self, func: F, udata: UserData) -> SysId
    where
        F: Fn(&Ecs, SystemView<'_>, UserData) -> i32 + Send + Sync + 'static,
    {
        self.systems.create(Arc::new(func), udata)
    }

    /// Adds `c` to `s`'s `all_of` and `read` sets.
    ///
    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    pub fn sys_require(&self, s: SysId, c: ComponentId) {
        self.systems.require(s, c);
    }

    /// Adds `c` to `s`'s `none_of` set.
    ///
    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    pub fn sys_exclude(&self, s: SysId, c: ComponentId) {
        self.systems.exclude(s, c);
    }

    /// Adds `c` to `s`'s `read` set.
    ///
    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    pub fn sys_read(&self, s: SysId, c: ComponentId) {
        self.systems.read(s, c);
    }

    /// Adds `c` to `s`'s `write` set.
    ///
    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    pub fn sys_write(&self, s: SysId, c: ComponentId) {
        self.systems.write(s, c);
    }

    /// Adds an explicit ordering edge: `s` must run strictly after
    /// `s_dep`.
    ///
    /// # Panics
    /// Panics if `s` or `s_dep` is out of range for this `Ecs`.
    pub fn sys_after(&self, s: SysId, s_dep: SysId) {
        self.systems.after(s, s_dep);
    }

    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    pub fn sys_enable(&self, s: SysId) {
        self.systems.set_enabled(s, true);
    }

    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    pub fn sys_disable(&self, s: SysId) {
        self.systems.set_enabled(s, false);
    }

    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    pub fn sys_set_group(&self, s: SysId, group: i32) {
        self.systems.set_group(s, group);
    }

    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    #[must_use]
    pub fn sys_get_group(&self, s: SysId) -> i32 {
        self.systems.group(s)
    }

    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    pub fn sys_set_udata(&self, s: SysId, udata: UserData) {
        self.systems.set_udata(s, udata);
    }

    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`.
    #[must_use]
    pub fn sys_get_udata(&self, s: SysId) -> UserData {
        self.systems.udata(s)
    }

    /// A `Debug`-friendly view of the current (cached) stage partition,
    /// useful for diagnosing scheduling decisions.
    ///
    /// # Panics
    /// Panics if the internal stage-builder lock is poisoned.
    pub fn with_stages<R>(&self, f: impl FnOnce(&[Stage]) -> R) -> R {
        f(self.stages.lock().unwrap().stages())
    }

    // ---- execution ---------------------------------------------------

    /// Runs one system outside stage logic, still applying command
    /// buffers at the end. Semantically equivalent to a one-stage tick
    /// containing exactly that system.
    ///
    /// # Panics
    /// Panics if `s` is out of range for this `Ecs`, or if an internal
    /// lock is poisoned.
    pub fn run_system(&self, s: SysId) -> Status {
        self.rebuild_stages_if_dirty();
        self.in_progress.store(true, Ordering::Release);
        let status = self.dispatch_stage(std::slice::from_ref(&s));
        self.in_progress.store(false, Ordering::Release);
        self.drain_commands();
        status
    }

    /// Runs every enabled system whose group matches `group_mask`,
    /// stage by stage. `group_mask == 0` selects systems in the default
    /// group (group `0`); otherwise a system participates if
    /// `group & group_mask != 0`.
    ///
    /// # Panics
    /// Panics if the internal stage-builder lock is poisoned.
    pub fn progress(&self, group_mask: i32) -> Status {
        self.rebuild_stages_if_dirty();
        self.in_progress.store(true, Ordering::Release);

        let stage_list = self.stages.lock().unwrap().stages().to_vec();
        let mut status = Status::OK;
        for stage in &stage_list {
            let active: Vec<SysId> = stage
                .systems
                .iter()
                .copied()
                .filter(|&s| self.system_active(s, group_mask))
                .collect();
            if active.is_empty() {
                continue;
            }
            let stage_status = self.dispatch_stage(&active);

            self.in_progress.store(false, Ordering::Release);
            self.drain_commands();
            self.in_progress.store(true, Ordering::Release);

            if !stage_status.is_ok() {
                if status.is_ok() {
                    status = stage_status;
                }
                break;
            }
        }

        self.in_progress.store(false, Ordering::Release);
        self.drain_commands();
        status
    }

    fn rebuild_stages_if_dirty(&self) {
        if self.systems.take_dirty() {
            let snapshot = self.systems.snapshot();
            tracing::trace!(systems = snapshot.len(), "rebuilding stage partition");
            self.stages.lock().unwrap().rebuild(&snapshot);
        }
    }

    fn system_active(&self, s: SysId, group_mask: i32) -> bool {
        if !self.systems.enabled(s) {
            return false;
        }
        let group = self.systems.group(s);
        if group_mask == 0 {
            group == 0
        } else {
            group & group_mask != 0
        }
    }

    fn lane_buffer(&self, lane: usize) -> Arc<Mutex<CommandBuffer>> {
        let lanes = self.lanes.read().unwrap();
        Arc::clone(
            lanes
                .command_buffers
                .get(lane)
                .unwrap_or_else(|| panic!("lane {lane} out of range")),
        )
    }

    fn lane_scratch(&self, lane: usize) -> Arc<Mutex<Vec<EntityId>>> {
        let lanes = self.lanes.read().unwrap();
        Arc::clone(
            lanes
                .scratch
                .get(lane)
                .unwrap_or_else(|| panic!("lane {lane} out of range")),
        )
    }

    fn dispatch_stage(&self, system_ids: &[SysId]) -> Status {
        let lane_count = self.lanes.read().unwrap().lane_count;
        let executor = self.executor.read().unwrap().clone();
        match executor {
            Some(exec) if lane_count > 1 => self.dispatch_parallel(system_ids, lane_count, &exec),
            _ => self.dispatch_sequential(system_ids),
        }
    }

    fn dispatch_sequential(&self, system_ids: &[SysId]) -> Status {
        let mut status = Status::OK;
        for &sys in system_ids {
            let st = self.run_task(sys, 0, 1);
            if !st.is_ok() && status.is_ok() {
                status = st;
            }
        }
        status
    }

    fn dispatch_parallel(
        &self,
        system_ids: &[SysId],
        lane_count: usize,
        executor: &Arc<dyn TaskExecutor>,
    ) -> Status {
        let first_error = Arc::new(AtomicI32::new(0));

        // SAFETY: `executor.wait()` below blocks until every task submitted
        // in this loop has completed, so `self` cannot be invalidated while
        // a task still holds this reference — the same scoped-thread
        // contract `std::thread::scope` relies on.
        let ecs: &'static Ecs = unsafe { &*std::ptr::from_ref(self) };

        for &sys in system_ids {
            for lane in 0..lane_count {
                let first_error = Arc::clone(&first_error);
                let task: Task = Box::new(move || {
                    let status = ecs.run_task(sys, lane, lane_count);
                    if !status.is_ok() {
                        let _ = first_error.compare_exchange(
                            0,
                            status.0,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                });
                let rc = executor.submit(task);
                if rc != 0 {
                    let _ = first_error.compare_exchange(
                        0,
                        rc,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }
        }
        executor.wait();
        Status(first_error.load(Ordering::Acquire))
    }

    /// Executes one `(system, lane)` task: publish the lane, pick a
    /// driver pool, slice it, match entities, run the system.
    fn run_task(&self, sys: SysId, lane: usize, lane_count: usize) -> Status {
        let _lane_guard = driver::LaneGuard::enter(lane);

        let (all_of, none_of, func, udata) = self
            .systems
            .with(sys, |rec| (rec.all_of, rec.none_of, rec.func.clone(), rec.udata));

        let driver_comp = all_of
            .iter_ones()
            .min_by_key(|&c| self.pools.with(c, ComponentPool::len));

        let scratch = self.lane_scratch(lane);
        let mut scratch_guard = scratch.lock().unwrap();
        scratch_guard.clear();

        if let Some(driver_comp) = driver_comp {
            let dense_len = self.pools.with(driver_comp, ComponentPool::len);
            let (start, end) = driver::compute_slice(dense_len, lane, lane_count);
            let candidates: Vec<EntityId> =
                self.pools.with(driver_comp, |p| p.dense()[start..end].to_vec());
            for e in candidates {
                if self.entity_matches(e, &all_of, &none_of) {
                    scratch_guard.push(e);
                }
            }
        }

        let view = SystemView {
            entities: &scratch_guard,
        };
        let raw_status = func(self, view, udata);
        Status(raw_status)
    }

    fn entity_matches(
        &self,
        e: EntityId,
        all_of: &system::CompBits,
        none_of: &system::CompBits,
    ) -> bool {
        for c in all_of.iter_ones() {
            if !self.pools.with(c, |p| p.has(e)) {
                return false;
            }
        }
        if none_of.any() {
            for c in none_of.iter_ones() {
                if self.pools.with(c, |p| p.has(e)) {
                    return false;
                }
            }
        }
        true
    }

    /// Applies every lane's staged commands (FIFO within a lane, order
    /// between lanes unspecified), then resets each lane's buffer.
    fn drain_commands(&self) {
        let buffers = self.lanes.read().unwrap().command_buffers.clone();
        for cb in buffers {
            let mut guard = cb.lock().unwrap();
            if guard.is_empty() {
                continue;
            }
            for cmd in guard.commands() {
                match cmd {
                    Command::Destroy(e) => self.destroy_immediate(*e),
                    Command::Remove(e, c) => {
                        self.pools.with_mut(*c, |p| {
                            p.remove(*e);
                        });
                    }
                    Command::Add { entity, component, .. } => {
                        // SAFETY: the arena backing this pointer has not
                        // been reset since this command was pushed; we
                        // are draining it now, before calling `reset`.
                        let bytes = unsafe { CommandBuffer::payload_of(cmd) }
                            .expect("Add command always carries a payload");
                        self.pools.with_mut(*component, |p| {
                            p.add(*entity).copy_from_slice(bytes);
                        });
                    }
                }
            }
            guard.reset();
        }
        tracing::trace!("command buffers drained");
    }
}
