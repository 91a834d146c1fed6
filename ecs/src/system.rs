// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! System records: the read/write/order metadata the stage builder
//! partitions into conflict-free execution stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bitset::Bitset;

use crate::component::ComponentId;
use crate::config;
use crate::driver::SystemView;
use crate::Ecs;

pub const COMP_WORDS: usize = config::MAX_COMPONENTS / 64;
pub const SYS_WORDS: usize = config::MAX_SYSTEMS / 64;

pub type CompBits = Bitset<COMP_WORDS>;
pub type SysBits = Bitset<SYS_WORDS>;

pub type SysId = usize;

/// Opaque, caller-owned user data handed back to a system on every call.
/// The ECS never dereferences or drops it — lifetime is the caller's
/// responsibility, matching a plain `void *` in the source design.
#[derive(Clone, Copy)]
pub struct UserData(pub *mut ());

// SAFETY: the ECS only ever stores and copies this pointer; it never
// dereferences it, so sending/sharing it across threads is sound as long
// as the caller upholds the documented lifetime contract.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl Default for UserData {
    fn default() -> Self {
        Self(std::ptr::null_mut())
    }
}

pub type SystemFn = Arc<dyn Fn(&Ecs, SystemView<'_>, UserData) -> i32 + Send + Sync>;

#[derive(Clone)]
pub(crate) struct SystemRecord {
    pub func: SystemFn,
    pub udata: UserData,
    pub all_of: CompBits,
    pub none_of: CompBits,
    pub read: CompBits,
    pub write: CompBits,
    pub after: SysBits,
    pub group: i32,
    pub enabled: bool,
}

impl SystemRecord {
    fn new(func: SystemFn, udata: UserData) -> Self {
        Self {
            func,
            udata,
            all_of: CompBits::new(),
            none_of: CompBits::new(),
            read: CompBits::new(),
            write: CompBits::new(),
            after: SysBits::new(),
            group: 0,
            enabled: true,
        }
    }

    /// Whether `self` and `other` conflict: one writes a component the
    /// other reads or writes.
    pub(crate) fn conflicts_with(&self, other: &SystemRecord) -> bool {
        let other_rw = other.read.or(&other.write);
        let self_rw = self.read.or(&self.write);
        self.write.intersects(&other_rw) || other.write.intersects(&self_rw)
    }
}

/// Registration-order store of every system known to an [`Ecs`].
///
/// Any mutation that can change the conflict graph or `after` edges sets
/// `dirty`, which tells the stage builder to recompute on the next tick.
pub(crate) struct SystemRegistry {
    systems: RwLock<Vec<SystemRecord>>,
    dirty: AtomicBool,
}

impl SystemRegistry {
    pub(crate) fn new() -> Self {
        Self {
            systems: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(true),
        }
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn len(&self) -> usize {
        self.systems.read().unwrap().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<SystemRecord> {
        self.systems.read().unwrap().clone()
    }

    pub(crate) fn create(&self, func: SystemFn, udata: UserData) -> SysId {
        let mut guard = self.systems.write().unwrap();
        assert!(
            guard.len() < config::MAX_SYSTEMS,
            "system registry exhausted: more than MAX_SYSTEMS ({}) systems registered",
            config::MAX_SYSTEMS
        );
        guard.push(SystemRecord::new(func, udata));
        drop(guard);
        self.mark_dirty();
        self.len() - 1
    }

    fn with_mut<R>(&self, s: SysId, f: impl FnOnce(&mut SystemRecord) -> R) -> R {
        let mut guard = self.systems.write().unwrap();
        let rec = guard
            .get_mut(s)
            .unwrap_or_else(|| panic!("system id {s} out of range"));
        f(rec)
    }

    pub(crate) fn with<R>(&self, s: SysId, f: impl FnOnce(&SystemRecord) -> R) -> R {
        let guard = self.systems.read().unwrap();
        let rec = guard
            .get(s)
            .unwrap_or_else(|| panic!("system id {s} out of range"));
        f(rec)
    }

    pub(crate) fn require(&self, s: SysId, c: ComponentId) {
        self.with_mut(s, |rec| {
            rec.all_of.set(c);
            rec.read.set(c);
        });
        self.mark_dirty();
    }

    pub(crate) fn exclude(&self, s: SysId, c: ComponentId) {
        self.with_mut(s, |rec| rec.none_of.set(c));
        self.mark_dirty();
    }

    pub(crate) fn read(&self, s: SysId, c: ComponentId) {
        self.with_mut(s, |rec| rec.read.set(c));
        self.mark_dirty();
    }

    pub(crate) fn write(&self, s: SysId, c: ComponentId) {
        self.with_mut(s, |rec| rec.write.set(c));
        self.mark_dirty();
    }

    pub(crate) fn after(&self, s: SysId, dep: SysId) {
        self.with_mut(s, |rec| rec.after.set(dep));
        self.mark_dirty();
    }

    pub(crate) fn set_enabled(&self, s: SysId, enabled: bool) {
        self.with_mut(s, |rec| rec.enabled = enabled);
        self.mark_dirty();
    }

    pub(crate) fn enabled(&self, s: SysId) -> bool {
        self.with(s, |rec| rec.enabled)
    }

    pub(crate) fn set_group(&self, s: SysId, group: i32) {
        self.with_mut(s, |rec| rec.group = group);
    }

    pub(crate) fn group(&self, s: SysId) -> i32 {
        self.with(s, |rec| rec.group)
    }

    pub(crate) fn set_udata(&self, s: SysId, udata: UserData) {
        self.with_mut(s, |rec| rec.udata = udata);
    }

    pub(crate) fn udata(&self, s: SysId) -> UserData {
        self.with(s, |rec| rec.udata)
    }
}
