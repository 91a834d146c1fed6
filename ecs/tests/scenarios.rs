// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios exercising the public `Ecs` API: scheduling,
//! deferred mutation, group filtering, and exclude filters.
//!
//! Component payloads are written/read through the raw pointers `add`/
//! `get` hand back using `write_unaligned`/`read_unaligned` — the backing
//! byte blob only guarantees single-byte alignment, so a plain
//! dereference of a `*mut i32` cast would not be sound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ecs::system::UserData;
use ecs::Ecs;
use job_pool::JobPool;

#[repr(C)]
#[derive(Clone, Copy)]
struct Pos {
    x: i32,
    y: i32,
}

unsafe fn write_pos(ptr: *mut u8, pos: Pos) {
    std::ptr::write_unaligned(ptr.cast::<Pos>(), pos);
}

unsafe fn read_pos(ptr: *mut u8) -> Pos {
    std::ptr::read_unaligned(ptr.cast::<Pos>())
}

#[test]
fn single_system_increments_pos_x() {
    let ecs = Ecs::new();
    let pos = ecs.register_component(std::mem::size_of::<Pos>());

    let entities: Vec<_> = (0..10)
        .map(|i| {
            let e = ecs.create();
            let ptr = ecs.add(e, pos);
            unsafe {
                write_pos(
                    ptr,
                    Pos {
                        x: i,
                        y: 2 * i,
                    },
                );
            }
            e
        })
        .collect();

    let s = ecs.sys_create(
        move |ecs, view, _udata| {
            for &e in view.entities() {
                let ptr = ecs.get(e, pos);
                unsafe {
                    let mut p = read_pos(ptr);
                    p.x += 1;
                    write_pos(ptr, p);
                }
            }
            0
        },
        UserData::default(),
    );
    ecs.sys_require(s, pos);
    ecs.sys_write(s, pos);

    let status = ecs.progress(0);
    assert!(status.is_ok());

    for (i, &e) in entities.iter().enumerate() {
        let ptr = ecs.get(e, pos);
        let p = unsafe { read_pos(ptr) };
        assert_eq!(p.x, i as i32 + 1);
        assert_eq!(p.y, 2 * i as i32);
    }
}

#[test]
fn deferred_add_is_visible_only_after_the_stage_that_staged_it() {
    let ecs = Ecs::new();
    let pos = ecs.register_component(std::mem::size_of::<Pos>());
    let vel = ecs.register_component(4);

    let entities: Vec<_> = (0..8)
        .map(|_| {
            let e = ecs.create();
            ecs.add(e, pos);
            e
        })
        .collect();

    let a_counts = Arc::new(Mutex::new(Vec::new()));
    let a_counts2 = Arc::clone(&a_counts);
    let sa = ecs.sys_create(
        move |ecs, view, _udata| {
            a_counts2.lock().unwrap().push(view.count());
            for &e in view.entities() {
                ecs.add(e, vel);
            }
            0
        },
        UserData::default(),
    );
    ecs.sys_require(sa, pos);
    ecs.sys_exclude(sa, vel);
    ecs.sys_write(sa, vel);

    let b_counts = Arc::new(Mutex::new(Vec::new()));
    let b_counts2 = Arc::clone(&b_counts);
    let sb = ecs.sys_create(
        move |_ecs, view, _udata| {
            b_counts2.lock().unwrap().push(view.count());
            0
        },
        UserData::default(),
    );
    ecs.sys_require(sb, pos);
    ecs.sys_require(sb, vel);

    assert!(ecs.progress(0).is_ok());
    assert_eq!(a_counts.lock().unwrap().as_slice(), &[8]);
    assert_eq!(b_counts.lock().unwrap().as_slice(), &[8]);

    assert!(ecs.progress(0).is_ok());
    assert_eq!(a_counts.lock().unwrap().as_slice(), &[8, 0]);
    assert_eq!(b_counts.lock().unwrap().as_slice(), &[8, 8]);

    let _ = entities;
}

#[test]
fn group_mask_selects_systems_by_group() {
    let ecs = Ecs::new();
    let marker = ecs.register_component(1);
    for _ in 0..10 {
        let e = ecs.create();
        ecs.add(e, marker);
    }

    let make_counter = |ecs: &Ecs, group: i32| {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let s = ecs.sys_create(
            move |_ecs, view, _udata| {
                count2.store(view.count(), Ordering::Relaxed);
                0
            },
            UserData::default(),
        );
        ecs.sys_require(s, marker);
        if group != 0 {
            ecs.sys_set_group(s, group);
        }
        count
    };

    let sa_count = make_counter(&ecs, 1);
    let sb_count = make_counter(&ecs, 2);
    let sc_count = make_counter(&ecs, 0);

    assert!(ecs.progress(1).is_ok());
    assert_eq!(sa_count.load(Ordering::Relaxed), 10);
    assert_eq!(sb_count.load(Ordering::Relaxed), 0);
    assert_eq!(sc_count.load(Ordering::Relaxed), 0);

    sa_count.store(0, Ordering::Relaxed);
    assert!(ecs.progress(2).is_ok());
    assert_eq!(sa_count.load(Ordering::Relaxed), 0);
    assert_eq!(sb_count.load(Ordering::Relaxed), 10);
    assert_eq!(sc_count.load(Ordering::Relaxed), 0);

    sb_count.store(0, Ordering::Relaxed);
    assert!(ecs.progress(1 | 2).is_ok());
    assert_eq!(sa_count.load(Ordering::Relaxed), 10);
    assert_eq!(sb_count.load(Ordering::Relaxed), 10);
    assert_eq!(sc_count.load(Ordering::Relaxed), 0);

    sa_count.store(0, Ordering::Relaxed);
    sb_count.store(0, Ordering::Relaxed);
    assert!(ecs.progress(0).is_ok());
    assert_eq!(sa_count.load(Ordering::Relaxed), 0);
    assert_eq!(sb_count.load(Ordering::Relaxed), 0);
    assert_eq!(sc_count.load(Ordering::Relaxed), 10);
}

#[test]
fn exclude_filter_drops_entities_with_the_excluded_component() {
    let ecs = Ecs::new();
    let pos = ecs.register_component(std::mem::size_of::<Pos>());
    let vel = ecs.register_component(4);

    let e1 = ecs.create();
    ecs.add(e1, pos);
    let e2 = ecs.create();
    ecs.add(e2, pos);
    ecs.add(e2, vel);

    let matched = Arc::new(Mutex::new(Vec::new()));
    let matched2 = Arc::clone(&matched);
    let s = ecs.sys_create(
        move |_ecs, view, _udata| {
            matched2.lock().unwrap().extend_from_slice(view.entities());
            0
        },
        UserData::default(),
    );
    ecs.sys_require(s, pos);
    ecs.sys_exclude(s, vel);

    assert!(ecs.progress(0).is_ok());
    assert_eq!(matched.lock().unwrap().as_slice(), &[e1]);
}

#[test]
fn parallel_lanes_partition_entities_without_overlap_or_gaps() {
    let ecs = Ecs::new();
    let pool = Arc::new(JobPool::new(4, 256));
    ecs.set_task_callbacks(pool, 4);

    let pos = ecs.register_component(std::mem::size_of::<Pos>());
    let entities: Vec<_> = (0..97)
        .map(|i| {
            let e = ecs.create();
            let ptr = ecs.add(e, pos);
            unsafe { write_pos(ptr, Pos { x: i, y: 0 }) };
            e
        })
        .collect();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let s = ecs.sys_create(
        move |ecs, view, _udata| {
            let mut guard = seen2.lock().unwrap();
            for &e in view.entities() {
                let ptr = ecs.get(e, pos);
                let mut p = unsafe { read_pos(ptr) };
                p.x += 1000;
                unsafe { write_pos(ptr, p) };
                guard.push(e);
            }
            0
        },
        UserData::default(),
    );
    ecs.sys_require(s, pos);
    ecs.sys_write(s, pos);

    assert!(ecs.progress(0).is_ok());

    let mut touched = seen.lock().unwrap().clone();
    touched.sort_unstable();
    let mut expected = entities.clone();
    expected.sort_unstable();
    assert_eq!(
        touched, expected,
        "every entity is visited exactly once across all lanes, odd entity count included"
    );

    for &e in &entities {
        let ptr = ecs.get(e, pos);
        let p = unsafe { read_pos(ptr) };
        assert_eq!(p.x - 1000, entities.iter().position(|&x| x == e).unwrap() as i32);
    }
}

#[test]
fn conflicting_systems_split_into_two_stages_either_registration_order() {
    for (writer_first, _label) in [(true, "writer-then-reader"), (false, "reader-then-writer")] {
        let ecs = Ecs::new();
        let pos = ecs.register_component(std::mem::size_of::<Pos>());

        let (writer, reader) = if writer_first {
            let w = ecs.sys_create(|_, _, _| 0, UserData::default());
            ecs.sys_require(w, pos);
            ecs.sys_write(w, pos);
            let r = ecs.sys_create(|_, _, _| 0, UserData::default());
            ecs.sys_require(r, pos);
            (w, r)
        } else {
            let r = ecs.sys_create(|_, _, _| 0, UserData::default());
            ecs.sys_require(r, pos);
            let w = ecs.sys_create(|_, _, _| 0, UserData::default());
            ecs.sys_require(w, pos);
            ecs.sys_write(w, pos);
            (w, r)
        };

        assert!(ecs.progress(0).is_ok());
        ecs.with_stages(|stages| {
            assert_eq!(stages.len(), 2);
            let stage_of = |s: usize| {
                stages
                    .iter()
                    .position(|st| st.systems.contains(&s))
                    .unwrap()
            };
            assert!(stage_of(writer) < stage_of(reader));
        });
    }
}
