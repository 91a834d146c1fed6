// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fixed-capacity MPMC job pool: a ring of ticket-sequenced slots plus a
//! small worker thread pool, with inline-execution fallback when the ring is
//! full and assisted waiting (a caller blocked in [`JobPool::wait`] drains
//! the ring itself rather than sitting idle).
//!
//! The ring follows the classic bounded MPMC queue design: each slot carries
//! an atomic `turn` counter that alternates between "writable" (even) and
//! "readable" (odd) as the slot cycles through producers and consumers.
//! `head`/`tail` are monotonically increasing ticket counters; a producer or
//! consumer claims a ticket with a single CAS and then owns that slot
//! exclusively until it publishes the next turn, so no two threads ever
//! touch the same slot's payload concurrently.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use ecs_spin::Backoff;
use ecs_util::CachePadded;

pub mod config {
    /// Ring capacity used when [`super::JobPool::new`] is given `0`.
    pub const DEFAULT_CAPACITY: usize = 1024;
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Slot {
    turn: AtomicU64,
    job: UnsafeCell<Option<Job>>,
}

// SAFETY: a slot's `job` cell is only ever touched by the single thread that
// currently holds the matching ticket (enforced by the turn protocol), so
// sharing `Slot` across threads is sound as long as `Job: Send`.
unsafe impl Sync for Slot {}

struct Inner {
    slots: Box<[Slot]>,
    capacity: u64,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    enqueued: CachePadded<AtomicUsize>,
    in_flight: CachePadded<AtomicUsize>,
    stop: AtomicBool,
    nthreads: usize,
    work_lock: Mutex<()>,
    cv_work: Condvar,
    done_lock: Mutex<()>,
    cv_done: Condvar,
}

impl Inner {
    /// Attempt to claim a slot for writing. Returns the job back on failure
    /// (ring full).
    fn try_enqueue(&self, job: Job) -> Result<(), Job> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            // `% self.capacity` is always < capacity, which was itself a
            // `usize` before being widened to `u64` in `new`.
            #[allow(clippy::cast_possible_truncation)]
            let idx = (head % self.capacity) as usize;
            let slot = &self.slots[idx];
            let expected_turn = (head / self.capacity) * 2;
            let observed = slot.turn.load(Ordering::Acquire);

            if observed == expected_turn {
                match self.head.compare_exchange_weak(
                    head,
                    head + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: we hold the only claim on this slot until
                        // we publish `expected_turn + 1` below.
                        unsafe {
                            *slot.job.get() = Some(job);
                        }
                        slot.turn.store(expected_turn + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(_) => {
                        backoff.spin();
                        continue;
                    }
                }
            }

            // Slot isn't writable yet. If head has moved since we read it,
            // another producer made progress; retry. Otherwise the ring is
            // genuinely full.
            if self.head.load(Ordering::Acquire) != head {
                backoff.spin();
                continue;
            }
            return Err(job);
        }
    }

    /// Attempt to claim a slot for reading. Returns `None` if the ring is
    /// empty.
    fn try_dequeue(&self) -> Option<Job> {
        let mut backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // See the matching comment in `try_enqueue`.
            #[allow(clippy::cast_possible_truncation)]
            let idx = (tail % self.capacity) as usize;
            let slot = &self.slots[idx];
            let expected_turn = (tail / self.capacity) * 2 + 1;
            let observed = slot.turn.load(Ordering::Acquire);

            if observed == expected_turn {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: see try_enqueue.
                        let job = unsafe { (*slot.job.get()).take() };
                        slot.turn
                            .store(expected_turn + 1, Ordering::Release);
                        return job;
                    }
                    Err(_) => {
                        backoff.spin();
                        continue;
                    }
                }
            }

            if self.tail.load(Ordering::Acquire) != tail {
                backoff.spin();
                continue;
            }
            return None;
        }
    }

    /// Claim one job off the ring and decrement `enqueued` to match, or
    /// `None` if nothing is available right now.
    fn claim(&self) -> Option<Job> {
        if self.enqueued.load(Ordering::Acquire) == 0 {
            return None;
        }
        let job = self.try_dequeue()?;
        self.enqueued.fetch_sub(1, Ordering::AcqRel);
        Some(job)
    }

    fn run(&self, job: Job) {
        job();
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.done_lock.lock().unwrap();
            self.cv_done.notify_all();
        }
    }

    fn wake_for_new_work(&self, prev_enqueued: usize) {
        if prev_enqueued < self.nthreads {
            let _guard = self.work_lock.lock().unwrap();
            self.cv_work.notify_one();
        }
        // A caller blocked in `wait()` may be able to assist; it's waiting
        // on `enqueued` too, not just `in_flight == 0`.
        let _guard = self.done_lock.lock().unwrap();
        self.cv_done.notify_all();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        if let Some(job) = inner.claim() {
            inner.run(job);
            continue;
        }
        if inner.stop.load(Ordering::Acquire) && inner.in_flight.load(Ordering::Acquire) == 0 {
            return;
        }
        let guard = inner.work_lock.lock().unwrap();
        if inner.enqueued.load(Ordering::Acquire) == 0 && !inner.stop.load(Ordering::Acquire) {
            let _guard = inner.cv_work.wait(guard).unwrap();
        }
    }
}

/// A fixed-capacity MPMC job pool with `nthreads` worker threads.
///
/// `submit` never blocks: if the ring is full the job runs inline on the
/// caller's thread, trading latency for the liveness guarantee that a burst
/// of submissions can never deadlock waiting for queue space.
pub struct JobPool {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl JobPool {
    /// Creates a pool with `nthreads` workers (minimum 1) and a ring of
    /// `capacity` slots (`0` selects [`config::DEFAULT_CAPACITY`]).
    ///
    /// # Panics
    /// Panics if the OS refuses to spawn a worker thread.
    #[must_use]
    pub fn new(nthreads: usize, capacity: usize) -> Self {
        let nthreads = nthreads.max(1);
        let capacity = if capacity == 0 {
            config::DEFAULT_CAPACITY
        } else {
            capacity
        };
        let slots = (0..capacity)
            .map(|_| Slot {
                turn: AtomicU64::new(0),
                job: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let inner = Arc::new(Inner {
            slots,
            capacity: capacity as u64,
            head: CachePadded::from(AtomicU64::new(0)),
            tail: CachePadded::from(AtomicU64::new(0)),
            enqueued: CachePadded::from(AtomicUsize::new(0)),
            in_flight: CachePadded::from(AtomicUsize::new(0)),
            stop: AtomicBool::new(false),
            nthreads,
            work_lock: Mutex::new(()),
            cv_work: Condvar::new(),
            done_lock: Mutex::new(()),
            cv_done: Condvar::new(),
        });

        let workers = (0..nthreads)
            .map(|i| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("job-pool-{i}"))
                    .spawn(move || worker_loop(inner))
                    .expect("failed to spawn job pool worker thread")
            })
            .collect();

        tracing::debug!(nthreads, capacity, "job pool started");
        Self { inner, workers }
    }

    #[must_use]
    pub fn nthreads(&self) -> usize {
        self.inner.nthreads
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity as usize
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Submits `job`. If the ring is full the job is executed inline before
    /// this call returns.
    ///
    /// # Panics
    /// Panics if an internal lock is poisoned (a panic occurred inside a
    /// previously submitted job while it held the lock).
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.inner.try_enqueue(Box::new(job)) {
            Ok(()) => {
                let prev = self.inner.enqueued.fetch_add(1, Ordering::AcqRel);
                self.inner.wake_for_new_work(prev);
            }
            Err(job) => {
                tracing::trace!("job pool ring full, running job inline");
                self.inner.run(job);
            }
        }
    }

    /// Blocks until every submitted job (and everything submitted before
    /// this call returns) has completed, assisting by draining the ring
    /// itself while it waits.
    ///
    /// # Panics
    /// Panics if an internal lock is poisoned (a panic occurred inside a
    /// previously submitted job while it held the lock).
    pub fn wait(&self) {
        loop {
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            if let Some(job) = self.inner.claim() {
                self.inner.run(job);
                continue;
            }
            let guard = self.inner.done_lock.lock().unwrap();
            if self.inner.in_flight.load(Ordering::Acquire) != 0
                && self.inner.enqueued.load(Ordering::Acquire) == 0
            {
                let _guard = self.inner.cv_done.wait(guard).unwrap();
            }
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.wait();
        self.inner.stop.store(true, Ordering::Release);
        {
            let _guard = self.inner.work_lock.lock().unwrap();
            self.inner.cv_work.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn runs_all_submitted_jobs() {
        let pool = JobPool::new(4, 64);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn overflow_runs_inline_without_deadlock() {
        // Capacity 4, nthreads 1: submitting far more than capacity forces
        // the inline fallback to kick in repeatedly.
        let pool = JobPool::new(1, 4);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn busy_worker_with_fast_jobs_still_completes() {
        let pool = JobPool::new(2, 8);
        let counter = Arc::new(AtomicU32::new(0));

        let slow_counter = Arc::clone(&counter);
        pool.submit(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            slow_counter.fetch_add(1, Ordering::Relaxed);
        });

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 51);
    }

    #[test]
    fn nested_submit_from_worker_does_not_deadlock() {
        let pool = Arc::new(JobPool::new(2, 16));
        let counter = Arc::new(AtomicU32::new(0));

        let pool2 = Arc::clone(&pool);
        let counter2 = Arc::clone(&counter);
        pool.submit(move || {
            for _ in 0..10 {
                let counter3 = Arc::clone(&counter2);
                pool2.submit(move || {
                    counter3.fetch_add(1, Ordering::Relaxed);
                });
            }
        });

        pool.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }
}
