// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use job_pool::JobPool;

fn submit_noop_jobs(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_pool_submit");
    for nthreads in [1, 4, 8] {
        group.bench_function(format!("nthreads={nthreads}"), |b| {
            let pool = JobPool::new(nthreads, 1024);
            let counter = Arc::new(AtomicU64::new(0));
            b.iter(|| {
                for _ in 0..1000 {
                    let counter = Arc::clone(&counter);
                    pool.submit(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                pool.wait();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, submit_noop_jobs);
criterion_main!(benches);
