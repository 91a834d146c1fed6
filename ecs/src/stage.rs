// Copyright 2025 k23-ecs contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stage construction: partitions systems into an ordered sequence of
//! conflict-free stages, honouring both write-conflict-derived edges and
//! explicit `after` edges.

use std::collections::VecDeque;

use crate::system::{SysId, SystemRecord};

/// One level of the schedule: a set of systems safe to run concurrently.
#[derive(Debug, Clone, Default)]
pub struct Stage {
    pub systems: Vec<SysId>,
}

/// Cached, conflict-aware partition of the system registry into stages.
///
/// Rebuilt only when the registry's `dirty` flag is set; the assignment is
/// a pure function of registration order and each system's read/write/
/// after sets (see the determinism property this crate's proptests
/// exercise).
#[derive(Default)]
pub(crate) struct StageBuilder {
    stages: Vec<Stage>,
}

impl StageBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub(crate) fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Recomputes the stage partition via longest-path topological
    /// leveling (Kahn's algorithm with level propagation on edge removal).
    ///
    /// Edges:
    /// - `i -> j` for `i < j` when `systems[i]` and `systems[j]` conflict
    ///   (write/read-or-write overlap), tie-broken by registration order.
    /// - `i -> j` whenever `j`'s `after` bitset has bit `i` set, regardless
    ///   of which of `i`, `j` registered first.
    ///
    /// # Panics
    ///
    /// Panics if the edge set contains a cycle: an explicit `after` edge
    /// contradicting a conflict-derived order is a precondition violation,
    /// not a recoverable error.
    pub(crate) fn rebuild(&mut self, systems: &[SystemRecord]) {
        let n = systems.len();
        let mut successors: Vec<Vec<SysId>> = vec![Vec::new(); n];
        let mut indegree = vec![0u32; n];

        for j in 0..n {
            for i in 0..n {
                if i == j {
                    continue;
                }
                let conflict_edge = i < j && systems[i].conflicts_with(&systems[j]);
                let after_edge = systems[j].after.test(i);
                if conflict_edge || after_edge {
                    successors[i].push(j);
                    indegree[j] += 1;
                }
            }
        }

        let mut remaining_indegree = indegree.clone();
        let mut level = vec![0usize; n];
        let mut queue: VecDeque<SysId> =
            (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut processed = 0usize;

        while let Some(u) = queue.pop_front() {
            processed += 1;
            for &v in &successors[u] {
                level[v] = level[v].max(level[u] + 1);
                remaining_indegree[v] -= 1;
                if remaining_indegree[v] == 0 {
                    queue.push_back(v);
                }
            }
        }

        if processed != n {
            self.panic_on_cycle(n, &remaining_indegree, &successors);
        }

        let num_stages = level.iter().copied().max().map_or(0, |m| m + 1);
        let mut stages = vec![Stage::default(); num_stages];
        for (i, &lvl) in level.iter().enumerate() {
            stages[lvl].systems.push(i);
        }
        self.stages = stages;
    }

    #[cold]
    fn panic_on_cycle(
        &self,
        n: usize,
        remaining_indegree: &[u32],
        successors: &[Vec<SysId>],
    ) -> ! {
        if cfg!(debug_assertions) {
            let stuck: Vec<SysId> = (0..n).filter(|&i| remaining_indegree[i] > 0).collect();
            let example_edge = stuck.iter().find_map(|&v| {
                successors
                    .iter()
                    .enumerate()
                    .find(|(_, succ)| succ.contains(&v))
                    .map(|(u, _)| (u, v))
            });
            panic!(
                "cyclic schedule: systems {stuck:?} never reached zero in-degree \
                 (an explicit `after` edge contradicts a write-conflict-derived \
                 order); example edge: {example_edge:?}"
            );
        }
        panic!("cyclic schedule: explicit `after` edges are inconsistent with write-conflict order");
    }
}
