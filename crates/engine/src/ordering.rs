//! Statement ordering
//!
//! Inserts and deletes of rows that reference each other must run in
//! foreign-key order: a referenced row is inserted before the rows pointing
//! at it and deleted after them. [`plan_order`] computes that order as a
//! stable topological sort over the dependencies between the scheduled
//! actions.
//!
//! Cycles are broken by deferring a nullable dependency: for an insert the
//! referencing row goes in with a NULL foreign key that a follow-up update
//! fills in, for a delete the foreign key is nulled before the deletes run.
//! A cycle made only of not-null references cannot be broken.
//!
//! With grouping enabled the order is built in dependency waves and each
//! wave is grouped by entity name, so consecutive statements hit the same
//! table.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;

/// `before` must execute before `after`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// Action that must run first
    pub before: usize,
    /// Action that must run second
    pub after: usize,
    /// Whether the foreign key behind the dependency accepts NULL
    pub nullable: bool,
}

/// Execution order of a set of actions
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionPlan {
    /// Action indexes in execution order
    pub order: Vec<usize>,
    /// Indexes of the dependencies deferred to break cycles
    pub deferred: Vec<usize>,
}

/// A cycle of not-null dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnbreakableCycle {
    /// Index of one not-null dependency on the cycle
    pub dependency: usize,
}

/// Order `count` actions so every non-deferred dependency is respected.
///
/// Without `groups` ready actions run in index order; with `groups` (one
/// entity name per action) each dependency wave runs grouped by name, in
/// the order the names first appear.
pub fn plan_order(
    count: usize,
    dependencies: &[Dependency],
    groups: Option<&[&str]>,
) -> Result<ExecutionPlan, UnbreakableCycle> {
    let mut deferred = Vec::new();
    let mut active = vec![true; dependencies.len()];

    for (index, dependency) in dependencies.iter().enumerate() {
        if dependency.before == dependency.after {
            if !dependency.nullable {
                return Err(UnbreakableCycle { dependency: index });
            }
            active[index] = false;
            deferred.push(index);
        }
    }

    let mut in_degree = vec![0usize; count];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (index, dependency) in dependencies.iter().enumerate() {
        if active[index] {
            in_degree[dependency.after] += 1;
            outgoing[dependency.before].push(index);
        }
    }

    let mut done = vec![false; count];
    let mut order = Vec::with_capacity(count);

    while order.len() < count {
        let ready: Vec<usize> = (0..count).filter(|i| !done[*i] && in_degree[*i] == 0).collect();
        if ready.is_empty() {
            let broken = break_cycle(dependencies, &active, &done)?;
            active[broken] = false;
            in_degree[dependencies[broken].after] -= 1;
            deferred.push(broken);
            continue;
        }

        match groups {
            Some(groups) => {
                for index in group_wave(&ready, groups) {
                    release(index, dependencies, &active, &outgoing, &mut in_degree);
                    done[index] = true;
                    order.push(index);
                }
            }
            None => {
                // Drain everything reachable without breaking a cycle,
                // always taking the lowest ready index first.
                let mut heap: BinaryHeap<Reverse<usize>> = ready.into_iter().map(Reverse).collect();
                while let Some(Reverse(index)) = heap.pop() {
                    if done[index] {
                        continue;
                    }
                    done[index] = true;
                    order.push(index);
                    for &d in &outgoing[index] {
                        if !active[d] {
                            continue;
                        }
                        let after = dependencies[d].after;
                        in_degree[after] -= 1;
                        if in_degree[after] == 0 && !done[after] {
                            heap.push(Reverse(after));
                        }
                    }
                }
            }
        }
    }

    deferred.sort_unstable();
    Ok(ExecutionPlan { order, deferred })
}

fn release(
    index: usize,
    dependencies: &[Dependency],
    active: &[bool],
    outgoing: &[Vec<usize>],
    in_degree: &mut [usize],
) {
    for &d in &outgoing[index] {
        if active[d] {
            in_degree[dependencies[d].after] -= 1;
        }
    }
}

/// Ready actions grouped by entity name, groups in first-seen order
fn group_wave(ready: &[usize], groups: &[&str]) -> Vec<usize> {
    let mut positions: FxHashMap<&str, usize> = FxHashMap::default();
    let mut buckets: Vec<Vec<usize>> = Vec::new();
    for &index in ready {
        let name = groups[index];
        let slot = *positions.entry(name).or_insert_with(|| {
            buckets.push(Vec::new());
            buckets.len() - 1
        });
        buckets[slot].push(index);
    }
    buckets.into_iter().flatten().collect()
}

/// Pick the nullable dependency to defer: the first one, in dependency
/// order, between two pending actions.
fn break_cycle(dependencies: &[Dependency], active: &[bool], done: &[bool]) -> Result<usize, UnbreakableCycle> {
    let pending = |d: &Dependency| !done[d.before] && !done[d.after];
    let mut first_not_null = None;
    for (index, dependency) in dependencies.iter().enumerate() {
        if !active[index] || !pending(dependency) {
            continue;
        }
        if dependency.nullable {
            return Ok(index);
        }
        first_not_null.get_or_insert(index);
    }
    Err(UnbreakableCycle {
        dependency: first_not_null.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dep(before: usize, after: usize, nullable: bool) -> Dependency {
        Dependency {
            before,
            after,
            nullable,
        }
    }

    fn position(plan: &ExecutionPlan, action: usize) -> usize {
        plan.order.iter().position(|a| *a == action).unwrap()
    }

    #[test]
    fn test_independent_actions_keep_index_order() {
        let plan = plan_order(4, &[], None).unwrap();
        assert_eq!(plan.order, vec![0, 1, 2, 3]);
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn test_referenced_row_goes_first() {
        // 0 = order referencing customer 1
        let plan = plan_order(2, &[dep(1, 0, false)], None).unwrap();
        assert_eq!(plan.order, vec![1, 0]);
    }

    #[test]
    fn test_nullable_cycle_is_deferred() {
        // 0 -> 1 (not null), 1 -> 0 (nullable)
        let deps = [dep(1, 0, false), dep(0, 1, true)];
        let plan = plan_order(2, &deps, None).unwrap();
        assert_eq!(plan.deferred, vec![1]);
        assert_eq!(plan.order, vec![1, 0]);
    }

    #[test]
    fn test_not_null_cycle_fails() {
        let deps = [dep(1, 0, false), dep(0, 1, false)];
        assert_eq!(
            plan_order(2, &deps, None).unwrap_err(),
            UnbreakableCycle { dependency: 0 }
        );
    }

    #[test]
    fn test_self_reference() {
        let plan = plan_order(1, &[dep(0, 0, true)], None).unwrap();
        assert_eq!(plan.deferred, vec![0]);
        assert!(plan_order(1, &[dep(0, 0, false)], None).is_err());
    }

    #[test]
    fn test_grouping_by_entity() {
        // Two customers and two orders persisted interleaved
        let groups = ["Customer", "Order", "Customer", "Order"];
        let deps = [dep(0, 1, false), dep(2, 3, false)];
        let plan = plan_order(4, &deps, Some(&groups)).unwrap();
        assert_eq!(plan.order, vec![0, 2, 1, 3]);

        let ungrouped = plan_order(4, &deps, None).unwrap();
        assert_eq!(ungrouped.order, vec![0, 1, 2, 3]);
    }

    proptest! {
        #[test]
        fn prop_acyclic_graphs_respect_every_dependency(
            count in 1usize..12,
            raw in proptest::collection::vec((0usize..12, 0usize..12, any::<bool>()), 0..30),
            grouped in any::<bool>(),
        ) {
            // Edges only from lower to higher index keep the graph acyclic
            let deps: Vec<Dependency> = raw
                .into_iter()
                .map(|(a, b, nullable)| (a % count, b % count, nullable))
                .filter(|(a, b, _)| a < b)
                .map(|(a, b, nullable)| dep(a, b, nullable))
                .collect();
            let names: Vec<&str> = (0..count).map(|i| if i % 3 == 0 { "A" } else { "B" }).collect();
            let groups = if grouped { Some(names.as_slice()) } else { None };

            let plan = plan_order(count, &deps, groups).unwrap();
            prop_assert!(plan.deferred.is_empty());
            let mut sorted = plan.order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..count).collect::<Vec<_>>());
            for d in &deps {
                prop_assert!(position(&plan, d.before) < position(&plan, d.after));
            }
        }

        #[test]
        fn prop_nullable_cycles_always_resolve(
            count in 1usize..10,
            raw in proptest::collection::vec((0usize..10, 0usize..10), 0..25),
        ) {
            let deps: Vec<Dependency> = raw
                .into_iter()
                .map(|(a, b)| dep(a % count, b % count, true))
                .collect();
            let plan = plan_order(count, &deps, None).unwrap();
            prop_assert_eq!(plan.order.len(), count);
            for (index, d) in deps.iter().enumerate() {
                if !plan.deferred.contains(&index) {
                    prop_assert!(position(&plan, d.before) < position(&plan, d.after));
                }
            }
        }
    }
}
