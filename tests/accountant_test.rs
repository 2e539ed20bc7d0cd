//! Accountant tree behaviour: limits, reservations, peaks and conservation.

use hypergraph_exec::memory::{Accountant, AllocationOutcome, MemoryPolicy};
use proptest::prelude::*;
use std::sync::Arc;

fn tree(root_limit: u64) -> (Arc<Accountant>, Arc<Accountant>) {
    let root = Accountant::new_root("query", root_limit, MemoryPolicy::strict());
    let child = root.new_child("op:scan", 100, 500).unwrap();
    (root, child)
}

#[test]
fn test_child_over_its_own_limit_fails_locally() {
    let (root, child) = tree(1000);
    assert_eq!(root.allocated(), 100);

    assert_eq!(child.allocate(450), AllocationOutcome::Success);
    assert_eq!(child.allocated(), 450);
    assert_eq!(root.allocated(), 450);

    assert_eq!(child.allocate(100), AllocationOutcome::FailedLocal);
    assert_eq!(child.allocated(), 450);
    assert_eq!(root.allocated(), 450);
    assert_eq!(child.peak(), 450);
}

#[test]
fn test_parent_refusal_unwinds_child() {
    let (root, child) = tree(300);
    assert_eq!(child.allocate(350), AllocationOutcome::FailedParent);
    assert_eq!(child.allocated(), 0);
    assert_eq!(root.allocated(), 100);
}

#[test]
fn test_lenient_grace_absorbs_small_overrun() {
    let root = Accountant::new_root("query", 1000, MemoryPolicy::lenient());
    assert_eq!(root.allocate(1050), AllocationOutcome::Success);
    assert_eq!(root.allocate(100), AllocationOutcome::FailedLocal);
    assert_eq!(root.allocated(), 1050);
}

#[test]
fn test_force_allocate_keeps_bytes_and_moves_peak() {
    let root = Accountant::new_root("query", 100, MemoryPolicy::strict());
    assert!(!root.force_allocate(250));
    assert_eq!(root.allocated(), 250);
    assert_eq!(root.peak(), 250);
    assert!(root.is_over_limit());
    root.release(250).unwrap();
    assert_eq!(root.allocated(), 0);
}

#[test]
fn test_close_is_root_last() {
    let (root, child) = tree(1000);
    assert!(root.close().is_err());
    child.close().unwrap();
    assert_eq!(root.allocated(), 0);
    root.close().unwrap();
    assert!(root.is_closed());
    assert!(root.new_child("late", 0, 10).is_err());
}

#[test]
fn test_concurrent_allocations_settle() {
    let root = Accountant::new_root("query", 1 << 30, MemoryPolicy::strict());
    let child = root.new_child("op:exchange", 0, 1 << 20).unwrap();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let child = Arc::clone(&child);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    if child.allocate(64).is_ok() {
                        child.release(64).unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(child.allocated(), 0);
    assert_eq!(root.allocated(), 0);
    assert!(child.peak() <= 1 << 20);
}

#[derive(Debug, Clone)]
enum Op {
    Allocate(u64),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..300).prop_map(Op::Allocate),
        (0usize..16).prop_map(Op::Release),
    ]
}

proptest! {
    /// Settled state always equals the bytes callers still hold, and never
    /// exceeds either limit under a strict policy.
    #[test]
    fn accounted_bytes_are_conserved(ops in prop::collection::vec(op(), 1..200)) {
        let (root, child) = tree(400);
        let mut held: Vec<u64> = Vec::new();
        for op in ops {
            match op {
                Op::Allocate(size) => {
                    if child.allocate(size).is_ok() {
                        held.push(size);
                    }
                }
                Op::Release(idx) => {
                    if !held.is_empty() {
                        let size = held.swap_remove(idx % held.len());
                        child.release(size).unwrap();
                    }
                }
            }
            let total: u64 = held.iter().sum();
            prop_assert_eq!(child.allocated(), total as i64);
            prop_assert!(child.allocated() <= child.limit());
            prop_assert!(root.allocated() <= root.limit());
            prop_assert_eq!(root.allocated(), 100 + (total as i64 - 100).max(0));
            prop_assert!(child.peak() >= child.allocated());
        }
    }

    /// With leniency on, nothing settles above `limit + min(max_grace, limit * margin)`.
    #[test]
    fn lenient_allocation_stays_within_grace(
        ops in prop::collection::vec(op(), 1..200),
        root_limit in 200u64..2000,
        child_limit in 100u64..1500,
        grace_margin in 0.0f64..0.5,
        max_grace in 0u64..200,
    ) {
        let policy = MemoryPolicy {
            lenient: true,
            leniency_locked: false,
            grace_margin,
            max_grace,
        };
        let root = Accountant::new_root("query", root_limit, policy);
        let child = root.new_child_with_policy("op:sort", 0, child_limit, policy).unwrap();
        let root_bound = root.limit() + policy.grace_for(root.limit());
        let child_bound = child.limit() + policy.grace_for(child.limit());

        let mut held: Vec<u64> = Vec::new();
        for op in ops {
            match op {
                Op::Allocate(size) => {
                    if child.allocate(size).is_ok() {
                        held.push(size);
                    }
                }
                Op::Release(idx) => {
                    if !held.is_empty() {
                        let size = held.swap_remove(idx % held.len());
                        child.release(size).unwrap();
                    }
                }
            }
            let total = held.iter().sum::<u64>() as i64;
            prop_assert_eq!(child.allocated(), total);
            prop_assert_eq!(root.allocated(), total);
            prop_assert!(child.allocated() <= child_bound);
            prop_assert!(root.allocated() <= root_bound);
            prop_assert!(child.peak() <= child_bound);
        }
    }
}
