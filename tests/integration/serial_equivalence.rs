//! Parallel runs must produce exactly what the serial elision produces.

use once_cell::sync::Lazy;
use proptest::prelude::*;
use strand::{Runtime, Spawned};

use crate::common::{fib, fib_serial, runtime};

static RUNTIMES: Lazy<Vec<Runtime>> = Lazy::new(|| vec![runtime(1), runtime(2), runtime(4)]);

/// A spawn tree: leaves compute, nodes spawn every child and sync.
#[derive(Debug, Clone)]
enum Program {
    Leaf(u64),
    Spawn(Vec<Program>),
    /// Nested call that opens its own sync scope before continuing.
    Call(Box<Program>, u64),
}

fn program() -> impl Strategy<Value = Program> {
    let leaf = any::<u64>().prop_map(Program::Leaf);
    leaf.prop_recursive(5, 64, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Program::Spawn),
            (inner, any::<u64>()).prop_map(|(body, salt)| Program::Call(Box::new(body), salt)),
        ]
    })
}

fn eval(program: &Program) -> u64 {
    match program {
        Program::Leaf(value) => value.wrapping_mul(0x9e37_79b9).rotate_left(7),
        Program::Spawn(children) => strand::sync_scope(|| {
            let handles: Vec<Spawned<u64>> = children
                .iter()
                .cloned()
                .map(|child| strand::spawn(move || eval(&child)))
                .collect();
            strand::sync();
            handles
                .into_iter()
                .enumerate()
                .fold(17u64, |acc, (index, handle)| {
                    let value = handle.try_take().expect("synced child has a result");
                    acc.wrapping_mul(131).wrapping_add(value ^ index as u64)
                })
        }),
        Program::Call(body, salt) => {
            let inner = strand::sync_scope(|| eval(body));
            inner.wrapping_add(*salt)
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_spawn_trees_match_serial(program in program()) {
        let expected = eval(&program);
        for runtime in RUNTIMES.iter() {
            let program = program.clone();
            prop_assert_eq!(runtime.run(move || eval(&program)), expected);
        }
    }
}

#[test]
fn test_fib_matches_serial_for_any_worker_count() {
    for runtime in RUNTIMES.iter() {
        assert_eq!(runtime.run(|| fib(20)), fib_serial(20));
    }
}

#[test]
fn test_join_borrows_from_the_caller() {
    fn sum(values: &[u64]) -> u64 {
        if values.len() <= 64 {
            return values.iter().sum();
        }
        let (left, right) = values.split_at(values.len() / 2);
        let (a, b) = strand::join(|| sum(left), || sum(right));
        a + b
    }

    let values: Vec<u64> = (0..50_000).collect();
    let expected: u64 = values.iter().sum();
    for runtime in RUNTIMES.iter() {
        assert_eq!(runtime.run(|| sum(&values)), expected);
    }
}

#[test]
fn test_spawn_side_effects_outside_a_runtime_follow_serial_order() {
    let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    for index in 0..5 {
        let child_log = log.clone();
        strand::spawn(move || child_log.lock().push(index));
        log.lock().push(100 + index);
    }
    strand::sync();
    assert_eq!(*log.lock(), vec![0, 100, 1, 101, 2, 102, 3, 103, 4, 104]);
}

#[test]
fn test_spawn_side_effects_in_a_runtime_happen_exactly_once() {
    let runtime = runtime(2);
    let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = log.clone();
    runtime.run(move || {
        for index in 0..64 {
            let log = seen.clone();
            strand::spawn(move || log.lock().push(index));
            seen.lock().push(100 + index);
        }
        strand::sync();
    });
    let mut entries = log.lock().clone();
    entries.sort_unstable();
    let expected: Vec<_> = (0..64).chain(100..164).collect();
    assert_eq!(entries, expected);
}

#[test]
fn test_results_outside_any_runtime() {
    assert_eq!(fib(15), fib_serial(15));
    let handle = strand::spawn(|| 41 + 1);
    strand::sync();
    assert_eq!(handle.join(), 42);
}
