//! Many small spawns: every one runs exactly once and the counters add up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::common::runtime;

const SPAWNS: u64 = 10_000;

#[test]
fn test_every_spawn_runs_exactly_once() {
    let runtime = runtime(4);
    let started = Instant::now();
    let hits: Arc<Vec<AtomicU64>> = Arc::new((0..SPAWNS).map(|_| AtomicU64::new(0)).collect());
    let counters = hits.clone();
    runtime.run(move || {
        for index in 0..SPAWNS as usize {
            let counters = counters.clone();
            strand::spawn(move || {
                counters[index].fetch_add(1, Ordering::Relaxed);
            });
        }
        strand::sync();
    });
    assert!(hits.iter().all(|hit| hit.load(Ordering::Relaxed) == 1));

    let stats = runtime.stats();
    let wall_ns = started.elapsed().as_nanos() as u64;
    let total = stats.total;
    assert_eq!(total.spawns + total.serial_fallbacks, SPAWNS);
    // Every published continuation is taken back by its owner or stolen,
    // never both and never twice.
    assert_eq!(total.steals + total.reclaims, total.spawns);
    assert_eq!(total.stolen_returns, total.steals);
    assert!(total.working_ns > 0);
    assert!(total.working_ns <= wall_ns * stats.nworkers as u64);
}

#[test]
fn test_wide_and_deep_trees_finish() {
    fn tree(depth: u32) -> u64 {
        if depth == 0 {
            return 1;
        }
        strand::sync_scope(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| strand::spawn(move || tree(depth - 1)))
                .collect();
            strand::sync();
            handles
                .into_iter()
                .map(|handle| handle.try_take().unwrap_or(0))
                .sum()
        })
    }

    let runtime = runtime(4);
    assert_eq!(runtime.run(|| tree(6)), 4u64.pow(6));
}
