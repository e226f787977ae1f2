//! Panics raised in spawned code surface at the parent's sync.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::{panic_message, runtime};

#[test]
fn test_child_panic_is_raised_at_sync_with_its_payload() {
    let runtime = runtime(2);
    let caught = runtime.run(|| {
        panic_message(|| {
            strand::sync_scope(|| {
                strand::spawn(|| panic!("child failed"));
                strand::sync();
                unreachable!("sync raises the child's panic");
            })
        })
    });
    assert_eq!(caught.as_deref(), Some("child failed"));
}

#[test]
fn test_panic_propagates_out_of_run() {
    let runtime = runtime(2);
    let message = panic_message(|| {
        runtime.run(|| {
            let (a, _) = strand::join(|| 1, || -> u32 { panic!("continuation failed") });
            a
        })
    });
    assert_eq!(message.as_deref(), Some("continuation failed"));
    // The runtime is still usable afterwards.
    assert_eq!(runtime.run(|| 7), 7);
}

#[test]
fn test_leftmost_exception_wins() {
    let runtime = runtime(4);
    for _ in 0..20 {
        let message = panic_message(|| {
            runtime.run(|| {
                for index in 0..8 {
                    strand::spawn(move || {
                        if index % 2 == 0 {
                            panic!("child {index}");
                        }
                    });
                }
                strand::sync();
            })
        });
        assert_eq!(message.as_deref(), Some("child 0"));
    }
}

/// Runs parallel code from its destructor, which may happen mid-unwind.
struct JoinsOnDrop {
    sums: Arc<AtomicUsize>,
}

impl Drop for JoinsOnDrop {
    fn drop(&mut self) {
        let (a, b) = strand::join(|| 1, || 2);
        let handle = strand::spawn(|| 3);
        strand::sync();
        let nested = strand::sync_scope(|| {
            let inner = strand::spawn(|| 4);
            strand::sync();
            inner.try_take().unwrap_or(0)
        });
        self.sums
            .fetch_add(a + b + handle.try_take().unwrap_or(0) + nested, Ordering::SeqCst);
    }
}

#[test]
fn test_parallel_code_in_drop_during_unwind() {
    let runtime = runtime(2);
    let sums = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let sums = sums.clone();
        let message = panic_message(|| {
            runtime.run(move || {
                let _guard = JoinsOnDrop { sums };
                panic!("user panic");
            })
        });
        assert_eq!(message.as_deref(), Some("user panic"));
    }
    assert_eq!(sums.load(Ordering::SeqCst), 10 * 10);
}

#[test]
fn test_panicking_continuation_suspends_for_its_running_sibling() {
    let runtime = runtime(4);
    for _ in 0..50 {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let message = panic_message(|| {
            runtime.run(move || {
                strand::join(
                    move || {
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        flag.store(true, Ordering::SeqCst);
                    },
                    || panic!("right side"),
                )
            })
        });
        assert_eq!(message.as_deref(), Some("right side"));
        assert!(finished.load(Ordering::SeqCst));
    }
    let total = runtime.stats().total;
    assert!(total.steals > 0);
    // A stolen continuation that panics waits at its sync like any other and
    // is resumed by the last child rather than spinning on the counter.
    assert!(total.provably_good_resumes > 0);
}

#[test]
fn test_left_panic_wins_when_both_sides_of_a_join_panic() {
    let runtime = runtime(2);
    let message = panic_message(|| {
        runtime.run(|| strand::join(|| -> u32 { panic!("left") }, || -> u32 { panic!("right") }))
    });
    assert_eq!(message.as_deref(), Some("left"));
}

#[test]
fn test_exception_after_steal_is_observed_once() {
    let runtime = runtime(4);
    let observed = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let seen = observed.clone();
        runtime.run(move || {
            let result = panic_message(|| {
                strand::sync_scope(|| {
                    strand::spawn(|| {
                        // Give thieves time to take the continuation.
                        std::thread::sleep(std::time::Duration::from_micros(200));
                        panic!("late child");
                    });
                    let _sibling = strand::spawn(|| 1 + 1);
                })
            });
            if result.as_deref() == Some("late child") {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    assert_eq!(observed.load(Ordering::SeqCst), 50);
    assert!(runtime.stats().total.steals > 0);
}

#[test]
fn test_unwinding_parent_waits_for_children() {
    let runtime = runtime(3);
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let message = panic_message(|| {
        runtime.run(move || {
            strand::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                flag.store(true, Ordering::SeqCst);
            });
            panic!("parent failed");
        })
    });
    assert_eq!(message.as_deref(), Some("parent failed"));
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_parent_panic_wins_over_child_panic() {
    let runtime = runtime(2);
    let message = panic_message(|| {
        runtime.run(|| {
            strand::spawn(|| panic!("child"));
            panic!("parent");
        })
    });
    assert_eq!(message.as_deref(), Some("parent"));
}

#[test]
fn test_panic_caught_inside_a_child_does_not_escape() {
    let runtime = runtime(2);
    let value = runtime.run(|| {
        let handle = strand::spawn(|| {
            let inner = panic_message(|| panic!("handled"));
            assert_eq!(inner.as_deref(), Some("handled"));
            // The child keeps spawning after recovering.
            let (a, b) = strand::join(|| 20, || 22);
            a + b
        });
        handle.join()
    });
    assert_eq!(value, 42);
}
