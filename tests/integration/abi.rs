//! Entry points used directly, without the `join`/`spawn` helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strand::{abi, Runtime};

use crate::common::{fib, fib_serial, panic_message, runtime};

#[test]
fn test_unbound_thread_runs_serially() {
    assert!(strand::current_worker_id().is_none());
    let guard = abi::enter_activation();
    assert!(!guard.is_bound());
    assert!(guard.id().is_none());

    let ran = Arc::new(AtomicUsize::new(0));
    let seen = ran.clone();
    abi::detach(Box::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    // Detach ran inline, before returning.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    abi::sync();
    abi::leave_activation(guard);
}

#[test]
fn test_explicit_enter_detach_leave() {
    let runtime = runtime(2);
    let total = runtime.run(|| {
        let sum = Arc::new(AtomicUsize::new(0));
        let guard = abi::enter_activation();
        assert!(guard.is_bound());
        for value in 1..=10 {
            let sum = sum.clone();
            abi::detach(Box::new(move || {
                sum.fetch_add(value, Ordering::SeqCst);
            }));
        }
        abi::leave_activation(guard);
        sum.load(Ordering::SeqCst)
    });
    assert_eq!(total, 55);
}

#[test]
fn test_fast_entry_inside_a_runtime() {
    let runtime = runtime(2);
    let ids = runtime.run(|| {
        let outer = abi::enter_activation_fast();
        let inner = abi::enter_activation_fast();
        let ids = (outer.id(), inner.id());
        inner.leave();
        outer.leave();
        ids
    });
    let (Some(outer), Some(inner)) = ids else {
        panic!("activations inside a runtime are bound");
    };
    assert_ne!(outer, inner);
}

#[test]
fn test_rethrow_raises_a_pending_child_exception() {
    let runtime = runtime(1);
    let message = panic_message(|| {
        runtime.run(|| {
            abi::detach(Box::new(|| panic!("rethrown")));
            abi::rethrow()
        })
    });
    assert_eq!(message.as_deref(), Some("rethrown"));
}

#[test]
fn test_worker_id_is_visible_only_inside_run() {
    let runtime = runtime(2);
    assert!(strand::current_worker_id().is_none());
    let inside = runtime.run(strand::current_worker_id);
    assert!(inside.is_some());
    assert!(strand::current_worker_id().is_none());
}

#[test]
fn test_nested_run_joins_the_enclosing_computation() {
    let runtime = runtime(2);
    let inner = runtime.clone();
    let value = runtime.run(move || {
        let outer = strand::current_worker_id();
        let (a, b) = inner.run(|| strand::join(|| fib(12), || fib(11)));
        assert!(outer.is_some());
        a + b
    });
    assert_eq!(value, fib_serial(13));
}

#[test]
fn test_concurrent_runs_from_several_threads() {
    let runtime = Runtime::builder()
        .nworkers(3)
        .max_user_workers(4)
        .stack_size(256 * 1024)
        .build()
        .unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));
    std::thread::scope(|scope| {
        for n in 14..18 {
            let runtime = runtime.clone();
            let results = results.clone();
            scope.spawn(move || {
                let value = runtime.run(|| fib(n));
                results.lock().push((n, value));
            });
        }
    });
    let mut results = results.lock().clone();
    results.sort_unstable();
    let expected: Vec<_> = (14..18).map(|n| (n, fib_serial(n))).collect();
    assert_eq!(results, expected);
}

#[test]
fn test_busy_user_slots_fall_back_to_serial() {
    let runtime = Runtime::builder()
        .nworkers(2)
        .max_user_workers(1)
        .stack_size(256 * 1024)
        .build()
        .unwrap();
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    std::thread::scope(|scope| {
        let holder = runtime.clone();
        scope.spawn(move || {
            holder.run(move || {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
        });
        entered_rx.recv().unwrap();
        // The only user slot is taken: this run executes on the caller alone.
        let (worker, value) = runtime.run(|| (strand::current_worker_id(), fib(15)));
        assert!(worker.is_none());
        assert_eq!(value, fib_serial(15));
        release_tx.send(()).unwrap();
    });
}

#[test]
fn test_runtime_can_be_recreated_after_drop() {
    for _ in 0..3 {
        let runtime = runtime(2);
        assert_eq!(runtime.run(|| fib(10)), fib_serial(10));
        drop(runtime);
    }
}

#[test]
fn test_shutdown_leaves_the_caller_as_the_only_worker() {
    let runtime = runtime(3);
    runtime.shutdown();
    runtime.shutdown();
    assert_eq!(runtime.run(|| fib(12)), fib_serial(12));
}

#[test]
fn test_continuation_can_resume_on_another_thread() {
    let runtime = runtime(4);
    let migrations = runtime.run(|| {
        (0..50)
            .filter(|_| {
                let before = std::thread::current().id();
                strand::join(
                    || std::thread::sleep(std::time::Duration::from_millis(1)),
                    || (),
                );
                std::thread::current().id() != before
            })
            .count()
    });
    // Thread-local state read before a join cannot be trusted after it.
    assert!(migrations > 0);
}
