//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::panic::{self, AssertUnwindSafe};

use strand::Runtime;

/// Runtime with `nworkers` workers and small stacks.
pub fn runtime(nworkers: usize) -> Runtime {
    Runtime::builder()
        .nworkers(nworkers)
        .stack_size(256 * 1024)
        .build()
        .expect("runtime should start")
}

/// Naive parallel Fibonacci built on `join`.
pub fn fib(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let (a, b) = strand::join(|| fib(n - 1), || fib(n - 2));
    a + b
}

pub fn fib_serial(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib_serial(n - 1) + fib_serial(n - 2)
    }
}

/// Run `f`, returning the panic message if it panicked.
pub fn panic_message<F, R>(f: F) -> Option<String>
where
    F: FnOnce() -> R,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => None,
        Err(payload) => Some(strand::runtime::exception::payload_message(&payload)),
    }
}
