//! The process-wide runtime and its parameter interface.
//!
//! Everything touching the singleton lives in one test: tests in this binary
//! run in parallel and would otherwise race on it.

use strand::ParamError;

use crate::common::{fib, fib_serial};

fn status(result: Result<(), ParamError>) -> i32 {
    match result {
        Ok(()) => ParamError::SUCCESS,
        Err(error) => error.code(),
    }
}

#[test]
fn test_global_runtime_lifecycle() {
    strand::shutdown();
    assert!(strand::global().is_none());

    assert_eq!(status(strand::set_param("nworkers", "2")), 0);
    assert_eq!(status(strand::set_param("stack_size", "262144")), 0);
    assert_eq!(status(strand::set_param("victim_policy", "round_robin")), 0);
    assert_eq!(status(strand::set_param("no_such_param", "1")), 1);
    assert_eq!(status(strand::set_param("nworkers", "many")), 3);
    assert_eq!(status(strand::set_param("nworkers", "0")), 2);
    assert_eq!(status(strand::set_param("stack_size", "1024")), 2);

    let runtime = strand::init().unwrap();
    assert_eq!(runtime.num_workers(), 2);
    assert_eq!(runtime.config().stack_size, 256 * 1024);
    assert_eq!(runtime.run(|| fib(16)), fib_serial(16));

    // A second init hands back the same runtime.
    let again = strand::init().unwrap();
    assert_eq!(again.num_workers(), 2);

    let late = strand::set_param("nworkers", "3").unwrap_err();
    assert_eq!(late, ParamError::TooLate("nworkers".to_string()));
    assert_eq!(late.code(), 4);
    // Once started, every change is too late, whatever the name or value.
    assert_eq!(status(strand::set_param("no_such_param", "1")), 4);
    assert_eq!(status(strand::set_param("nworkers", "many")), 4);
    assert!(strand::global().is_some());

    strand::shutdown();
    assert!(strand::global().is_none());
    // Parameters are accepted again once the runtime is gone.
    assert_eq!(status(strand::set_param("nworkers", "1")), 0);
    let fresh = strand::init().unwrap();
    assert_eq!(fresh.num_workers(), 1);
    strand::shutdown();
}

#[test]
fn test_builder_rejects_bad_parameters() {
    let error = strand::Runtime::builder()
        .param("deque_capacity", "1")
        .unwrap_err();
    assert_eq!(error.code(), 2);

    let error = strand::Runtime::builder().nworkers(0).build().unwrap_err();
    assert!(matches!(error, strand::RuntimeError::InvalidConfig(_)));
}
