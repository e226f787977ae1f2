//! Runtime system
//!
//! Continuation-stealing scheduler: workers, ready deques, full frames,
//! fibers and exception migration.

pub mod abi;
mod api;
pub(crate) mod context;
pub mod error;
pub mod exception;
pub mod fiber;
pub mod frame;
pub mod scheduler;
pub(crate) mod worker;

pub use api::{
    init, global, join, set_param, shutdown, spawn, sync, sync_scope, Runtime, RuntimeBuilder,
    Spawned,
};
pub use context::{RuntimeStats, WorkerReport};
pub use worker::{current_worker_id, LoopState, WorkerKind};
