//! Strand: a continuation-stealing parallel task runtime
//!
//! A program built from spawns and syncs runs serially by default. Any
//! spawned call's continuation may be stolen by an idle worker and run in
//! parallel; results combine at the next sync exactly as they would in the
//! serial program.
//!
//! # Example
//!
//! ```no_run
//! use strand::Runtime;
//!
//! fn sum(values: &[u64]) -> u64 {
//!     if values.len() <= 1024 {
//!         return values.iter().sum();
//!     }
//!     let (left, right) = values.split_at(values.len() / 2);
//!     let (a, b) = strand::join(|| sum(left), || sum(right));
//!     a + b
//! }
//!
//! let values: Vec<u64> = (0..1_000_000).collect();
//! let runtime = Runtime::new().unwrap();
//! assert_eq!(runtime.run(|| sum(&values)), values.iter().sum::<u64>());
//! ```
//!
//! # Crate layout
//!
//! - [`runtime`]: scheduler, workers, fibers, full frames, exception migration
//! - [`runtime::abi`]: the low-level entry points spawn-capable code calls
//! - [`util`]: configuration, logging and diagnostic dumps

#![doc(html_root_url = "https://docs.rs/strand-rt")]
#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

pub use runtime::abi;
pub use runtime::error::{ParamError, ProtocolViolation, RuntimeError};
pub use runtime::{
    current_worker_id, global, init, join, set_param, shutdown, spawn, sync, sync_scope, Runtime,
    RuntimeBuilder, RuntimeStats, Spawned, WorkerReport,
};
pub use util::config::{DumpTarget, RuntimeConfig, VictimPolicy};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
