//! Diagnostic dump
//!
//! Renders build, version, worker and thread information as pretty JSON.
//! Reports are written on request ([`write_report`]) and from the fatal path
//! ([`flush_on_fatal`]) when `STRAND_DUMP` or the runtime configuration
//! names a target.
//!
//! # Example
//!
//! ```no_run
//! use strand::util::config::DumpTarget;
//!
//! let runtime = strand::Runtime::new().unwrap();
//! runtime.write_diagnostics(&DumpTarget::Stderr).unwrap();
//! ```

use std::fs;
use std::io::Write;
use std::sync::{Arc, Weak};

use anyhow::{Context as _, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;

use crate::runtime::context::{Context, RuntimeStats};
use crate::runtime::error::ProtocolViolation;
use crate::util::config::DumpTarget;

/// Environment variable naming the dump target (`stderr` or a file path).
pub const DUMP_ENV: &str = "STRAND_DUMP";

/// Everything a dump contains.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub crate_name: &'static str,
    pub version: &'static str,
    pub build_profile: &'static str,
    pub target_arch: &'static str,
    pub target_os: &'static str,
    pub exception_bridge: &'static str,
    pub nworkers: usize,
    pub user_worker_slots: usize,
    /// Set when the report is written on the way to an abort.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<String>,
    pub stats: RuntimeStats,
}

impl DiagnosticReport {
    pub(crate) fn collect(
        ctx: &Context,
        violation: Option<&ProtocolViolation>,
    ) -> Self {
        Self {
            crate_name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            build_profile: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            },
            target_arch: std::env::consts::ARCH,
            target_os: std::env::consts::OS,
            exception_bridge: ctx.bridge().name(),
            nworkers: ctx.config().nworkers,
            user_worker_slots: ctx.config().max_user_workers,
            violation: violation.map(ToString::to_string),
            stats: ctx.stats(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize diagnostic report")
    }
}

/// Write `report` to `target`.
pub fn write_report(
    report: &DiagnosticReport,
    target: &DumpTarget,
) -> Result<()> {
    let json = report.to_json()?;
    match target {
        DumpTarget::Stderr => {
            let mut stderr = std::io::stderr().lock();
            writeln!(stderr, "{json}").context("failed to write diagnostic report to stderr")
        },
        DumpTarget::File(path) => fs::write(path, json)
            .with_context(|| format!("failed to write diagnostic report to {}", path.display())),
    }
}

static REGISTERED: Lazy<Mutex<Weak<Context>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Remember the most recently started runtime for the fatal path.
pub(crate) fn register_context(ctx: &Arc<Context>) {
    *REGISTERED.lock() = Arc::downgrade(ctx);
}

/// Dump target from `STRAND_DUMP`, falling back to the runtime's config.
fn fatal_target(ctx: Option<&Context>) -> Option<DumpTarget> {
    match std::env::var(DUMP_ENV) {
        Ok(value) => DumpTarget::parse(&value),
        Err(_) => ctx.and_then(|ctx| ctx.config().diagnostics.clone()),
    }
}

/// Write a report describing `violation`, if a target is configured.
///
/// Never blocks on the registry lock and never fails: the process is about
/// to abort either way.
pub(crate) fn flush_on_fatal(violation: &ProtocolViolation) {
    let ctx = REGISTERED.try_lock().and_then(|registered| registered.upgrade());
    let Some(target) = fatal_target(ctx.as_deref()) else {
        return;
    };
    let Some(ctx) = ctx else {
        eprintln!("strand: no runtime registered; diagnostic report skipped");
        return;
    };
    let report = DiagnosticReport::collect(&ctx, Some(violation));
    if let Err(error) = write_report(&report, &target) {
        eprintln!("strand: {error:#}");
    }
}

