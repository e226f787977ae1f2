//! Public runtime API: the [`Runtime`] handle, its builder, the spawn/sync
//! helpers and the process-wide singleton.
//!
//! # Example
//!
//! ```no_run
//! fn fib(n: u64) -> u64 {
//!     if n < 2 {
//!         return n;
//!     }
//!     let (a, b) = strand::join(|| fib(n - 1), || fib(n - 2));
//!     a + b
//! }
//!
//! let runtime = strand::Runtime::builder().nworkers(4).build().unwrap();
//! assert_eq!(runtime.run(|| fib(20)), 6765);
//! ```

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::runtime::abi;
use crate::runtime::context::{Context, RuntimeStats};
use crate::runtime::error::{fatal, OrFatal, ParamError, ProtocolViolation, RuntimeError};
use crate::runtime::exception::{ExceptionBridge, UnwindBridge};
use crate::runtime::fiber::{self, Job};
use crate::runtime::frame::{Activation, RootLatch, RootOutcome};
use crate::runtime::scheduler;
use crate::runtime::worker::Worker;
use crate::util::config::{DumpTarget, RuntimeConfig, VictimPolicy};
use crate::util::diagnostic::{self, DiagnosticReport};

/// Handle to a running scheduler. Cloning shares the same workers; the
/// runtime shuts down when the last handle is dropped.
#[derive(Clone)]
pub struct Runtime {
    handle: Arc<RuntimeHandle>,
}

struct RuntimeHandle {
    ctx: Arc<Context>,
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.ctx.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("context", &self.handle.ctx)
            .finish()
    }
}

/// Builder for [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    bridge: Arc<dyn ExceptionBridge>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Builder with default settings; the environment is not consulted.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            bridge: Arc::new(UnwindBridge),
        }
    }

    /// Builder seeded from `STRAND_*` environment variables.
    pub fn from_env() -> Result<Self, ParamError> {
        Ok(Self::new().config(RuntimeConfig::from_env()?))
    }

    pub fn config(
        mut self,
        config: RuntimeConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Total workers, counting the thread that calls [`Runtime::run`].
    pub fn nworkers(
        mut self,
        nworkers: usize,
    ) -> Self {
        self.config.nworkers = nworkers;
        self
    }

    pub fn max_user_workers(
        mut self,
        slots: usize,
    ) -> Self {
        self.config.max_user_workers = slots;
        self
    }

    pub fn stack_size(
        mut self,
        bytes: usize,
    ) -> Self {
        self.config.stack_size = bytes;
        self
    }

    pub fn max_stacks(
        mut self,
        stacks: usize,
    ) -> Self {
        self.config.max_stacks = stacks;
        self
    }

    pub fn local_stack_cache(
        mut self,
        stacks: usize,
    ) -> Self {
        self.config.local_stack_cache = stacks;
        self
    }

    pub fn deque_capacity(
        mut self,
        entries: usize,
    ) -> Self {
        self.config.deque_capacity = entries;
        self
    }

    pub fn victim_policy(
        mut self,
        policy: VictimPolicy,
    ) -> Self {
        self.config.victim_policy = policy;
        self
    }

    pub fn diagnostics(
        mut self,
        target: DumpTarget,
    ) -> Self {
        self.config.diagnostics = Some(target);
        self
    }

    /// Set a parameter by name, as `set_param` does.
    pub fn param(
        mut self,
        name: &str,
        value: &str,
    ) -> Result<Self, ParamError> {
        self.config.set(name, value)?;
        Ok(self)
    }

    pub fn exception_bridge<B>(
        mut self,
        bridge: B,
    ) -> Self
    where
        B: ExceptionBridge + 'static,
    {
        self.bridge = Arc::new(bridge);
        self
    }

    /// Start the system workers.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let ctx = Context::start(self.config, self.bridge)?;
        Ok(Runtime {
            handle: Arc::new(RuntimeHandle { ctx }),
        })
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Runtime with default settings.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::builder().build()
    }

    /// Runtime configured from `STRAND_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        RuntimeBuilder::from_env()?.build()
    }

    #[inline]
    fn ctx(&self) -> &Arc<Context> {
        &self.handle.ctx
    }

    /// Total workers, counting the user thread.
    pub fn num_workers(&self) -> usize {
        self.ctx().config().nworkers
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.ctx().config()
    }

    pub fn stats(&self) -> RuntimeStats {
        self.ctx().stats()
    }

    pub fn diagnostics(&self) -> DiagnosticReport {
        DiagnosticReport::collect(self.ctx(), None)
    }

    /// Write a diagnostic report to `target`.
    pub fn write_diagnostics(
        &self,
        target: &DumpTarget,
    ) -> anyhow::Result<()> {
        diagnostic::write_report(&self.diagnostics(), target)
    }

    /// Stop the system workers. Later calls to [`Runtime::run`] still work,
    /// with the calling thread as the only worker.
    pub fn shutdown(&self) {
        self.ctx().shutdown();
    }

    /// Run `f` as the root of a parallel computation and return its result.
    ///
    /// The calling thread becomes a worker until `f` and everything it
    /// spawned have finished. A panic that `f` leaves unhandled is raised
    /// again here. Called from inside a computation, `f` runs as a nested
    /// scope of that computation instead.
    pub fn run<F, R>(
        &self,
        f: F,
    ) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        if fiber::on_fiber() {
            return sync_scope(f);
        }
        let ctx = self.ctx();
        let Some(slot) = ctx.bind_user_slot() else {
            warn!(
                slots = ctx.config().max_user_workers,
                "no free user worker slot; running serially"
            );
            return f();
        };

        let result: Mutex<Option<R>> = Mutex::new(None);
        let out = &result;
        let body: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
            let value = f();
            *out.lock() = Some(value);
        });
        // SAFETY: this call does not return before the latch completes, and
        // the latch completes only after the root job, with every descendant
        // synced, has finished running `body`.
        let body = unsafe { erase_lifetime(body) };

        let latch = Arc::new(RootLatch::new(slot.index()));
        let root = Activation::root(ctx.next_activation_id(), latch.clone(), slot.index());
        let job = Job {
            activation: root,
            body,
        };

        let worker = Worker::new(ctx.clone(), slot.clone());
        let binding = worker.bind();
        debug!(worker = worker.index(), "user thread entered the runtime");
        let serial = match worker.acquire_fiber() {
            Ok(root_fiber) => {
                scheduler::run_root(&worker, root_fiber, job, &latch);
                None
            },
            Err(error) => {
                ctx.warn_stack_exhaustion_once(&error);
                worker.stats().record_serial_fallback();
                Some(job)
            },
        };
        drop(binding);
        drop(worker);
        slot.unbind();

        if let Some(job) = serial {
            (job.body)();
        } else {
            match latch.take() {
                Some(RootOutcome::Returned) => {},
                Some(RootOutcome::Panicked(exception)) => {
                    let payload = exception.into_payload().or_fatal();
                    ctx.bridge().raise(payload);
                },
                None => fatal(ProtocolViolation::ResultUnavailable),
            }
        }
        result
            .into_inner()
            .unwrap_or_else(|| fatal(ProtocolViolation::ResultUnavailable))
    }
}

/// Erase the lifetime of a job body.
///
/// # Safety
///
/// Everything `body` borrows must outlive its execution.
unsafe fn erase_lifetime<'a>(
    body: Box<dyn FnOnce() + Send + 'a>
) -> Box<dyn FnOnce() + Send + 'static> {
    // SAFETY: only the lifetime bound changes; upheld by the caller.
    unsafe { std::mem::transmute(body) }
}

/// Result of a [`spawn`], readable once the spawning activation has synced.
#[derive(Debug)]
pub struct Spawned<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Spawned<T> {
    /// Whether the child has stored its result.
    pub fn is_done(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Take the result if it is there.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Sync the current activation, then take the result.
    ///
    /// Fatal if the child belongs to another activation and has not finished.
    pub fn join(self) -> T {
        abi::sync();
        self.try_take()
            .unwrap_or_else(|| fatal(ProtocolViolation::ResultUnavailable))
    }
}

/// Spawn `f` as a child of the current activation.
///
/// Outside a runtime `f` runs immediately on the calling thread.
///
/// # Thread-local state
///
/// The caller's continuation may be stolen and resume on another worker
/// thread. A `thread_local!` read after the spawn can therefore see a
/// different thread's slot than one read before it. Keep per-thread state
/// out of code that spans a spawn or a sync.
pub fn spawn<F, T>(f: F) -> Spawned<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let slot = Arc::new(Mutex::new(None));
    let out = slot.clone();
    abi::detach(Box::new(move || {
        let value = f();
        *out.lock() = Some(value);
    }));
    Spawned { slot }
}

/// Wait for every child of the current activation.
pub fn sync() {
    abi::sync();
}

/// Run `a` and `b`, potentially in parallel, and return both results.
///
/// `a` is spawned and `b` runs as the continuation. Panics surface after
/// both sides have finished; if both panic, `a`'s payload wins.
///
/// As with [`spawn`], code after `join` returns may run on a different
/// worker thread than code before it, so thread-local state does not carry
/// across the call.
pub fn join<A, B, RA, RB>(
    a: A,
    b: B,
) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    if !fiber::on_fiber() {
        return (a(), b());
    }
    // Declared before the guard so it outlives the child during unwinding.
    let left: Mutex<Option<RA>> = Mutex::new(None);
    let guard = abi::enter_activation();
    let out = &left;
    let body: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
        let value = a();
        *out.lock() = Some(value);
    });
    // SAFETY: `guard` syncs the child before this frame is left, whether by
    // return or by unwinding, and `left` is dropped after `guard`.
    abi::detach(unsafe { erase_lifetime(body) });
    let right = guard.leave_after(b);
    let left = left
        .into_inner()
        .unwrap_or_else(|| fatal(ProtocolViolation::ResultUnavailable));
    (left, right)
}

/// Run `f` in its own activation; every child it spawns is synced before
/// this returns.
pub fn sync_scope<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    abi::enter_activation().leave_after(f)
}

struct GlobalState {
    /// Parameters set before the singleton started.
    config: Option<RuntimeConfig>,
    runtime: Option<Runtime>,
}

static GLOBAL: Lazy<Mutex<GlobalState>> = Lazy::new(|| {
    Mutex::new(GlobalState {
        config: None,
        runtime: None,
    })
});

/// Start the process-wide runtime, or return it if it is already running.
///
/// Configuration comes from `STRAND_*` variables overridden by any earlier
/// [`set_param`] calls.
pub fn init() -> Result<Runtime, RuntimeError> {
    let mut global = GLOBAL.lock();
    if let Some(runtime) = &global.runtime {
        return Ok(runtime.clone());
    }
    let config = match global.config.take() {
        Some(config) => config,
        None => RuntimeConfig::from_env()?,
    };
    let runtime = RuntimeBuilder::new().config(config).build()?;
    global.runtime = Some(runtime.clone());
    Ok(runtime)
}

/// The process-wide runtime, if started.
pub fn global() -> Option<Runtime> {
    GLOBAL.lock().runtime.clone()
}

/// Change a parameter of the process-wide runtime before it starts.
///
/// Returns [`ParamError::TooLate`] for any name or value once [`init`] has
/// run.
pub fn set_param(
    name: &str,
    value: &str,
) -> Result<(), ParamError> {
    let mut global = GLOBAL.lock();
    if global.runtime.is_some() {
        return Err(ParamError::TooLate(name.to_string()));
    }
    let mut config = match global.config.clone() {
        Some(config) => config,
        None => RuntimeConfig::from_env()?,
    };
    config.set(name, value)?;
    global.config = Some(config);
    Ok(())
}

/// Shut down the process-wide runtime. A later [`init`] starts a new one.
pub fn shutdown() {
    let runtime = {
        let mut global = GLOBAL.lock();
        global.config = None;
        global.runtime.take()
    };
    if let Some(runtime) = runtime {
        runtime.shutdown();
    }
}
