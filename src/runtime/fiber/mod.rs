//! Fibers: pooled stacks that run user code and migrate between workers.
//!
//! User code only ever runs on a fiber. A worker's native stack runs the
//! scheduler trampoline, which resumes fibers and reacts to the command each
//! one yields back (spawn, block at a sync, or job finished). A fiber that
//! finishes a job returns to its dispatch point and can be reused for the
//! next job without reallocating its stack.
//!
//! Thread-local state is re-installed every time a fiber is resumed, because
//! the thread resuming it need not be the one that suspended it.

mod pool;

use std::cell::{Cell, RefCell};
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::{Arc, Weak};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use smallvec::SmallVec;
use tracing::{trace, warn};

pub use pool::PoolStats;
pub(crate) use pool::{FiberPool, LocalFiberCache, PoolError};

use crate::runtime::abi::ActivationGuard;
use crate::runtime::error::{fatal, ProtocolViolation};
use crate::runtime::exception::{catch_once, PendingException};
use crate::runtime::frame::{Activation, ActivationKind};
use crate::runtime::worker;

/// Unique fiber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

impl std::fmt::Display for FiberId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Keeps a fiber out of circulation while something still refers to it.
#[derive(Debug, Clone)]
pub struct FiberPin {
    fiber: FiberId,
    _pin: Arc<()>,
}

impl FiberPin {
    #[inline]
    pub fn fiber(&self) -> FiberId {
        self.fiber
    }
}

/// A unit of work started on a fresh fiber.
pub(crate) struct Job {
    pub activation: Arc<Activation>,
    pub body: Box<dyn FnOnce() + Send + 'static>,
}

/// What the trampoline sends into a fiber.
pub(crate) enum FiberInput {
    /// Start a job at the dispatch point.
    Run(Job),
    /// Continue a suspended job.
    Resume,
    /// Leave the dispatch loop so the stack can be freed.
    Exit,
}

/// What a fiber yields back to the trampoline.
pub(crate) enum FiberCommand {
    /// The job returned; the fiber is back at its dispatch point.
    Finished(JobOutcome),
    /// `parent` spawned `job`; the yielding fiber is the parent's continuation.
    Spawn {
        parent: Arc<Activation>,
        child: Fiber,
        job: Job,
    },
    /// The activation hit a sync with children outstanding.
    Block(Arc<Activation>),
}

/// Result of a finished job.
pub(crate) struct JobOutcome {
    pub activation: Arc<Activation>,
    pub exception: Option<PendingException>,
}

type FiberCoroutine = Coroutine<FiberInput, FiberCommand, (), DefaultStack>;
type FiberYielder = Yielder<FiberInput, FiberCommand>;

/// A pooled stack running the dispatch loop.
pub struct Fiber {
    id: FiberId,
    coroutine: ManuallyDrop<FiberCoroutine>,
    pin: Arc<()>,
    mid_job: bool,
}

// SAFETY: a fiber is resumed by at most one thread at a time; ownership moves
// through the deque, the frame lock or the pool. Code running on the fiber
// never caches thread-local addresses across a suspension: the accessors
// below are not inlined and `suspend` re-installs the fiber's state on the
// resuming thread. Closures started on a fiber are `Send`.
unsafe impl Send for Fiber {}

impl std::fmt::Debug for Fiber {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("mid_job", &self.mid_job)
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

impl Fiber {
    pub(crate) fn new(
        id: FiberId,
        stack: DefaultStack,
    ) -> Self {
        let pin = Arc::new(());
        let weak = Arc::downgrade(&pin);
        let coroutine = Coroutine::with_stack(stack, move |yielder: &FiberYielder, input| {
            dispatch(yielder, input, id, weak)
        });
        Self {
            id,
            coroutine: ManuallyDrop::new(coroutine),
            pin,
            mid_job: false,
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// A pending exception still refers to this fiber.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        Arc::strong_count(&self.pin) > 1
    }

    /// Suspended inside a job rather than idle at the dispatch point.
    #[inline]
    pub fn is_mid_job(&self) -> bool {
        self.mid_job
    }

    /// Switch to the fiber until it yields a command.
    ///
    /// Returns `None` once the dispatch loop has exited.
    pub(crate) fn resume(
        &mut self,
        input: FiberInput,
    ) -> Option<FiberCommand> {
        match (&input, self.mid_job) {
            (FiberInput::Run(_), true) => fatal(ProtocolViolation::StartBusyFiber(self.id.0)),
            (FiberInput::Resume, false) => fatal(ProtocolViolation::ResumeIdleFiber(self.id.0)),
            _ => {},
        }
        let result = self.coroutine.resume(input);
        clear_current();
        match result {
            CoroutineResult::Yield(command) => {
                self.mid_job = !matches!(command, FiberCommand::Finished(_));
                Some(command)
            },
            CoroutineResult::Return(()) => {
                self.mid_job = false;
                None
            },
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.mid_job {
            // Unwinding user frames from here would run their destructors on
            // the wrong thread and outside any activation.
            warn!(fiber = %self.id, "leaking stack of a fiber suspended mid-job");
            return;
        }
        if self.coroutine.started() && !self.coroutine.done() {
            let _ = self.coroutine.resume(FiberInput::Exit);
            clear_current();
        }
        // SAFETY: the coroutine is not touched after this point.
        unsafe { ManuallyDrop::drop(&mut self.coroutine) }
    }
}

/// Per-fiber state reachable from the thread currently running the fiber.
pub(crate) struct FiberLocal {
    id: FiberId,
    yielder: *const FiberYielder,
    pin: Weak<()>,
    /// Activation stack of this fiber; the top is the current activation.
    activations: RefCell<SmallVec<[Arc<Activation>; 4]>>,
}

thread_local! {
    static CURRENT_FIBER: Cell<*const FiberLocal> = const { Cell::new(ptr::null()) };
}

impl FiberLocal {
    /// State of the fiber running on this thread, if any.
    ///
    /// The reference points into the fiber's own stack and stays valid across
    /// suspensions until the current job returns. Callers never hold it past
    /// the job that fetched it.
    #[inline(never)]
    pub(crate) fn current() -> Option<&'static FiberLocal> {
        let local = CURRENT_FIBER.with(Cell::get);
        // SAFETY: set only while the fiber's job is running on this thread;
        // the pointee lives on that fiber's stack for the whole job.
        unsafe { local.as_ref() }
    }

    #[inline(never)]
    fn install(&self) {
        CURRENT_FIBER.with(|current| current.set(self as *const FiberLocal));
    }

    #[inline]
    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn pin(&self) -> Option<FiberPin> {
        self.pin.upgrade().map(|pin| FiberPin {
            fiber: self.id,
            _pin: pin,
        })
    }

    pub(crate) fn push(
        &self,
        activation: Arc<Activation>,
    ) {
        self.activations.borrow_mut().push(activation);
    }

    pub(crate) fn pop(&self) -> Option<Arc<Activation>> {
        self.activations.borrow_mut().pop()
    }

    /// The activation currently executing on this fiber.
    pub(crate) fn top(&self) -> Option<Arc<Activation>> {
        self.activations.borrow().last().cloned()
    }
}

#[inline(never)]
fn clear_current() {
    CURRENT_FIBER.with(|current| current.set(ptr::null()));
}

/// Whether this thread is currently running a fiber.
#[inline(never)]
pub fn on_fiber() -> bool {
    CURRENT_FIBER.with(|current| !current.get().is_null())
}

/// Yield `command` to the trampoline and wait to be resumed, possibly on
/// another worker.
pub(crate) fn suspend(command: FiberCommand) {
    let local = FiberLocal::current()
        .unwrap_or_else(|| fatal(ProtocolViolation::NotOnFiber("suspend")));
    if std::thread::panicking() {
        fatal(ProtocolViolation::SuspendWhileUnwinding(local.id.0));
    }
    worker::settle_in_flight();
    // SAFETY: the yielder lives on this fiber's stack while the job runs.
    let input = unsafe { (*local.yielder).suspend(command) };
    local.install();
    if !matches!(input, FiberInput::Resume) {
        fatal(ProtocolViolation::StartBusyFiber(local.id.0));
    }
}

fn dispatch(
    yielder: &FiberYielder,
    mut input: FiberInput,
    id: FiberId,
    pin: Weak<()>,
) {
    loop {
        match input {
            FiberInput::Run(job) => {
                let local = FiberLocal {
                    id,
                    yielder: yielder as *const FiberYielder,
                    pin: pin.clone(),
                    activations: RefCell::new(SmallVec::new()),
                };
                local.install();
                let outcome = run_job(job, &local);
                clear_current();
                input = yielder.suspend(FiberCommand::Finished(outcome));
            },
            FiberInput::Resume => fatal(ProtocolViolation::ResumeIdleFiber(id.0)),
            FiberInput::Exit => {
                trace!(fiber = %id, "fiber exiting");
                return;
            },
        }
    }
}

/// Run a job behind the spawn boundary: the body is bracketed by its own
/// activation, and any panic is caught here and wrapped for migration.
fn run_job(
    job: Job,
    local: &FiberLocal,
) -> JobOutcome {
    let Job { activation, body } = job;
    let bridge = worker::current_bridge()
        .unwrap_or_else(|| fatal(ProtocolViolation::UnboundWorker("run_job")));

    let bottom = activation.clone();
    let result = catch_once(&*bridge, move || {
        ActivationGuard::adopt(bottom).leave_after_preferring_body(body);
    });

    let exception = match result {
        Ok(()) => {
            worker::settle_in_flight();
            None
        },
        Err(payload) => {
            let steal_guard = worker::capture_in_flight();
            let rethrow_at = match activation.kind() {
                ActivationKind::Root(_) => activation.id(),
                _ => activation
                    .parent()
                    .map(|parent| parent.id())
                    .unwrap_or_else(|| activation.id()),
            };
            Some(PendingException::wrap(
                payload,
                local.pin(),
                rethrow_at,
                activation.ordinal(),
                steal_guard,
            ))
        },
    };

    JobOutcome {
        activation,
        exception,
    }
}

#[cfg(test)]
mod tests;
