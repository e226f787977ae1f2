//! Low-level entry points that parallel code is built from.
//!
//! Every spawn-capable function brackets its body with
//! [`enter_activation`] / [`leave_activation`] (or the guard's
//! [`ActivationGuard::leave`]), spawns with [`detach`] and joins with
//! [`sync`]. The higher-level helpers in [`crate::runtime::api`] are thin
//! wrappers over these.
//!
//! On a thread that is not bound to a worker every entry point degrades to
//! the serial elision of the program: spawns run inline and syncs do
//! nothing.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;
use tracing::warn;

use crate::runtime::error::{fatal, OrFatal, ProtocolViolation};
use crate::runtime::exception::{catch_once, PendingException};
use crate::runtime::fiber::{self, FiberCommand, FiberLocal, Job};
use crate::runtime::frame::{Activation, ActivationEvent, ActivationId, FullFrame};
use crate::runtime::worker::{self, Worker};

/// Scope of one activation. Leaving it performs the implicit sync.
///
/// Dropping the guard leaves the activation as well; during unwinding the
/// guard still waits for every outstanding child before the frame goes away.
#[must_use = "dropping the guard immediately syncs and leaves the activation"]
pub struct ActivationGuard {
    activation: Option<Arc<Activation>>,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for ActivationGuard {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ActivationGuard")
            .field("activation", &self.id())
            .finish()
    }
}

impl ActivationGuard {
    fn unbound() -> Self {
        Self {
            activation: None,
            _not_send: PhantomData,
        }
    }

    /// Push `activation` on the current fiber and guard it.
    pub(crate) fn adopt(activation: Arc<Activation>) -> Self {
        let local = FiberLocal::current()
            .unwrap_or_else(|| fatal(ProtocolViolation::NotOnFiber("enter_activation")));
        local.push(activation.clone());
        Self {
            activation: Some(activation),
            _not_send: PhantomData,
        }
    }

    /// Whether the guard belongs to a worker-bound activation.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.activation.is_some()
    }

    pub fn id(&self) -> Option<ActivationId> {
        self.activation.as_ref().map(|activation| activation.id())
    }

    /// Run `body` in this activation, then sync and leave even if `body`
    /// panicked, so the wait for children suspends instead of blocking the
    /// worker. A child's exception is raised in preference to the body's,
    /// matching the serial program where the child runs first.
    pub(crate) fn leave_after<F, R>(
        self,
        body: F,
    ) -> R
    where
        F: FnOnce() -> R,
    {
        self.leave_after_with(body, false)
    }

    /// Like [`leave_after`](Self::leave_after), but a panic of `body` wins
    /// over its children's. Used at spawn boundaries and computation roots.
    pub(crate) fn leave_after_preferring_body<F, R>(
        self,
        body: F,
    ) -> R
    where
        F: FnOnce() -> R,
    {
        self.leave_after_with(body, true)
    }

    fn leave_after_with<F, R>(
        self,
        body: F,
        body_wins: bool,
    ) -> R
    where
        F: FnOnce() -> R,
    {
        let bridge = match worker::current_bridge() {
            Some(bridge) if self.is_bound() => bridge,
            _ => {
                let value = body();
                self.leave();
                return value;
            },
        };
        let mut value = None;
        let result = catch_once(&*bridge, || value = Some(body()));
        worker::settle_in_flight();
        let payload = match result {
            Ok(()) => {
                self.leave();
                return value.unwrap_or_else(|| fatal(ProtocolViolation::ResultUnavailable));
            },
            Err(payload) => payload,
        };
        if body_wins {
            self.leave_discarding_children();
        } else {
            self.leave();
        }
        worker::begin_in_flight();
        bridge.raise(payload)
    }

    /// Sync and leave, dropping any exception the children left behind.
    fn leave_discarding_children(mut self) {
        if let Some(activation) = self.activation.take() {
            let exception = sync_activation(&activation);
            finish(&activation);
            if let Some(exception) = exception {
                warn!(
                    activation = %activation.id(),
                    message = %exception.message(),
                    "discarding child exception superseded by a panic in its parent"
                );
            }
        }
    }

    /// Sync and leave. Re-raises the leftmost exception of any child.
    pub fn leave(mut self) {
        if let Some(activation) = self.activation.take() {
            let exception = sync_activation(&activation);
            finish(&activation);
            if let Some(exception) = exception {
                raise(exception);
            }
        }
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        let Some(activation) = self.activation.take() else {
            return;
        };
        if thread::panicking() {
            sync_for_unwind(&activation);
            finish(&activation);
        } else {
            let exception = sync_activation(&activation);
            finish(&activation);
            if let Some(exception) = exception {
                raise(exception);
            }
        }
    }
}

/// Open a new activation for the current call.
///
/// On a thread that is not bound to a worker the guard is unbound and every
/// spawn beneath it runs serially.
pub fn enter_activation() -> ActivationGuard {
    match FiberLocal::current() {
        Some(local) => enter_on(local),
        None => ActivationGuard::unbound(),
    }
}

/// Like [`enter_activation`] for callers that know they run on a worker.
///
/// Calling it from an unbound thread is fatal.
pub fn enter_activation_fast() -> ActivationGuard {
    let local = FiberLocal::current()
        .unwrap_or_else(|| fatal(ProtocolViolation::UnboundWorker("enter_activation_fast")));
    enter_on(local)
}

fn enter_on(local: &FiberLocal) -> ActivationGuard {
    worker::settle_in_flight();
    let worker = Worker::current()
        .unwrap_or_else(|| fatal(ProtocolViolation::UnboundWorker("enter_activation")));
    let caller = local
        .top()
        .unwrap_or_else(|| fatal(ProtocolViolation::NotOnFiber("enter_activation")));
    let activation = Activation::called(
        worker.context().next_activation_id(),
        caller,
        worker.index(),
    );
    ActivationGuard::adopt(activation)
}

/// Leave the activation opened by `guard`, syncing first.
pub fn leave_activation(guard: ActivationGuard) {
    guard.leave();
}

/// Spawn `body` as a child of the current activation.
///
/// The child starts immediately on a fresh fiber; the caller's continuation
/// becomes available to thieves until the child returns. If no stack can be
/// had the child runs inline on the caller's stack.
pub fn detach(body: Box<dyn FnOnce() + Send + 'static>) {
    let (Some(worker), Some(local)) = (Worker::current(), FiberLocal::current()) else {
        body();
        return;
    };
    worker::settle_in_flight();

    let parent = local
        .top()
        .unwrap_or_else(|| fatal(ProtocolViolation::NotOnFiber("detach")));
    let ctx = worker.context();
    let child = Activation::spawned(
        ctx.next_activation_id(),
        parent.clone(),
        parent.next_ordinal(),
        worker.index(),
    );

    // A fiber cannot switch away mid-unwind; the child runs on this stack.
    if thread::panicking() {
        worker.stats().record_serial_fallback();
        run_inline(child, body);
        return;
    }

    match worker.acquire_fiber() {
        Ok(child_fiber) => {
            let command = FiberCommand::Spawn {
                parent,
                child: child_fiber,
                job: Job {
                    activation: child,
                    body,
                },
            };
            fiber::suspend(command);
        },
        Err(error) => {
            ctx.warn_stack_exhaustion_once(&error);
            worker.stats().record_serial_fallback();
            run_inline(child, body);
        },
    }
}

/// Run a spawned child on the caller's stack, keeping spawn semantics for
/// exceptions: a panic is parked on the parent and raised at its sync.
fn run_inline(
    child: Arc<Activation>,
    body: Box<dyn FnOnce() + Send + 'static>,
) {
    let bridge = worker::current_bridge()
        .unwrap_or_else(|| fatal(ProtocolViolation::UnboundWorker("detach")));
    let bottom = child.clone();
    let result = catch_once(&*bridge, move || {
        ActivationGuard::adopt(bottom).leave_after_preferring_body(body);
    });

    let payload = match result {
        Ok(()) => {
            worker::settle_in_flight();
            return;
        },
        Err(payload) => payload,
    };

    let steal_guard = worker::capture_in_flight();
    let (Some(worker), Some(local), Some(parent)) =
        (Worker::current(), FiberLocal::current(), child.parent())
    else {
        fatal(ProtocolViolation::UnboundWorker("detach"));
    };
    let mut exception = PendingException::wrap(
        payload,
        local.pin(),
        parent.id(),
        child.ordinal(),
        steal_guard,
    );
    exception.migrate(parent.id()).or_fatal();
    parent
        .simulated_steal(worker.index(), local.id())
        .attach_exception(exception);
}

/// Wait for every child of the current activation, then re-raise the
/// leftmost exception any of them left behind.
pub fn sync() {
    let Some(local) = FiberLocal::current() else {
        return;
    };
    worker::settle_in_flight();
    let activation = local
        .top()
        .unwrap_or_else(|| fatal(ProtocolViolation::NotOnFiber("sync")));
    if let Some(exception) = sync_activation(&activation) {
        raise(exception);
    }
}

/// Raise the pending exception of the current activation.
///
/// Fatal if there is none or the thread is not bound to a worker.
pub fn rethrow() -> ! {
    let local = FiberLocal::current()
        .unwrap_or_else(|| fatal(ProtocolViolation::UnboundWorker("rethrow")));
    let activation = local
        .top()
        .unwrap_or_else(|| fatal(ProtocolViolation::NotOnFiber("rethrow")));
    let exception = activation
        .frame()
        .and_then(|frame| frame.take_pending().into_leftmost())
        .unwrap_or_else(|| fatal(ProtocolViolation::MissingPendingException(activation.id())));
    raise(exception)
}

/// Block the activation until its children are done; return the exception
/// that should be raised, if any.
fn sync_activation(activation: &Arc<Activation>) -> Option<PendingException> {
    loop {
        let Some(frame) = activation.frame().cloned() else {
            activation.transition(ActivationEvent::SyncReady).or_fatal();
            return None;
        };
        if frame.outstanding() == 0 {
            activation.transition(ActivationEvent::SyncReady).or_fatal();
            return frame.take_pending().into_leftmost();
        }
        if thread::panicking() {
            wait_for_children(&frame);
            continue;
        }
        fiber::suspend(FiberCommand::Block(activation.clone()));
    }
}

/// Wait in place for every stolen child of `frame`.
///
/// Only reached while the thread unwinds, when the fiber cannot switch away.
fn wait_for_children(frame: &FullFrame) {
    let backoff = Backoff::new();
    while frame.outstanding() > 0 {
        if backoff.is_completed() {
            thread::sleep(Duration::from_micros(50));
        } else {
            backoff.snooze();
        }
    }
}

/// Sync a guard dropped while a panic unwinds through the activation.
///
/// Children's exceptions lose to the one already unwinding.
fn sync_for_unwind(activation: &Arc<Activation>) {
    if let Some(frame) = activation.frame().cloned() {
        wait_for_children(&frame);
        frame
            .take_pending()
            .reclaim_all("a panic unwinding through the parent");
    }
    activation.transition(ActivationEvent::SyncReady).or_fatal();
}

/// Retire a synced activation and pop it off the fiber's activation stack.
fn finish(activation: &Arc<Activation>) {
    activation.transition(ActivationEvent::Leave).or_fatal();
    if let Some(frame) = activation.frame() {
        frame.unlink();
    }
    let local = FiberLocal::current()
        .unwrap_or_else(|| fatal(ProtocolViolation::NotOnFiber("leave_activation")));
    match local.pop() {
        Some(top) if Arc::ptr_eq(&top, activation) => {},
        _ => fatal(ProtocolViolation::InconsistentExit {
            id: activation.id(),
            state: activation.state(),
        }),
    }
}

/// Raise a pending exception on the current fiber.
fn raise(exception: PendingException) -> ! {
    let bridge = worker::current_bridge()
        .unwrap_or_else(|| fatal(ProtocolViolation::UnboundWorker("rethrow")));
    let payload = exception.into_payload().or_fatal();
    worker::begin_in_flight();
    bridge.raise(payload)
}
