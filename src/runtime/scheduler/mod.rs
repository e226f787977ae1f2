//! Scheduler loop and fiber trampoline.
//!
//! Every worker thread runs [`run_loop`] on its native stack. The loop
//! resumes one fiber at a time and reacts to the command the fiber yields:
//!
//! - `Spawn`: the yielding fiber is the parent's continuation. It is pushed
//!   on the worker's ready deque and the child's fiber starts the job.
//! - `Finished`: the fiber goes back to the pool. The worker pops its own
//!   deque tail; if the parent is still there it resumes it, otherwise the
//!   parent was stolen and the child reports to the parent's full frame,
//!   resuming the parent here if it was the last child the parent waited on.
//! - `Block`: a sync found children outstanding. The fiber is parked on the
//!   activation's full frame unless the last child finished in the meantime.
//!
//! With nothing to run the worker steals from a victim's deque head, backing
//! off from spinning to yielding to sleeping on the sleep tree.

mod deque;
mod sleep;
mod stats;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use tracing::{debug, trace};

pub use deque::StealFailure;
pub(crate) use deque::{Continuation, ReadyDeque};
pub(crate) use sleep::SleepTree;
pub use stats::{StatsSnapshot, WorkerStats};

use crate::runtime::context::Context;
use crate::runtime::error::{fatal, OrFatal, ProtocolViolation};
use crate::runtime::exception::payload_message;
use crate::runtime::fiber::{Fiber, FiberCommand, FiberInput, Job, JobOutcome};
use crate::runtime::frame::{ActivationEvent, ActivationKind, RootLatch, RootOutcome};
use crate::runtime::worker::{LoopState, Worker, WorkerShared};

/// The fiber to run next and what to send it.
type Next = Option<(Fiber, FiberInput)>;

/// Entry point of a system worker thread.
pub(crate) fn system_worker_main(
    ctx: Arc<Context>,
    shared: Arc<WorkerShared>,
) {
    let worker = Worker::new(ctx.clone(), shared.clone());
    let _binding = worker.bind();
    debug!(worker = worker.index(), "system worker started");

    let done = || ctx.is_work_done();
    let result = panic::catch_unwind(AssertUnwindSafe(|| run_loop(&worker, None, &done)));
    if let Err(payload) = result {
        fatal(ProtocolViolation::SchedulerPanic(payload_message(&payload)));
    }

    shared.set_state(LoopState::Shutdown);
    debug!(worker = worker.index(), "system worker exiting");
}

/// Run `job` as a computation root on the calling user thread and keep
/// scheduling until the root has finished, wherever it finished.
pub(crate) fn run_root(
    worker: &Worker,
    fiber: Fiber,
    job: Job,
    latch: &RootLatch,
) {
    let done = || latch.is_complete();
    let first = Some((fiber, FiberInput::Run(job)));
    let result = panic::catch_unwind(AssertUnwindSafe(|| run_loop(worker, first, &done)));
    if let Err(payload) = result {
        fatal(ProtocolViolation::SchedulerPanic(payload_message(&payload)));
    }
    worker.shared().set_state(LoopState::Shutdown);
}

fn run_loop(
    worker: &Worker,
    mut next: Next,
    done: &dyn Fn() -> bool,
) {
    let ctx = worker.context();
    let config = ctx.config();
    let spin_rounds = config.steal_rounds_before_yield;
    let yield_rounds = spin_rounds.saturating_add(config.yield_rounds_before_sleep);
    let sleep_timeout = Duration::from_millis(config.sleep_timeout_ms);
    let backoff = Backoff::new();
    let mut failed_rounds: u32 = 0;

    loop {
        if let Some((fiber, input)) = next.take() {
            failed_rounds = 0;
            backoff.reset();
            next = execute(worker, fiber, input);
            continue;
        }

        if done() {
            break;
        }

        worker.shared().set_state(LoopState::Stealing);
        if let Some(continuation) = steal_round(worker) {
            next = Some((continuation.fiber, FiberInput::Resume));
            continue;
        }

        failed_rounds = failed_rounds.saturating_add(1);
        if failed_rounds <= spin_rounds {
            backoff.snooze();
        } else if failed_rounds <= yield_rounds {
            thread::yield_now();
        } else {
            worker.trim_fibers();
            worker.shared().set_state(LoopState::Sleeping);
            worker.stats().record_sleep();
            ctx.sleep_tree().sleep(worker.index(), sleep_timeout, done);
            failed_rounds = 0;
            backoff.reset();
        }
    }
}

/// Resume `fiber` and handle what it yields.
fn execute(
    worker: &Worker,
    mut fiber: Fiber,
    input: FiberInput,
) -> Next {
    worker.shared().set_state(LoopState::Working);
    let started = Instant::now();
    let command = fiber.resume(input);
    worker
        .stats()
        .record_working(started.elapsed().as_nanos() as u64);

    match command {
        Some(FiberCommand::Spawn { parent, child, job }) => {
            parent.transition(ActivationEvent::Detach).or_fatal();
            worker
                .shared()
                .deque
                .push(Continuation {
                    activation: parent,
                    fiber,
                })
                .or_fatal();
            worker.stats().record_spawn();
            worker.context().sleep_tree().wake_children(worker.index());
            Some((child, FiberInput::Run(job)))
        },
        Some(FiberCommand::Finished(outcome)) => {
            worker.release_fiber(fiber);
            child_returned(worker, outcome)
        },
        Some(FiberCommand::Block(activation)) => {
            let frame = activation
                .frame()
                .cloned()
                .unwrap_or_else(|| fatal(ProtocolViolation::MissingFullFrame(activation.id())));
            frame
                .park(&activation, fiber)
                .or_fatal()
                .map(|fiber| (fiber, FiberInput::Resume))
        },
        None => None,
    }
}

/// A job finished on this worker; decide what runs next.
fn child_returned(
    worker: &Worker,
    outcome: JobOutcome,
) -> Next {
    let JobOutcome {
        activation,
        mut exception,
    } = outcome;

    if let ActivationKind::Root(latch) = activation.kind() {
        let outcome = match exception {
            Some(mut exception) => {
                exception.migrate(activation.id()).or_fatal();
                RootOutcome::Panicked(exception)
            },
            None => RootOutcome::Returned,
        };
        latch.complete(outcome);
        worker.context().sleep_tree().wake(latch.waiter());
        return None;
    }

    let parent = activation
        .parent()
        .cloned()
        .unwrap_or_else(|| fatal(ProtocolViolation::MissingFullFrame(activation.id())));
    if let Some(exception) = exception.as_mut() {
        exception.migrate(parent.id()).or_fatal();
    }

    match worker.shared().deque.pop().or_fatal() {
        Some(continuation) => {
            if !Arc::ptr_eq(&continuation.activation, &parent) {
                fatal(ProtocolViolation::ForeignContinuation {
                    expected: parent.id(),
                    found: continuation.activation.id(),
                });
            }
            if let Some(exception) = exception {
                parent
                    .simulated_steal(worker.index(), continuation.fiber.id())
                    .attach_exception(exception);
            }
            parent.transition(ActivationEvent::Reclaim).or_fatal();
            worker.stats().record_reclaim();
            Some((continuation.fiber, FiberInput::Resume))
        },
        None => {
            worker.stats().record_stolen_return();
            let frame = parent
                .frame()
                .cloned()
                .unwrap_or_else(|| fatal(ProtocolViolation::MissingFullFrame(parent.id())));
            let resumed = frame.child_completed(exception).or_fatal()?;
            parent.transition(ActivationEvent::Resume).or_fatal();
            frame.set_owner(worker.index());
            parent.assign_worker(worker.index());
            worker.stats().record_provably_good();
            trace!(
                worker = worker.index(),
                activation = %parent.id(),
                "resuming parent after its last child"
            );
            Some((resumed, FiberInput::Resume))
        },
    }
}

/// One pass over the other workers looking for a continuation to steal.
fn steal_round(worker: &Worker) -> Option<Continuation> {
    let ctx = worker.context();
    let thief = worker.index();
    let attempts = ctx.workers().len().saturating_sub(1);

    for _ in 0..attempts {
        let victim_index = worker.pick_victim()?;
        let victim = &ctx.workers()[victim_index];
        let result = victim.deque.steal(
            |candidate| {
                victim.stealing_enabled() && candidate.activation.state().is_spawn_boundary()
            },
            |taken| {
                taken
                    .activation
                    .transition(ActivationEvent::Steal)
                    .or_fatal();
                taken
                    .activation
                    .promote_on_steal(thief, taken.fiber.id());
            },
        );

        match result {
            Ok(continuation) => {
                worker.stats().record_steal();
                trace!(
                    thief,
                    victim = victim_index,
                    activation = %continuation.activation.id(),
                    "stole continuation"
                );
                ctx.sleep_tree().wake_children(thief);
                return Some(continuation);
            },
            Err(failure) => worker.stats().record_steal_failure(failure),
        }
    }
    None
}
