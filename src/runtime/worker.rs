//! Workers: the per-thread half of the scheduler.
//!
//! [`WorkerShared`] is what other threads may touch (the ready deque, the
//! steal-disable flag, statistics). [`Worker`] adds the state only the owning
//! thread uses (its stack cache and random source) and is reachable through a
//! thread-local pointer while the thread is bound.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::trace;

use crate::runtime::context::Context;
use crate::runtime::error::{OrFatal, ProtocolViolation};
use crate::runtime::exception::ExceptionBridge;
use crate::runtime::fiber::{self, Fiber, LocalFiberCache, PoolError};
use crate::runtime::scheduler::{ReadyDeque, WorkerStats};
use crate::util::config::VictimPolicy;

/// Whether a slot belongs to a runtime thread or to a user thread calling `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    System,
    User,
}

/// What a worker's scheduling loop is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LoopState {
    /// Running a fiber.
    Working = 0,
    /// Looking for a victim.
    Stealing = 1,
    /// Parked on its sleep node.
    Sleeping = 2,
    /// Left the loop.
    Shutdown = 3,
}

impl LoopState {
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => LoopState::Working,
            1 => LoopState::Stealing,
            2 => LoopState::Sleeping,
            _ => LoopState::Shutdown,
        }
    }

    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Cross-thread part of a worker.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    index: usize,
    kind: WorkerKind,
    pub deque: ReadyDeque,
    pub stats: WorkerStats,
    state: AtomicU8,
    /// Set while an exception unwinds on this worker.
    steal_disabled: AtomicBool,
    /// Panics raised on this worker and not yet caught or settled.
    in_flight: AtomicUsize,
    /// A thread currently owns this slot.
    bound: AtomicBool,
    thread_name: Mutex<Option<String>>,
}

impl WorkerShared {
    pub fn new(
        index: usize,
        kind: WorkerKind,
        deque_capacity: usize,
    ) -> Self {
        Self {
            index,
            kind,
            deque: ReadyDeque::new(index, deque_capacity),
            stats: WorkerStats::default(),
            state: AtomicU8::new(LoopState::Stealing.as_u8()),
            steal_disabled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            bound: AtomicBool::new(false),
            thread_name: Mutex::new(None),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_state(
        &self,
        state: LoopState,
    ) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    #[inline]
    pub fn stealing_enabled(&self) -> bool {
        !self.steal_disabled.load(Ordering::SeqCst)
    }

    pub fn disable_stealing(&self) -> Result<(), ProtocolViolation> {
        if self.steal_disabled.swap(true, Ordering::SeqCst) {
            return Err(ProtocolViolation::DoubleStealDisable(self.index));
        }
        trace!(worker = self.index, "stealing disabled");
        Ok(())
    }

    pub fn restore_stealing(&self) -> Result<(), ProtocolViolation> {
        if !self.steal_disabled.swap(false, Ordering::SeqCst) {
            return Err(ProtocolViolation::UnpairedStealRestore(self.index));
        }
        trace!(worker = self.index, "stealing restored");
        Ok(())
    }

    /// A panic started on this worker.
    pub fn begin_in_flight(&self) -> Result<(), ProtocolViolation> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            self.disable_stealing()?;
        }
        Ok(())
    }

    /// User code caught the panic itself; nothing is unwinding any more.
    pub fn settle_in_flight(&self) -> Result<(), ProtocolViolation> {
        if self.in_flight.swap(0, Ordering::SeqCst) > 0 {
            self.restore_stealing()?;
        }
        Ok(())
    }

    /// The panic was caught at a spawn boundary. Stealing stays disabled
    /// until the returned guard is dropped.
    pub fn capture_in_flight(self: &Arc<Self>) -> Option<StealGuard> {
        if self.in_flight.swap(0, Ordering::SeqCst) > 0 {
            Some(StealGuard {
                worker: self.clone(),
            })
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn try_bind(&self) -> bool {
        self.bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unbind(&self) {
        self.bound.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub fn set_thread_name(
        &self,
        name: Option<String>,
    ) {
        *self.thread_name.lock() = name;
    }

    pub fn thread_name(&self) -> Option<String> {
        self.thread_name.lock().clone()
    }
}

/// Re-enables stealing on a worker when dropped.
pub(crate) struct StealGuard {
    worker: Arc<WorkerShared>,
}

impl std::fmt::Debug for StealGuard {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StealGuard")
            .field("worker", &self.worker.index())
            .finish()
    }
}

impl Drop for StealGuard {
    fn drop(&mut self) {
        self.worker.restore_stealing().or_fatal();
    }
}

/// Thread-owned part of a worker.
pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    ctx: Arc<Context>,
    fibers: LocalFiberCache,
    rng: RefCell<SmallRng>,
    next_victim: Cell<usize>,
}

thread_local! {
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

impl Worker {
    pub fn new(
        ctx: Arc<Context>,
        shared: Arc<WorkerShared>,
    ) -> Self {
        let index = shared.index();
        Self {
            fibers: LocalFiberCache::new(ctx.config().local_stack_cache),
            rng: RefCell::new(SmallRng::seed_from_u64(0x9e37_79b9_7f4a_7c15 ^ index as u64)),
            next_victim: Cell::new(index + 1),
            shared,
            ctx,
        }
    }

    /// The worker bound to this thread.
    ///
    /// A worker outlives every fiber it runs, so the reference is valid for
    /// as long as code holding it stays on this thread. Code running on a
    /// fiber must fetch it again after any suspension.
    #[inline(never)]
    pub fn current() -> Option<&'static Worker> {
        let worker = CURRENT_WORKER.with(Cell::get);
        // SAFETY: the pointer is set by `bind` for the lifetime of a `Binding`
        // that lives on this thread's native stack below every use.
        unsafe { worker.as_ref() }
    }

    /// Make this worker current on the calling thread until the binding drops.
    pub fn bind(&self) -> Binding {
        let previous = CURRENT_WORKER.with(|current| current.replace(self as *const Worker));
        self.shared
            .set_thread_name(std::thread::current().name().map(str::to_string));
        Binding { previous }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.shared.index()
    }

    #[inline]
    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    #[inline]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    #[inline]
    pub fn stats(&self) -> &WorkerStats {
        &self.shared.stats
    }

    pub fn acquire_fiber(&self) -> Result<Fiber, PoolError> {
        self.fibers.acquire(self.ctx.pool())
    }

    pub fn release_fiber(
        &self,
        fiber: Fiber,
    ) {
        self.fibers.release(fiber, self.ctx.pool());
    }

    pub fn trim_fibers(&self) {
        self.fibers.trim(self.ctx.pool());
    }

    /// Next worker to try stealing from, never this one.
    pub fn pick_victim(&self) -> Option<usize> {
        let slots = self.ctx.workers().len();
        if slots < 2 {
            return None;
        }
        let me = self.index();
        for _ in 0..slots {
            let candidate = match self.ctx.config().victim_policy {
                VictimPolicy::Random => {
                    let pick = self.rng.borrow_mut().random_range(0..slots - 1);
                    if pick >= me {
                        pick + 1
                    } else {
                        pick
                    }
                },
                VictimPolicy::RoundRobin => {
                    let mut pick = self.next_victim.get() % slots;
                    if pick == me {
                        pick = (pick + 1) % slots;
                    }
                    self.next_victim.set(pick + 1);
                    pick
                },
            };
            if self.ctx.workers()[candidate].is_bound() {
                return Some(candidate);
            }
        }
        None
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.fibers.flush(self.ctx.pool());
    }
}

/// Keeps a worker installed as the thread's current worker.
pub(crate) struct Binding {
    previous: *const Worker,
}

impl Drop for Binding {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|current| current.set(self.previous));
    }
}

/// Index of the worker bound to the calling thread.
pub fn current_worker_id() -> Option<usize> {
    Worker::current().map(Worker::index)
}

pub(crate) fn current_bridge() -> Option<Arc<dyn ExceptionBridge>> {
    Worker::current().map(|worker| worker.context().bridge().clone())
}

/// Settle a panic that user code caught before reaching a runtime entry point.
pub(crate) fn settle_in_flight() {
    if std::thread::panicking() {
        return;
    }
    if let Some(worker) = Worker::current() {
        worker.shared.settle_in_flight().or_fatal();
    }
}

pub(crate) fn capture_in_flight() -> Option<StealGuard> {
    Worker::current().and_then(|worker| worker.shared.capture_in_flight())
}

/// Mark an exception as raised on the current worker.
pub(crate) fn begin_in_flight() {
    if let Some(worker) = Worker::current() {
        worker.shared.begin_in_flight().or_fatal();
    }
}

/// Called from the panic hook.
pub(crate) fn note_panic_on_fiber() {
    if !fiber::on_fiber() {
        return;
    }
    begin_in_flight();
}
