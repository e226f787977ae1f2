//! Process context: the worker table, the stack pool, the sleep tree and the
//! shutdown flag, created by one explicit start call and torn down by one
//! explicit shutdown call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::runtime::error::RuntimeError;
use crate::runtime::exception::{self, ExceptionBridge};
use crate::runtime::fiber::{FiberPool, PoolError, PoolStats};
use crate::runtime::frame::ActivationId;
use crate::runtime::scheduler::{self, SleepTree, StatsSnapshot};
use crate::runtime::worker::{LoopState, WorkerKind, WorkerShared};
use crate::util::config::{RuntimeConfig, MIN_STACK_SIZE};
use crate::util::diagnostic;

/// Shared state of one runtime instance.
pub(crate) struct Context {
    config: RuntimeConfig,
    /// System worker slots first, then user worker slots.
    workers: Box<[Arc<WorkerShared>]>,
    pool: FiberPool,
    sleep: SleepTree,
    bridge: Arc<dyn ExceptionBridge>,
    work_done: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_activation: AtomicU64,
    exhaustion_warned: AtomicBool,
    started: Instant,
}

impl std::fmt::Debug for Context {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("nworkers", &self.config.nworkers)
            .field("slots", &self.workers.len())
            .field("bridge", &self.bridge.name())
            .field("work_done", &self.is_work_done())
            .finish()
    }
}

/// Per-worker part of a [`RuntimeStats`] snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub index: usize,
    pub kind: WorkerKind,
    pub state: LoopState,
    pub bound: bool,
    pub thread_name: Option<String>,
    pub queued: usize,
    /// Panics unwinding on this worker that no boundary has caught yet.
    pub in_flight: usize,
    pub sleeping: bool,
    pub stats: StatsSnapshot,
}

/// Scheduler counters of a whole runtime.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub nworkers: usize,
    pub uptime_ms: u64,
    pub total: StatsSnapshot,
    pub workers: Vec<WorkerReport>,
    pub pool: PoolStats,
}

impl Context {
    /// Validate `config`, build the worker table and start the system workers.
    pub(crate) fn start(
        config: RuntimeConfig,
        bridge: Arc<dyn ExceptionBridge>,
    ) -> Result<Arc<Context>, RuntimeError> {
        validate(&config)?;
        exception::install_panic_hook();

        let system = config.system_workers();
        let total = config.total_slots();
        let workers: Box<[Arc<WorkerShared>]> = (0..total)
            .map(|index| {
                let kind = if index < system {
                    WorkerKind::System
                } else {
                    WorkerKind::User
                };
                Arc::new(WorkerShared::new(index, kind, config.deque_capacity))
            })
            .collect();

        let ctx = Arc::new(Context {
            pool: FiberPool::new(config.stack_size, config.max_stacks),
            sleep: SleepTree::new(system, total),
            workers,
            bridge,
            work_done: AtomicBool::new(false),
            threads: Mutex::new(Vec::with_capacity(system)),
            next_activation: AtomicU64::new(1),
            exhaustion_warned: AtomicBool::new(false),
            started: Instant::now(),
            config,
        });
        diagnostic::register_context(&ctx);

        for index in 0..system {
            let shared = ctx.workers[index].clone();
            shared.try_bind();
            let worker_ctx = ctx.clone();
            let spawned = thread::Builder::new()
                .name(format!("strand-worker-{index}"))
                .spawn(move || scheduler::system_worker_main(worker_ctx, shared));
            match spawned {
                Ok(handle) => ctx.threads.lock().push(handle),
                Err(source) => {
                    ctx.shutdown();
                    return Err(RuntimeError::ThreadSpawn { index, source });
                },
            }
        }

        info!(
            nworkers = ctx.config.nworkers,
            user_slots = ctx.config.max_user_workers,
            bridge = ctx.bridge.name(),
            "runtime started"
        );
        Ok(ctx)
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn pool(&self) -> &FiberPool {
        &self.pool
    }

    #[inline]
    pub fn workers(&self) -> &[Arc<WorkerShared>] {
        &self.workers
    }

    #[inline]
    pub fn sleep_tree(&self) -> &SleepTree {
        &self.sleep
    }

    #[inline]
    pub fn bridge(&self) -> &Arc<dyn ExceptionBridge> {
        &self.bridge
    }

    #[inline]
    pub fn is_work_done(&self) -> bool {
        self.work_done.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn next_activation_id(&self) -> ActivationId {
        ActivationId(self.next_activation.fetch_add(1, Ordering::Relaxed))
    }

    /// Warn about stack exhaustion the first time it forces a serial spawn.
    pub fn warn_stack_exhaustion_once(
        &self,
        error: &PoolError,
    ) {
        if !self.exhaustion_warned.swap(true, Ordering::Relaxed) {
            warn!("{error}; spawns will run serially until stacks are released");
        }
    }

    /// Claim a free user worker slot for the calling thread.
    pub fn bind_user_slot(&self) -> Option<Arc<WorkerShared>> {
        self.workers
            .iter()
            .skip(self.config.system_workers())
            .find(|slot| slot.try_bind())
            .cloned()
    }

    /// Stop the system workers and release every cached stack.
    ///
    /// Idempotent. Workers finish the fiber they are running and leave at the
    /// top of their loop.
    pub fn shutdown(&self) {
        if self.work_done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sleep.wake_all();

        let me = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == me {
                warn!("runtime shut down from one of its own workers; not joining it");
                continue;
            }
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                warn!(thread = ?name, "worker thread panicked during shutdown");
            }
        }
        for slot in self.workers.iter().filter(|slot| slot.kind() == WorkerKind::System) {
            slot.unbind();
        }

        let released = self.pool.drain();
        debug!(released, "runtime shut down");
    }

    pub fn stats(&self) -> RuntimeStats {
        let workers: Vec<WorkerReport> = self
            .workers
            .iter()
            .map(|slot| WorkerReport {
                index: slot.index(),
                kind: slot.kind(),
                state: slot.state(),
                bound: slot.is_bound(),
                thread_name: slot.thread_name(),
                queued: slot.deque.len(),
                in_flight: slot.in_flight(),
                sleeping: self.sleep.is_sleeping(slot.index()),
                stats: slot.stats.snapshot(),
            })
            .collect();
        let total = workers
            .iter()
            .fold(StatsSnapshot::default(), |acc, report| acc.merge(&report.stats));
        RuntimeStats {
            nworkers: self.config.nworkers,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            total,
            workers,
            pool: self.pool.stats(),
        }
    }
}

fn validate(config: &RuntimeConfig) -> Result<(), RuntimeError> {
    if config.nworkers == 0 {
        return Err(RuntimeError::InvalidConfig("nworkers must be at least 1".into()));
    }
    if config.max_user_workers == 0 {
        return Err(RuntimeError::InvalidConfig(
            "max_user_workers must be at least 1".into(),
        ));
    }
    if config.stack_size < MIN_STACK_SIZE {
        return Err(RuntimeError::InvalidConfig(format!(
            "stack_size {} is below the minimum of {MIN_STACK_SIZE}",
            config.stack_size
        )));
    }
    if config.max_stacks == 0 || config.deque_capacity < 2 {
        return Err(RuntimeError::InvalidConfig(
            "max_stacks and deque_capacity must be positive".into(),
        ));
    }
    Ok(())
}
