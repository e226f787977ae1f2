//! Stack pool: worker-local caches in front of a global cache, bounded by a
//! system-wide cap on live stacks.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use corosensei::stack::DefaultStack;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use super::{Fiber, FiberId};

/// Why a fiber could not be handed out.
#[derive(Debug, Error)]
pub(crate) enum PoolError {
    #[error("system-wide limit of {0} stacks reached")]
    AtCapacity(usize),

    #[error("failed to allocate a {size}-byte stack: {source}")]
    Allocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub stack_size: usize,
    pub max_stacks: usize,
    /// Stacks currently allocated, wherever they are.
    pub live: usize,
    pub global_cached: usize,
    /// Finished fibers held back because a pending exception refers to them.
    pub deferred: usize,
    pub allocated_total: u64,
    pub exhausted_total: u64,
}

/// Process-wide part of the stack pool.
#[derive(Debug)]
pub(crate) struct FiberPool {
    stack_size: usize,
    max_stacks: usize,
    live: AtomicUsize,
    next_id: AtomicU64,
    allocated_total: AtomicU64,
    exhausted_total: AtomicU64,
    global: Mutex<Vec<Fiber>>,
    deferred: Mutex<Vec<Fiber>>,
    deferred_len: AtomicUsize,
}

impl FiberPool {
    pub fn new(
        stack_size: usize,
        max_stacks: usize,
    ) -> Self {
        Self {
            stack_size,
            max_stacks,
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            allocated_total: AtomicU64::new(0),
            exhausted_total: AtomicU64::new(0),
            global: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            deferred_len: AtomicUsize::new(0),
        }
    }

    /// Allocate a fresh stack if the cap allows it.
    fn allocate(&self) -> Result<Fiber, PoolError> {
        let mut live = self.live.load(Ordering::Relaxed);
        loop {
            if live >= self.max_stacks {
                self.exhausted_total.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::AtCapacity(self.max_stacks));
            }
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => live = actual,
            }
        }

        match DefaultStack::new(self.stack_size) {
            Ok(stack) => {
                let id = FiberId(self.next_id.fetch_add(1, Ordering::Relaxed));
                self.allocated_total.fetch_add(1, Ordering::Relaxed);
                trace!(fiber = %id, size = self.stack_size, "allocated stack");
                Ok(Fiber::new(id, stack))
            },
            Err(source) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                self.exhausted_total.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::Allocation {
                    size: self.stack_size,
                    source,
                })
            },
        }
    }

    fn take_global(&self) -> Option<Fiber> {
        self.global.lock().pop()
    }

    fn give_global<I>(
        &self,
        fibers: I,
    ) where
        I: IntoIterator<Item = Fiber>,
    {
        self.global.lock().extend(fibers);
    }

    fn defer(
        &self,
        fiber: Fiber,
    ) {
        trace!(fiber = %fiber.id(), "deferring pinned fiber");
        self.deferred.lock().push(fiber);
        self.deferred_len.fetch_add(1, Ordering::Relaxed);
    }

    /// Move deferred fibers that are no longer pinned into the global cache.
    pub fn reclaim_deferred(&self) -> usize {
        if self.deferred_len.load(Ordering::Relaxed) == 0 {
            return 0;
        }
        let released: Vec<Fiber> = {
            let mut deferred = self.deferred.lock();
            let (pinned, released): (Vec<Fiber>, Vec<Fiber>) =
                deferred.drain(..).partition(Fiber::is_pinned);
            *deferred = pinned;
            self.deferred_len.store(deferred.len(), Ordering::Relaxed);
            released
        };
        let count = released.len();
        if count > 0 {
            self.give_global(released);
        }
        count
    }

    /// Free every cached stack. Returns how many were freed.
    pub fn drain(&self) -> usize {
        let mut freed: Vec<Fiber> = std::mem::take(&mut *self.global.lock());
        freed.append(&mut self.deferred.lock());
        self.deferred_len.store(0, Ordering::Relaxed);
        let count = freed.len();
        drop(freed);
        self.live.fetch_sub(count, Ordering::AcqRel);
        debug!(count, "freed cached stacks");
        count
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            stack_size: self.stack_size,
            max_stacks: self.max_stacks,
            live: self.live.load(Ordering::Relaxed),
            global_cached: self.global.lock().len(),
            deferred: self.deferred_len.load(Ordering::Relaxed),
            allocated_total: self.allocated_total.load(Ordering::Relaxed),
            exhausted_total: self.exhausted_total.load(Ordering::Relaxed),
        }
    }
}

/// Worker-local stack cache. Owned by a single worker thread.
#[derive(Debug)]
pub(crate) struct LocalFiberCache {
    fibers: RefCell<Vec<Fiber>>,
    capacity: usize,
}

impl LocalFiberCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            fibers: RefCell::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Local cache first, then the global cache, then a fresh allocation.
    pub fn acquire(
        &self,
        pool: &FiberPool,
    ) -> Result<Fiber, PoolError> {
        if let Some(fiber) = self.fibers.borrow_mut().pop() {
            return Ok(fiber);
        }
        pool.reclaim_deferred();
        if let Some(fiber) = pool.take_global() {
            return Ok(fiber);
        }
        pool.allocate()
    }

    /// Return a finished fiber. Overflow spills the oldest half to the
    /// global cache; pinned fibers wait in the pool's deferred list.
    pub fn release(
        &self,
        fiber: Fiber,
        pool: &FiberPool,
    ) {
        if fiber.is_pinned() {
            pool.defer(fiber);
            return;
        }
        let mut fibers = self.fibers.borrow_mut();
        fibers.push(fiber);
        if fibers.len() > self.capacity {
            let spill = (fibers.len() / 2).max(fibers.len() - self.capacity);
            pool.give_global(fibers.drain(..spill));
        }
    }

    /// Keep only the most recently used fiber locally.
    pub fn trim(
        &self,
        pool: &FiberPool,
    ) {
        let mut fibers = self.fibers.borrow_mut();
        if fibers.len() > 1 {
            let spill = fibers.len() - 1;
            pool.give_global(fibers.drain(..spill));
        }
    }

    /// Hand every cached fiber to the global cache.
    pub fn flush(
        &self,
        pool: &FiberPool,
    ) {
        pool.give_global(self.fibers.borrow_mut().drain(..));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.fibers.borrow().len()
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<FiberId> {
        self.fibers.borrow().iter().map(Fiber::id).collect()
    }
}
