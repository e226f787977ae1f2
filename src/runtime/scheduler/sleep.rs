//! Sleep tree for idle workers.
//!
//! System workers form an implicit binary tree: worker `i` wakes `2i + 1`
//! and `2i + 2` when it finds work, so waking everyone after a burst costs
//! O(log N) latency instead of one thread doing N wake-ups. User worker
//! slots hang off the tree root.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct NodeState {
    sleeping: bool,
    /// A wake-up arrived; the next sleep returns immediately.
    pending: bool,
}

#[derive(Debug, Default)]
struct SleepNode {
    state: Mutex<NodeState>,
    cond: Condvar,
}

#[derive(Debug)]
pub(crate) struct SleepTree {
    nodes: Box<[SleepNode]>,
    /// Number of system workers; they occupy indices `0..system`.
    system: usize,
    sleepers: AtomicUsize,
}

impl SleepTree {
    pub fn new(
        system: usize,
        total: usize,
    ) -> Self {
        Self {
            nodes: (0..total).map(|_| SleepNode::default()).collect(),
            system,
            sleepers: AtomicUsize::new(0),
        }
    }

    /// Workers currently asleep.
    #[inline]
    pub fn sleepers(&self) -> usize {
        self.sleepers.load(Ordering::SeqCst)
    }

    /// Tree children of `worker`.
    pub fn children(
        &self,
        worker: usize,
    ) -> impl Iterator<Item = usize> {
        let system = self.system;
        let (first, count) = if worker < system {
            (2 * worker + 1, 2)
        } else {
            (0, 1)
        };
        (first..first + count).filter(move |&child| child < system)
    }

    /// Park `worker` until woken, `stop` returns true, or `timeout` passes.
    pub fn sleep<F>(
        &self,
        worker: usize,
        timeout: Duration,
        stop: F,
    ) where
        F: Fn() -> bool,
    {
        let Some(node) = self.nodes.get(worker) else {
            return;
        };
        let mut state = node.state.lock();
        if state.pending {
            state.pending = false;
            return;
        }
        if stop() {
            return;
        }
        state.sleeping = true;
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        while !state.pending && !stop() {
            if node.cond.wait_for(&mut state, timeout).timed_out() {
                break;
            }
        }
        state.pending = false;
        state.sleeping = false;
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake one worker. A worker that is awake will skip its next sleep.
    pub fn wake(
        &self,
        worker: usize,
    ) -> bool {
        let Some(node) = self.nodes.get(worker) else {
            return false;
        };
        let mut state = node.state.lock();
        state.pending = true;
        let was_sleeping = state.sleeping;
        if was_sleeping {
            node.cond.notify_one();
        }
        was_sleeping
    }

    /// Wake the tree children of `worker` if anyone is asleep.
    pub fn wake_children(
        &self,
        worker: usize,
    ) {
        if self.sleepers() == 0 {
            return;
        }
        for child in self.children(worker) {
            self.wake(child);
        }
    }

    /// Wake everyone.
    pub fn wake_all(&self) {
        for index in 0..self.nodes.len() {
            self.wake(index);
        }
    }

    pub fn is_sleeping(
        &self,
        worker: usize,
    ) -> bool {
        self.nodes
            .get(worker)
            .is_some_and(|node| node.state.lock().sleeping)
    }
}
