//! Activations: the lightweight record every spawn-capable call carries.
//!
//! An activation moves through a closed set of states driven by an explicit
//! transition table ([`ActivationState::on`]). The saved continuation of a
//! detached activation is the fiber it was suspended on; the fiber travels
//! with the activation through the ready deque and the full frame.

use std::sync::{
    atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::full_frame::FullFrame;
use crate::runtime::error::ProtocolViolation;
use crate::runtime::exception::PendingException;
use crate::runtime::fiber::FiberId;

/// Unique activation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationId(pub u64);

impl ActivationId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ActivationId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Activation({})", self.0)
    }
}

/// Scheduling state of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActivationState {
    /// Executing; nothing outstanding that needs a join.
    Running = 0,
    /// Suspended at a spawn point with its continuation in a ready deque.
    Detached = 1,
    /// Executing with a full frame whose children may still be outstanding.
    Unsynced = 2,
    /// Parked at a sync waiting for outstanding children.
    Suspended = 3,
    /// Returned.
    Done = 4,
}

impl ActivationState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => ActivationState::Running,
            1 => ActivationState::Detached,
            2 => ActivationState::Unsynced,
            3 => ActivationState::Suspended,
            _ => ActivationState::Done,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// The transition table.
    ///
    /// `has_frame` tells whether the activation has been promoted to a full
    /// frame; it only matters when the owner reclaims its own continuation.
    pub fn on(
        self,
        event: ActivationEvent,
        has_frame: bool,
    ) -> Option<ActivationState> {
        use ActivationEvent as E;
        use ActivationState as S;

        match (self, event) {
            (S::Running | S::Unsynced, E::Detach) => Some(S::Detached),
            (S::Detached, E::Reclaim) if has_frame => Some(S::Unsynced),
            (S::Detached, E::Reclaim) => Some(S::Running),
            (S::Detached, E::Steal) => Some(S::Unsynced),
            (S::Running | S::Unsynced, E::SyncReady) => Some(S::Running),
            (S::Unsynced, E::SyncBlock) => Some(S::Suspended),
            (S::Suspended, E::Resume) => Some(S::Unsynced),
            (S::Running, E::Leave) => Some(S::Done),
            _ => None,
        }
    }

    /// Whether a thief may take the continuation of an activation in this state.
    #[inline]
    pub fn is_spawn_boundary(&self) -> bool {
        *self == ActivationState::Detached
    }
}

/// Events that move an activation between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationEvent {
    /// A spawn published the continuation.
    Detach,
    /// The owner popped its own continuation back.
    Reclaim,
    /// A thief took the continuation.
    Steal,
    /// A sync found nothing outstanding.
    SyncReady,
    /// A sync found outstanding children and parked.
    SyncBlock,
    /// The last outstanding child completed and resumed the parked continuation.
    Resume,
    /// The call returned.
    Leave,
}

/// How an activation came to exist.
#[derive(Debug)]
pub enum ActivationKind {
    /// Bottom of a `Runtime::run` computation.
    Root(Arc<RootLatch>),
    /// Bottom of a spawned child's fiber; `ordinal` is its spawn position
    /// within the parent.
    Spawned { ordinal: u64 },
    /// A nested call on the same fiber that opened its own sync scope.
    Called,
}

/// An activation record.
#[derive(Debug)]
pub struct Activation {
    id: ActivationId,
    kind: ActivationKind,
    state: AtomicU8,
    /// Spawner for spawned activations, caller for called ones.
    parent: Option<Arc<Activation>>,
    /// Worker currently responsible for this activation.
    worker: AtomicUsize,
    /// Spawn ordinals handed to children.
    next_ordinal: AtomicU64,
    frame: OnceCell<Arc<FullFrame>>,
}

impl Activation {
    fn new(
        id: ActivationId,
        kind: ActivationKind,
        parent: Option<Arc<Activation>>,
        worker: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            state: AtomicU8::new(ActivationState::Running.as_u8()),
            parent,
            worker: AtomicUsize::new(worker),
            next_ordinal: AtomicU64::new(0),
            frame: OnceCell::new(),
        })
    }

    /// Bottom activation of a `run` computation.
    pub fn root(
        id: ActivationId,
        latch: Arc<RootLatch>,
        worker: usize,
    ) -> Arc<Self> {
        Self::new(id, ActivationKind::Root(latch), None, worker)
    }

    /// Bottom activation of a spawned child.
    pub fn spawned(
        id: ActivationId,
        parent: Arc<Activation>,
        ordinal: u64,
        worker: usize,
    ) -> Arc<Self> {
        Self::new(id, ActivationKind::Spawned { ordinal }, Some(parent), worker)
    }

    /// Nested activation opened by a call on the same fiber.
    pub fn called(
        id: ActivationId,
        caller: Arc<Activation>,
        worker: usize,
    ) -> Arc<Self> {
        Self::new(id, ActivationKind::Called, Some(caller), worker)
    }

    #[inline]
    pub fn id(&self) -> ActivationId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> &ActivationKind {
        &self.kind
    }

    #[inline]
    pub fn parent(&self) -> Option<&Arc<Activation>> {
        self.parent.as_ref()
    }

    /// Spawn position within the parent; zero for non-spawned activations.
    #[inline]
    pub fn ordinal(&self) -> u64 {
        match self.kind {
            ActivationKind::Spawned { ordinal } => ordinal,
            _ => 0,
        }
    }

    /// Whether this is the bottom activation of its fiber.
    #[inline]
    pub fn is_last_on_stack(&self) -> bool {
        !matches!(self.kind, ActivationKind::Called)
    }

    #[inline]
    pub fn state(&self) -> ActivationState {
        ActivationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Apply `event` according to the transition table.
    pub fn transition(
        &self,
        event: ActivationEvent,
    ) -> Result<ActivationState, ProtocolViolation> {
        let current = self.state();
        let next = current
            .on(event, self.frame.get().is_some())
            .ok_or_else(|| match (current, event) {
                (ActivationState::Suspended, ActivationEvent::SyncBlock) => {
                    ProtocolViolation::DoubleSync(self.id)
                },
                (_, ActivationEvent::Steal) => ProtocolViolation::IneligibleSteal(self.id),
                (_, ActivationEvent::Leave) => ProtocolViolation::InconsistentExit {
                    id: self.id,
                    state: current,
                },
                _ => ProtocolViolation::IllegalTransition {
                    id: self.id,
                    state: current,
                    event,
                },
            })?;
        self.state
            .compare_exchange(
                current.as_u8(),
                next.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|raced| ProtocolViolation::IllegalTransition {
                id: self.id,
                state: ActivationState::from_u8(raced),
                event,
            })?;
        Ok(next)
    }

    /// Hand out the next spawn ordinal.
    #[inline]
    pub fn next_ordinal(&self) -> u64 {
        self.next_ordinal.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn worker(&self) -> usize {
        self.worker.load(Ordering::SeqCst)
    }

    /// Record `worker` as responsible for this activation and for the called
    /// activations beneath it on the same fiber.
    pub fn assign_worker(
        &self,
        worker: usize,
    ) {
        self.worker.store(worker, Ordering::SeqCst);
        let mut below = self;
        while let (ActivationKind::Called, Some(caller)) = (&below.kind, below.parent.as_ref()) {
            caller.worker.store(worker, Ordering::SeqCst);
            below = caller;
        }
    }

    #[inline]
    pub fn frame(&self) -> Option<&Arc<FullFrame>> {
        self.frame.get()
    }

    /// Nearest ancestor that has been promoted.
    pub fn nearest_framed_ancestor(&self) -> Option<Arc<FullFrame>> {
        let mut cursor = self.parent.as_ref();
        while let Some(activation) = cursor {
            if let Some(frame) = activation.frame.get() {
                return Some(frame.clone());
            }
            cursor = activation.parent.as_ref();
        }
        None
    }

    /// Promote on a successful steal: create the frame if this is the first
    /// steal, then count the child that is now running in parallel.
    pub fn promote_on_steal(
        &self,
        thief: usize,
        fiber: FiberId,
    ) -> Arc<FullFrame> {
        let frame = self.promote(thief, fiber);
        frame.add_outstanding_child();
        frame.set_owner(thief);
        frame.set_fiber(fiber);
        self.assign_worker(thief);
        frame
    }

    /// Promote without a thief, so bookkeeping that lives on full frames
    /// (pending exceptions) has a home. Creates the frame at most once.
    pub fn simulated_steal(
        &self,
        owner: usize,
        fiber: FiberId,
    ) -> Arc<FullFrame> {
        self.promote(owner, fiber)
    }

    fn promote(
        &self,
        owner: usize,
        fiber: FiberId,
    ) -> Arc<FullFrame> {
        self.frame
            .get_or_init(|| {
                let parent = self.nearest_framed_ancestor();
                FullFrame::new(self.id, owner, fiber, parent)
            })
            .clone()
    }
}

/// Completion latch of a `run` root.
///
/// The root may finish on any worker; the user thread that called `run`
/// sleeps on its own sleep node until the latch is set.
#[derive(Debug)]
pub struct RootLatch {
    /// Worker slot of the user thread waiting on this root.
    waiter: usize,
    outcome: Mutex<Option<RootOutcome>>,
}

/// How a root finished.
#[derive(Debug)]
pub enum RootOutcome {
    Returned,
    Panicked(PendingException),
}

impl RootLatch {
    pub fn new(waiter: usize) -> Self {
        Self {
            waiter,
            outcome: Mutex::new(None),
        }
    }

    #[inline]
    pub fn waiter(&self) -> usize {
        self.waiter
    }

    pub fn complete(
        &self,
        outcome: RootOutcome,
    ) {
        *self.outcome.lock() = Some(outcome);
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.lock().is_some()
    }

    pub fn take(&self) -> Option<RootOutcome> {
        self.outcome.lock().take()
    }
}
