//! Full frames: the heavyweight form an activation takes once it has been
//! stolen (or simulated-stolen).
//!
//! A full frame owns the outstanding-children counter, the continuation
//! parked at a blocked sync, and the chain of exceptions migrated from
//! children. Frames form a tree mirroring the promoted part of the
//! activation tree, linked through left siblings and the rightmost child.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use tracing::trace;

use super::activation::{Activation, ActivationEvent, ActivationId};
use crate::runtime::error::ProtocolViolation;
use crate::runtime::exception::{ExceptionChain, PendingException};
use crate::runtime::fiber::{Fiber, FiberId};

/// Mutable part of a full frame, guarded by the frame lock.
struct FrameState {
    /// Children currently executing in parallel with this frame.
    outstanding: usize,
    /// Continuation parked at a blocked sync.
    suspended: Option<Fiber>,
    /// Exceptions migrated from children, ordered by spawn ordinal.
    pending: ExceptionChain,
    rightmost_child: Option<Weak<FullFrame>>,
    left_sibling: Option<Weak<FullFrame>>,
    linked: bool,
}

/// Promoted form of an activation.
pub struct FullFrame {
    activation: ActivationId,
    /// Worker currently responsible for the frame.
    owner: AtomicUsize,
    /// Fiber carrying the frame's continuation.
    fiber: AtomicU64,
    parent: Option<Arc<FullFrame>>,
    state: Mutex<FrameState>,
}

impl std::fmt::Debug for FullFrame {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("FullFrame")
            .field("activation", &self.activation)
            .field("owner", &self.owner())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl FullFrame {
    /// Create a frame and link it as the rightmost child of `parent`.
    pub(crate) fn new(
        activation: ActivationId,
        owner: usize,
        fiber: FiberId,
        parent: Option<Arc<FullFrame>>,
    ) -> Arc<Self> {
        let frame = Arc::new(Self {
            activation,
            owner: AtomicUsize::new(owner),
            fiber: AtomicU64::new(fiber.0),
            parent: parent.clone(),
            state: Mutex::new(FrameState {
                outstanding: 0,
                suspended: None,
                pending: ExceptionChain::new(),
                rightmost_child: None,
                left_sibling: None,
                linked: parent.is_some(),
            }),
        });

        if let Some(parent) = parent {
            let mut parent_state = parent.state.lock();
            let left = parent_state
                .rightmost_child
                .replace(Arc::downgrade(&frame));
            frame.state.lock().left_sibling = left;
        }

        trace!(activation = %activation, owner, "promoted to full frame");
        frame
    }

    #[inline]
    pub fn activation(&self) -> ActivationId {
        self.activation
    }

    #[inline]
    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_owner(
        &self,
        worker: usize,
    ) {
        self.owner.store(worker, Ordering::SeqCst);
    }

    #[inline]
    pub fn fiber(&self) -> FiberId {
        FiberId(self.fiber.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_fiber(
        &self,
        fiber: FiberId,
    ) {
        self.fiber.store(fiber.0, Ordering::SeqCst);
    }

    #[inline]
    pub fn parent(&self) -> Option<&Arc<FullFrame>> {
        self.parent.as_ref()
    }

    /// Number of children still running in parallel.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn has_pending_exception(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    pub(crate) fn add_outstanding_child(&self) {
        self.state.lock().outstanding += 1;
    }

    /// A child that ran in parallel has returned.
    ///
    /// Merges the child's exception, decrements the counter and hands back
    /// the parked continuation if this was the last child the frame was
    /// blocked on.
    pub(crate) fn child_completed(
        &self,
        exception: Option<PendingException>,
    ) -> Result<Option<Fiber>, ProtocolViolation> {
        let mut state = self.state.lock();
        if let Some(exception) = exception {
            state.pending.insert(exception);
        }
        state.outstanding = state
            .outstanding
            .checked_sub(1)
            .ok_or(ProtocolViolation::CounterUnderflow(self.activation))?;
        if state.outstanding == 0 {
            Ok(state.suspended.take())
        } else {
            Ok(None)
        }
    }

    /// Park `fiber` at a sync of `activation`.
    ///
    /// The counter is re-checked under the frame lock: if the last child
    /// completed after the sync looked, the fiber is handed straight back.
    pub(crate) fn park(
        &self,
        activation: &Activation,
        fiber: Fiber,
    ) -> Result<Option<Fiber>, ProtocolViolation> {
        let mut state = self.state.lock();
        if state.outstanding == 0 {
            return Ok(Some(fiber));
        }
        if state.suspended.is_some() {
            return Err(ProtocolViolation::DoubleSync(self.activation));
        }
        activation.transition(ActivationEvent::SyncBlock)?;
        state.suspended = Some(fiber);
        Ok(None)
    }

    /// Attach an exception that reached this frame without a parallel child
    /// (inline child or serial fallback).
    pub(crate) fn attach_exception(
        &self,
        exception: PendingException,
    ) {
        self.state.lock().pending.insert(exception);
    }

    /// Take every pending exception, leftmost first.
    pub(crate) fn take_pending(&self) -> ExceptionChain {
        std::mem::take(&mut self.state.lock().pending)
    }

    /// Promoted children, left to right.
    pub fn children(&self) -> Vec<Arc<FullFrame>> {
        let state = self.state.lock();
        let mut children = Vec::new();
        let mut cursor = state.rightmost_child.as_ref().and_then(Weak::upgrade);
        drop(state);
        while let Some(child) = cursor {
            cursor = child
                .state
                .lock()
                .left_sibling
                .as_ref()
                .and_then(Weak::upgrade);
            children.push(child);
        }
        children.reverse();
        children
    }

    /// Remove this frame from its parent's child list. Idempotent.
    pub(crate) fn unlink(&self) {
        if let Some(parent) = &self.parent {
            unlink_from(parent, self);
        }
    }
}

fn unlink_from(
    parent: &FullFrame,
    frame: &FullFrame,
) {
    let target = frame as *const FullFrame;
    let mut parent_state = parent.state.lock();
    let mut left = {
        let mut state = frame.state.lock();
        if !state.linked {
            return;
        }
        state.linked = false;
        state.left_sibling.take()
    };

    let is_rightmost = parent_state
        .rightmost_child
        .as_ref()
        .is_some_and(|weak| weak.as_ptr() == target);
    if is_rightmost {
        parent_state.rightmost_child = left;
        return;
    }

    let mut cursor = parent_state.rightmost_child.as_ref().and_then(Weak::upgrade);
    while let Some(right) = cursor {
        let mut right_state = right.state.lock();
        if right_state
            .left_sibling
            .as_ref()
            .is_some_and(|weak| weak.as_ptr() == target)
        {
            right_state.left_sibling = left.take();
            return;
        }
        cursor = right_state.left_sibling.as_ref().and_then(Weak::upgrade);
    }
}

impl Drop for FullFrame {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.take() {
            unlink_from(&parent, self);
        }
    }
}
