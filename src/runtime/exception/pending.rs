//! Pending exception records and the per-frame chain that orders them.

use std::fmt;

use tracing::{debug, warn};

use super::bridge::{payload_message, Payload};
use crate::runtime::error::ProtocolViolation;
use crate::runtime::fiber::{FiberId, FiberPin};
use crate::runtime::frame::ActivationId;
use crate::runtime::worker::StealGuard;

/// Lifecycle of an exception travelling across steal boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionState {
    /// No exception.
    Normal,
    /// Raised and unwinding on a worker; stealing from that worker is off.
    Thrown,
    /// Caught at a spawn boundary and held in a heap record.
    Wrapped,
    /// Handed to the activation that will raise it at its sync.
    Migrated,
    /// Raised again at the sync.
    Rethrown,
    /// Discarded without being raised.
    Reclaimed,
}

impl ExceptionState {
    /// Whether a record may move from `self` to `to`.
    pub fn can_advance(
        self,
        to: ExceptionState,
    ) -> bool {
        use ExceptionState as S;
        matches!(
            (self, to),
            (S::Normal, S::Thrown)
                | (S::Thrown, S::Wrapped)
                | (S::Wrapped, S::Migrated)
                | (S::Wrapped | S::Migrated, S::Rethrown)
                | (S::Wrapped | S::Migrated, S::Reclaimed)
        )
    }
}

/// An exception caught at a spawn boundary, waiting to be raised at a sync.
pub struct PendingException {
    payload: Option<Payload>,
    state: ExceptionState,
    /// Keeps the origin fiber out of the stack pool until the record is gone.
    origin: Option<FiberPin>,
    /// Activation whose sync will raise this exception.
    rethrow_at: ActivationId,
    /// Spawn ordinal of the activation that raised it.
    ordinal: u64,
    /// Stealing stays disabled on the raising worker until migration.
    steal_guard: Option<StealGuard>,
    next: Option<Box<PendingException>>,
}

impl fmt::Debug for PendingException {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PendingException")
            .field("state", &self.state)
            .field("rethrow_at", &self.rethrow_at)
            .field("ordinal", &self.ordinal)
            .field("origin", &self.origin())
            .finish()
    }
}

impl PendingException {
    /// Wrap a payload caught at a spawn boundary.
    pub(crate) fn wrap(
        payload: Payload,
        origin: Option<FiberPin>,
        rethrow_at: ActivationId,
        ordinal: u64,
        steal_guard: Option<StealGuard>,
    ) -> Self {
        debug!(
            rethrow_at = %rethrow_at,
            ordinal,
            message = %payload_message(&payload),
            "exception wrapped at spawn boundary"
        );
        Self {
            payload: Some(payload),
            state: ExceptionState::Wrapped,
            origin,
            rethrow_at,
            ordinal,
            steal_guard,
            next: None,
        }
    }

    #[inline]
    pub fn state(&self) -> ExceptionState {
        self.state
    }

    #[inline]
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    #[inline]
    pub fn rethrow_at(&self) -> ActivationId {
        self.rethrow_at
    }

    /// Fiber the exception was raised on.
    pub fn origin(&self) -> Option<FiberId> {
        self.origin.as_ref().map(FiberPin::fiber)
    }

    /// Message of the payload, if it is a string.
    pub fn message(&self) -> String {
        self.payload
            .as_ref()
            .map(payload_message)
            .unwrap_or_default()
    }

    fn advance(
        &mut self,
        to: ExceptionState,
    ) -> Result<(), ProtocolViolation> {
        if !self.state.can_advance(to) {
            return Err(ProtocolViolation::ExceptionTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Hand the record to `target`. Releases the raising worker's steal guard.
    pub(crate) fn migrate(
        &mut self,
        target: ActivationId,
    ) -> Result<(), ProtocolViolation> {
        if self.state != ExceptionState::Migrated {
            self.advance(ExceptionState::Migrated)?;
        }
        self.rethrow_at = target;
        self.steal_guard = None;
        Ok(())
    }

    /// Consume the record for raising. The origin fiber is released.
    pub(crate) fn into_payload(mut self) -> Result<Payload, ProtocolViolation> {
        self.advance(ExceptionState::Rethrown)?;
        self.steal_guard = None;
        self.origin = None;
        self.payload
            .take()
            .ok_or(ProtocolViolation::MissingPendingException(self.rethrow_at))
    }
}

impl Drop for PendingException {
    fn drop(&mut self) {
        if self.payload.is_some() {
            self.state = ExceptionState::Reclaimed;
            debug!(
                rethrow_at = %self.rethrow_at,
                ordinal = self.ordinal,
                "pending exception reclaimed"
            );
        }
        // Unlink iteratively so long chains cannot overflow the stack.
        let mut next = self.next.take();
        while let Some(mut record) = next {
            next = record.next.take();
        }
    }
}

/// Exceptions waiting at a frame, ordered by spawn ordinal.
#[derive(Default)]
pub struct ExceptionChain {
    head: Option<Box<PendingException>>,
    len: usize,
}

impl fmt::Debug for ExceptionChain {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ExceptionChain")
            .field("ordinals", &self.ordinals())
            .finish()
    }
}

impl ExceptionChain {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Insert keeping ascending ordinal order; equal ordinals keep arrival order.
    pub fn insert(
        &mut self,
        exception: PendingException,
    ) {
        let mut record = Box::new(exception);
        let mut cursor = &mut self.head;
        while cursor
            .as_ref()
            .is_some_and(|existing| existing.ordinal <= record.ordinal)
        {
            // Checked by the loop condition.
            if let Some(existing) = cursor {
                cursor = &mut existing.next;
            }
        }
        record.next = cursor.take();
        *cursor = Some(record);
        self.len += 1;
    }

    /// Remove the leftmost record.
    pub fn pop_leftmost(&mut self) -> Option<PendingException> {
        let mut head = self.head.take()?;
        self.head = head.next.take();
        self.len -= 1;
        Some(*head)
    }

    /// Keep only the leftmost record. The rest are reclaimed.
    pub fn into_leftmost(mut self) -> Option<PendingException> {
        let leftmost = self.pop_leftmost();
        if leftmost.is_some() {
            self.reclaim_all("an exception from an earlier spawn");
        }
        leftmost
    }

    /// Reclaim every record, logging each as superseded by `winner`.
    pub fn reclaim_all(
        &mut self,
        winner: &str,
    ) {
        while let Some(record) = self.pop_leftmost() {
            warn!(
                ordinal = record.ordinal,
                message = %record.message(),
                "discarding exception superseded by {winner}"
            );
        }
    }

    /// Ordinals in chain order.
    pub fn ordinals(&self) -> Vec<u64> {
        let mut ordinals = Vec::with_capacity(self.len);
        let mut cursor = self.head.as_deref();
        while let Some(record) = cursor {
            ordinals.push(record.ordinal);
            cursor = record.next.as_deref();
        }
        ordinals
    }
}
