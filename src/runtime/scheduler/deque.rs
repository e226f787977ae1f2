//! Per-worker ready deque guarded by the THE protocol.
//!
//! The owning worker pushes and pops continuations at the tail without
//! locking. Thieves take from the head while holding the deque lock. Both
//! sides first claim an index by moving their end, fence, then check for a
//! conflict with the other end; a conflicting owner undoes its claim and
//! retries under the lock, a conflicting thief undoes its claim and gives up.
//!
//! A thief that wins runs the supplied promotion callback while it still
//! holds the lock, so an owner that lost the race cannot observe the stolen
//! activation half-promoted.

use std::ptr;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::runtime::error::{OrFatal, ProtocolViolation};
use crate::runtime::fiber::Fiber;
use crate::runtime::frame::Activation;

/// A detached activation together with the fiber holding its continuation.
#[derive(Debug)]
pub(crate) struct Continuation {
    pub activation: Arc<Activation>,
    pub fiber: Fiber,
}

/// Why a steal attempt came back empty-handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StealFailure {
    /// Nothing to take.
    Empty,
    /// Another thief holds the victim's lock.
    Busy,
    /// Lost the race for the last entry to the owner.
    Collision,
    /// The victim is not stealable right now.
    Ineligible,
}

/// Fixed-capacity ring of continuations.
pub(crate) struct ReadyDeque {
    worker: usize,
    head: CachePadded<AtomicIsize>,
    tail: CachePadded<AtomicIsize>,
    lock: Mutex<()>,
    slots: Box<[AtomicPtr<Continuation>]>,
}

impl std::fmt::Debug for ReadyDeque {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ReadyDeque")
            .field("worker", &self.worker)
            .field("head", &self.head())
            .field("tail", &self.tail())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl ReadyDeque {
    pub fn new(
        worker: usize,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            worker,
            head: CachePadded::new(AtomicIsize::new(0)),
            tail: CachePadded::new(AtomicIsize::new(0)),
            lock: Mutex::new(()),
            slots,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn head(&self) -> isize {
        self.head.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn tail(&self) -> isize {
        self.tail.load(Ordering::SeqCst)
    }

    /// Approximate number of entries.
    pub fn len(&self) -> usize {
        (self.tail() - self.head()).max(0) as usize
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(
        &self,
        index: isize,
    ) -> &AtomicPtr<Continuation> {
        &self.slots[index.rem_euclid(self.slots.len() as isize) as usize]
    }

    /// Take the entry at `index`, which the caller has claimed.
    fn claim(
        &self,
        index: isize,
    ) -> Result<Continuation, ProtocolViolation> {
        let raw = self.slot(index).swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return Err(ProtocolViolation::DoubleClaim(index));
        }
        // SAFETY: non-null slots hold pointers produced by `Box::into_raw` in
        // `push`, and the swap above hands each one out exactly once.
        Ok(*unsafe { Box::from_raw(raw) })
    }

    /// Append at the tail. Owner only.
    pub fn push(
        &self,
        continuation: Continuation,
    ) -> Result<(), ProtocolViolation> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail - head >= self.slots.len() as isize {
            return Err(ProtocolViolation::DequeOverflow {
                worker: self.worker,
                capacity: self.slots.len(),
            });
        }
        let raw = Box::into_raw(Box::new(continuation));
        let previous = self.slot(tail).swap(raw, Ordering::Release);
        if !previous.is_null() {
            // SAFETY: `raw` was created just above and never shared.
            drop(unsafe { Box::from_raw(raw) });
            return Err(ProtocolViolation::DoubleClaim(tail));
        }
        self.tail.store(tail + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Remove the tail entry. Owner only.
    ///
    /// Returns `Ok(None)` when the entry was taken by a thief.
    pub fn pop(&self) -> Result<Option<Continuation>, ProtocolViolation> {
        // No early emptiness check: a thief may hold a claimed head index
        // while it promotes, and only the lock tells us it is done.
        let tail = self.tail.load(Ordering::Relaxed);
        let claimed = tail - 1;
        self.tail.store(claimed, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if self.head.load(Ordering::SeqCst) > claimed {
            self.tail.store(tail, Ordering::SeqCst);
            let _guard = self.lock.lock();
            self.tail.store(claimed, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if self.head.load(Ordering::SeqCst) > claimed {
                self.tail.store(tail, Ordering::SeqCst);
                return Ok(None);
            }
            return self.claim(claimed).map(Some);
        }
        self.claim(claimed).map(Some)
    }

    /// Take the head entry on behalf of another worker.
    ///
    /// `eligible` is consulted once the head index has been won; `promote`
    /// runs on the taken entry before the lock is released.
    pub fn steal<E, P>(
        &self,
        eligible: E,
        promote: P,
    ) -> Result<Continuation, StealFailure>
    where
        E: FnOnce(&Continuation) -> bool,
        P: FnOnce(&Continuation),
    {
        let _guard = self.lock.try_lock().ok_or(StealFailure::Busy)?;

        let head = self.head.load(Ordering::SeqCst);
        if head >= self.tail.load(Ordering::SeqCst) {
            return Err(StealFailure::Empty);
        }

        self.head.store(head + 1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if head + 1 > self.tail.load(Ordering::SeqCst) {
            self.head.store(head, Ordering::SeqCst);
            return Err(StealFailure::Collision);
        }

        // The owner cannot reach index `head` any more without the lock.
        let raw = self.slot(head).load(Ordering::Acquire);
        // SAFETY: the entry at `head` stays in place while we hold the lock
        // and own the head index.
        let Some(candidate) = (unsafe { raw.as_ref() }) else {
            self.head.store(head, Ordering::SeqCst);
            return Err(StealFailure::Empty);
        };
        if !eligible(candidate) {
            self.head.store(head, Ordering::SeqCst);
            return Err(StealFailure::Ineligible);
        }

        let continuation = self.claim(head).or_fatal();
        promote(&continuation);
        Ok(continuation)
    }
}

impl Drop for ReadyDeque {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let raw = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // SAFETY: see `claim`.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}
