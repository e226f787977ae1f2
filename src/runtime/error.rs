//! Runtime error taxonomy and the single fatal path.
//!
//! Recoverable conditions are reported through [`RuntimeError`] and
//! [`ParamError`]. Protocol violations are never recoverable: internal
//! validators return them as values and the scheduler escalates through
//! [`fatal`], which flushes diagnostics and aborts the process.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::error;

use crate::runtime::exception::ExceptionState;
use crate::runtime::frame::{ActivationEvent, ActivationId, ActivationState};

/// Recoverable runtime errors surfaced by the public API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A system worker thread could not be started.
    #[error("failed to spawn worker thread {index}: {source}")]
    ThreadSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    /// The configuration is internally inconsistent.
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),

    /// The process-wide context has not been initialized.
    #[error("runtime is not initialized")]
    NotInitialized,

    /// A parameter change was rejected.
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Result of a rejected `set_param` call.
///
/// Each variant maps to a stable numeric status through [`ParamError::code`];
/// `0` is reserved for success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    /// The parameter name is not known.
    #[error("unknown runtime parameter `{0}`")]
    Unimplemented(String),

    /// The value parsed but lies outside the accepted range.
    #[error("value `{value}` is out of range for `{name}`")]
    OutOfRange { name: String, value: String },

    /// The value could not be parsed.
    #[error("value `{value}` is not valid for `{name}`")]
    Invalid { name: String, value: String },

    /// The runtime has already started; the parameter can no longer change.
    #[error("too late to change `{0}`: the runtime has already started")]
    TooLate(String),
}

impl ParamError {
    /// Status code returned for a successful parameter change.
    pub const SUCCESS: i32 = 0;

    /// Stable numeric status for this error.
    pub fn code(&self) -> i32 {
        match self {
            ParamError::Unimplemented(_) => 1,
            ParamError::OutOfRange { .. } => 2,
            ParamError::Invalid { .. } => 3,
            ParamError::TooLate(_) => 4,
        }
    }
}

/// A broken scheduler invariant. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("activation {id} cannot take event {event:?} in state {state:?}")]
    IllegalTransition {
        id: ActivationId,
        state: ActivationState,
        event: ActivationEvent,
    },

    #[error("activation {id} left in state {state:?}")]
    InconsistentExit {
        id: ActivationId,
        state: ActivationState,
    },

    #[error("activation {0} synced twice while suspended")]
    DoubleSync(ActivationId),

    #[error("steal target {0} is not a spawn boundary")]
    IneligibleSteal(ActivationId),

    #[error("ready deque slot {0} was claimed twice")]
    DoubleClaim(isize),

    #[error("ready deque of worker {worker} overflowed its capacity of {capacity}")]
    DequeOverflow { worker: usize, capacity: usize },

    #[error("popped continuation of {found} while returning to {expected}")]
    ForeignContinuation {
        expected: ActivationId,
        found: ActivationId,
    },

    #[error("outstanding-children counter of activation {0} would become negative")]
    CounterUnderflow(ActivationId),

    #[error("activation {0} completed a child but has no full frame")]
    MissingFullFrame(ActivationId),

    #[error("stealing disabled twice on worker {0} without an intervening release")]
    DoubleStealDisable(usize),

    #[error("stealing restored on worker {0} while it was not disabled")]
    UnpairedStealRestore(usize),

    #[error("no pending exception record for activation {0}")]
    MissingPendingException(ActivationId),

    #[error("`{0}` invoked on a thread that is not bound to a worker")]
    UnboundWorker(&'static str),

    #[error("`{0}` called outside of a fiber")]
    NotOnFiber(&'static str),

    #[error("fiber {0} tried to switch away while unwinding")]
    SuspendWhileUnwinding(u64),

    #[error("fiber {0} resumed while idle at its dispatch point")]
    ResumeIdleFiber(u64),

    #[error("fiber {0} received a job while suspended mid-job")]
    StartBusyFiber(u64),

    #[error("exception record cannot move from {from:?} to {to:?}")]
    ExceptionTransition {
        from: ExceptionState,
        to: ExceptionState,
    },

    #[error("panic escaped spawned code under the abort exception bridge: {0}")]
    AbortOnPanic(String),

    #[error("result of a spawned call was read before its activation synced")]
    ResultUnavailable,

    #[error("scheduler loop panicked: {0}")]
    SchedulerPanic(String),
}

static ABORTING: AtomicBool = AtomicBool::new(false);

/// Report a protocol violation and abort the process.
///
/// Diagnostics are flushed before aborting. A violation raised while another
/// one is already being reported aborts immediately.
#[cold]
#[inline(never)]
pub fn fatal(violation: ProtocolViolation) -> ! {
    if ABORTING.swap(true, Ordering::SeqCst) {
        std::process::abort();
    }
    error!(target: "strand::fatal", "{violation}");
    eprintln!("strand: fatal runtime error: {violation}");
    crate::util::diagnostic::flush_on_fatal(&violation);
    std::process::abort();
}

/// Escalate a validator result to the fatal path.
pub(crate) trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for Result<T, ProtocolViolation> {
    #[inline]
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(violation) => fatal(violation),
        }
    }
}
