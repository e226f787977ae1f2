//! Exception bridges: how panics are caught at a spawn boundary and raised
//! again at a sync.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::runtime::error::{fatal, ProtocolViolation};

/// A caught panic payload.
pub type Payload = Box<dyn Any + Send + 'static>;

/// Language-neutral interface for catching and raising exceptions.
///
/// The scheduler only ever moves opaque payloads around; the bridge decides
/// what catching and raising means.
pub trait ExceptionBridge: Send + Sync + fmt::Debug {
    /// Short name used in logs and diagnostic reports.
    fn name(&self) -> &'static str;

    /// Run `body`, returning the payload of any exception it raised.
    fn catch(
        &self,
        body: &mut dyn FnMut(),
    ) -> Result<(), Payload>;

    /// Raise `payload` on the current stack.
    fn raise(
        &self,
        payload: Payload,
    ) -> !;
}

/// Bridge backed by Rust panics and unwinding.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnwindBridge;

impl ExceptionBridge for UnwindBridge {
    fn name(&self) -> &'static str {
        "unwind"
    }

    fn catch(
        &self,
        body: &mut dyn FnMut(),
    ) -> Result<(), Payload> {
        panic::catch_unwind(AssertUnwindSafe(body))
    }

    fn raise(
        &self,
        payload: Payload,
    ) -> ! {
        panic::resume_unwind(payload)
    }
}

/// Bridge for programs that treat any panic in parallel code as fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortBridge;

impl ExceptionBridge for AbortBridge {
    fn name(&self) -> &'static str {
        "abort"
    }

    fn catch(
        &self,
        body: &mut dyn FnMut(),
    ) -> Result<(), Payload> {
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(()) => Ok(()),
            Err(payload) => fatal(ProtocolViolation::AbortOnPanic(payload_message(&payload))),
        }
    }

    fn raise(
        &self,
        payload: Payload,
    ) -> ! {
        fatal(ProtocolViolation::AbortOnPanic(payload_message(&payload)))
    }
}

/// Run a one-shot closure through a bridge.
pub(crate) fn catch_once<F>(
    bridge: &dyn ExceptionBridge,
    body: F,
) -> Result<(), Payload>
where
    F: FnOnce(),
{
    let mut body = Some(body);
    bridge.catch(&mut || {
        if let Some(body) = body.take() {
            body()
        }
    })
}

/// Extract a human-readable message from a panic payload.
pub fn payload_message(payload: &Payload) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
