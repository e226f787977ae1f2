//! Exception migration across steal boundaries.
//!
//! A panic inside spawned code is caught where the child's fiber began,
//! wrapped into a [`PendingException`] and migrated to the parent's full
//! frame. The parent raises the leftmost pending exception at its next sync,
//! so a program observes the same exception it would see running serially.
//!
//! While a panic unwinds on a worker, thieves may not take work from that
//! worker. The panic hook installed by [`install_panic_hook`] disables
//! stealing when a panic starts on a fiber; the raising side re-enables it
//! once the payload has been caught and handed on.

mod bridge;
mod pending;

use std::panic;
use std::sync::Once;

pub use bridge::{payload_message, AbortBridge, ExceptionBridge, Payload, UnwindBridge};
pub(crate) use bridge::catch_once;
pub use pending::{ExceptionChain, ExceptionState, PendingException};

static HOOK: Once = Once::new();

/// Chain a panic hook that marks the current worker as having an exception
/// in flight. Installed once per process; the previous hook still runs.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            crate::runtime::worker::note_panic_on_fiber();
            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests;
