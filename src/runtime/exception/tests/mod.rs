//! Exception migration unit tests

use std::sync::Arc;

use crate::runtime::error::ProtocolViolation;
use crate::runtime::exception::{
    catch_once, payload_message, ExceptionBridge, ExceptionChain, ExceptionState,
    PendingException, UnwindBridge,
};
use crate::runtime::frame::ActivationId;
use crate::runtime::worker::{WorkerKind, WorkerShared};

fn record(ordinal: u64) -> PendingException {
    PendingException::wrap(Box::new(ordinal), None, ActivationId(10), ordinal, None)
}

fn message_record(
    ordinal: u64,
    message: &'static str,
) -> PendingException {
    PendingException::wrap(Box::new(message), None, ActivationId(10), ordinal, None)
}

#[cfg(test)]
mod exception_state_tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        use ExceptionState as S;
        assert!(S::Normal.can_advance(S::Thrown));
        assert!(S::Thrown.can_advance(S::Wrapped));
        assert!(S::Wrapped.can_advance(S::Migrated));
        assert!(S::Migrated.can_advance(S::Rethrown));
        assert!(S::Migrated.can_advance(S::Reclaimed));
        assert!(S::Wrapped.can_advance(S::Rethrown));
    }

    #[test]
    fn test_no_backwards_or_skipping() {
        use ExceptionState as S;
        assert!(!S::Normal.can_advance(S::Wrapped));
        assert!(!S::Migrated.can_advance(S::Wrapped));
        assert!(!S::Rethrown.can_advance(S::Migrated));
        assert!(!S::Reclaimed.can_advance(S::Rethrown));
        assert!(!S::Rethrown.can_advance(S::Rethrown));
    }
}

#[cfg(test)]
mod pending_exception_tests {
    use super::*;

    #[test]
    fn test_wrap_and_migrate() {
        let mut exception = message_record(2, "boom");
        assert_eq!(exception.state(), ExceptionState::Wrapped);
        assert_eq!(exception.ordinal(), 2);
        assert_eq!(exception.message(), "boom");
        assert_eq!(exception.origin(), None);

        exception.migrate(ActivationId(3)).unwrap();
        assert_eq!(exception.state(), ExceptionState::Migrated);
        assert_eq!(exception.rethrow_at(), ActivationId(3));

        exception.migrate(ActivationId(4)).unwrap();
        assert_eq!(exception.rethrow_at(), ActivationId(4));
    }

    #[test]
    fn test_payload_survives_migration_unchanged() {
        let mut exception = record(7);
        exception.migrate(ActivationId(1)).unwrap();
        let payload = exception.into_payload().unwrap();
        assert_eq!(payload.downcast_ref::<u64>(), Some(&7));
    }

    #[test]
    fn test_debug_lists_ordinal() {
        let debug = format!("{:?}", record(5));
        assert!(debug.contains("ordinal: 5"));
    }

    #[test]
    fn test_released_steal_guard_restores_stealing() {
        let worker = Arc::new(WorkerShared::new(0, WorkerKind::System, 8));
        worker.begin_in_flight().unwrap();
        let guard = worker.capture_in_flight();
        assert!(guard.is_some());
        assert!(!worker.stealing_enabled());

        let mut exception =
            PendingException::wrap(Box::new("x"), None, ActivationId(1), 0, guard);
        assert!(!worker.stealing_enabled());
        exception.migrate(ActivationId(2)).unwrap();
        assert!(worker.stealing_enabled());
    }
}

#[cfg(test)]
mod chain_tests {
    use super::*;

    #[test]
    fn test_insert_keeps_ordinal_order() {
        let mut chain = ExceptionChain::new();
        for ordinal in [4, 1, 3, 0, 2] {
            chain.insert(record(ordinal));
        }
        assert_eq!(chain.len(), 5);
        assert_eq!(chain.ordinals(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_equal_ordinals_keep_arrival_order() {
        let mut chain = ExceptionChain::new();
        chain.insert(message_record(1, "first"));
        chain.insert(message_record(1, "second"));
        chain.insert(message_record(0, "zero"));
        let messages: Vec<_> = std::iter::from_fn(|| chain.pop_leftmost())
            .map(|record| record.message())
            .collect();
        assert_eq!(messages, vec!["zero", "first", "second"]);
    }

    #[test]
    fn test_into_leftmost_reclaims_the_rest() {
        let mut chain = ExceptionChain::new();
        chain.insert(record(2));
        chain.insert(record(1));
        let leftmost = chain.into_leftmost().unwrap();
        assert_eq!(leftmost.ordinal(), 1);
        assert!(ExceptionChain::new().into_leftmost().is_none());
    }

    #[test]
    fn test_reclaim_all_empties() {
        let mut chain = ExceptionChain::new();
        chain.insert(record(0));
        chain.insert(record(1));
        chain.reclaim_all("a test");
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
    }

    #[test]
    fn test_long_chain_drops_without_recursion() {
        let mut chain = ExceptionChain::new();
        for ordinal in 0..10_000 {
            chain.insert(record(10_000 - ordinal));
        }
        drop(chain);
    }
}

#[cfg(test)]
mod bridge_tests {
    use super::*;

    #[test]
    fn test_unwind_bridge_catches() {
        let bridge = UnwindBridge;
        assert_eq!(bridge.name(), "unwind");
        let result = catch_once(&bridge, || panic!("caught here"));
        let payload = result.unwrap_err();
        assert_eq!(payload_message(&payload), "caught here");
    }

    #[test]
    fn test_unwind_bridge_passes_through_success() {
        let mut ran = false;
        let result = catch_once(&UnwindBridge, || ran = true);
        assert!(result.is_ok());
        assert!(ran);
    }

    #[test]
    fn test_raise_round_trips_payload() {
        let result = catch_once(&UnwindBridge, || UnwindBridge.raise(Box::new(42_u32)));
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn test_payload_message_variants() {
        let owned: crate::runtime::exception::Payload = Box::new(String::from("owned"));
        let borrowed: crate::runtime::exception::Payload = Box::new("borrowed");
        let other: crate::runtime::exception::Payload = Box::new(1_i32);
        assert_eq!(payload_message(&owned), "owned");
        assert_eq!(payload_message(&borrowed), "borrowed");
        assert_eq!(payload_message(&other), "unknown panic");
    }
}

#[cfg(test)]
mod steal_disable_tests {
    use super::*;

    #[test]
    fn test_double_disable_is_a_violation() {
        let worker = WorkerShared::new(3, WorkerKind::User, 8);
        worker.disable_stealing().unwrap();
        assert_eq!(
            worker.disable_stealing(),
            Err(ProtocolViolation::DoubleStealDisable(3))
        );
    }

    #[test]
    fn test_unpaired_restore_is_a_violation() {
        let worker = WorkerShared::new(1, WorkerKind::System, 8);
        assert_eq!(
            worker.restore_stealing(),
            Err(ProtocolViolation::UnpairedStealRestore(1))
        );
    }

    #[test]
    fn test_nested_panics_disable_once() {
        let worker = WorkerShared::new(0, WorkerKind::System, 8);
        worker.begin_in_flight().unwrap();
        worker.begin_in_flight().unwrap();
        assert_eq!(worker.in_flight(), 2);
        assert!(!worker.stealing_enabled());
        worker.settle_in_flight().unwrap();
        assert!(worker.stealing_enabled());
        assert_eq!(worker.in_flight(), 0);
        worker.settle_in_flight().unwrap();
        assert!(worker.stealing_enabled());
    }
}
