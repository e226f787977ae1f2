//! Fiber and stack pool unit tests

use corosensei::stack::DefaultStack;

use crate::runtime::fiber::{
    on_fiber, Fiber, FiberId, FiberInput, FiberPin, FiberPool, LocalFiberCache, PoolError,
};

const STACK: usize = 64 * 1024;

fn pin_of(fiber: &Fiber) -> FiberPin {
    FiberPin {
        fiber: fiber.id(),
        _pin: fiber.pin.clone(),
    }
}

#[cfg(test)]
mod fiber_tests {
    use super::*;

    #[test]
    fn test_fiber_id_display() {
        assert_eq!(FiberId(3).to_string(), "Fiber(3)");
    }

    #[test]
    fn test_new_fiber_is_idle() {
        let fiber = Fiber::new(FiberId(1), DefaultStack::new(STACK).unwrap());
        assert_eq!(fiber.id(), FiberId(1));
        assert!(!fiber.is_mid_job());
        assert!(!fiber.is_pinned());
        assert!(!on_fiber());
    }

    #[test]
    fn test_exit_before_first_job() {
        let mut fiber = Fiber::new(FiberId(1), DefaultStack::new(STACK).unwrap());
        assert!(fiber.resume(FiberInput::Exit).is_none());
        assert!(!fiber.is_mid_job());
        assert!(!on_fiber());
    }

    #[test]
    fn test_pin_tracks_references() {
        let fiber = Fiber::new(FiberId(2), DefaultStack::new(STACK).unwrap());
        let pin = pin_of(&fiber);
        assert_eq!(pin.fiber(), FiberId(2));
        assert!(fiber.is_pinned());
        let second = pin.clone();
        drop(pin);
        assert!(fiber.is_pinned());
        drop(second);
        assert!(!fiber.is_pinned());
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    #[test]
    fn test_release_then_acquire_returns_same_stack() {
        let pool = FiberPool::new(STACK, 16);
        let cache = LocalFiberCache::new(4);
        let fiber = cache.acquire(&pool).unwrap();
        let _other = cache.acquire(&pool).unwrap();
        let id = fiber.id();
        cache.release(fiber, &pool);
        assert_eq!(cache.acquire(&pool).unwrap().id(), id);
    }

    #[test]
    fn test_trim_twice_leaves_one() {
        let pool = FiberPool::new(STACK, 16);
        let cache = LocalFiberCache::new(8);
        let fibers: Vec<_> = (0..5).map(|_| cache.acquire(&pool).unwrap()).collect();
        let newest = fibers[4].id();
        for fiber in fibers {
            cache.release(fiber, &pool);
        }
        assert_eq!(cache.len(), 5);

        cache.trim(&pool);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ids(), vec![newest]);
        cache.trim(&pool);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ids(), vec![newest]);
        assert_eq!(pool.stats().global_cached, 4);
    }

    #[test]
    fn test_overflow_spills_half_to_global() {
        let pool = FiberPool::new(STACK, 16);
        let cache = LocalFiberCache::new(4);
        let fibers: Vec<_> = (0..5).map(|_| cache.acquire(&pool).unwrap()).collect();
        for fiber in fibers {
            cache.release(fiber, &pool);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(pool.stats().global_cached, 2);
    }

    #[test]
    fn test_global_cache_before_allocation() {
        let pool = FiberPool::new(STACK, 16);
        let first = LocalFiberCache::new(0);
        let second = LocalFiberCache::new(4);
        let fiber = first.acquire(&pool).unwrap();
        let id = fiber.id();
        first.release(fiber, &pool);
        assert_eq!(first.len(), 0);
        assert_eq!(second.acquire(&pool).unwrap().id(), id);
        assert_eq!(pool.stats().allocated_total, 1);
    }

    #[test]
    fn test_cap_on_live_stacks() {
        let pool = FiberPool::new(STACK, 2);
        let cache = LocalFiberCache::new(4);
        let _a = cache.acquire(&pool).unwrap();
        let _b = cache.acquire(&pool).unwrap();
        assert!(matches!(cache.acquire(&pool), Err(PoolError::AtCapacity(2))));
        let stats = pool.stats();
        assert_eq!(stats.live, 2);
        assert_eq!(stats.exhausted_total, 1);
    }

    #[test]
    fn test_pinned_fiber_is_deferred_until_unpinned() {
        let pool = FiberPool::new(STACK, 4);
        let cache = LocalFiberCache::new(4);
        let fiber = cache.acquire(&pool).unwrap();
        let id = fiber.id();
        let pin = pin_of(&fiber);

        cache.release(fiber, &pool);
        assert_eq!(cache.len(), 0);
        assert_eq!(pool.stats().deferred, 1);
        assert_eq!(pool.reclaim_deferred(), 0);

        drop(pin);
        assert_eq!(pool.reclaim_deferred(), 1);
        assert_eq!(pool.stats().deferred, 0);
        assert_eq!(cache.acquire(&pool).unwrap().id(), id);
    }

    #[test]
    fn test_drain_frees_cached_stacks() {
        let pool = FiberPool::new(STACK, 4);
        let cache = LocalFiberCache::new(1);
        let fibers: Vec<_> = (0..3).map(|_| cache.acquire(&pool).unwrap()).collect();
        for fiber in fibers {
            cache.release(fiber, &pool);
        }
        cache.flush(&pool);
        assert_eq!(pool.stats().live, 3);
        assert_eq!(pool.drain(), 3);
        assert_eq!(pool.stats().live, 0);
    }
}
