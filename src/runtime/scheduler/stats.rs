//! Per-worker scheduling statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::deque::StealFailure;

/// Counters owned by one worker and read by anyone.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Spawns performed by code running on this worker.
    pub spawns: AtomicU64,
    /// Continuations this worker stole.
    pub steals: AtomicU64,
    pub steal_empty: AtomicU64,
    pub steal_busy: AtomicU64,
    pub steal_collision: AtomicU64,
    pub steal_ineligible: AtomicU64,
    /// Parent continuations popped back after a child returned.
    pub reclaims: AtomicU64,
    /// Children that returned to find their parent stolen.
    pub stolen_returns: AtomicU64,
    /// Suspended parents resumed by their last returning child.
    pub provably_good_resumes: AtomicU64,
    /// Spawns run inline because no stack was available.
    pub serial_fallbacks: AtomicU64,
    pub sleeps: AtomicU64,
    /// Nanoseconds spent inside fibers.
    pub working_ns: AtomicU64,
}

impl WorkerStats {
    #[inline]
    pub fn record_spawn(&self) {
        self.spawns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed steal attempt under its category.
    #[inline]
    pub fn record_steal_failure(
        &self,
        failure: StealFailure,
    ) {
        let counter = match failure {
            StealFailure::Empty => &self.steal_empty,
            StealFailure::Busy => &self.steal_busy,
            StealFailure::Collision => &self.steal_collision,
            StealFailure::Ineligible => &self.steal_ineligible,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stolen_return(&self) {
        self.stolen_returns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_provably_good(&self) {
        self.provably_good_resumes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_serial_fallback(&self) {
        self.serial_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sleep(&self) {
        self.sleeps.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_working(
        &self,
        nanos: u64,
    ) {
        self.working_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            spawns: self.spawns.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            steal_empty: self.steal_empty.load(Ordering::Relaxed),
            steal_busy: self.steal_busy.load(Ordering::Relaxed),
            steal_collision: self.steal_collision.load(Ordering::Relaxed),
            steal_ineligible: self.steal_ineligible.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            stolen_returns: self.stolen_returns.load(Ordering::Relaxed),
            provably_good_resumes: self.provably_good_resumes.load(Ordering::Relaxed),
            serial_fallbacks: self.serial_fallbacks.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            working_ns: self.working_ns.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub spawns: u64,
    pub steals: u64,
    pub steal_empty: u64,
    pub steal_busy: u64,
    pub steal_collision: u64,
    pub steal_ineligible: u64,
    pub reclaims: u64,
    pub stolen_returns: u64,
    pub provably_good_resumes: u64,
    pub serial_fallbacks: u64,
    pub sleeps: u64,
    pub working_ns: u64,
}

impl StatsSnapshot {
    /// Steal attempts of every outcome.
    pub fn steal_attempts(&self) -> u64 {
        self.steals
            + self.steal_empty
            + self.steal_busy
            + self.steal_collision
            + self.steal_ineligible
    }

    /// Fraction of steal attempts that succeeded.
    pub fn steal_success_rate(&self) -> f64 {
        let total = self.steal_attempts();
        if total == 0 {
            return 1.0;
        }
        self.steals as f64 / total as f64
    }

    /// Field-wise sum.
    pub fn merge(
        mut self,
        other: &StatsSnapshot,
    ) -> StatsSnapshot {
        self.spawns += other.spawns;
        self.steals += other.steals;
        self.steal_empty += other.steal_empty;
        self.steal_busy += other.steal_busy;
        self.steal_collision += other.steal_collision;
        self.steal_ineligible += other.steal_ineligible;
        self.reclaims += other.reclaims;
        self.stolen_returns += other.stolen_returns;
        self.provably_good_resumes += other.provably_good_resumes;
        self.serial_fallbacks += other.serial_fallbacks;
        self.sleeps += other.sleeps;
        self.working_ns += other.working_ns;
        self
    }
}
