//! Run guards
//!
//! [`TierRunGuard`] keeps scheduled runs of one tier from overlapping.
//! [`ReceiverLocks`] keeps any two syncs of the same receiver (scheduled or
//! manual, any tier) from overlapping. Neither queues: a caller that cannot
//! acquire simply skips.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::models::{ReceiverId, Tier};

/// Two-state (`idle` / `running`) gate for one tier
#[derive(Debug)]
pub struct TierRunGuard {
    tier: Tier,
    running: AtomicBool,
    acquisitions: AtomicU64,
    releases: AtomicU64,
}

impl TierRunGuard {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            running: AtomicBool::new(false),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Transition `idle` -> `running`.
    ///
    /// Returns false with no state change if the tier is already running.
    /// Safe under concurrent callers: exactly one of them wins.
    pub fn try_acquire(&self) -> bool {
        let acquired = self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if acquired {
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Unconditionally transition to `idle`
    pub fn release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.running.store(false, Ordering::Release);
    }

    /// Acquire and return a permit that releases on drop
    pub fn try_permit(&self) -> Option<TierPermit<'_>> {
        self.try_acquire().then_some(TierPermit { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Successful `try_acquire` calls since creation
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// `release` calls since creation
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}

/// Held for the duration of a tier run; releases the guard when dropped,
/// including on early return and panic.
#[must_use = "the tier is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct TierPermit<'a> {
    guard: &'a TierRunGuard,
}

impl Drop for TierPermit<'_> {
    fn drop(&mut self) {
        self.guard.release();
    }
}

/// One guard per tier, created once at scheduler construction
#[derive(Debug)]
pub struct TierGuards {
    incremental: TierRunGuard,
    full: TierRunGuard,
}

impl TierGuards {
    pub fn new() -> Self {
        Self {
            incremental: TierRunGuard::new(Tier::Incremental),
            full: TierRunGuard::new(Tier::Full),
        }
    }

    pub fn get(&self, tier: Tier) -> &TierRunGuard {
        match tier {
            Tier::Incremental => &self.incremental,
            Tier::Full => &self.full,
        }
    }
}

impl Default for TierGuards {
    fn default() -> Self {
        Self::new()
    }
}

/// Set of receivers with a sync in flight
#[derive(Debug, Default)]
pub struct ReceiverLocks {
    busy: Mutex<HashSet<ReceiverId>>,
}

impl ReceiverLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark `id` busy, or return None if it already is.
    ///
    /// The lease is owned so it can travel with blocking work that outlives
    /// the caller (a timed-out sync keeps its receiver locked until the
    /// blocking call actually returns).
    pub fn try_lock(self: &Arc<Self>, id: &ReceiverId) -> Option<ReceiverLease> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        busy.insert(id.clone()).then(|| ReceiverLease {
            locks: Arc::clone(self),
            id: id.clone(),
        })
    }

    pub fn is_locked(&self, id: &ReceiverId) -> bool {
        let busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        busy.contains(id)
    }

    fn unlock(&self, id: &ReceiverId) {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        busy.remove(id);
    }
}

/// Exclusive claim on one receiver, released on drop
#[must_use = "the receiver is unlocked as soon as the lease is dropped"]
#[derive(Debug)]
pub struct ReceiverLease {
    locks: Arc<ReceiverLocks>,
    id: ReceiverId,
}

impl ReceiverLease {
    pub fn receiver_id(&self) -> &ReceiverId {
        &self.id
    }
}

impl Drop for ReceiverLease {
    fn drop(&mut self) {
        self.locks.unlock(&self.id);
    }
}
