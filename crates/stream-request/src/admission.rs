//! Admission control: bounds how many requests are active at the same time.
//!
//! Admission is polled, not queued. A request that fails to get a slot simply asks again on its
//! next tick; there is no FIFO ordering between waiting requests and sustained contention may
//! starve an unlucky one.
//!
//! The controller is an explicit object so tests can run independent controllers with different
//! ceilings. An engine owns one by default; several engines may share one through `Arc`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use tracing::trace;

/// Counter of active requests plus a configurable ceiling.
///
/// Invariant: `active() <= ceiling` whenever `ceiling > 0`.
#[derive(Debug, Default)]
pub struct AdmissionController {
    active: AtomicUsize,
    ceiling: AtomicI64,
}

impl AdmissionController {
    /// Create a controller. A ceiling `<= 0` admits everything immediately.
    pub fn new(ceiling: i64) -> Self {
        Self {
            active: AtomicUsize::new(0),
            ceiling: AtomicI64::new(ceiling),
        }
    }

    /// Current ceiling.
    pub fn ceiling(&self) -> i64 {
        self.ceiling.load(Ordering::Acquire)
    }

    /// Change the ceiling. Already admitted requests keep their slots; lowering the ceiling
    /// below the active count only blocks new admissions.
    pub fn set_ceiling(&self, ceiling: i64) {
        self.ceiling.store(ceiling, Ordering::Release);
    }

    /// Number of currently admitted requests.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Increment the active count iff the ceiling allows it.
    pub fn try_admit(&self) -> bool {
        let ceiling = self.ceiling();
        if ceiling <= 0 {
            self.active.fetch_add(1, Ordering::AcqRel);
            return true;
        }

        let limit = usize::try_from(ceiling).unwrap_or(usize::MAX);
        let admitted = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok();

        trace!(admitted, ceiling, active = self.active(), "admission: try_admit");
        admitted
    }

    /// Decrement the active count.
    ///
    /// Must be paired with a successful [`try_admit`](Self::try_admit). Prefer
    /// [`try_acquire`](Self::try_acquire), whose slot guard releases exactly once.
    pub fn release(&self) {
        let prev = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug_assert!(prev.is_ok(), "admission released more often than admitted");
    }

    /// Admit and return a guard that releases the slot when dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionSlot> {
        self.try_admit().then(|| AdmissionSlot {
            controller: Arc::clone(self),
        })
    }
}

/// An occupied admission slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionSlot {
    controller: Arc<AdmissionController>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.controller.release();
    }
}
