use super::signal::Cause;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};

/// Aggregate counters shared by every component of one run.
///
/// `submitted` is advanced by the queue before a task becomes visible to
/// workers, and `completed`/`failed` by workers after a result is emitted, so
/// `completed + failed <= submitted` holds at every instant.
#[derive(Debug, Default)]
pub struct RunState {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    shutdown: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` for the caller that flipped the flag.
    pub(crate) fn mark_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    /// Snapshot of the counters. Read `failed`/`completed` before `submitted`
    /// so a concurrent submission can only make the snapshot more
    /// conservative.
    pub fn report(&self, cause: Option<Cause>) -> RunReport {
        let failed = self.failed();
        let completed = self.completed();
        let submitted = self.submitted();
        RunReport {
            submitted,
            completed,
            failed,
            abandoned: submitted.saturating_sub(completed + failed),
            cause,
        }
    }
}

/// Outcome of a run as reported by [`LifecycleCoordinator::shutdown`].
///
/// `abandoned` counts tasks that were admitted but never executed because the
/// run was cancelled (or timed out) first. After a graceful shutdown it is
/// zero.
///
/// [`LifecycleCoordinator::shutdown`]: crate::LifecycleCoordinator::shutdown
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunReport {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub cause: Option<Cause>,
}

impl RunReport {
    /// Every admitted task produced a result.
    pub const fn is_drained(&self) -> bool {
        self.abandoned == 0
    }
}
