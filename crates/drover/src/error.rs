use crate::task::TaskId;
use thiserror::Error;

/// A result type defaulting to the crate-wide [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All error variants that `drover` can emit.
///
/// Task-level failures are carried inside a [`TaskResult`] as
/// [`Error::TaskFailed`] and never unwind a worker. Protocol violations
/// (submitting after close, closing twice, reusing a coordinator) are returned
/// synchronously to the caller that committed them. [`Error::Cancelled`] and
/// [`Error::Timeout`] are returned to whichever caller was suspended when the
/// run's signal fired.
///
/// [`TaskResult`]: crate::TaskResult
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The queue no longer accepts submissions.
    #[error("task queue is closed")]
    QueueClosed,

    /// Returned only by non-blocking submission when the queue is at
    /// capacity. The blocking `submit` waits instead.
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The operation was aborted by an explicit cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation was aborted because a deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// A task body reported failure.
    #[error("task {task_id} failed: {reason}")]
    TaskFailed { task_id: TaskId, reason: String },

    /// Fewer results arrived than were awaited before the signal fired.
    #[error("collected {collected} of {expected} results")]
    Partial { collected: usize, expected: usize },

    /// A task was submitted with an id the queue already admitted.
    #[error("task {task_id} was already submitted")]
    DuplicateTask { task_id: TaskId },

    /// A second result was emitted for the same task.
    #[error("duplicate result for task {task_id}")]
    DuplicateResult { task_id: TaskId },

    /// The counter store was built with a fixed key set that does not contain
    /// this key.
    #[error("unknown counter key `{key}`")]
    UnknownCounter { key: String },

    /// A coordinator drives exactly one run.
    #[error("lifecycle coordinator already started a run")]
    RunAlreadyStarted,

    /// A constructor rejected its arguments.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A `std` mutex was poisoned by a panicking holder. Not reachable when
    /// the `parking-lot` feature is enabled.
    #[cfg_attr(docsrs, doc(cfg(not(feature = "parking-lot"))))]
    #[cfg(not(feature = "parking-lot"))]
    #[error("lock poisoned")]
    LockPoisoned,
}

impl Error {
    /// Returns `true` for the two errors produced by a fired signal.
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout)
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg_attr(docsrs, doc(cfg(not(feature = "parking-lot"))))]
#[cfg(not(feature = "parking-lot"))]
use crate::mutex::{MutexGuard, PoisonError};
#[cfg_attr(docsrs, doc(cfg(not(feature = "parking-lot"))))]
#[cfg(not(feature = "parking-lot"))]
impl<T> From<PoisonError<MutexGuard<'_, T>>> for Error {
    fn from(_: PoisonError<MutexGuard<'_, T>>) -> Self {
        Self::LockPoisoned
    }
}
