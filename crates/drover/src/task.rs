use crate::error::{Error, Result};
use core::fmt;
use tokio::time::Instant;

/// Identity of a worker within one pool run (`0..size`).
pub type WorkerId = usize;

/// Unique identifier of a [`Task`].
///
/// Identifiers are either assigned by the caller ([`Task::new`]) or drawn from
/// the queue's sequence ([`TaskQueue::submit_payload`]). The engine keys
/// results by this value; a queue refuses an id it has already admitted, and
/// its sequence skips ids the caller took.
///
/// [`TaskQueue::submit_payload`]: crate::TaskQueue::submit_payload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TaskId(u64);

impl TaskId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of work.
///
/// The payload is opaque to the engine. A task is immutable once submitted:
/// the queue stamps `submitted_at` on admission and then moves the task, by
/// value, to whichever worker claims it.
#[derive(Debug)]
pub struct Task<P> {
    id: TaskId,
    payload: P,
    submitted_at: Instant,
}

impl<P> Task<P> {
    /// Creates a task with a caller-assigned identifier.
    pub fn new(id: impl Into<TaskId>, payload: P) -> Self {
        Self {
            id: id.into(),
            payload,
            submitted_at: Instant::now(),
        }
    }

    pub const fn id(&self) -> TaskId {
        self.id
    }

    pub const fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Instant at which the queue admitted the task.
    pub const fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub(crate) fn stamp(&mut self) {
        self.submitted_at = Instant::now();
    }
}

/// The single result emitted for a [`Task`] by the worker that executed it.
///
/// A failed task is still a result: its `outcome` holds
/// [`Error::TaskFailed`].
#[derive(Debug)]
pub struct TaskResult<O> {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub outcome: Result<O>,
    pub submitted_at: Instant,
    pub completed_at: Instant,
}

impl<O> TaskResult<O> {
    pub const fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub const fn output(&self) -> Option<&O> {
        match &self.outcome {
            Ok(output) => Some(output),
            Err(_) => None,
        }
    }

    pub fn into_output(self) -> Result<O> {
        self.outcome
    }

    pub(crate) fn failed(
        task_id: TaskId,
        worker_id: WorkerId,
        reason: String,
        submitted_at: Instant,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            outcome: Err(Error::TaskFailed { task_id, reason }),
            submitted_at,
            completed_at: Instant::now(),
        }
    }
}

/// Restores task order on a set of results, which otherwise arrive in
/// completion order.
pub fn sort_by_task_id<O>(results: &mut [TaskResult<O>]) {
    results.sort_unstable_by_key(|r| r.task_id);
}

/// Orders results by admission time, breaking ties by identifier.
pub fn sort_by_submission<O>(results: &mut [TaskResult<O>]) {
    results.sort_unstable_by_key(|r| (r.submitted_at, r.task_id));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: u64, submitted_at: Instant) -> TaskResult<u64> {
        TaskResult {
            task_id: TaskId::new(id),
            worker_id: 0,
            outcome: Ok(id),
            submitted_at,
            completed_at: submitted_at,
        }
    }

    #[test]
    fn task_exposes_parts() {
        let task = Task::new(7, "payload");
        assert_eq!(task.id(), TaskId::new(7));
        assert_eq!(*task.payload(), "payload");
        assert_eq!(task.into_payload(), "payload");
    }

    #[test]
    fn failed_result_carries_reason() {
        let r: TaskResult<()> = TaskResult::failed(TaskId::new(3), 1, "boom".into(), Instant::now());
        assert!(!r.is_ok());
        assert!(r.output().is_none());
        assert_eq!(
            r.into_output(),
            Err(Error::TaskFailed {
                task_id: TaskId::new(3),
                reason: "boom".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sorts_restore_order() {
        let t0 = Instant::now();
        let t1 = t0 + core::time::Duration::from_millis(5);
        let mut results = vec![result(3, t0), result(1, t1), result(2, t0)];

        sort_by_task_id(&mut results);
        let ids: Vec<_> = results.iter().map(|r| r.task_id.get()).collect();
        assert_eq!(ids, [1, 2, 3]);

        sort_by_submission(&mut results);
        let ids: Vec<_> = results.iter().map(|r| r.task_id.get()).collect();
        assert_eq!(ids, [2, 3, 1]);
    }

    #[test]
    fn display_is_prefixed() {
        assert_eq!(TaskId::new(42).to_string(), "#42");
    }
}
