//! Fixed-size pool of asynchronous workers draining a [`TaskQueue`].
//!
//! This module defines the [`WorkerPool`], which spawns `size` workers for a
//! single run. Every worker repeatedly acquires a rate-limiter permit (when a
//! limiter is configured), claims the oldest pending task, executes it and
//! hands the [`TaskResult`] to a [`ResultCollector`]. Workers stop when the
//! queue is closed and drained, or when the run's [`Signal`] fires.
//!
//! Cancellation is observed before acquiring a permit and before starting a
//! task, never in the middle of one: task bodies are not preempted.
//!
//! A worker takes its permit before claiming a task, so idle workers each sit
//! on a spent permit while the queue is empty. When work arrives after such a
//! lull, up to `size` tasks start at the same instant. Issuance itself still
//! never exceeds the limiter's rate; only the starts bunch up.
//!
//! [`TaskResult`]: crate::TaskResult
//! [`Signal`]: crate::Signal

mod worker;

use crate::{
    collector::ResultCollector,
    counter::CounterStore,
    error::{Error, Result},
    lifecycle::{LifecycleCoordinator, RunReport},
    limiter::RateLimiter,
    queue::TaskQueue,
    task::{Task, WorkerId},
};
use core::fmt;
use portable_atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use worker::{WorkerContext, worker_loop};

/// Counter key advanced once per successful task.
pub const METRIC_TASKS_COMPLETED: &str = "tasks.completed";
/// Counter key advanced once per failed task.
pub const METRIC_TASKS_FAILED: &str = "tasks.failed";
/// Counter key advanced once per rate-limiter permit taken by a worker.
pub const METRIC_PERMITS_GRANTED: &str = "permits.granted";

/// Every key the pool writes, for stores that need their keys up front.
pub const METRIC_KEYS: [&str; 3] = [
    METRIC_TASKS_COMPLETED,
    METRIC_TASKS_FAILED,
    METRIC_PERMITS_GRANTED,
];

/// The body executed for every task.
///
/// Implemented for any `Fn(Task<P>) -> impl Future<Output = Result<O, E>>`
/// where `E: Display`. An `Err` is recorded as [`Error::TaskFailed`] with the
/// error's display text; it never stops the worker.
pub trait TaskFn<P>: Send + Sync + 'static {
    type Output: Send + 'static;
    type Error: fmt::Display;

    fn call(
        &self,
        task: Task<P>,
    ) -> impl Future<Output = core::result::Result<Self::Output, Self::Error>> + Send;
}

impl<P, F, Fut, O, E> TaskFn<P> for F
where
    F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = core::result::Result<O, E>> + Send,
    O: Send + 'static,
    E: fmt::Display,
{
    type Output = O;
    type Error = E;

    fn call(&self, task: Task<P>) -> impl Future<Output = core::result::Result<O, E>> + Send {
        self(task)
    }
}

/// Lifecycle state of one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum WorkerState {
    /// Waiting for a permit or a task.
    Idle = 0,
    /// Executing a claimed task.
    Running = 1,
    /// Exited; never runs again.
    Stopped = 2,
}

impl WorkerState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: AtomicU8,
    executed: AtomicU64,
}

/// Read-only view of a pool's workers. Cheap to clone and usable while the
/// pool runs.
#[derive(Clone, Debug)]
pub struct PoolMonitor {
    slots: Arc<[Slot]>,
}

impl PoolMonitor {
    fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| Slot::default()).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self, worker_id: WorkerId) -> Option<WorkerState> {
        self.slots
            .get(worker_id)
            .map(|slot| WorkerState::from_raw(slot.state.load(Ordering::Acquire)))
    }

    pub fn states(&self) -> Vec<WorkerState> {
        (0..self.size()).filter_map(|id| self.state(id)).collect()
    }

    /// Tasks executed by `worker_id`, successful or not.
    pub fn executed(&self, worker_id: WorkerId) -> Option<u64> {
        self.slots
            .get(worker_id)
            .map(|slot| slot.executed.load(Ordering::Relaxed))
    }

    pub fn all_stopped(&self) -> bool {
        self.states().iter().all(|s| *s == WorkerState::Stopped)
    }

    pub(crate) fn set_state(&self, worker_id: WorkerId, state: WorkerState) {
        self.slots[worker_id]
            .state
            .store(state as u8, Ordering::Release);
    }

    pub(crate) fn record_executed(&self, worker_id: WorkerId) {
        self.slots[worker_id].executed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A fixed set of workers sharing one task body.
///
/// A pool is consumed by [`WorkerPool::run`]: workers exist for exactly one
/// run and are not reused.
pub struct WorkerPool<F> {
    task_fn: Arc<F>,
    limiter: Option<RateLimiter>,
    metrics: Option<Arc<dyn CounterStore>>,
    monitor: PoolMonitor,
}

impl<F> WorkerPool<F> {
    /// Creates a pool of `size` workers executing `task_fn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `size` is zero.
    pub fn new(size: usize, task_fn: F) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid("worker pool size must be greater than 0"));
        }
        Ok(Self {
            task_fn: Arc::new(task_fn),
            limiter: None,
            metrics: None,
            monitor: PoolMonitor::new(size),
        })
    }

    /// Every worker takes a permit from `limiter` before claiming a task.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Workers record [`METRIC_KEYS`] into `store` as they go.
    #[must_use]
    pub fn with_metrics(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.metrics = Some(store);
        self
    }

    pub fn size(&self) -> usize {
        self.monitor.size()
    }

    pub fn monitor(&self) -> PoolMonitor {
        self.monitor.clone()
    }

    /// Runs the pool until every worker has stopped, then reports the run.
    ///
    /// Workers stop once `queue` is closed and drained (graceful) or once the
    /// coordinator's signal fires (cancellation or deadline). Close the queue
    /// from the producer, or call [`LifecycleCoordinator::shutdown`] from
    /// another task, to end the run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunAlreadyStarted`] if `lifecycle` already drove a run
    /// or is attached to a different queue.
    pub async fn run<P>(
        self,
        queue: &TaskQueue<P>,
        collector: &ResultCollector<F::Output>,
        lifecycle: &LifecycleCoordinator,
    ) -> Result<RunReport>
    where
        P: Send + 'static,
        F: TaskFn<P>,
    {
        lifecycle.begin_run()?;
        if !lifecycle.is_attached_to(queue) {
            lifecycle.attach(queue)?;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            workers = self.size(),
            capacity = queue.capacity(),
            rate = ?self.limiter.as_ref().map(RateLimiter::mode),
            "Starting worker pool"
        );

        for worker_id in 0..self.size() {
            let ctx = WorkerContext {
                worker_id,
                queue: queue.clone(),
                collector: collector.clone(),
                task_fn: Arc::clone(&self.task_fn),
                limiter: self.limiter.clone(),
                metrics: self.metrics.clone(),
                signal: lifecycle.signal().clone(),
                monitor: self.monitor.clone(),
            };
            lifecycle.tracker().spawn(worker_loop(ctx));
        }

        lifecycle.wait_stopped().await;

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool stopped");

        Ok(lifecycle.report())
    }
}
