//! Run lifecycle: the shared cancellation signal, deadlines, worker tracking
//! and graceful or immediate shutdown.
//!
//! A [`LifecycleCoordinator`] drives exactly one run. It owns the run's
//! [`Signal`], tracks every worker task spawned for the run, and holds a
//! type-erased handle to the attached [`TaskQueue`] so that a graceful
//! shutdown can close it. Firing the signal is irreversible; a fresh run
//! needs a fresh coordinator.
//!
//! [`TaskQueue`]: crate::TaskQueue

mod signal;
mod state;

pub use signal::*;
pub use state::*;

use crate::{
    error::{Error, Result},
    mutex::{Mutex, lock_unpoisoned},
    queue::{QueueControl, TaskQueue},
};
use core::time::Duration;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::time::{sleep, timeout};
use tokio_util::task::TaskTracker;

/// Owner of one run's cancellation signal and worker set.
///
/// Cloning yields another handle to the same coordinator, so a producer, a
/// signal handler and the pool can each hold one.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    signal: Signal,
    tracker: TaskTracker,
    queue: OnceLock<Box<dyn QueueControl>>,
    /// Held while publishing the queue and while requesting a drain, so one
    /// side always sees the other.
    drain_requested: Mutex<bool>,
    run_started: AtomicBool,
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                signal: Signal::new(),
                tracker: TaskTracker::new(),
                queue: OnceLock::new(),
                drain_requested: Mutex::new(false),
                run_started: AtomicBool::new(false),
            }),
        }
    }

    /// The run-wide signal observed by every blocking operation.
    pub fn signal(&self) -> &Signal {
        &self.inner.signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.signal.is_fired()
    }

    /// Raises the run-wide signal without waiting for workers to stop.
    /// Returns `false` if it had already fired.
    pub fn cancel(&self) -> bool {
        self.inner.signal.fire(Cause::Cancelled)
    }

    /// Returns a deadline whose signal fires after `after`, or earlier with
    /// the run's cause if the run is cancelled first. Firing the deadline
    /// does not cancel the run.
    pub fn timeout(&self, after: Duration) -> Deadline {
        self.inner.signal.with_timeout(after)
    }

    /// Fires the run-wide signal with [`Cause::Timeout`] once `after` has
    /// elapsed, unless it fired for another reason first.
    pub fn arm_deadline(&self, after: Duration) {
        let signal = self.inner.signal.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = sleep(after) => {
                    if signal.fire(Cause::Timeout) {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(?after, "Run deadline elapsed, cancelling");
                    }
                }
                _ = signal.fired() => {}
            }
        });
    }

    /// Binds `queue` to this run. Called once, by [`WorkerPool::run`] or by
    /// the caller beforehand. From then on the queue's blocking operations
    /// observe the run's signal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunAlreadyStarted`] if a queue is already attached.
    ///
    /// [`WorkerPool::run`]: crate::WorkerPool::run
    pub fn attach<P: Send + 'static>(&self, queue: &TaskQueue<P>) -> Result<()> {
        let drain = {
            let requested = lock_unpoisoned!(self.inner.drain_requested);
            self.inner
                .queue
                .set(Box::new(queue.clone()) as Box<dyn QueueControl>)
                .map_err(|_| Error::RunAlreadyStarted)?;
            *requested
        };
        queue.bind(self.inner.signal.clone());

        // A graceful shutdown requested before the queue was known still has
        // to stop admissions.
        if drain {
            let _ = queue.close();
        }
        Ok(())
    }

    /// Claims the single run this coordinator may drive.
    pub(crate) fn begin_run(&self) -> Result<()> {
        if self.inner.run_started.swap(true, Ordering::AcqRel) {
            return Err(Error::RunAlreadyStarted);
        }
        Ok(())
    }

    pub(crate) fn is_attached_to<P>(&self, queue: &TaskQueue<P>) -> bool {
        self.inner
            .queue
            .get()
            .is_some_and(|attached| Arc::ptr_eq(&attached.state(), queue.state()))
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    /// Counters of the attached queue, if any.
    pub fn state(&self) -> Option<Arc<RunState>> {
        self.inner.queue.get().map(|queue| queue.state())
    }

    /// Current counters. Before a queue is attached everything is zero.
    pub fn report(&self) -> RunReport {
        let cause = self.inner.signal.cause();
        self.state()
            .map_or(RunReport { cause, ..RunReport::default() }, |state| {
                state.report(cause)
            })
    }

    /// Waits until every tracked worker has stopped.
    pub(crate) async fn wait_stopped(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Shuts the run down and reports its outcome.
    ///
    /// - `graceful = true`: closes the queue, then waits for workers to drain
    ///   every buffered task. Still interruptible by the run's signal, e.g. an
    ///   armed deadline.
    /// - `graceful = false`: fires the signal. Workers stop at their next
    ///   checkpoint; a task already executing is finished, everything still
    ///   queued is reported as abandoned.
    ///
    /// Calling it again returns a fresh report and has no other effect.
    pub async fn shutdown(&self, graceful: bool) -> RunReport {
        self.begin_shutdown(graceful);
        self.wait_stopped().await;
        self.finish_shutdown()
    }

    /// Graceful shutdown bounded by `grace`; escalates to cancellation if the
    /// workers have not drained by then.
    pub async fn shutdown_within(&self, grace: Duration) -> RunReport {
        self.begin_shutdown(true);
        if timeout(grace, self.wait_stopped()).await.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(?grace, "Graceful drain timed out, cancelling remaining work");
            self.cancel();
            self.wait_stopped().await;
        }
        self.finish_shutdown()
    }

    fn begin_shutdown(&self, graceful: bool) {
        if let Some(state) = self.state() {
            state.mark_shutdown();
        }

        if graceful {
            #[cfg(feature = "tracing")]
            tracing::info!("Refusing new tasks, draining queue");
            let attached = {
                let mut requested = lock_unpoisoned!(self.inner.drain_requested);
                *requested = true;
                self.inner.queue.get()
            };
            if let Some(queue) = attached {
                // Already closed by the producer is the normal case.
                let _ = queue.close();
            }
        } else {
            #[cfg(feature = "tracing")]
            tracing::info!("Cancelling run");
            self.cancel();
        }
    }

    fn finish_shutdown(&self) -> RunReport {
        let report = self.report();
        #[cfg(feature = "tracing")]
        tracing::info!(
            submitted = report.submitted,
            completed = report.completed,
            failed = report.failed,
            abandoned = report.abandoned,
            "Run shut down"
        );
        report
    }
}
