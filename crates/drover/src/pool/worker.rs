use super::{
    METRIC_PERMITS_GRANTED, METRIC_TASKS_COMPLETED, METRIC_TASKS_FAILED, PoolMonitor, TaskFn,
    WorkerState,
};
use crate::{
    collector::ResultCollector,
    counter::CounterStore,
    lifecycle::Signal,
    limiter::RateLimiter,
    queue::TaskQueue,
    task::{TaskResult, WorkerId},
};
use core::any::Any;
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::time::Instant;

/// Everything one worker needs for the length of a run.
pub(super) struct WorkerContext<P, F: TaskFn<P>> {
    pub worker_id: WorkerId,
    pub queue: TaskQueue<P>,
    pub collector: ResultCollector<F::Output>,
    pub task_fn: Arc<F>,
    pub limiter: Option<RateLimiter>,
    pub metrics: Option<Arc<dyn CounterStore>>,
    pub signal: Signal,
    pub monitor: PoolMonitor,
}

/// Worker task draining the shared queue.
///
/// Each iteration takes a permit (if a limiter is configured), claims the
/// oldest task and executes it. The loop ends when the queue is closed and
/// drained, or when the run's signal fires while the worker is idle. A task
/// body that returns an error or panics yields a failed [`TaskResult`]; the
/// worker keeps going.
pub(super) async fn worker_loop<P, F>(ctx: WorkerContext<P, F>)
where
    P: Send + 'static,
    F: TaskFn<P>,
{
    let worker_id = ctx.worker_id;

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    loop {
        if ctx.signal.is_fired() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker {worker_id} observed cancellation");
            break;
        }

        if let Some(limiter) = &ctx.limiter {
            if limiter.acquire(&ctx.signal).await.is_err() {
                break;
            }
            bump(ctx.metrics.as_deref(), METRIC_PERMITS_GRANTED);
        }

        let task = match ctx.queue.next_with(&ctx.signal).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} found the queue drained");
                break;
            }
            Err(_) => break,
        };

        let task_id = task.id();
        let submitted_at = task.submitted_at();
        ctx.monitor.set_state(worker_id, WorkerState::Running);

        #[cfg(feature = "tracing")]
        tracing::trace!(%task_id, "Worker {worker_id} executing task");

        let outcome = match AssertUnwindSafe(ctx.task_fn.call(task)).catch_unwind().await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(err.to_string()),
            Err(panic) => Err(panic_reason(&*panic)),
        };

        let result = match outcome {
            Ok(output) => {
                ctx.queue.state().record_completed();
                bump(ctx.metrics.as_deref(), METRIC_TASKS_COMPLETED);
                TaskResult {
                    task_id,
                    worker_id,
                    outcome: Ok(output),
                    submitted_at,
                    completed_at: Instant::now(),
                }
            }
            Err(reason) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%task_id, %reason, "Worker {worker_id} task failed");
                ctx.queue.state().record_failed();
                bump(ctx.metrics.as_deref(), METRIC_TASKS_FAILED);
                TaskResult::failed(task_id, worker_id, reason, submitted_at)
            }
        };

        if let Err(_e) = ctx.collector.collect(result) {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {worker_id} could not deliver result: {_e}");
        }

        ctx.monitor.record_executed(worker_id);
        ctx.monitor.set_state(worker_id, WorkerState::Idle);
    }

    ctx.monitor.set_state(worker_id, WorkerState::Stopped);

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}

fn bump(metrics: Option<&dyn CounterStore>, key: &str) {
    let Some(store) = metrics else { return };
    if let Err(_e) = store.increment(key) {
        #[cfg(feature = "tracing")]
        tracing::warn!(key, "Failed to record metric: {_e}");
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_reasons() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_reason(&*payload), "task panicked: boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_reason(&*payload), "task panicked: owned");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_reason(&*payload), "task panicked");
    }
}
