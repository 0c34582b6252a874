use crate::{
    AtomicCounterStore, Cause, CounterStore, Error, LifecycleCoordinator, METRIC_KEYS,
    METRIC_PERMITS_GRANTED, METRIC_TASKS_COMPLETED, METRIC_TASKS_FAILED, RateLimiter,
    ResultCollector, RunReport, Task, TaskQueue, TaskResult, WorkerPool, WorkerState,
    sort_by_task_id,
};
use core::time::Duration;
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};

/// Submits tasks `1..=count` with payload equal to the id, then closes the
/// queue.
fn spawn_producer(queue: &TaskQueue<u64>, count: u64) -> JoinHandle<()> {
    let queue = queue.clone();
    tokio::spawn(async move {
        for id in 1..=count {
            queue.submit(Task::new(id, id)).await.unwrap();
        }
        queue.close().unwrap();
    })
}

/// Runs `pool` to completion on a background task.
fn spawn_run<F>(
    pool: WorkerPool<F>,
    queue: &TaskQueue<u64>,
    collector: &ResultCollector<u64>,
    lifecycle: &LifecycleCoordinator,
) -> JoinHandle<Result<RunReport, Error>>
where
    F: crate::TaskFn<u64, Output = u64>,
{
    let queue = queue.clone();
    let collector = collector.clone();
    let lifecycle = lifecycle.clone();
    tokio::spawn(async move { pool.run(&queue, &collector, &lifecycle).await })
}

async fn double(task: Task<u64>) -> Result<u64, String> {
    tokio::task::yield_now().await;
    Ok(*task.payload() * 2)
}

/// Every third task fails.
async fn double_or_fail(task: Task<u64>) -> Result<u64, String> {
    let n = *task.payload();
    if n % 3 == 0 {
        return Err(format!("{n} is divisible by three"));
    }
    Ok(n * 2)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_queue_many_tasks_all_results_arrive() {
    let queue = TaskQueue::new(2).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let pool = WorkerPool::new(3, double).unwrap();

    let producer = spawn_producer(&queue, 5);
    let report = pool.run(&queue, &collector, &lifecycle).await.unwrap();
    producer.await.unwrap();

    assert_eq!(report.submitted, 5);
    assert_eq!(report.completed, 5);
    assert!(report.is_drained());

    let mut results = collector.await_all(5, lifecycle.signal()).await.unwrap();
    sort_by_task_id(&mut results);
    let outputs: Vec<_> = results
        .into_iter()
        .map(|r| r.into_output().unwrap())
        .collect();
    assert_eq!(outputs, [2, 4, 6, 8, 10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_accounts_for_every_task() {
    for tasks in [0, 1, 7, 50] {
        for workers in [1, 3, 8] {
            let queue = TaskQueue::new(4).unwrap();
            let collector = ResultCollector::new();
            let lifecycle = LifecycleCoordinator::new();
            let pool = WorkerPool::new(workers, double_or_fail).unwrap();
            let monitor = pool.monitor();

            let producer = spawn_producer(&queue, tasks);
            let report = pool.run(&queue, &collector, &lifecycle).await.unwrap();
            producer.await.unwrap();

            assert_eq!(
                report.completed + report.failed,
                tasks,
                "{tasks} tasks on {workers} workers"
            );
            assert_eq!(report.failed, tasks / 3);
            assert_eq!(report.abandoned, 0);
            assert_eq!(report.cause, None);
            assert_eq!(collector.len() as u64, tasks);
            assert!(monitor.all_stopped());
            let executed: u64 = (0..workers).filter_map(|id| monitor.executed(id)).sum();
            assert_eq!(executed, tasks);
        }
    }
}

#[tokio::test]
async fn failing_and_panicking_tasks_do_not_stop_the_worker() {
    let queue = TaskQueue::new(8).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let pool = WorkerPool::new(1, |task: Task<u64>| async move {
        match *task.payload() {
            4 => panic!("task four exploded"),
            n if n % 2 == 1 => Err(format!("odd payload {n}")),
            n => Ok(n),
        }
    })
    .unwrap();
    let monitor = pool.monitor();

    let producer = spawn_producer(&queue, 6);
    let report = pool.run(&queue, &collector, &lifecycle).await.unwrap();
    producer.await.unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 4);
    assert_eq!(monitor.executed(0), Some(6));

    let mut results = collector.await_all(6, lifecycle.signal()).await.unwrap();
    sort_by_task_id(&mut results);
    assert!(results[1].is_ok());
    assert!(matches!(
        &results[3].outcome,
        Err(Error::TaskFailed { reason, .. }) if reason.contains("task four exploded")
    ));
    assert!(matches!(
        &results[4].outcome,
        Err(Error::TaskFailed { reason, .. }) if reason == "odd payload 5"
    ));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_idle_workers_promptly() {
    let queue = TaskQueue::new(4).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let pool = WorkerPool::new(4, double).unwrap();
    let monitor = pool.monitor();

    let run = spawn_run(pool, &queue, &collector, &lifecycle);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(monitor.states(), [WorkerState::Idle; 4]);

    let cancelled_at = Instant::now();
    let report = lifecycle.shutdown(false).await;
    assert!(cancelled_at.elapsed() < Duration::from_millis(1));
    assert_eq!(report.cause, Some(Cause::Cancelled));
    assert_eq!(run.await.unwrap().unwrap(), report);
    assert!(monitor.all_stopped());
    assert!(!queue.is_closed());
}

#[tokio::test(start_paused = true)]
async fn cancellation_lets_the_running_task_finish() {
    const TASK_TIME: Duration = Duration::from_millis(100);

    let queue = TaskQueue::new(4).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let pool = WorkerPool::new(1, |task: Task<u64>| async move {
        sleep(TASK_TIME).await;
        Ok::<_, String>(*task.payload())
    })
    .unwrap();
    let monitor = pool.monitor();

    for id in 1..=3 {
        queue.submit(Task::new(id, id)).await.unwrap();
    }
    let run = spawn_run(pool, &queue, &collector, &lifecycle);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(monitor.state(0), Some(WorkerState::Running));

    let start = Instant::now();
    let report = lifecycle.shutdown(false).await;
    assert!(start.elapsed() >= TASK_TIME - Duration::from_millis(10));
    run.await.unwrap().unwrap();

    assert_eq!(report.submitted, 3);
    assert_eq!(report.completed, 1);
    assert_eq!(report.abandoned, 2);
    assert!(!report.is_drained());
    assert_eq!(queue.len(), 2);

    let partial = collector
        .await_all(3, lifecycle.signal())
        .await
        .expect_err("two tasks never ran");
    assert_eq!(partial.cause, Error::Cancelled);
    assert_eq!(partial.collected(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_deadline_cuts_the_run_short() {
    let queue = TaskQueue::new(5).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let pool = WorkerPool::new(1, |task: Task<u64>| async move {
        sleep(Duration::from_millis(30)).await;
        Ok::<_, String>(*task.payload())
    })
    .unwrap();

    for id in 1..=5 {
        queue.submit(Task::new(id, id)).await.unwrap();
    }
    queue.close().unwrap();
    lifecycle.arm_deadline(Duration::from_millis(50));

    let report = pool.run(&queue, &collector, &lifecycle).await.unwrap();
    assert_eq!(report.cause, Some(Cause::Timeout));
    assert_eq!(report.completed, 2);
    assert_eq!(report.abandoned, 3);
}

#[tokio::test(start_paused = true)]
async fn bounded_graceful_shutdown_escalates() {
    let queue = TaskQueue::new(3).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let pool = WorkerPool::new(1, |task: Task<u64>| async move {
        sleep(Duration::from_secs(1)).await;
        Ok::<_, String>(*task.payload())
    })
    .unwrap();

    for id in 1..=3 {
        queue.submit(Task::new(id, id)).await.unwrap();
    }
    let run = spawn_run(pool, &queue, &collector, &lifecycle);
    sleep(Duration::from_millis(1)).await;

    let report = lifecycle.shutdown_within(Duration::from_millis(100)).await;
    assert!(queue.is_closed());
    assert_eq!(report.cause, Some(Cause::Cancelled));
    assert_eq!(report.completed, 1);
    assert_eq!(report.abandoned, 2);
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_from_outside_drains_the_queue() {
    let queue = TaskQueue::new(8).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let pool = WorkerPool::new(2, |task: Task<u64>| async move {
        sleep(Duration::from_millis(20)).await;
        Ok::<_, String>(*task.payload())
    })
    .unwrap();

    for id in 1..=6 {
        queue.submit(Task::new(id, id)).await.unwrap();
    }
    let run = spawn_run(pool, &queue, &collector, &lifecycle);
    sleep(Duration::from_millis(1)).await;

    let report = lifecycle.shutdown(true).await;
    assert_eq!(report.completed, 6);
    assert!(report.is_drained());
    assert_eq!(queue.submit(Task::new(7, 7)).await, Err(Error::QueueClosed));
    assert_eq!(run.await.unwrap().unwrap(), report);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_pool_spaces_task_starts() {
    const INTERVAL: Duration = Duration::from_millis(10);

    let queue = TaskQueue::new(8).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let limiter = RateLimiter::steady(INTERVAL).unwrap();
    let metrics = Arc::new(AtomicCounterStore::new(METRIC_KEYS));
    let pool = WorkerPool::new(4, double)
        .unwrap()
        .with_rate_limiter(limiter.clone())
        .with_metrics(metrics.clone());

    let start = Instant::now();
    let producer = spawn_producer(&queue, 5);
    pool.run(&queue, &collector, &lifecycle).await.unwrap();
    producer.await.unwrap();

    let mut results = collector.await_all(5, lifecycle.signal()).await.unwrap();
    sort_by_task_id(&mut results);
    // Steady mode starts empty: the first permit lands one interval in.
    assert!(results[0].completed_at - start >= INTERVAL);
    assert!(start.elapsed() >= INTERVAL * 5);
    assert!(metrics.get(METRIC_PERMITS_GRANTED).unwrap() >= 5);
    assert_eq!(metrics.get(METRIC_PERMITS_GRANTED).unwrap(), limiter.granted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metrics_land_in_the_counter_store() {
    let queue = TaskQueue::new(4).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let metrics: Arc<dyn CounterStore> = Arc::new(crate::LockCounterStore::new());
    let pool = WorkerPool::new(3, double_or_fail)
        .unwrap()
        .with_metrics(Arc::clone(&metrics));

    let producer = spawn_producer(&queue, 10);
    let report = pool.run(&queue, &collector, &lifecycle).await.unwrap();
    producer.await.unwrap();

    assert_eq!(metrics.get(METRIC_TASKS_COMPLETED).unwrap(), report.completed);
    assert_eq!(metrics.get(METRIC_TASKS_FAILED).unwrap(), report.failed);
    assert_eq!(report.failed, 3);
    assert_eq!(metrics.get(METRIC_PERMITS_GRANTED).unwrap(), 0);
}

#[tokio::test]
async fn a_coordinator_cannot_drive_two_runs() {
    let lifecycle = LifecycleCoordinator::new();
    let collector = ResultCollector::new();

    let first = TaskQueue::new(1).unwrap();
    first.close().unwrap();
    let report = WorkerPool::new(2, double)
        .unwrap()
        .run(&first, &collector, &lifecycle)
        .await
        .unwrap();
    assert_eq!(report, RunReport::default());

    let second = TaskQueue::new(1).unwrap();
    let res = WorkerPool::new(2, double)
        .unwrap()
        .run(&second, &collector, &lifecycle)
        .await;
    assert_eq!(res, Err(Error::RunAlreadyStarted));

    // Nor the same queue twice.
    let res = WorkerPool::new(2, double)
        .unwrap()
        .run(&first, &collector, &lifecycle)
        .await;
    assert_eq!(res, Err(Error::RunAlreadyStarted));
}

#[tokio::test]
async fn results_carry_worker_and_timing() {
    let queue = TaskQueue::new(2).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();

    let producer = spawn_producer(&queue, 2);
    WorkerPool::new(2, double)
        .unwrap()
        .run(&queue, &collector, &lifecycle)
        .await
        .unwrap();
    producer.await.unwrap();

    let results: Vec<TaskResult<u64>> = collector.await_all(2, lifecycle.signal()).await.unwrap();
    for result in results {
        assert!(result.worker_id < 2);
        assert!(result.completed_at >= result.submitted_at);
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_unblocks_a_producer_using_plain_submit() {
    let queue = TaskQueue::new(1).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let pool = WorkerPool::new(1, |task: Task<u64>| async move {
        sleep(Duration::from_secs(1)).await;
        Ok::<_, String>(*task.payload())
    })
    .unwrap();

    let producer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            for id in 1..=10 {
                queue.submit(Task::new(id, id)).await?;
            }
            queue.close()
        })
    };
    let run = spawn_run(pool, &queue, &collector, &lifecycle);
    sleep(Duration::from_millis(10)).await;

    let report = lifecycle.shutdown(false).await;
    let produced = timeout(Duration::from_secs(60), producer)
        .await
        .expect("producer stays blocked after cancellation")
        .unwrap();
    assert_eq!(produced, Err(Error::Cancelled));
    assert_eq!(report.cause, Some(Cause::Cancelled));
    assert_eq!(report.completed, 1);
    assert_eq!(run.await.unwrap().unwrap().submitted, report.submitted);
}

#[tokio::test]
async fn repeated_task_id_cannot_lose_a_result() {
    let queue = TaskQueue::new(4).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();

    queue.submit(Task::new(1, 1)).await.unwrap();
    assert!(matches!(
        queue.submit(Task::new(1, 2)).await,
        Err(Error::DuplicateTask { .. })
    ));
    queue.close().unwrap();

    let report = WorkerPool::new(1, double)
        .unwrap()
        .run(&queue, &collector, &lifecycle)
        .await
        .unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(report.completed + report.failed, collector.len() as u64);
    assert!(report.is_drained());
}

#[tokio::test(start_paused = true)]
async fn idle_rate_limited_workers_start_together_when_work_arrives() {
    const INTERVAL: Duration = Duration::from_millis(10);

    let queue = TaskQueue::new(4).unwrap();
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let limiter = RateLimiter::steady(INTERVAL).unwrap();
    let pool = WorkerPool::new(3, double)
        .unwrap()
        .with_rate_limiter(limiter.clone());

    let start = Instant::now();
    let run = spawn_run(pool, &queue, &collector, &lifecycle);
    // Each idle worker holds a permit by now.
    sleep(INTERVAL * 10).await;
    assert_eq!(limiter.granted(), 3);

    let arrived = Instant::now();
    for id in 1..=3 {
        queue.submit(Task::new(id, id)).await.unwrap();
    }
    queue.close().unwrap();
    run.await.unwrap().unwrap();

    let results = collector.await_all(3, lifecycle.signal()).await.unwrap();
    assert!(results.iter().all(|r| r.completed_at - arrived < INTERVAL));
    // Issuance stays within one permit per interval.
    let slots = (start.elapsed().as_nanos() / INTERVAL.as_nanos()) as u64;
    assert!(limiter.granted() <= slots);
}

