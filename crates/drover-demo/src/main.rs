#![doc = include_str!("../README.md")]

mod config;
mod telemetry;

use clap::Parser;
use config::{CliArgs, CounterKind, DemoConfig};
use drover::{
    AtomicCounterStore, CounterStore, LifecycleCoordinator, LockCounterStore, METRIC_KEYS,
    RateLimiter, ResultCollector, Task, TaskQueue, WorkerPool, sort_by_task_id,
};
use std::sync::Arc;
use telemetry::init_telemetry;
use tokio::{signal, time::sleep};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = DemoConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let queue = TaskQueue::new(config.queue_capacity)?;
    let collector = ResultCollector::new();
    let lifecycle = LifecycleCoordinator::new();
    let metrics: Arc<dyn CounterStore> = match config.counter_store {
        CounterKind::Lock => Arc::new(LockCounterStore::with_keys(METRIC_KEYS)),
        CounterKind::Atomic => Arc::new(AtomicCounterStore::new(METRIC_KEYS)),
    };

    let work = config.work;
    let fail_every = config.fail_every;
    let mut pool = WorkerPool::new(config.num_workers, move |task: Task<u64>| async move {
        sleep(work).await;
        let n = *task.payload();
        match fail_every {
            Some(every) if n % every == 0 => Err(format!("{n} is a multiple of {every}")),
            _ => Ok(n * 2),
        }
    })?
    .with_metrics(Arc::clone(&metrics));
    if let Some(mode) = config.rate {
        pool = pool.with_rate_limiter(RateLimiter::new(mode)?);
    }

    if let Some(deadline) = config.deadline {
        lifecycle.arm_deadline(deadline);
    }

    let producer = tokio::spawn(produce(queue.clone(), lifecycle.clone(), config.num_tasks));
    let on_signal = tokio::spawn(shutdown_signal(lifecycle.clone(), config.grace));

    let report = pool.run(&queue, &collector, &lifecycle).await?;
    on_signal.abort();
    producer.await?;

    // Everything collected so far; a zero target never waits.
    let mut results = collector
        .await_all(0, lifecycle.signal())
        .await
        .map_err(drover::Error::from)?;
    sort_by_task_id(&mut results);
    let failures: Vec<_> = results
        .iter()
        .filter_map(|r| r.outcome.as_ref().err().map(ToString::to_string))
        .collect();

    let summary = serde_json::json!({
        "report": report,
        "counters": metrics.snapshot()?,
        "results": results.len(),
        "failures": failures,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

/// Submits tasks `1..=count`, then closes the queue. Stops early if the run is
/// cancelled or the queue is closed under it.
async fn produce(queue: TaskQueue<u64>, lifecycle: LifecycleCoordinator, count: u64) {
    for n in 1..=count {
        if let Err(_e) = queue.submit_with(Task::new(n, n), lifecycle.signal()).await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Producer stopped after {} tasks: {}", n - 1, _e);
            break;
        }
    }

    // Closed by a graceful shutdown already is fine.
    let _ = queue.close();

    #[cfg(feature = "tracing")]
    tracing::info!("Producer finished");
}

fn log_startup_info(_config: &DemoConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting worker pool with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting worker pool with {} workers and {} tasks",
            _config.num_workers,
            _config.num_tasks
        );
    }
}

async fn shutdown_signal(lifecycle: LifecycleCoordinator, grace: core::time::Duration) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    if grace.is_zero() {
        lifecycle.shutdown(false).await;
    } else {
        lifecycle.shutdown_within(grace).await;
    }
}
