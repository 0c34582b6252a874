use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use drover::RateMode;

/// Runtime configuration for the `drover-demo` binary.
///
/// Every value can be given as a CLI flag or an environment variable (a `.env`
/// file in the working directory is loaded first). The defaults run a short,
/// unthrottled batch on one worker per core.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "drover-demo",
    version,
    about = "Pushes a batch of tasks through a bounded, rate-limited worker pool"
)]
pub struct CliArgs {
    /// Number of workers draining the queue.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = num_cpus::get())]
    pub num_workers: usize,

    /// Maximum number of pending tasks before the producer blocks.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 16)]
    pub queue_capacity: usize,

    /// Number of tasks the producer submits before closing the queue.
    ///
    /// Environment variable: `NUM_TASKS`
    #[arg(long, env = "NUM_TASKS", default_value_t = 100)]
    pub num_tasks: u64,

    /// How task starts are throttled.
    ///
    /// Environment variable: `RATE_MODE`
    #[arg(long, env = "RATE_MODE", value_enum, default_value_t = RateKind::None)]
    pub rate_mode: RateKind,

    /// Refill interval of the rate limiter, in milliseconds.
    ///
    /// Environment variable: `RATE_INTERVAL_MS`
    #[arg(long, env = "RATE_INTERVAL_MS", default_value_t = 10)]
    pub rate_interval_ms: u64,

    /// Reservoir size in burst mode. Ignored otherwise.
    ///
    /// Environment variable: `BURST_CAPACITY`
    #[arg(long, env = "BURST_CAPACITY", default_value_t = 3)]
    pub burst_capacity: usize,

    /// Every task whose id is a multiple of this value fails. `0` disables
    /// failures.
    ///
    /// Environment variable: `FAIL_EVERY`
    #[arg(long, env = "FAIL_EVERY", default_value_t = 0)]
    pub fail_every: u64,

    /// Simulated work per task, in milliseconds.
    ///
    /// Environment variable: `WORK_MS`
    #[arg(long, env = "WORK_MS", default_value_t = 5)]
    pub work_ms: u64,

    /// Cancels the whole run after this many milliseconds. `0` means no
    /// deadline.
    ///
    /// Environment variable: `DEADLINE_MS`
    #[arg(long, env = "DEADLINE_MS", default_value_t = 0)]
    pub deadline_ms: u64,

    /// On Ctrl+C or SIGTERM, drain the queue for at most this many
    /// milliseconds before cancelling. `0` cancels immediately.
    ///
    /// Environment variable: `GRACE_MS`
    #[arg(long, env = "GRACE_MS", default_value_t = 0)]
    pub grace_ms: u64,

    /// Counter store receiving the pool's metrics.
    ///
    /// Environment variable: `COUNTER_STORE`
    #[arg(long, env = "COUNTER_STORE", value_enum, default_value_t = CounterKind::Atomic)]
    pub counter_store: CounterKind,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateKind {
    None,
    Steady,
    Burst,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Lock,
    Atomic,
}

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub num_workers: usize,
    pub queue_capacity: usize,
    pub num_tasks: u64,
    pub rate: Option<RateMode>,
    pub fail_every: Option<u64>,
    pub work: Duration,
    pub deadline: Option<Duration>,
    pub grace: Duration,
    pub counter_store: CounterKind,
}

impl TryFrom<CliArgs> for DemoConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }

        let interval = Duration::from_millis(args.rate_interval_ms);
        let rate = match args.rate_mode {
            RateKind::None => None,
            RateKind::Steady | RateKind::Burst if interval.is_zero() => {
                bail!("RATE_INTERVAL_MS must be greater than 0 when a rate mode is set");
            }
            RateKind::Steady => Some(RateMode::Steady { interval }),
            RateKind::Burst => {
                if args.burst_capacity == 0 {
                    bail!("BURST_CAPACITY must be greater than 0 in burst mode");
                }
                Some(RateMode::Burst {
                    interval,
                    capacity: args.burst_capacity,
                })
            }
        };

        Ok(Self {
            num_workers: args.num_workers,
            queue_capacity: args.queue_capacity,
            num_tasks: args.num_tasks,
            rate,
            fail_every: (args.fail_every > 0).then_some(args.fail_every),
            work: Duration::from_millis(args.work_ms),
            deadline: (args.deadline_ms > 0).then(|| Duration::from_millis(args.deadline_ms)),
            grace: Duration::from_millis(args.grace_ms),
            counter_store: args.counter_store,
        })
    }
}
