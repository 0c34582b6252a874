//! Steady and burst-tolerant rate limiting.
//!
//! Both modes share one mechanism: a bounded reservoir of permits (an
//! [`mpsc`] channel of unit values) fed by a refill routine that ticks once per
//! interval. Steady mode uses a reservoir of one slot that starts empty, the
//! same shape as a ticker channel. Burst mode starts with the reservoir full.
//!
//! A refill that finds the reservoir full is discarded. The refill routine
//! never blocks and the reservoir never grows, so after an idle period at
//! most `capacity` permits are immediately available.
//!
//! Waiters are queued on a fair async mutex in front of the reservoir, so
//! permits are granted in request order. Only [`RateLimiter::try_acquire`]
//! bypasses that queue, and it succeeds only while nobody is waiting.

use crate::{
    error::{Error, Result},
    lifecycle::Signal,
};
use core::time::Duration;
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, mpsc::error::TrySendError},
    task::AbortHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};

/// How a [`RateLimiter`] admits requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateMode {
    /// One permit per `interval`. Requests block until the next tick.
    Steady { interval: Duration },
    /// A reservoir of `capacity` permits, full at construction and refilled
    /// one permit per `interval`.
    Burst { interval: Duration, capacity: usize },
}

impl RateMode {
    pub const fn interval(&self) -> Duration {
        match *self {
            Self::Steady { interval } | Self::Burst { interval, .. } => interval,
        }
    }

    /// Permits that can be held at once. In any window of length `W` at most
    /// `ceil(W / interval) + reservoir_capacity` permits are issued.
    pub const fn reservoir_capacity(&self) -> usize {
        match *self {
            Self::Steady { .. } => 1,
            Self::Burst { capacity, .. } => capacity,
        }
    }
}

/// A grant to start one task. Holds no resources.
#[must_use = "a permit authorizes exactly one task start"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Permit {
    granted_at: Instant,
}

impl Permit {
    pub const fn granted_at(&self) -> Instant {
        self.granted_at
    }
}

/// A cloneable handle to a shared rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    mode: RateMode,
    reservoir: AsyncMutex<mpsc::Receiver<()>>,
    granted: AtomicU64,
    discarded: Arc<AtomicU64>,
    refill: AbortHandle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.refill.abort();
    }
}

impl RateLimiter {
    /// Creates a limiter and starts its refill routine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero interval or a zero burst
    /// capacity.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(mode: RateMode) -> Result<Self> {
        let interval = mode.interval();
        if interval.is_zero() {
            return Err(Error::invalid("rate limiter interval must be non-zero"));
        }
        let capacity = mode.reservoir_capacity();
        if capacity == 0 {
            return Err(Error::invalid("burst capacity must be greater than 0"));
        }

        let (tx, rx) = mpsc::channel(capacity);
        if let RateMode::Burst { .. } = mode {
            for _ in 0..capacity {
                // Cannot fail: the channel was just created with this
                // capacity.
                let _ = tx.try_send(());
            }
        }

        let discarded = Arc::new(AtomicU64::new(0));
        let refill = tokio::spawn(refill(tx, interval, Arc::clone(&discarded))).abort_handle();

        #[cfg(feature = "tracing")]
        tracing::debug!(?mode, "Rate limiter started");

        Ok(Self {
            inner: Arc::new(Inner {
                mode,
                reservoir: AsyncMutex::new(rx),
                granted: AtomicU64::new(0),
                discarded,
                refill,
            }),
        })
    }

    /// Shorthand for [`RateMode::Steady`].
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn steady(interval: Duration) -> Result<Self> {
        Self::new(RateMode::Steady { interval })
    }

    /// Shorthand for [`RateMode::Burst`].
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn burst(interval: Duration, capacity: usize) -> Result<Self> {
        Self::new(RateMode::Burst { interval, capacity })
    }

    pub fn mode(&self) -> RateMode {
        self.inner.mode
    }

    /// Permits issued so far.
    pub fn granted(&self) -> u64 {
        self.inner.granted.load(Ordering::Relaxed)
    }

    /// Refill ticks dropped because the reservoir was already full.
    pub fn discarded_refills(&self) -> u64 {
        self.inner.discarded.load(Ordering::Relaxed)
    }

    fn grant(&self) -> Permit {
        self.inner.granted.fetch_add(1, Ordering::Relaxed);
        Permit {
            granted_at: Instant::now(),
        }
    }

    /// Waits for a permit.
    ///
    /// # Errors
    ///
    /// Returns the signal's error ([`Error::Cancelled`] or
    /// [`Error::Timeout`]) if `signal` fires first.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub async fn acquire(&self, signal: &Signal) -> Result<Permit> {
        if let Some(err) = signal.error() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = signal.fired() => Err(err),
            permit = self.wait_permit() => permit,
        }
    }

    async fn wait_permit(&self) -> Result<Permit> {
        let mut reservoir = self.inner.reservoir.lock().await;
        match reservoir.recv().await {
            Some(()) => Ok(self.grant()),
            // The refill routine is gone, nothing will ever be granted again.
            None => Err(Error::Cancelled),
        }
    }

    /// Takes a permit only if one is ready and no earlier request is waiting.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut reservoir = self.inner.reservoir.try_lock().ok()?;
        reservoir.try_recv().ok().map(|()| self.grant())
    }
}

async fn refill(tx: mpsc::Sender<()>, every: Duration, discarded: Arc<AtomicU64>) {
    // The first refill lands one interval after construction: a pre-filled
    // reservoir is not topped up immediately.
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {
                discarded.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::trace!("Reservoir full, refill discarded");
            }
            Err(TrySendError::Closed(())) => break,
        }
    }
}
