use crate::{
    error::Error,
    mutex::{Mutex, lock_unpoisoned},
};
use core::time::Duration;
use std::sync::{Arc, OnceLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Why a [`Signal`] fired. The first cause recorded wins and is never
/// overwritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Cause {
    /// Explicit cancellation, e.g. a non-graceful shutdown.
    Cancelled,
    /// A deadline elapsed.
    Timeout,
}

impl From<Cause> for Error {
    fn from(cause: Cause) -> Self {
        match cause {
            Cause::Cancelled => Self::Cancelled,
            Cause::Timeout => Self::Timeout,
        }
    }
}

/// A one-shot, broadcast cancellation signal.
///
/// Cloning yields another handle to the same signal. Once fired a signal
/// stays fired, and the cause recorded by the first [`Signal::fire`] is the
/// one every observer sees.
#[derive(Clone, Debug, Default)]
pub struct Signal {
    token: CancellationToken,
    cause: Arc<OnceLock<Cause>>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Returns `false` if it had already fired, in which
    /// case `cause` is ignored.
    pub fn fire(&self, cause: Cause) -> bool {
        // The cause is published before the token so that anyone woken by the
        // token reads it.
        let first = self.cause.set(cause).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<Cause> {
        self.cause.get().copied()
    }

    /// The error a suspended operation should unwind with, if fired.
    pub fn error(&self) -> Option<Error> {
        if self.is_fired() {
            self.cause().map(Error::from)
        } else {
            None
        }
    }

    /// Completes once the signal fires, yielding the error to report.
    pub async fn fired(&self) -> Error {
        self.token.cancelled().await;
        self.cause().map_or(Error::Cancelled, Error::from)
    }

    /// Returns an independent signal that also fires, with `Timeout`, after
    /// `after`, and follows this signal's cause if this one fires first.
    ///
    /// Must be called from within a tokio runtime: the timer runs as a
    /// spawned task that exits as soon as the child fires or is stopped and
    /// its parent has fired.
    pub fn with_timeout(&self, after: Duration) -> Deadline {
        let child = Signal::new();
        let armed = Arc::new(Mutex::new(true));
        let stop = CancellationToken::new();

        tokio::spawn(run_deadline(
            self.clone(),
            child.clone(),
            Arc::clone(&armed),
            stop.clone(),
            after,
        ));

        Deadline {
            signal: child,
            armed,
            stop,
        }
    }
}

async fn run_deadline(
    parent: Signal,
    child: Signal,
    armed: Arc<Mutex<bool>>,
    stop: CancellationToken,
    after: Duration,
) {
    let timer = sleep(after);
    tokio::pin!(timer);
    let mut timer_live = true;

    loop {
        tokio::select! {
            () = &mut timer, if timer_live => {
                let mut armed = lock_unpoisoned!(armed);
                if *armed {
                    *armed = false;
                    child.fire(Cause::Timeout);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(?after, "Deadline elapsed");
                    return;
                }
                timer_live = false;
            }
            () = stop.cancelled(), if timer_live => {
                timer_live = false;
            }
            _ = parent.fired() => {
                // First signal wins; a parent that fired after a stopped
                // timer still propagates.
                child.fire(parent.cause().unwrap_or(Cause::Cancelled));
                return;
            }
            () = child.token.cancelled() => return,
        }
    }
}

/// Handle returned by [`Signal::with_timeout`] and
/// [`LifecycleCoordinator::timeout`].
///
/// [`LifecycleCoordinator::timeout`]: crate::LifecycleCoordinator::timeout
#[derive(Debug)]
pub struct Deadline {
    signal: Signal,
    armed: Arc<Mutex<bool>>,
    stop: CancellationToken,
}

impl Deadline {
    /// The signal that fires when the deadline elapses or its parent fires.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Disarms the timer. Returns `true` if the call stopped the timer before
    /// it fired, `false` if it had already fired or been stopped.
    ///
    /// The signal keeps following its parent after the timer is stopped.
    pub fn stop(&self) -> bool {
        let mut armed = lock_unpoisoned!(self.armed);
        let was_armed = *armed && !self.signal.is_fired();
        *armed = false;
        drop(armed);
        self.stop.cancel();
        was_armed
    }
}
