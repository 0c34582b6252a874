//! Aggregation of worker output.
//!
//! Results are keyed by [`TaskId`] and arrive in completion order, which is
//! unrelated to submission order. Callers that need task order should sort
//! with [`sort_by_task_id`] or [`sort_by_submission`].
//!
//! [`sort_by_task_id`]: crate::sort_by_task_id
//! [`sort_by_submission`]: crate::sort_by_submission

use crate::{
    error::{Error, Result},
    lifecycle::Signal,
    mutex::{Mutex, lock_unpoisoned},
    task::{TaskId, TaskResult},
};
use core::fmt;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::Notify;

/// A cloneable handle to a shared result set.
pub struct ResultCollector<O> {
    inner: Arc<Inner<O>>,
}

struct Inner<O> {
    store: Mutex<Store<O>>,
    arrived: Notify,
}

struct Store<O> {
    pending: HashMap<TaskId, TaskResult<O>>,
    seen: HashSet<TaskId>,
}

impl<O> Clone for ResultCollector<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O> Default for ResultCollector<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> ResultCollector<O> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(Store {
                    pending: HashMap::new(),
                    seen: HashSet::new(),
                }),
                arrived: Notify::new(),
            }),
        }
    }

    /// Records `result` and wakes any caller blocked in
    /// [`Self::await_all`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateResult`] if a result for the same task was
    /// already collected, including one already handed out by
    /// [`Self::await_all`]. The duplicate is discarded.
    pub fn collect(&self, result: TaskResult<O>) -> Result<()> {
        let task_id = result.task_id;
        {
            let mut store = lock_unpoisoned!(self.inner.store);
            if !store.seen.insert(task_id) {
                #[cfg(feature = "tracing")]
                tracing::warn!(%task_id, "Discarding duplicate result");
                return Err(Error::DuplicateResult { task_id });
            }
            store.pending.insert(task_id, result);
        }
        self.inner.arrived.notify_waiters();
        Ok(())
    }

    /// Results collected and not yet handed out.
    pub fn len(&self) -> usize {
        lock_unpoisoned!(self.inner.store).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self) -> Vec<TaskResult<O>> {
        lock_unpoisoned!(self.inner.store)
            .pending
            .drain()
            .map(|(_, result)| result)
            .collect()
    }

    /// Waits until at least `expected` results are held, then hands all of
    /// them to the caller.
    ///
    /// # Errors
    ///
    /// If `signal` fires first, returns a [`Partial`] that owns every result
    /// that did arrive together with the signal's cause.
    pub async fn await_all(
        &self,
        expected: usize,
        signal: &Signal,
    ) -> Result<Vec<TaskResult<O>>, Partial<O>> {
        loop {
            let arrived = self.inner.arrived.notified();
            tokio::pin!(arrived);
            // Register interest before checking the count so a result landing
            // in between still wakes us.
            arrived.as_mut().enable();

            if self.len() >= expected {
                return Ok(self.take());
            }

            tokio::select! {
                biased;
                cause = signal.fired() => {
                    let results = self.take();
                    #[cfg(feature = "tracing")]
                    tracing::debug!(collected = results.len(), expected, %cause, "Returning partial results");
                    return Err(Partial { results, expected, cause });
                }
                () = &mut arrived => {}
            }
        }
    }
}

/// The results that arrived before an [`ResultCollector::await_all`] was
/// interrupted.
pub struct Partial<O> {
    pub results: Vec<TaskResult<O>>,
    pub expected: usize,
    /// [`Error::Cancelled`] or [`Error::Timeout`].
    pub cause: Error,
}

impl<O> Partial<O> {
    pub fn collected(&self) -> usize {
        self.results.len()
    }
}

impl<O> fmt::Debug for Partial<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partial")
            .field("collected", &self.results.len())
            .field("expected", &self.expected)
            .field("cause", &self.cause)
            .finish()
    }
}

impl<O> fmt::Display for Partial<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "collected {} of {} results before: {}",
            self.results.len(),
            self.expected,
            self.cause
        )
    }
}

impl<O> core::error::Error for Partial<O> {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.cause)
    }
}

impl<O> From<Partial<O>> for Error {
    fn from(partial: Partial<O>) -> Self {
        Self::Partial {
            collected: partial.results.len(),
            expected: partial.expected,
        }
    }
}
