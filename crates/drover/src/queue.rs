//! Bounded FIFO task queue with backpressure.
//!
//! The queue is a bounded [`mpsc`] channel whose single receiver is shared by
//! every worker behind a fair async mutex. Producers that find the channel
//! full are suspended until a worker makes room; nothing is ever dropped and
//! the buffer never grows past the capacity fixed at construction.
//!
//! Closing drops the queue's sender. Once every in-flight `submit` has
//! finished and the buffer is drained, [`TaskQueue::next`] yields `None`,
//! which is the one and only termination signal workers rely on.
//!
//! Once attached to a [`LifecycleCoordinator`], the queue follows that run's
//! [`Signal`]: a producer suspended in [`TaskQueue::submit`] unwinds with the
//! run's error when it fires, even if it started waiting before the attach.
//!
//! [`LifecycleCoordinator`]: crate::LifecycleCoordinator

use crate::{
    error::{Error, Result},
    lifecycle::{RunState, Signal},
    mutex::{Mutex, lock_unpoisoned},
    task::{Task, TaskId},
};
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};
use std::{
    collections::HashSet,
    sync::{Arc, OnceLock},
};
use tokio::sync::{
    Mutex as AsyncMutex, Notify,
    mpsc::{self, OwnedPermit, error::TrySendError},
};

/// A cloneable handle to a bounded, closeable queue of [`Task`]s.
pub struct TaskQueue<P> {
    inner: Arc<Inner<P>>,
}

struct Inner<P> {
    tx: Mutex<Option<mpsc::Sender<Task<P>>>>,
    rx: AsyncMutex<mpsc::Receiver<Task<P>>>,
    capacity: usize,
    /// Buffered tasks, incremented before a task becomes claimable.
    pending: AtomicUsize,
    sequence: AtomicU64,
    /// Every id ever admitted. A second task with the same id is refused.
    admitted: Mutex<HashSet<TaskId>>,
    state: Arc<RunState>,
    signal: OnceLock<Signal>,
    bound: Notify,
}

impl<P> Clone for TaskQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> TaskQueue<P> {
    /// Creates an open queue holding at most `capacity` pending tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid("queue capacity must be greater than 0"));
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                rx: AsyncMutex::new(rx),
                capacity,
                pending: AtomicUsize::new(0),
                sequence: AtomicU64::new(1),
                admitted: Mutex::new(HashSet::new()),
                state: Arc::new(RunState::new()),
                signal: OnceLock::new(),
                bound: Notify::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Counters of the run this queue feeds.
    pub fn state(&self) -> &Arc<RunState> {
        &self.inner.state
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned!(self.inner.tx).is_none()
    }

    /// Number of tasks buffered and not yet claimed. Closing does not reset
    /// it: a closed queue still hands out what it holds.
    pub fn len(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes blocking operations on this queue observe `signal`. Only the
    /// first binding takes effect.
    pub(crate) fn bind(&self, signal: Signal) {
        if self.inner.signal.set(signal).is_ok() {
            self.inner.bound.notify_waiters();
        }
    }

    /// Completes with the bound run's error once its signal fires. Pending
    /// forever on a queue that is never attached.
    async fn run_interrupted(&self) -> Error {
        let bound = self.inner.bound.notified();
        tokio::pin!(bound);
        // Register before checking so a bind landing in between still wakes us.
        bound.as_mut().enable();

        if self.inner.signal.get().is_none() {
            bound.await;
        }
        match self.inner.signal.get() {
            Some(signal) => signal.fired().await,
            None => core::future::pending().await,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Task<P>>> {
        if let Some(err) = self.inner.signal.get().and_then(Signal::error) {
            return Err(err);
        }
        lock_unpoisoned!(self.inner.tx)
            .as_ref()
            .cloned()
            .ok_or(Error::QueueClosed)
    }

    /// Enqueues `task`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] immediately if the queue was closed,
    /// [`Error::DuplicateTask`] if its id was already admitted, and
    /// [`Error::Cancelled`]/[`Error::Timeout`] if the run this queue is
    /// attached to fires first.
    pub async fn submit(&self, task: Task<P>) -> Result<()> {
        let permit = self.reserve(None).await?;
        self.admit(task.id())?;
        self.dispatch(permit, task);
        Ok(())
    }

    /// Like [`Self::submit`], but a producer suspended on a full queue also
    /// unwinds with the error of `signal` when it fires.
    ///
    /// # Errors
    ///
    /// See [`Self::submit`].
    pub async fn submit_with(&self, task: Task<P>, signal: &Signal) -> Result<()> {
        if let Some(err) = signal.error() {
            return Err(err);
        }
        let permit = self.reserve(Some(signal)).await?;
        self.admit(task.id())?;
        self.dispatch(permit, task);
        Ok(())
    }

    /// Wraps `payload` in a task numbered from the queue's own sequence and
    /// submits it. Numbers already taken by caller-assigned ids are skipped.
    ///
    /// # Errors
    ///
    /// See [`Self::submit`].
    pub async fn submit_payload(&self, payload: P) -> Result<TaskId> {
        let permit = self.reserve(None).await?;
        let id = {
            let mut admitted = lock_unpoisoned!(self.inner.admitted);
            loop {
                let id = TaskId::new(self.inner.sequence.fetch_add(1, Ordering::Relaxed));
                if admitted.insert(id) {
                    break id;
                }
            }
        };
        self.dispatch(permit, Task::new(id, payload));
        Ok(id)
    }

    /// Enqueues `task` only if there is room right now. On failure the task
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if the queue is at capacity,
    /// [`Error::QueueClosed`] if it was closed and [`Error::DuplicateTask`]
    /// if the id was already admitted.
    pub fn try_submit(&self, task: Task<P>) -> Result<()> {
        let permit = self.sender()?.try_reserve_owned().map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull {
                capacity: self.inner.capacity,
            },
            TrySendError::Closed(_) => Error::QueueClosed,
        })?;
        self.admit(task.id())?;
        self.dispatch(permit, task);
        Ok(())
    }

    /// Waits for a free slot. The slot is released again if the caller drops
    /// the permit.
    async fn reserve(&self, signal: Option<&Signal>) -> Result<OwnedPermit<Task<P>>> {
        let tx = self.sender()?;
        let reserved = match signal {
            Some(signal) => tokio::select! {
                biased;
                err = signal.fired() => return Err(err),
                err = self.run_interrupted() => return Err(err),
                permit = tx.reserve_owned() => permit,
            },
            None => tokio::select! {
                biased;
                err = self.run_interrupted() => return Err(err),
                permit = tx.reserve_owned() => permit,
            },
        };
        reserved.map_err(|_| Error::QueueClosed)
    }

    fn admit(&self, task_id: TaskId) -> Result<()> {
        if lock_unpoisoned!(self.inner.admitted).insert(task_id) {
            Ok(())
        } else {
            #[cfg(feature = "tracing")]
            tracing::warn!(%task_id, "Refusing task with an id already admitted");
            Err(Error::DuplicateTask { task_id })
        }
    }

    fn dispatch(&self, permit: OwnedPermit<Task<P>>, mut task: Task<P>) {
        task.stamp();
        // Counted before it becomes claimable so `completed + failed` can
        // never overtake `submitted`, and `pending` never underflows.
        self.inner.state.record_submitted();
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        permit.send(task);
    }

    /// Stops admissions. Tasks already buffered remain claimable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] if the queue was already closed.
    pub fn close(&self) -> Result<()> {
        match lock_unpoisoned!(self.inner.tx).take() {
            Some(_tx) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Task queue closed");
                Ok(())
            }
            None => Err(Error::QueueClosed),
        }
    }

    /// Claims the oldest pending task, waiting while the queue is empty and
    /// open. Returns `None` once the queue is closed and drained, or once the
    /// run it is attached to has been cancelled.
    pub async fn next(&self) -> Option<Task<P>> {
        tokio::select! {
            biased;
            _ = self.run_interrupted() => None,
            task = self.recv() => task,
        }
    }

    /// Like [`Self::next`], but unwinds when `signal` fires.
    ///
    /// # Errors
    ///
    /// Returns the signal's error if it fired before a task was claimed.
    pub async fn next_with(&self, signal: &Signal) -> Result<Option<Task<P>>> {
        tokio::select! {
            biased;
            err = signal.fired() => Err(err),
            err = self.run_interrupted() => Err(err),
            task = self.recv() => Ok(task),
        }
    }

    async fn recv(&self) -> Option<Task<P>> {
        let mut rx = self.inner.rx.lock().await;
        let task = rx.recv().await;
        if task.is_some() {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        }
        task
    }
}

/// Type-erased control surface the coordinator keeps over an attached queue.
pub(crate) trait QueueControl: Send + Sync {
    fn close(&self) -> Result<()>;
    fn state(&self) -> Arc<RunState>;
}

impl<P: Send + 'static> QueueControl for TaskQueue<P> {
    fn close(&self) -> Result<()> {
        TaskQueue::close(self)
    }

    fn state(&self) -> Arc<RunState> {
        Arc::clone(TaskQueue::state(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Cause;
    use core::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            TaskQueue::<()>::new(0),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let queue = TaskQueue::new(4).unwrap();
        for id in 1..=4 {
            queue.submit(Task::new(id, id * 10)).await.unwrap();
        }
        assert_eq!(queue.len(), 4);
        queue.close().unwrap();

        let mut seen = Vec::new();
        while let Some(task) = queue.next().await {
            seen.push((task.id().get(), task.into_payload()));
        }
        assert_eq!(seen, [(1, 10), (2, 20), (3, 30), (4, 40)]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn submit_after_close_fails_without_blocking() {
        let queue = TaskQueue::new(1).unwrap();
        queue.submit(Task::new(1, ())).await.unwrap();
        queue.close().unwrap();

        // The queue is full, so a blocking submit would hang if it did not
        // observe the closure first.
        let res = timeout(Duration::from_secs(1), queue.submit(Task::new(2, ()))).await;
        assert_eq!(res, Ok(Err(Error::QueueClosed)));
        assert_eq!(queue.submit_payload(()).await, Err(Error::QueueClosed));
        assert_eq!(queue.try_submit(Task::new(3, ())), Err(Error::QueueClosed));
        assert_eq!(queue.state().submitted(), 1);
    }

    #[tokio::test]
    async fn double_close_is_a_protocol_error() {
        let queue = TaskQueue::<()>::new(1).unwrap();
        assert_eq!(queue.close(), Ok(()));
        assert_eq!(queue.close(), Err(Error::QueueClosed));
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn try_submit_reports_full() {
        let queue = TaskQueue::new(1).unwrap();
        queue.try_submit(Task::new(1, ())).unwrap();
        assert_eq!(
            queue.try_submit(Task::new(2, ())),
            Err(Error::QueueFull { capacity: 1 })
        );
        assert_eq!(queue.state().submitted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_applies_backpressure() {
        let queue = TaskQueue::new(1).unwrap();
        queue.submit(Task::new(1, ())).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), queue.submit(Task::new(2, ()))).await;
        assert!(blocked.is_err(), "submit must wait while the queue is full");

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(Task::new(3, ())).await })
        };
        assert_eq!(queue.next().await.map(|t| t.id().get()), Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.next().await.map(|t| t.id().get()), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_submit_unwinds_on_signal() {
        let queue = TaskQueue::new(1).unwrap();
        queue.submit(Task::new(1, ())).await.unwrap();

        let signal = Signal::new();
        let producer = {
            let queue = queue.clone();
            let signal = signal.clone();
            tokio::spawn(async move { queue.submit_with(Task::new(2, ()), &signal).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.fire(Cause::Cancelled);

        assert_eq!(producer.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(queue.state().submitted(), 1);
    }

    #[tokio::test]
    async fn sequence_ids_start_at_one() {
        let queue = TaskQueue::new(3).unwrap();
        for expected in 1..=3 {
            assert_eq!(queue.submit_payload("x").await, Ok(TaskId::new(expected)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn next_with_observes_signal() {
        let queue = TaskQueue::<()>::new(1).unwrap();
        let signal = Signal::new();
        signal.fire(Cause::Timeout);
        assert_eq!(queue.next_with(&signal).await.err(), Some(Error::Timeout));
    }

    #[tokio::test]
    async fn len_counts_buffered_tasks_after_close() {
        let queue = TaskQueue::new(4).unwrap();
        queue.submit(Task::new(1, ())).await.unwrap();
        queue.try_submit(Task::new(2, ())).unwrap();
        queue.close().unwrap();
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_empty());

        queue.next().await.unwrap();
        assert_eq!(queue.len(), 1);
        queue.next().await.unwrap();
        assert!(queue.is_empty());
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn repeated_ids_are_refused_at_admission() {
        let queue = TaskQueue::new(4).unwrap();
        queue.submit(Task::new(1, "a")).await.unwrap();

        let dup = Error::DuplicateTask {
            task_id: TaskId::new(1),
        };
        assert_eq!(queue.submit(Task::new(1, "b")).await, Err(dup.clone()));
        assert_eq!(queue.try_submit(Task::new(1, "c")), Err(dup));
        assert_eq!(queue.state().submitted(), 1);
        assert_eq!(queue.len(), 1);

        // The sequence steps over ids the caller already used.
        queue.submit(Task::new(3, "d")).await.unwrap();
        assert_eq!(queue.submit_payload("e").await, Ok(TaskId::new(2)));
        assert_eq!(queue.submit_payload("f").await, Ok(TaskId::new(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn bound_signal_unwinds_plain_submit() {
        let queue = TaskQueue::new(1).unwrap();
        queue.submit(Task::new(1, ())).await.unwrap();

        // Already waiting when the signal is bound.
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(Task::new(2, ())).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let signal = Signal::new();
        queue.bind(signal.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        signal.fire(Cause::Cancelled);
        assert_eq!(producer.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(queue.submit_payload(()).await, Err(Error::Cancelled));
        assert!(queue.next().await.is_none());
        assert_eq!(queue.state().submitted(), 1);
    }
}
