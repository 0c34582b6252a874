//! Concurrency-safe named counters.
//!
//! Two strategies implement [`CounterStore`]:
//!
//! - [`LockCounterStore`]: one mutex guards the whole map. Any key can be
//!   created on first use; every access is serialized.
//! - [`AtomicCounterStore`]: one lock-free atomic per key. The key set is
//!   fixed at construction and only increment/read are supported.
//!
//! Both guarantee that `N` concurrent increments of a key raise it by exactly
//! `N`, and that a read never observes a partially applied update.

mod atomic;
mod lock;

pub use atomic::*;
pub use lock::*;

use crate::error::Result;
use std::collections::BTreeMap;

/// Shared key → count map.
pub trait CounterStore: Send + Sync {
    /// Adds one to `key` and returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownCounter`] if the store has a fixed key set
    /// without `key`, or [`Error::LockPoisoned`] if a lock-based store was
    /// poisoned.
    ///
    /// [`Error::UnknownCounter`]: crate::Error::UnknownCounter
    /// [`Error::LockPoisoned`]: crate::Error
    fn increment(&self, key: &str) -> Result<u64>;

    /// Current count of `key`; zero for keys never incremented.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockPoisoned`] if a lock-based store was poisoned.
    ///
    /// [`Error::LockPoisoned`]: crate::Error
    fn get(&self, key: &str) -> Result<u64>;

    /// Point-in-time copy of every counter, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockPoisoned`] if a lock-based store was poisoned.
    ///
    /// [`Error::LockPoisoned`]: crate::Error
    fn snapshot(&self) -> Result<BTreeMap<String, u64>>;
}
