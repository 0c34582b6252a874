use crate::{
    counter::CounterStore,
    error::Result,
    mutex::{Mutex, lock},
};
use std::collections::{BTreeMap, HashMap};
#[cfg(feature = "tracing")]
use tracing::instrument;

/// A counter map behind a single mutex.
///
/// ## Features
/// - ✅ Thread-safe
/// - ✅ Keys are created on first increment
///
/// ## Recommended When
/// - The key set is not known in advance
/// - A consistent snapshot across keys matters more than raw throughput
///
/// ## See Also
/// - [`AtomicCounterStore`]
///
/// [`AtomicCounterStore`]: crate::counter::AtomicCounterStore
#[derive(Debug, Default)]
pub struct LockCounterStore {
    #[cfg(feature = "cache-padded")]
    counters: crossbeam_utils::CachePadded<Mutex<HashMap<String, u64>>>,
    #[cfg(not(feature = "cache-padded"))]
    counters: Mutex<HashMap<String, u64>>,
}

impl LockCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with `keys` present at zero, so they show up in
    /// snapshots before their first increment.
    pub fn with_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let map: HashMap<String, u64> = keys.into_iter().map(|k| (k.into(), 0)).collect();
        Self {
            #[cfg(feature = "cache-padded")]
            counters: crossbeam_utils::CachePadded::new(Mutex::new(map)),
            #[cfg(not(feature = "cache-padded"))]
            counters: Mutex::new(map),
        }
    }
}

impl CounterStore for LockCounterStore {
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    fn increment(&self, key: &str) -> Result<u64> {
        let mut counters = lock!(self.counters);
        // Only allocate the key on its first increment.
        if let Some(count) = counters.get_mut(key) {
            *count += 1;
            return Ok(*count);
        }
        counters.insert(key.to_owned(), 1);
        Ok(1)
    }

    fn get(&self, key: &str) -> Result<u64> {
        let counters = lock!(self.counters);
        Ok(counters.get(key).copied().unwrap_or(0))
    }

    fn snapshot(&self) -> Result<BTreeMap<String, u64>> {
        let counters = lock!(self.counters);
        Ok(counters.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }
}
