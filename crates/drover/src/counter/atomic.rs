use crate::{
    counter::CounterStore,
    error::{Error, Result},
};
use portable_atomic::{AtomicU64, Ordering};
use std::collections::{BTreeMap, HashMap};
#[cfg(feature = "tracing")]
use tracing::instrument;

#[cfg(feature = "cache-padded")]
type Slot = crossbeam_utils::CachePadded<AtomicU64>;
#[cfg(not(feature = "cache-padded"))]
type Slot = AtomicU64;

fn new_slot() -> Slot {
    #[cfg(feature = "cache-padded")]
    {
        crossbeam_utils::CachePadded::new(AtomicU64::new(0))
    }
    #[cfg(not(feature = "cache-padded"))]
    {
        AtomicU64::new(0)
    }
}

/// A lock-free counter map with a key set fixed at construction.
///
/// The map itself is never mutated after construction; each key owns an
/// [`AtomicU64`], so increments to different keys never contend and
/// increments to the same key never block.
///
/// ## Features
/// - ✅ Thread-safe
/// - ❌ Keys cannot be added after construction
///
/// ## Recommended When
/// - The keys are known in advance (e.g. a fixed set of metrics)
/// - Only increment and read are needed
///
/// ## See Also
/// - [`LockCounterStore`]
///
/// [`LockCounterStore`]: crate::counter::LockCounterStore
#[derive(Debug)]
pub struct AtomicCounterStore {
    counters: HashMap<String, Slot>,
}

impl AtomicCounterStore {
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            counters: keys
                .into_iter()
                .map(|k| (k.into(), new_slot()))
                .collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.counters.contains_key(key)
    }
}

impl CounterStore for AtomicCounterStore {
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    fn increment(&self, key: &str) -> Result<u64> {
        let slot = self.counters.get(key).ok_or_else(|| Error::UnknownCounter {
            key: key.to_owned(),
        })?;
        Ok(slot.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn get(&self, key: &str) -> Result<u64> {
        Ok(self
            .counters
            .get(key)
            .map_or(0, |slot| slot.load(Ordering::Acquire)))
    }

    fn snapshot(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self
            .counters
            .iter()
            .map(|(k, slot)| (k.clone(), slot.load(Ordering::Acquire)))
            .collect())
    }
}
