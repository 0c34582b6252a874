#[cfg(feature = "parking-lot")]
pub use parking_lot::{Mutex, MutexGuard};
#[cfg(not(feature = "parking-lot"))]
pub use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `$mutex`, propagating poisoning with `?` when the `std` mutex is in
/// use.
macro_rules! lock {
    ($mutex:expr) => {{
        #[cfg(feature = "parking-lot")]
        {
            $mutex.lock()
        }
        #[cfg(not(feature = "parking-lot"))]
        {
            $mutex.lock()?
        }
    }};
}

pub(crate) use lock;

/// Locks `$mutex` for a critical section that cannot panic halfway through,
/// recovering the guard if the `std` mutex was poisoned anyway.
macro_rules! lock_unpoisoned {
    ($mutex:expr) => {{
        #[cfg(feature = "parking-lot")]
        {
            $mutex.lock()
        }
        #[cfg(not(feature = "parking-lot"))]
        {
            $mutex
                .lock()
                .unwrap_or_else($crate::mutex::PoisonError::into_inner)
        }
    }};
}

pub(crate) use lock_unpoisoned;
