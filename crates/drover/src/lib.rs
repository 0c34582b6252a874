#![doc = include_str!("../README.md")]

mod collector;
mod counter;
mod error;
mod lifecycle;
mod limiter;
mod mutex;
mod pool;
mod queue;
mod task;
#[cfg(test)]
mod tests;

pub use crate::collector::*;
pub use crate::counter::*;
pub use crate::error::*;
pub use crate::lifecycle::*;
pub use crate::limiter::*;
pub use crate::pool::*;
pub use crate::queue::*;
pub use crate::task::*;
