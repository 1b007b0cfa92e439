pub mod core;
mod execution;
pub mod queue;
pub mod types;

#[cfg(test)]
mod tests;

pub use core::{Scheduler, SchedulerComponents};
pub use queue::TaskQueue;
pub use types::*;
