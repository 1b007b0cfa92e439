pub mod deadlock;
pub mod manager;
pub mod pool;
mod table;
pub mod types;

#[cfg(test)]
mod tests;

pub use deadlock::WaitForGraph;
pub use manager::{LockGuard, LockManager, Transaction};
pub use pool::{ConnectionFactory, ConnectionPool, DatastoreConnection, PooledConnection};
pub use types::*;
