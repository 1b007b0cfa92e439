use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identifier of a single lock request
pub type RequestId = Uuid;

/// Identity of the transaction that holds or awaits locks
pub type OwnerId = Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Shared,
    Exclusive,
}

/// A request for a table-level lock.
///
/// `priority` decides wait-queue order and deadlock victims: higher values are
/// more important and are served first / aborted last.
#[derive(Clone, Debug)]
pub struct LockRequest {
    pub id: RequestId,
    pub owner: OwnerId,
    pub lock_type: LockType,
    pub resource_key: String,
    pub requested_at: DateTime<Utc>,
    pub timeout: Duration,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatastoreError {
    #[error("Lock wait on '{resource}' exceeded its timeout")]
    LockTimeout { resource: String },
    #[error("Lock on '{resource}' is busy")]
    LockBusy { resource: String },
    #[error("Deadlock detected; transaction {owner} chosen as victim")]
    Deadlock { owner: OwnerId },
    #[error("No datastore connection available within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("Datastore connection failure: {0}")]
    Connection(String),
    #[error("Connection pool is closed")]
    PoolClosed,
    #[error("Lock request aborted: {0}")]
    Aborted(String),
}

/// Connection pool sizing and timeouts
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LockManagerConfig {
    pub pool: PoolConfig,
    /// Default wait for a lock grant
    pub lock_timeout_ms: u64,
    pub deadlock_check_interval_ms: u64,
    pub eviction_interval_ms: u64,
    /// Backoff for [`crate::lock::LockManager::execute_with_retry`]
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Fraction of the backoff delay applied as random jitter (0.0..=1.0)
    pub retry_jitter: f64,
    pub max_retries: u32,
}

/// Point-in-time view of lock activity
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LockStats {
    pub held_locks: usize,
    pub waiting_requests: usize,
    pub locked_resources: usize,
    pub granted_total: u64,
    pub timeouts_total: u64,
    pub deadlocks_detected: u64,
    pub victims_aborted: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub in_use: usize,
    pub max_connections: usize,
    pub created: u64,
    pub discarded_unhealthy: u64,
    pub evicted_idle: u64,
    pub acquire_timeouts: u64,
}

/// Result of one deadlock detection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadlockReport {
    pub cycles: Vec<Vec<OwnerId>>,
    pub victims: Vec<OwnerId>,
}

impl LockRequest {
    pub fn new(
        owner: OwnerId,
        resource_key: impl Into<String>,
        lock_type: LockType,
        priority: u8,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            lock_type,
            resource_key: resource_key.into(),
            requested_at: Utc::now(),
            timeout,
            priority,
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Shared => f.write_str("shared"),
            LockType::Exclusive => f.write_str("exclusive"),
        }
    }
}

impl DatastoreError {
    /// Contention that is worth retrying after a short backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DatastoreError::LockTimeout { .. }
                | DatastoreError::LockBusy { .. }
                | DatastoreError::ConnectionTimeout(_)
        )
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, DatastoreError::Deadlock { .. })
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 5,
            idle_timeout_ms: 300_000,
            acquire_timeout_ms: 10_000,
        }
    }
}

impl LockManagerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn deadlock_check_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_check_interval_ms.max(1))
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms.max(1))
    }

    /// `min(base * 2^(attempt-1), cap)` before jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(20);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            lock_timeout_ms: 30_000,
            deadlock_check_interval_ms: 5_000,
            eviction_interval_ms: 60_000,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            retry_jitter: 0.2,
            max_retries: 3,
        }
    }
}
