use crate::lock::pool::{ConnectionFactory, ConnectionPool, PooledConnection};
use crate::lock::table::{Admission, LockTable};
use crate::lock::types::*;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

type SharedTable = Arc<Mutex<LockTable>>;

fn lock_table(table: &SharedTable) -> MutexGuard<'_, LockTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table-level lock arbiter in front of a bounded connection pool.
///
/// Shared requests are granted unless another owner holds the resource
/// exclusively; exclusive requests need the resource to be free of other
/// owners. Blocked requests queue by priority and feed a wait-for graph that
/// is checked for cycles on every blocked acquisition and on a timer.
pub struct LockManager {
    config: LockManagerConfig,
    pool: Arc<ConnectionPool>,
    table: SharedTable,
    write_gate: tokio::sync::Mutex<()>,
}

/// A granted lock. Released when dropped.
pub struct LockGuard {
    table: SharedTable,
    request_id: RequestId,
    owner: OwnerId,
    resource: String,
    lock_type: LockType,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("request_id", &self.request_id)
            .field("owner", &self.owner)
            .field("resource", &self.resource)
            .field("lock_type", &self.lock_type)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// A connection with an open datastore transaction and the locks taken under it.
///
/// Finish with [`Transaction::commit`] or [`Transaction::rollback`]. Dropping an
/// unfinished transaction releases its locks and discards the connection.
pub struct Transaction {
    owner: OwnerId,
    priority: u8,
    lock_timeout: Duration,
    table: SharedTable,
    conn: PooledConnection,
    locks: Vec<LockGuard>,
    finished: bool,
}

impl LockManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: LockManagerConfig) -> Self {
        let pool = ConnectionPool::new(factory, config.pool.clone());
        Self {
            config,
            pool,
            table: Arc::new(Mutex::new(LockTable::default())),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Warm the connection pool
    pub async fn initialize(&self) -> Result<(), DatastoreError> {
        self.pool.initialize().await
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Wait for `request` to be granted, up to its timeout.
    ///
    /// Fails with [`DatastoreError::Deadlock`] when the request's owner is
    /// picked as a deadlock victim while waiting.
    pub async fn acquire_lock(&self, request: LockRequest) -> Result<LockGuard, DatastoreError> {
        acquire(&self.table, request).await
    }

    /// Grant `request` only if that is possible without waiting
    pub fn try_acquire(&self, request: LockRequest) -> Result<LockGuard, DatastoreError> {
        let granted = lock_table(&self.table).try_grant(&request);
        if granted {
            Ok(LockGuard::new(&self.table, &request))
        } else {
            Err(DatastoreError::LockBusy {
                resource: request.resource_key,
            })
        }
    }

    /// Find wait-for cycles and abort one victim per cycle
    pub fn detect_deadlocks(&self) -> DeadlockReport {
        resolve(&self.table)
    }

    /// Check out a connection and open a transaction on it.
    ///
    /// `priority` applies to every lock taken through the transaction.
    pub async fn begin(&self, priority: u8) -> Result<Transaction, DatastoreError> {
        let mut conn = self.pool.acquire().await?;
        if let Err(err) = conn.begin().await {
            conn.mark_broken();
            return Err(err);
        }
        let owner = Uuid::new_v4();
        debug!(owner = %owner, connection = conn.id(), priority, "Transaction started");
        Ok(Transaction {
            owner,
            priority,
            lock_timeout: self.config.lock_timeout(),
            table: Arc::clone(&self.table),
            conn,
            locks: Vec::new(),
            finished: false,
        })
    }

    /// Run `op` inside a transaction holding `lock_type` on `resource`.
    ///
    /// Commits when `op` succeeds and rolls back otherwise. The lock and the
    /// connection are released before this returns.
    pub async fn transaction<T, F, Fut>(
        &self,
        resource: &str,
        lock_type: LockType,
        priority: u8,
        op: F,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut tx = self.begin(priority).await?;
        if let Err(err) = tx.lock(resource, lock_type).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(resource, error = %rollback_err, "Rollback after lock failure failed");
            }
            return Err(err.into());
        }

        match op().await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(resource, error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Retry `op` on lock contention, connection exhaustion and deadlock.
    ///
    /// Errors that do not carry a retryable [`DatastoreError`] propagate on the
    /// first failure. Contention backs off exponentially with jitter; a
    /// deadlock first runs victim selection, then backs off the same way.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut op: F, max_retries: u32) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(db_err) = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<DatastoreError>())
                .cloned()
            else {
                return Err(err);
            };
            if !(db_err.is_transient() || db_err.is_deadlock()) || attempt >= max_retries {
                return Err(err);
            }
            attempt += 1;

            if db_err.is_deadlock() {
                let report = self.detect_deadlocks();
                debug!(
                    cycles = report.cycles.len(),
                    victims = report.victims.len(),
                    "Deadlock handling ran before retry"
                );
            }

            let delay = self.retry_delay(attempt);
            warn!(
                attempt,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %db_err,
                "Retrying datastore operation"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Backoff for retry `attempt` with the configured jitter applied
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_delay(attempt);
        let jitter = self.config.retry_jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let spread = rand::random::<f64>() * 2.0 - 1.0;
        base.mul_f64((1.0 + jitter * spread).max(0.0))
    }

    /// Run `op` while holding the global write gate. Used for bulk rewrites
    /// that must not interleave with each other.
    pub async fn serialized_write<T, F, Fut>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _gate = self.write_gate.lock().await;
        op().await
    }

    pub fn stats(&self) -> LockStats {
        lock_table(&self.table).snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Current holders of `resource`
    pub fn holders(&self, resource: &str) -> Vec<(OwnerId, LockType)> {
        lock_table(&self.table).holders_of(resource)
    }

    /// Periodic deadlock sweep until `shutdown` flips to true
    pub async fn run_deadlock_detector(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.deadlock_check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.detect_deadlocks();
                    if !report.victims.is_empty() {
                        info!(
                            cycles = report.cycles.len(),
                            victims = report.victims.len(),
                            "Periodic deadlock sweep aborted victims"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Deadlock detector stopped");
    }

    /// Periodic idle-connection eviction until `shutdown` flips to true
    pub async fn run_idle_evictor(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.eviction_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    self.pool.evict_idle();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Idle connection evictor stopped");
    }

    /// Close the pool. Checked-out connections are dropped when returned.
    pub fn close(&self) {
        self.pool.close();
        info!("Lock manager closed");
    }
}

async fn acquire(table: &SharedTable, request: LockRequest) -> Result<LockGuard, DatastoreError> {
    let (tx, rx) = oneshot::channel();
    let mut guard = LockGuard::new(table, &request);
    let timeout = request.timeout;

    let admission = lock_table(table).admit(request, tx);
    if let Admission::Granted = admission {
        return Ok(guard);
    }

    resolve(table);

    // While queued the guard stays armed: dropping this future withdraws the
    // request, or releases it when the grant already arrived
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(()))) => Ok(guard),
        Ok(Ok(Err(err))) => Err(err),
        Ok(Err(_)) => Err(DatastoreError::Aborted(
            "lock request dropped by the arbiter".to_string(),
        )),
        Err(_) => {
            guard.release_inner();
            lock_table(table).stats.timeouts_total += 1;
            debug!(
                request = %guard.request_id,
                owner = %guard.owner,
                resource = %guard.resource,
                "Lock wait timed out"
            );
            Err(DatastoreError::LockTimeout {
                resource: guard.resource.clone(),
            })
        }
    }
}

fn resolve(table: &SharedTable) -> DeadlockReport {
    let report = lock_table(table).resolve_deadlocks();
    if !report.cycles.is_empty() {
        warn!(
            cycles = report.cycles.len(),
            victims = ?report.victims,
            "Deadlock detected"
        );
    }
    report
}

impl LockGuard {
    fn new(table: &SharedTable, request: &LockRequest) -> Self {
        Self {
            table: Arc::clone(table),
            request_id: request.id,
            owner: request.owner,
            resource: request.resource_key.clone(),
            lock_type: request.lock_type,
            released: false,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    /// Withdraw the request if it is still queued, otherwise release the grant
    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut table = lock_table(&self.table);
        if table.withdraw(self.request_id).is_none() {
            table.release(self.request_id);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl Transaction {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Take a lock for the remainder of the transaction
    pub async fn lock(&mut self, resource: &str, lock_type: LockType) -> Result<(), DatastoreError> {
        let request = LockRequest::new(self.owner, resource, lock_type, self.priority, self.lock_timeout);
        let guard = acquire(&self.table, request).await?;
        self.locks.push(guard);
        Ok(())
    }

    pub async fn commit(mut self) -> Result<(), DatastoreError> {
        self.finished = true;
        let result = self.conn.commit().await;
        if result.is_err() {
            self.conn.mark_broken();
        }
        debug!(owner = %self.owner, ok = result.is_ok(), "Transaction committed");
        result
    }

    pub async fn rollback(mut self) -> Result<(), DatastoreError> {
        self.finished = true;
        let result = self.conn.rollback().await;
        if result.is_err() {
            self.conn.mark_broken();
        }
        debug!(owner = %self.owner, "Transaction rolled back");
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(owner = %self.owner, "Transaction dropped without commit or rollback");
            self.conn.mark_broken();
        }
        // Locks go before the connection returns to the pool
        self.locks.clear();
    }
}
