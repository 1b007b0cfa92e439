use crate::lock::types::{DatastoreError, PoolConfig, PoolStats};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Handle to one datastore connection
#[async_trait::async_trait]
pub trait DatastoreConnection: Send + Sync {
    fn id(&self) -> u64;
    async fn is_healthy(&self) -> bool;
    async fn begin(&mut self) -> Result<(), DatastoreError>;
    async fn commit(&mut self) -> Result<(), DatastoreError>;
    async fn rollback(&mut self) -> Result<(), DatastoreError>;
}

/// Opens new datastore connections for the pool
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DatastoreConnection>, DatastoreError>;
}

/// Bounded pool of datastore connections.
///
/// At most `max_connections` handles are checked out at once; waiting callers
/// park on a semaphore rather than polling. Idle handles above
/// `min_connections` are dropped by [`ConnectionPool::evict_idle`].
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    total: AtomicUsize,
    created: AtomicU64,
    discarded: AtomicU64,
    evicted: AtomicU64,
    timeouts: AtomicU64,
}

struct IdleConnection {
    conn: Box<dyn DatastoreConnection>,
    idle_since: Instant,
}

/// Idle connection under a health check. Goes back to the idle list if the
/// checkout is abandoned before it is decided.
struct IdleCandidate<'a> {
    pool: &'a ConnectionPool,
    idle: Option<IdleConnection>,
}

impl Drop for IdleCandidate<'_> {
    fn drop(&mut self) {
        if let Some(idle) = self.idle.take() {
            self.pool.idle_list().push_front(idle);
        }
    }
}

/// Checked-out connection; returned to the pool on drop
pub struct PooledConnection {
    conn: Option<Box<dyn DatastoreConnection>>,
    pool: Arc<ConnectionPool>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Arc<Self> {
        let max = config.max_connections.max(1);
        let config = PoolConfig {
            max_connections: max,
            min_connections: config.min_connections.min(max),
            ..config
        };
        Arc::new(Self {
            factory,
            permits: Arc::new(Semaphore::new(max)),
            config,
            idle: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    fn idle_list(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Open connections until `min_connections` exist
    pub async fn initialize(&self) -> Result<(), DatastoreError> {
        while self.total.load(Ordering::SeqCst) < self.config.min_connections {
            let conn = self.open().await?;
            self.idle_list().push_back(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
        info!(
            min = self.config.min_connections,
            max = self.config.max_connections,
            "Connection pool initialized"
        );
        Ok(())
    }

    async fn open(&self) -> Result<Box<dyn DatastoreConnection>, DatastoreError> {
        let conn = self.factory.connect().await?;
        self.total.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(connection = conn.id(), "Opened datastore connection");
        Ok(conn)
    }

    /// Wait up to `timeout` for a healthy connection
    pub async fn acquire_connection(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<PooledConnection, DatastoreError> {
        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DatastoreError::PoolClosed),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
                debug!(?timeout, "Timed out waiting for a datastore connection");
                return Err(DatastoreError::ConnectionTimeout(timeout));
            }
        };

        loop {
            // Most recently used first; the front holds the stalest handles
            let candidate = self.idle_list().pop_back();
            match candidate {
                Some(idle) => {
                    let mut candidate = IdleCandidate {
                        pool: self.as_ref(),
                        idle: Some(idle),
                    };
                    let healthy = match candidate.idle.as_ref() {
                        Some(idle) => idle.conn.is_healthy().await,
                        None => false,
                    };
                    let Some(idle) = candidate.idle.take() else {
                        continue;
                    };
                    if healthy {
                        return Ok(self.wrap(idle.conn, permit));
                    }
                    warn!(connection = idle.conn.id(), "Discarding unhealthy connection");
                    self.total.fetch_sub(1, Ordering::SeqCst);
                    self.discarded.fetch_add(1, Ordering::SeqCst);
                }
                None => {
                    let conn = self.open().await?;
                    return Ok(self.wrap(conn, permit));
                }
            }
        }
    }

    /// Acquire with the configured default timeout
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, DatastoreError> {
        self.acquire_connection(self.config.acquire_timeout()).await
    }

    fn wrap(
        self: &Arc<Self>,
        conn: Box<dyn DatastoreConnection>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            discard: false,
            _permit: permit,
        }
    }

    fn give_back(&self, conn: Box<dyn DatastoreConnection>, discard: bool) {
        if discard || self.permits.is_closed() {
            debug!(connection = conn.id(), "Dropping returned connection");
            self.total.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.idle_list().push_back(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
    }

    /// Drop idle connections past `idle_timeout`, never going below
    /// `min_connections`. Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let mut idle = self.idle_list();
        let mut evicted = 0;
        while let Some(oldest) = idle.front() {
            if self.total.load(Ordering::SeqCst) <= self.config.min_connections
                || oldest.idle_since.elapsed() < idle_timeout
            {
                break;
            }
            idle.pop_front();
            self.total.fetch_sub(1, Ordering::SeqCst);
            evicted += 1;
        }
        drop(idle);

        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::SeqCst);
            debug!(evicted, "Evicted idle connections");
        }
        evicted
    }

    /// Refuse new checkouts and drop idle connections
    pub fn close(&self) {
        self.permits.close();
        let mut idle = self.idle_list();
        let dropped = idle.len();
        idle.clear();
        self.total.fetch_sub(dropped, Ordering::SeqCst);
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle_list().len();
        let total = self.total.load(Ordering::SeqCst);
        PoolStats {
            total_connections: total,
            idle_connections: idle,
            in_use: total.saturating_sub(idle),
            max_connections: self.config.max_connections,
            created: self.created.load(Ordering::SeqCst),
            discarded_unhealthy: self.discarded.load(Ordering::SeqCst),
            evicted_idle: self.evicted.load(Ordering::SeqCst),
            acquire_timeouts: self.timeouts.load(Ordering::SeqCst),
        }
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id()).unwrap_or_default()
    }

    fn conn_mut(&mut self) -> Result<&mut Box<dyn DatastoreConnection>, DatastoreError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DatastoreError::Connection("connection already released".to_string()))
    }

    pub async fn begin(&mut self) -> Result<(), DatastoreError> {
        self.conn_mut()?.begin().await
    }

    pub async fn commit(&mut self) -> Result<(), DatastoreError> {
        self.conn_mut()?.commit().await
    }

    pub async fn rollback(&mut self) -> Result<(), DatastoreError> {
        self.conn_mut()?.rollback().await
    }

    /// Do not return this handle to the pool (e.g. its state is unknown)
    pub fn mark_broken(&mut self) {
        self.discard = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.discard);
        }
    }
}
