use super::*;
use crate::store::InMemoryConnectionFactory;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

fn test_config() -> LockManagerConfig {
    LockManagerConfig {
        pool: PoolConfig {
            min_connections: 2,
            max_connections: 5,
            idle_timeout_ms: 50,
            acquire_timeout_ms: 200,
        },
        lock_timeout_ms: 500,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..Default::default()
    }
}

fn manager() -> LockManager {
    LockManager::new(Arc::new(InMemoryConnectionFactory::new()), test_config())
}

fn request(owner: OwnerId, resource: &str, lock_type: LockType, priority: u8) -> LockRequest {
    LockRequest::new(owner, resource, lock_type, priority, Duration::from_millis(200))
}

#[tokio::test]
async fn test_shared_locks_coexist() {
    let manager = manager();
    let a = manager
        .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Shared, 50))
        .await
        .unwrap();
    let b = manager
        .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Shared, 50))
        .await
        .unwrap();

    assert_eq!(manager.holders("tasks").len(), 2);
    assert_eq!(manager.stats().held_locks, 2);
    drop(a);
    drop(b);
    assert!(manager.holders("tasks").is_empty());
    assert_eq!(manager.stats().locked_resources, 0);
}

#[tokio::test]
async fn test_exclusive_excludes_everyone_else() {
    let manager = manager();
    let writer = manager
        .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Exclusive, 50))
        .await
        .unwrap();

    let busy = manager.try_acquire(request(Uuid::new_v4(), "tasks", LockType::Shared, 99));
    assert!(matches!(busy, Err(DatastoreError::LockBusy { .. })));

    let timed_out = manager
        .acquire_lock(LockRequest::new(
            Uuid::new_v4(),
            "tasks",
            LockType::Shared,
            99,
            Duration::from_millis(30),
        ))
        .await;
    assert!(matches!(timed_out, Err(DatastoreError::LockTimeout { .. })));
    assert_eq!(manager.stats().timeouts_total, 1);
    assert_eq!(manager.stats().waiting_requests, 0);

    let holders = manager.holders("tasks");
    assert_eq!(holders, vec![(writer.owner(), LockType::Exclusive)]);
}

#[tokio::test]
async fn test_same_owner_is_reentrant() {
    let manager = manager();
    let owner = Uuid::new_v4();
    let _shared = manager
        .acquire_lock(request(owner, "tasks", LockType::Shared, 50))
        .await
        .unwrap();
    let upgraded = manager.try_acquire(request(owner, "tasks", LockType::Exclusive, 50));
    assert!(upgraded.is_ok());
}

#[tokio::test]
async fn test_waiter_granted_on_release() {
    let manager = Arc::new(manager());
    let holder = manager
        .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Exclusive, 50))
        .await
        .unwrap();

    let waiting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Exclusive, 50))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.stats().waiting_requests, 1);
    holder.release();

    let granted = waiting.await.unwrap().unwrap();
    assert_eq!(granted.lock_type(), LockType::Exclusive);
    assert_eq!(manager.stats().waiting_requests, 0);
}

#[tokio::test]
async fn test_aborted_waiter_does_not_keep_its_grant() {
    let manager = Arc::new(manager());
    let holder = manager
        .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Exclusive, 50))
        .await
        .unwrap();

    let waiting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Exclusive, 50))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.stats().waiting_requests, 1);

    // The grant is sent on release; the waiter is aborted before it can observe it
    drop(holder);
    waiting.abort();
    assert!(waiting.await.unwrap_err().is_cancelled());

    assert!(manager.holders("tasks").is_empty());
    let stats = manager.stats();
    assert_eq!(stats.held_locks, 0);
    assert_eq!(stats.waiting_requests, 0);
    assert!(
        manager
            .try_acquire(request(Uuid::new_v4(), "tasks", LockType::Exclusive, 50))
            .is_ok()
    );
}

#[tokio::test]
async fn test_aborted_waiter_leaves_the_queue() {
    let manager = Arc::new(manager());
    let holder = manager
        .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Exclusive, 50))
        .await
        .unwrap();

    let waiting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Exclusive, 50))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    waiting.abort();
    assert!(waiting.await.unwrap_err().is_cancelled());
    assert_eq!(manager.stats().waiting_requests, 0);

    drop(holder);
    assert!(manager.holders("tasks").is_empty());
    assert_eq!(manager.stats().held_locks, 0);
}

#[tokio::test]
async fn test_higher_priority_waiter_served_first() {
    let manager = Arc::new(manager());
    let holder = manager
        .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Exclusive, 50))
        .await
        .unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for priority in [10u8, 90u8] {
        let manager = Arc::clone(&manager);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let guard = manager
                .acquire_lock(request(Uuid::new_v4(), "tasks", LockType::Exclusive, priority))
                .await
                .unwrap();
            order.lock().unwrap().push(priority);
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(guard);
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    drop(holder);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![90, 10]);
}

#[tokio::test]
async fn test_deadlock_aborts_lower_priority_transaction() {
    let manager = Arc::new(manager());
    let mut high = manager.begin(90).await.unwrap();
    let mut low = manager.begin(10).await.unwrap();

    high.lock("posts", LockType::Exclusive).await.unwrap();
    low.lock("tasks", LockType::Exclusive).await.unwrap();

    let high_waits = tokio::spawn(async move {
        let result = high.lock("tasks", LockType::Exclusive).await;
        (high, result)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let victim = low.lock("posts", LockType::Exclusive).await;
    assert!(matches!(victim, Err(DatastoreError::Deadlock { owner }) if owner == low.owner()));
    low.rollback().await.unwrap();

    let (high, result) = high_waits.await.unwrap();
    assert!(result.is_ok());
    high.commit().await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.deadlocks_detected, 1);
    assert_eq!(stats.victims_aborted, 1);
    assert_eq!(stats.held_locks, 0);
}

#[tokio::test]
async fn test_transaction_commits_and_releases() {
    let manager = manager();
    let value = manager
        .transaction("tasks", LockType::Exclusive, 50, || async { Ok(7) })
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(manager.stats().held_locks, 0);
    assert_eq!(manager.pool_stats().in_use, 0);

    let failed: anyhow::Result<()> = manager
        .transaction("tasks", LockType::Exclusive, 50, || async {
            Err(anyhow::anyhow!("publish rejected"))
        })
        .await;
    assert!(failed.is_err());
    assert_eq!(manager.stats().held_locks, 0);
}

#[tokio::test]
async fn test_execute_with_retry_recovers_from_contention() {
    let manager = manager();
    let calls = AtomicU32::new(0);
    let result = manager
        .execute_with_retry(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(DatastoreError::LockBusy {
                            resource: "tasks".to_string(),
                        }
                        .into())
                    } else {
                        Ok("done")
                    }
                }
            },
            3,
        )
        .await
        .unwrap();
    assert_eq!(result, "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_execute_with_retry_gives_up_after_max() {
    let manager = manager();
    let calls = AtomicU32::new(0);
    let result: anyhow::Result<()> = manager
        .execute_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DatastoreError::ConnectionTimeout(Duration::from_millis(1)).into()) }
            },
            2,
        )
        .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_execute_with_retry_propagates_other_errors() {
    let manager = manager();
    let calls = AtomicU32::new(0);
    let result: anyhow::Result<()> = manager
        .execute_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("content rejected by platform")) }
            },
            5,
        )
        .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_backoff_is_capped() {
    let config = LockManagerConfig::default();
    assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
    assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
    assert_eq!(config.backoff_delay(30), Duration::from_millis(5_000));

    let manager = LockManager::new(Arc::new(InMemoryConnectionFactory::new()), config);
    for attempt in 1..6 {
        let delay = manager.retry_delay(attempt);
        let base = manager.config().backoff_delay(attempt);
        assert!(delay >= base.mul_f64(0.8) && delay <= base.mul_f64(1.2));
    }
}

#[tokio::test]
async fn test_pool_blocks_sixth_acquisition_until_release() {
    let manager = manager();
    manager.initialize().await.unwrap();
    assert_eq!(manager.pool_stats().total_connections, 2);

    let pool = Arc::clone(manager.pool());
    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(pool.stats().total_connections, 5);

    let sixth = pool.acquire_connection(Duration::from_millis(30)).await;
    assert!(matches!(sixth, Err(DatastoreError::ConnectionTimeout(_))));
    assert_eq!(pool.stats().acquire_timeouts, 1);

    let waiting = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire_connection(Duration::from_secs(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    held.pop();
    let conn = waiting.await.unwrap().unwrap();
    assert!(conn.id() > 0);
    assert_eq!(pool.stats().total_connections, 5);
}

/// Connections whose health check takes a long time
struct SlowCheckFactory;

struct SlowCheckConnection;

#[async_trait::async_trait]
impl ConnectionFactory for SlowCheckFactory {
    async fn connect(&self) -> Result<Box<dyn DatastoreConnection>, DatastoreError> {
        Ok(Box::new(SlowCheckConnection))
    }
}

#[async_trait::async_trait]
impl DatastoreConnection for SlowCheckConnection {
    fn id(&self) -> u64 {
        7
    }

    async fn is_healthy(&self) -> bool {
        tokio::time::sleep(Duration::from_secs(5)).await;
        true
    }

    async fn begin(&mut self) -> Result<(), DatastoreError> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DatastoreError> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DatastoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_cancelled_health_check_keeps_connection_counted() {
    let pool = ConnectionPool::new(
        Arc::new(SlowCheckFactory),
        PoolConfig {
            min_connections: 1,
            max_connections: 2,
            idle_timeout_ms: 0,
            acquire_timeout_ms: 1_000,
        },
    );
    pool.initialize().await.unwrap();
    assert_eq!(pool.stats().total_connections, 1);

    let checkout = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await.map(|conn| conn.id()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().idle_connections, 0);
    checkout.abort();
    assert!(checkout.await.unwrap_err().is_cancelled());

    let stats = pool.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.in_use, 0);
    assert_eq!(pool.available(), 2);
    // Already at the minimum, so nothing is evicted
    assert_eq!(pool.evict_idle(), 0);
}

#[tokio::test]
async fn test_pool_replaces_unhealthy_and_evicts_idle() {
    let factory = Arc::new(InMemoryConnectionFactory::new());
    let pool = ConnectionPool::new(factory.clone(), test_config().pool);
    pool.initialize().await.unwrap();

    factory.invalidate_existing();
    let conn = pool.acquire().await.unwrap();
    assert_eq!(pool.stats().discarded_unhealthy, 2);
    assert_eq!(factory.created_count(), 3);
    drop(conn);

    // Grow past the minimum, then let everything go idle
    let extra: Vec<_> = futures::future::join_all((0..4).map(|_| pool.acquire()))
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();
    drop(extra);
    assert_eq!(pool.stats().total_connections, 4);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(pool.evict_idle(), 2);
    assert_eq!(pool.stats().total_connections, 2);
    assert_eq!(pool.evict_idle(), 0);
}

#[tokio::test]
async fn test_serialized_writes_do_not_interleave() {
    let manager = Arc::new(manager());
    let active = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        let active = Arc::clone(&active);
        handles.push(tokio::spawn(async move {
            manager
                .serialized_write(|| async {
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}
