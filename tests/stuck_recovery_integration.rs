use autopost::lock::{LockManager, LockManagerConfig};
use autopost::recovery::RecoveryConfig;
use autopost::store::{InMemoryConnectionFactory, InMemoryTaskStore, Task, TaskLogEvent, TaskStatus, TaskStore, TaskUpdate};
use autopost::StuckTaskRecovery;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

fn recovery(store: &Arc<InMemoryTaskStore>) -> Arc<StuckTaskRecovery> {
    let lock_manager = Arc::new(LockManager::new(
        Arc::new(InMemoryConnectionFactory::new()),
        LockManagerConfig::default(),
    ));
    Arc::new(StuckTaskRecovery::new(
        store.clone(),
        lock_manager,
        RecoveryConfig {
            stuck_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(60),
        },
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_sweeps_recover_each_task_once() {
    let store = Arc::new(InMemoryTaskStore::new());
    let mut stuck = Vec::new();
    for i in 0..4 {
        let id = store
            .insert(Task::new("blog", "news", format!("post-{i}"), Utc::now()))
            .await;
        store.update(id, TaskUpdate::start(Utc::now())).await.unwrap();
        store.backdate(id, ChronoDuration::minutes(20)).await;
        stuck.push(id);
    }

    let recovery = recovery(&store);
    let (a, b) = tokio::join!(
        {
            let recovery = recovery.clone();
            async move { recovery.recover_once().await }
        },
        {
            let recovery = recovery.clone();
            async move { recovery.recover_once().await }
        }
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.recovered_count() + b.recovered_count(), 4);
    assert!(a.errors.is_empty() && b.errors.is_empty());

    for id in stuck {
        let task = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        let recoveries = store
            .log_entries_for(id)
            .await
            .into_iter()
            .filter(|entry| entry.event == TaskLogEvent::StuckRecovered)
            .count();
        assert_eq!(recoveries, 1);
    }
}

#[tokio::test]
async fn test_recent_progress_is_not_stuck() {
    let store = Arc::new(InMemoryTaskStore::new());
    let id = store.insert(Task::new("blog", "news", "post", Utc::now())).await;
    store.update(id, TaskUpdate::start(Utc::now())).await.unwrap();
    store.backdate(id, ChronoDuration::minutes(4)).await;

    let report = recovery(&store).recover_once().await.unwrap();
    assert_eq!(report.scanned, 0);
    let task = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
}
