use super::*;
use crate::classifier::ErrorCategory;
use crate::lock::{LockManager, LockManagerConfig};
use crate::store::{
    InMemoryConnectionFactory, InMemoryTaskStore, MockContentGenerator, MockPublisher, TASKS_RESOURCE, Task,
    TaskLogEvent, TaskStatus, TaskStore, TaskUpdate,
};
use crate::timing::{TimingConfig, TimingPredictor};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_workers: 3,
        batch_size: 10,
        check_interval_seconds: 1,
        max_retries: 3,
        task_timeout_seconds: 5,
        stuck_task_timeout_seconds: 60,
        daily_min_tasks: 0,
        daily_max_tasks: 0,
        low_water_mark: 5,
        lookahead_minutes: 60,
        shutdown_grace_seconds: 5,
        use_timing_adjustment: false,
        project_id: None,
    }
}

struct Harness {
    store: Arc<InMemoryTaskStore>,
    publisher: Arc<MockPublisher>,
    scheduler: Scheduler,
}

fn components(store: &Arc<InMemoryTaskStore>, publisher: &Arc<MockPublisher>) -> SchedulerComponents {
    let lock_manager = Arc::new(LockManager::new(
        Arc::new(InMemoryConnectionFactory::new()),
        LockManagerConfig::default(),
    ));
    SchedulerComponents::new(
        store.clone(),
        publisher.clone(),
        Arc::new(MockContentGenerator::new()),
        lock_manager,
    )
}

fn harness(config: SchedulerConfig, publisher: MockPublisher) -> Harness {
    let store = Arc::new(InMemoryTaskStore::new());
    let publisher = Arc::new(publisher);
    let scheduler = Scheduler::new(config, components(&store, &publisher)).unwrap();
    Harness {
        store,
        publisher,
        scheduler,
    }
}

async fn wait_for_stats(scheduler: &Scheduler, done: impl Fn(&SchedulerStats) -> bool) -> SchedulerStats {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = scheduler.get_stats();
        if done(&stats) {
            return stats;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not reached: {stats:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn task(store: &InMemoryTaskStore, id: Uuid) -> Task {
    store.get_by_id(id).await.unwrap().unwrap()
}

#[derive(Clone, Default)]
struct RecordingHandler(Arc<Mutex<Vec<SchedulerEvent>>>);

impl SchedulerEventHandler for RecordingHandler {
    fn handle_event(&self, event: &SchedulerEvent) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[test]
fn test_queue_orders_by_priority_then_time() {
    let now = Utc::now();
    let mut queue = TaskQueue::new();
    let low = TaskExecution::new(Uuid::new_v4(), 70, now);
    let later = TaskExecution::new(Uuid::new_v4(), 30, now + ChronoDuration::seconds(1));
    let urgent = TaskExecution::new(Uuid::new_v4(), 30, now);
    let tie = TaskExecution::new(Uuid::new_v4(), 30, now);

    queue.push(low.clone());
    queue.push(later.clone());
    queue.push(urgent.clone());
    queue.push(tie.clone());
    assert!(queue.contains(&tie.task_id));

    let order: Vec<Uuid> = queue.drain().into_iter().map(|e| e.task_id).collect();
    assert_eq!(order, vec![urgent.task_id, tie.task_id, later.task_id, low.task_id]);
    assert!(queue.is_empty());
    assert!(!queue.contains(&tie.task_id));
}

#[test]
fn test_queue_holds_back_head_not_yet_due() {
    let now = Utc::now();
    let mut queue = TaskQueue::new();
    queue.push(TaskExecution::new(Uuid::new_v4(), 10, now + ChronoDuration::hours(1)));
    queue.push(TaskExecution::new(Uuid::new_v4(), 50, now));

    assert!(queue.pop_due(now).is_none());
    assert_eq!(queue.len(), 2);
    assert!(queue.pop_due(now + ChronoDuration::hours(2)).is_some());
}

#[test]
fn test_lock_priority_follows_urgency() {
    let now = Utc::now();
    assert_eq!(TaskExecution::new(Uuid::new_v4(), 1, now).lock_priority(), 100);
    assert_eq!(TaskExecution::new(Uuid::new_v4(), 100, now).lock_priority(), 1);
    assert_eq!(TaskExecution::new(Uuid::new_v4(), 500, now).priority, 100);
}

#[test]
fn test_invalid_config_rejected() {
    let bad = SchedulerConfig {
        task_timeout_seconds: 600,
        stuck_task_timeout_seconds: 300,
        ..config()
    };
    let store = Arc::new(InMemoryTaskStore::new());
    let publisher = Arc::new(MockPublisher::new());
    let result = Scheduler::new(bad, components(&store, &publisher));
    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));

    let no_workers = SchedulerConfig {
        max_workers: 0,
        ..config()
    };
    assert!(no_workers.validate().is_err());
}

#[tokio::test]
async fn test_batch_admission_skips_queued_and_future_tasks() {
    let h = harness(config(), MockPublisher::new());
    let now = Utc::now();
    for _ in 0..3 {
        h.store.insert(Task::new("proj", "news", "payload", now)).await;
    }
    h.store
        .insert(Task::new("proj", "news", "payload", now + ChronoDuration::days(1)))
        .await;

    let first = h.scheduler.schedule_batch(10).await.unwrap();
    assert_eq!(first.scheduled_count, 3);
    assert_eq!(first.total_pending, 4);
    assert_eq!(h.scheduler.queue_size(), 3);

    let second = h.scheduler.schedule_batch(10).await.unwrap();
    assert_eq!(second.scheduled_count, 0);
    assert_eq!(h.scheduler.queue_size(), 3);
}

#[tokio::test]
async fn test_batch_admission_filters_project_and_caps_daily() {
    let h = harness(
        SchedulerConfig {
            project_id: Some("alpha".to_string()),
            daily_max_tasks: 2,
            ..config()
        },
        MockPublisher::new(),
    );
    let now = Utc::now();
    for _ in 0..4 {
        h.store.insert(Task::new("alpha", "news", "payload", now)).await;
        h.store.insert(Task::new("beta", "news", "payload", now)).await;
    }

    let result = h.scheduler.schedule_batch(10).await.unwrap();
    assert_eq!(result.scheduled_count, 2);
    assert!(!result.daily_cap_reached);

    // Queued work counts against the cap
    let again = h.scheduler.schedule_batch(10).await.unwrap();
    assert_eq!(again.scheduled_count, 0);
}

#[tokio::test]
async fn test_timing_adjustment_still_admits() {
    let store = Arc::new(InMemoryTaskStore::new());
    let publisher = Arc::new(MockPublisher::new());
    let components = components(&store, &publisher)
        .with_timing(TimingPredictor::new(TimingConfig::default()).unwrap());
    let scheduler = Scheduler::new(
        SchedulerConfig {
            use_timing_adjustment: true,
            ..config()
        },
        components,
    )
    .unwrap();
    store.insert(Task::new("proj", "engagement", "payload", Utc::now())).await;

    let result = scheduler.schedule_batch(5).await.unwrap();
    assert_eq!(result.scheduled_count, 1);
}

#[tokio::test]
async fn test_tasks_publish_end_to_end() {
    let h = harness(config(), MockPublisher::new());
    let ids = h
        .store
        .insert_all(
            (0..4)
                .map(|i| Task::new("proj", "news", format!("payload-{i}"), Utc::now()).with_media("img.png"))
                .collect(),
        )
        .await;

    h.scheduler.start().unwrap();
    wait_for_stats(&h.scheduler, |s| s.successful == 4).await;
    let stats = h.scheduler.stop().await;

    assert_eq!(stats.successful, 4);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.running_count, 0);
    assert_eq!(stats.published_today, 4);
    assert_eq!(h.publisher.call_count(), 4);
    assert!(h.publisher.published().await.iter().all(|(_, media)| media.as_deref() == Some("img.png")));

    for id in ids {
        let task = task(&h.store, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.published_id.is_some());
        assert!(task.published_url.is_some());
        let events: Vec<TaskLogEvent> = h
            .store
            .log_entries_for(id)
            .await
            .into_iter()
            .map(|entry| entry.event)
            .collect();
        assert_eq!(events, vec![TaskLogEvent::Started, TaskLogEvent::Completed]);
    }
}

#[tokio::test]
async fn test_rate_limit_failure_schedules_retry() {
    let h = harness(config(), MockPublisher::new());
    h.publisher.fail_next("Rate limit exceeded, 429").await;
    let id = h.store.insert(Task::new("proj", "news", "payload", Utc::now())).await;

    h.scheduler.start().unwrap();
    let stats = wait_for_stats(&h.scheduler, |s| s.retried == 1).await;
    assert_eq!(stats.errors_by_category.get(&ErrorCategory::RateLimit), Some(&1));

    let task = task(&h.store, id).await;
    assert_eq!(task.status, TaskStatus::Retry);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.error_category.as_deref(), Some("rate_limit"));
    let delay = task.scheduled_time - Utc::now();
    assert!(delay > ChronoDuration::seconds(1790) && delay <= ChronoDuration::seconds(1800));
    // Requeued, but not due yet
    assert_eq!(h.scheduler.queue_size(), 1);

    let stats = h.scheduler.stop().await;
    assert_eq!(stats.successful, 0);
    assert_eq!(stats.retried, 1);
}

#[tokio::test]
async fn test_content_rejection_needs_human_intervention() {
    let h = harness(config(), MockPublisher::new());
    h.publisher.fail_next("Duplicate content detected").await;
    let id = h.store.insert(Task::new("proj", "news", "payload", Utc::now())).await;

    h.scheduler.start().unwrap();
    wait_for_stats(&h.scheduler, |s| s.failed == 1).await;
    h.scheduler.stop().await;

    let task = task(&h.store, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.needs_human_intervention);
    assert_eq!(task.error_category.as_deref(), Some("content"));
    assert_eq!(h.publisher.call_count(), 1);
}

#[tokio::test]
async fn test_global_retry_cap_overrides_category_budget() {
    let h = harness(
        SchedulerConfig {
            max_retries: 2,
            ..config()
        },
        MockPublisher::new(),
    );
    h.publisher.fail_next("connection reset by peer").await;
    let id = h
        .store
        .insert(Task::new("proj", "news", "payload", Utc::now()).with_retry_count(2))
        .await;

    h.scheduler.start().unwrap();
    let stats = wait_for_stats(&h.scheduler, |s| s.failed == 1).await;
    h.scheduler.stop().await;

    assert_eq!(stats.retried, 0);
    let task = task(&h.store, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(!task.needs_human_intervention);
    assert_eq!(task.error_category.as_deref(), Some("network"));
}

#[tokio::test]
async fn test_timeout_cancels_exactly_once() {
    let h = harness(
        SchedulerConfig {
            task_timeout_seconds: 1,
            ..config()
        },
        MockPublisher::new().with_delay(Duration::from_secs(3)),
    );
    let id = h.store.insert(Task::new("proj", "news", "payload", Utc::now())).await;

    h.scheduler.start().unwrap();
    wait_for_stats(&h.scheduler, |s| s.timed_out == 1 && s.retried == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = h.scheduler.get_stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.running_count, 0);
    assert_eq!(stats.errors_by_category.get(&ErrorCategory::Network), Some(&1));

    let task = task(&h.store, id).await;
    assert_eq!(task.status, TaskStatus::Retry);
    assert_eq!(task.retry_count, 1);
    let timeouts = h
        .store
        .log_entries_for(id)
        .await
        .into_iter()
        .filter(|entry| entry.event == TaskLogEvent::TimedOut)
        .count();
    assert_eq!(timeouts, 1);
    assert_eq!(h.publisher.call_count(), 1);

    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_repeated_schedule_publishes_once() {
    let h = harness(config(), MockPublisher::new());
    // Outside the look-ahead window, so only explicit scheduling picks it up
    let id = h
        .store
        .insert(Task::new("proj", "news", "payload", Utc::now() + ChronoDuration::hours(3)))
        .await;
    for _ in 0..3 {
        assert!(h.scheduler.schedule_task(id, 50, Duration::ZERO));
    }

    h.scheduler.start().unwrap();
    wait_for_stats(&h.scheduler, |s| s.successful == 1 && s.queue_size == 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = h.scheduler.stop().await;

    assert_eq!(stats.successful, 1);
    assert_eq!(h.publisher.call_count(), 1);
    assert_eq!(task(&h.store, id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_start_twice_and_restart_are_errors() {
    let h = harness(config(), MockPublisher::new());
    assert_eq!(h.scheduler.state(), RunState::Idle);
    h.scheduler.start().unwrap();
    assert_eq!(h.scheduler.start(), Err(SchedulerError::AlreadyRunning));

    h.scheduler.stop().await;
    assert_eq!(h.scheduler.state(), RunState::Stopped);
    assert_eq!(h.scheduler.start(), Err(SchedulerError::Stopped));
    assert!(!h.scheduler.schedule_task(Uuid::new_v4(), 10, Duration::ZERO));
}

#[tokio::test]
async fn test_stop_cancels_stragglers_and_resets_them() {
    let h = harness(
        SchedulerConfig {
            shutdown_grace_seconds: 0,
            task_timeout_seconds: 30,
            ..config()
        },
        MockPublisher::new().with_delay(Duration::from_secs(10)),
    );
    let id = h.store.insert(Task::new("proj", "news", "payload", Utc::now())).await;

    h.scheduler.start().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while task(&h.store, id).await.status != TaskStatus::Running {
        assert!(tokio::time::Instant::now() < deadline, "task never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = h.scheduler.stop().await;
    assert_eq!(stats.running_count, 0);
    assert_eq!(stats.successful, 0);

    let task = task(&h.store, id).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.started_at.is_none());
    let log = h.store.log_entries_for(id).await;
    assert_eq!(log.last().map(|entry| entry.event), Some(TaskLogEvent::Cancelled));
}

#[tokio::test]
async fn test_day_rollover_reports_missed_minimum() {
    let store = Arc::new(InMemoryTaskStore::new());
    let publisher = Arc::new(MockPublisher::new());
    let recorder = RecordingHandler::default();
    let scheduler = Scheduler::new(
        SchedulerConfig {
            daily_min_tasks: 3,
            ..config()
        },
        components(&store, &publisher).with_event_handler(Box::new(recorder.clone())),
    )
    .unwrap();

    let today = Utc::now().date_naive();
    scheduler.inner.roll_day(today);
    assert!(recorder.0.lock().unwrap().is_empty());

    scheduler.inner.record_publication();
    let tomorrow = today + ChronoDuration::days(1);
    scheduler.inner.roll_day(tomorrow);

    let events = recorder.0.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        SchedulerEvent::DailyMinimumMissed { published: 1, minimum: 3, .. }
    )));
}

#[tokio::test]
async fn test_schedule_task_rejects_unrepresentable_delay() {
    let h = harness(config(), MockPublisher::new());
    let id = Uuid::new_v4();

    assert!(!h.scheduler.schedule_task(id, 10, Duration::from_secs(u64::MAX)));
    assert!(!h.scheduler.schedule_task(id, 10, Duration::from_secs(9_000_000_000_000)));
    assert_eq!(h.scheduler.queue_size(), 0);

    assert!(h.scheduler.schedule_task(id, 10, Duration::from_secs(60)));
    assert_eq!(h.scheduler.queue_size(), 1);
}

#[tokio::test]
async fn test_failure_never_reopens_completed_task() {
    let h = harness(config(), MockPublisher::new());
    let id = h.store.insert(Task::new("proj", "news", "payload", Utc::now())).await;
    let completed = TaskUpdate {
        status: Some(TaskStatus::Completed),
        published_id: Some("post-1".to_string()),
        ..Default::default()
    };
    h.store.update(id, completed).await.unwrap();

    let execution = TaskExecution::new(id, 50, Utc::now());
    let lock_error = anyhow::Error::new(crate::lock::DatastoreError::LockTimeout {
        resource: TASKS_RESOURCE.to_string(),
    });
    h.scheduler.inner.record_failure(&execution, lock_error, false).await;

    let task = task(&h.store, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 0);
    assert!(task.last_error.is_none());

    let stats = h.scheduler.get_stats();
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.queue_size, 0);
    assert!(stats.errors_by_category.is_empty());
    assert!(h.store.log_entries_for(id).await.is_empty());
}

#[tokio::test]
async fn test_duplicate_execution_blocked_on_lock_leaves_completed_task() {
    let store = Arc::new(InMemoryTaskStore::new());
    let publisher = Arc::new(MockPublisher::new());
    let lock_manager = Arc::new(LockManager::new(
        Arc::new(InMemoryConnectionFactory::new()),
        LockManagerConfig {
            lock_timeout_ms: 50,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            max_retries: 1,
            ..Default::default()
        },
    ));
    let scheduler = Scheduler::new(
        config(),
        SchedulerComponents::new(
            store.clone(),
            publisher.clone(),
            Arc::new(MockContentGenerator::new()),
            lock_manager.clone(),
        ),
    )
    .unwrap();

    let id = store
        .insert(Task::new("proj", "news", "payload", Utc::now() + ChronoDuration::hours(3)))
        .await;
    let completed = TaskUpdate {
        status: Some(TaskStatus::Completed),
        ..Default::default()
    };
    store.update(id, completed).await.unwrap();

    let holder = lock_manager
        .acquire_lock(crate::lock::LockRequest::new(
            Uuid::new_v4(),
            TASKS_RESOURCE,
            crate::lock::LockType::Exclusive,
            100,
            Duration::from_secs(1),
        ))
        .await
        .unwrap();

    scheduler.start().unwrap();
    assert!(scheduler.schedule_task(id, 1, Duration::ZERO));
    // Claim and outcome write both time out while the table is held
    wait_for_stats(&scheduler, |s| s.pending_outcomes == 1 && s.running_count == 0).await;

    drop(holder);
    scheduler.inner.flush_pending_outcomes().await;
    let stats = scheduler.stop().await;

    assert_eq!(stats.retried, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending_outcomes, 0);
    assert_eq!(publisher.call_count(), 0);
    let task = task(&store, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 0);
}

/// Store whose updates can be switched to fail
struct FlakyStore {
    inner: InMemoryTaskStore,
    fail_updates: std::sync::atomic::AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            fail_updates: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.fail_updates.store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl TaskStore for FlakyStore {
    async fn get_ready(&self, filter: &crate::store::TaskFilter, limit: usize) -> anyhow::Result<Vec<Task>> {
        self.inner.get_ready(filter, limit).await
    }

    async fn get_by_id(&self, id: crate::store::TaskId) -> anyhow::Result<Option<Task>> {
        self.inner.get_by_id(id).await
    }

    async fn update(&self, id: crate::store::TaskId, update: TaskUpdate) -> anyhow::Result<bool> {
        if self.fail_updates.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("datastore unavailable");
        }
        self.inner.update(id, update).await
    }

    async fn get_stuck(&self, timeout: ChronoDuration) -> anyhow::Result<Vec<Task>> {
        self.inner.get_stuck(timeout).await
    }

    async fn append_log(&self, entry: crate::store::TaskLogEntry) -> anyhow::Result<()> {
        self.inner.append_log(entry).await
    }

    async fn count_by_status(&self, status: TaskStatus) -> anyhow::Result<usize> {
        self.inner.count_by_status(status).await
    }
}

fn flaky_scheduler(store: &Arc<FlakyStore>) -> Scheduler {
    let lock_manager = Arc::new(LockManager::new(
        Arc::new(InMemoryConnectionFactory::new()),
        LockManagerConfig::default(),
    ));
    Scheduler::new(
        config(),
        SchedulerComponents::new(
            store.clone(),
            Arc::new(MockPublisher::new()),
            Arc::new(MockContentGenerator::new()),
            lock_manager,
        ),
    )
    .unwrap()
}

#[tokio::test]
async fn test_unstored_publication_is_counted_once_written() {
    let store = Arc::new(FlakyStore::new());
    let scheduler = flaky_scheduler(&store);
    let id = store.inner.insert(Task::new("proj", "news", "payload", Utc::now())).await;
    store.update(id, TaskUpdate::start(Utc::now())).await.unwrap();

    store.set_failing(true);
    let execution = TaskExecution::new(id, 50, Utc::now());
    let receipt = crate::store::PublishReceipt {
        id: "post-9".to_string(),
        url: "https://example.test/post-9".to_string(),
    };
    scheduler.inner.record_success(&execution, receipt).await;

    let stats = scheduler.get_stats();
    assert_eq!(stats.successful, 0);
    assert_eq!(stats.published_today, 0);
    assert_eq!(stats.pending_outcomes, 1);
    assert_eq!(store.get_by_id(id).await.unwrap().unwrap().status, TaskStatus::Running);

    // Still failing: the outcome stays pending
    assert_eq!(scheduler.inner.flush_pending_outcomes().await, 0);
    assert_eq!(scheduler.get_stats().pending_outcomes, 1);

    store.set_failing(false);
    assert_eq!(scheduler.inner.flush_pending_outcomes().await, 1);

    let stats = scheduler.get_stats();
    assert_eq!(stats.successful, 1);
    assert_eq!(stats.published_today, 1);
    assert_eq!(stats.pending_outcomes, 0);
    let task = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.published_id.as_deref(), Some("post-9"));
}

#[tokio::test]
async fn test_unstored_retry_is_not_counted_or_requeued() {
    let store = Arc::new(FlakyStore::new());
    let scheduler = flaky_scheduler(&store);
    let id = store.inner.insert(Task::new("proj", "news", "payload", Utc::now())).await;
    store.update(id, TaskUpdate::start(Utc::now())).await.unwrap();

    store.set_failing(true);
    let execution = TaskExecution::new(id, 50, Utc::now());
    scheduler
        .inner
        .record_failure(&execution, anyhow::anyhow!("Rate limit exceeded, 429"), false)
        .await;

    let stats = scheduler.get_stats();
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.queue_size, 0);
    assert_eq!(stats.pending_outcomes, 1);
    assert!(stats.errors_by_category.is_empty());

    store.set_failing(false);
    scheduler.inner.flush_pending_outcomes().await;

    let stats = scheduler.get_stats();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.queue_size, 1);
    assert_eq!(stats.pending_outcomes, 0);
    assert_eq!(stats.errors_by_category.get(&ErrorCategory::RateLimit), Some(&1));
    let task = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Retry);
    assert_eq!(task.retry_count, 1);
}
