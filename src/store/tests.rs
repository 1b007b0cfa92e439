use super::*;
use chrono::{Duration, Utc};

fn pending_task(minutes_from_now: i64) -> Task {
    Task::new(
        "launch",
        "announcement",
        "payload://launch-post",
        Utc::now() + Duration::minutes(minutes_from_now),
    )
}

#[tokio::test]
async fn test_get_ready_orders_by_schedule_and_respects_limit() {
    let store = InMemoryTaskStore::new();
    let late = store.insert(pending_task(30)).await;
    let early = store.insert(pending_task(-10)).await;
    store.insert(pending_task(60)).await;

    let ready = store.get_ready(&TaskFilter::default(), 2).await.unwrap();
    assert_eq!(ready.len(), 2);
    assert_eq!(ready[0].id, early);
    assert_eq!(ready[1].id, late);
}

#[tokio::test]
async fn test_filter_excludes_other_projects_and_future_tasks() {
    let store = InMemoryTaskStore::new();
    let due = store.insert(pending_task(-5)).await;
    store.insert(pending_task(120)).await;
    let mut other = pending_task(-5);
    other.project_id = "other".to_string();
    store.insert(other).await;

    let filter = TaskFilter {
        project_id: Some("launch".to_string()),
        due_before: Some(Utc::now()),
        ..Default::default()
    };
    let ready = store.get_ready(&filter, 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, due);
}

#[tokio::test]
async fn test_update_applies_only_set_fields() {
    let store = InMemoryTaskStore::new();
    let id = store.insert(pending_task(0)).await;

    let applied = store
        .update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Retry),
                retry_count: Some(1),
                last_error: Some(Some("boom".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(applied);

    let task = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Retry);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.last_error.as_deref(), Some("boom"));
    assert_eq!(task.content_type, "announcement");

    let missing = store
        .update(uuid::Uuid::new_v4(), TaskUpdate::status(TaskStatus::Failed))
        .await
        .unwrap();
    assert!(!missing);
}

#[tokio::test]
async fn test_get_stuck_only_returns_stale_running_tasks() {
    let store = InMemoryTaskStore::new();
    let stale = store.insert(pending_task(-30)).await;
    let fresh = store.insert(pending_task(-30)).await;
    store.update(stale, TaskUpdate::start(Utc::now())).await.unwrap();
    store.update(fresh, TaskUpdate::start(Utc::now())).await.unwrap();
    store.backdate(stale, Duration::minutes(45)).await;

    let stuck = store.get_stuck(Duration::minutes(30)).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, stale);
}

#[tokio::test]
async fn test_mock_publisher_scripted_failures() {
    let publisher = MockPublisher::new();
    publisher.fail_next("Rate limit exceeded, 429").await;

    let first = publisher.publish("hello", None).await;
    assert!(first.is_err());
    let second = publisher.publish("hello", Some("media://1")).await.unwrap();
    assert!(second.url.ends_with(&second.id));
    assert_eq!(publisher.call_count(), 2);
    assert_eq!(publisher.published().await.len(), 1);
}

#[test]
fn test_status_helpers() {
    let task = pending_task(0).with_project_priority(9);
    assert_eq!(task.project_priority, 5);
    assert!(task.is_runnable());
    assert!(!task.is_terminal());
    assert!(TaskStatus::Cancelled.is_terminal());
    assert_eq!(TaskStatus::Retry.to_string(), "retry");
}
