//! In-memory collaborators used by the CLI and the test suites.

use crate::lock::{ConnectionFactory, DatastoreConnection, DatastoreError};
use crate::store::traits::*;
use crate::store::types::*;
use anyhow::{Result, anyhow};
use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Task store kept entirely in process memory
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    log: Mutex<Vec<TaskLogEntry>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task: Task) -> TaskId {
        let id = task.id;
        self.tasks.write().await.insert(id, task);
        id
    }

    pub async fn insert_all(&self, tasks: Vec<Task>) -> Vec<TaskId> {
        let mut guard = self.tasks.write().await;
        tasks
            .into_iter()
            .map(|task| {
                let id = task.id;
                guard.insert(id, task);
                id
            })
            .collect()
    }

    pub async fn all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|task| task.scheduled_time);
        tasks
    }

    pub async fn log_entries(&self) -> Vec<TaskLogEntry> {
        self.log.lock().await.clone()
    }

    pub async fn log_entries_for(&self, id: TaskId) -> Vec<TaskLogEntry> {
        self.log
            .lock()
            .await
            .iter()
            .filter(|entry| entry.task_id == id)
            .cloned()
            .collect()
    }

    /// Overwrite `updated_at`, for simulating stale records
    pub async fn backdate(&self, id: TaskId, by: Duration) -> bool {
        match self.tasks.write().await.get_mut(&id) {
            Some(task) => {
                task.updated_at -= by;
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_ready(&self, filter: &TaskFilter, limit: usize) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut ready: Vec<Task> = tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            a.scheduled_time
                .cmp(&b.scheduled_time)
                .then_with(|| b.project_priority.cmp(&a.project_priority))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    async fn get_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) => {
                task.apply(&update, Utc::now());
                debug!(task_id = %id, status = %task.status, "Task updated");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_stuck(&self, timeout: Duration) -> Result<Vec<Task>> {
        let cutoff = Utc::now() - timeout;
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|task| task.status == TaskStatus::Running && task.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: TaskLogEntry) -> Result<()> {
        self.log.lock().await.push(entry);
        Ok(())
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<usize> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|task| task.status == status)
            .count())
    }
}

/// Publisher that records what it was asked to publish.
///
/// Failures can be scripted with [`MockPublisher::fail_next`]; each scripted
/// message is returned once, in order.
#[derive(Default)]
pub struct MockPublisher {
    delay: std::time::Duration,
    failures: Mutex<VecDeque<String>>,
    permanent_failure: Option<String>,
    published: Mutex<Vec<(String, Option<String>)>>,
    calls: AtomicUsize,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn always_failing(mut self, message: impl Into<String>) -> Self {
        self.permanent_failure = Some(message.into());
        self
    }

    pub async fn fail_next(&self, message: impl Into<String>) {
        self.failures.lock().await.push_back(message.into());
    }

    pub async fn published(&self) -> Vec<(String, Option<String>)> {
        self.published.lock().await.clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, content: &str, media_ref: Option<&str>) -> Result<PublishReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(ref message) = self.permanent_failure {
            return Err(anyhow!(message.clone()));
        }
        if let Some(message) = self.failures.lock().await.pop_front() {
            return Err(anyhow!(message));
        }

        let id = Uuid::new_v4().simple().to_string();
        self.published
            .lock()
            .await
            .push((content.to_string(), media_ref.map(str::to_string)));
        Ok(PublishReceipt {
            url: format!("https://example.invalid/posts/{id}"),
            id,
        })
    }
}

/// Content generator that derives text from the task payload reference
#[derive(Default)]
pub struct MockContentGenerator {
    failure: Option<String>,
}

impl MockContentGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
        }
    }
}

#[async_trait::async_trait]
impl ContentGenerator for MockContentGenerator {
    async fn generate(&self, task: &Task) -> Result<GeneratedContent> {
        if let Some(ref message) = self.failure {
            return Err(anyhow!(message.clone()));
        }
        Ok(GeneratedContent {
            text: format!("{} [{}]", task.payload_ref, task.content_type),
            media_ref: task.media_ref.clone(),
        })
    }
}

/// Connection factory producing in-process connection handles.
///
/// Connections are healthy while the factory generation they were created in
/// is current; [`InMemoryConnectionFactory::invalidate_existing`] bumps it.
#[derive(Default)]
pub struct InMemoryConnectionFactory {
    generation: Arc<AtomicU64>,
    created: AtomicU64,
}

pub struct InMemoryConnection {
    id: u64,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    in_transaction: bool,
}

impl InMemoryConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Mark every connection created so far as unhealthy
    pub fn invalidate_existing(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for InMemoryConnectionFactory {
    async fn connect(&self) -> std::result::Result<Box<dyn DatastoreConnection>, DatastoreError> {
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(InMemoryConnection {
            id,
            generation: self.generation.load(Ordering::SeqCst),
            current_generation: Arc::clone(&self.generation),
            in_transaction: false,
        }))
    }
}

#[async_trait::async_trait]
impl DatastoreConnection for InMemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn is_healthy(&self) -> bool {
        self.generation == self.current_generation.load(Ordering::SeqCst)
    }

    async fn begin(&mut self) -> std::result::Result<(), DatastoreError> {
        if self.in_transaction {
            return Err(DatastoreError::Connection(format!(
                "connection {} already has an open transaction",
                self.id
            )));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> std::result::Result<(), DatastoreError> {
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> std::result::Result<(), DatastoreError> {
        self.in_transaction = false;
        Ok(())
    }
}
