use crate::store::types::*;
use anyhow::Result;
use chrono::Duration;

/// Durable storage of publishing tasks.
///
/// The scheduler only depends on this capability contract; callers are expected
/// to wrap every mutating call in a [`crate::lock::LockManager`] transaction.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks matching `filter`, ordered by scheduled time, at most `limit`
    async fn get_ready(&self, filter: &TaskFilter, limit: usize) -> Result<Vec<Task>>;

    async fn get_by_id(&self, id: TaskId) -> Result<Option<Task>>;

    /// Apply a partial update. Returns `false` when the task does not exist.
    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<bool>;

    /// Running tasks whose last update is older than `timeout`
    async fn get_stuck(&self, timeout: Duration) -> Result<Vec<Task>>;

    async fn append_log(&self, entry: TaskLogEntry) -> Result<()>;

    async fn count_by_status(&self, status: TaskStatus) -> Result<usize>;
}

/// Publishing side of the external API
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, content: &str, media_ref: Option<&str>) -> Result<PublishReceipt>;
}

/// Produces the text to publish for a task
#[async_trait::async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, task: &Task) -> Result<GeneratedContent>;
}
