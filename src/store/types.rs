use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for publishing tasks
pub type TaskId = Uuid;

/// Identifier of the project a task belongs to
pub type ProjectId = String;

/// Lock resource guarding every write to the task table
pub const TASKS_RESOURCE: &str = "tasks";

/// Publishing task as owned by the task store
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    /// Project importance, 1 (lowest) to 5 (highest)
    pub project_priority: u8,
    pub content_type: String,
    pub payload_ref: String,
    pub media_ref: Option<String>,
    pub status: TaskStatus,
    pub scheduled_time: DateTime<Utc>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_category: Option<String>,
    pub needs_human_intervention: bool,
    pub published_id: Option<String>,
    pub published_url: Option<String>,
}

/// Lifecycle state of a task
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Retry,
    Completed,
    Failed,
    Cancelled,
}

/// Partial update applied by [`crate::store::TaskStore::update`].
///
/// Only fields set to `Some` are written; `updated_at` is stamped by the store.
/// Nested options (`Option<Option<_>>`) distinguish "leave as is" from "clear".
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
    pub error_category: Option<Option<String>>,
    pub needs_human_intervention: Option<bool>,
    pub published_id: Option<String>,
    pub published_url: Option<String>,
}

/// Selection criteria for ready tasks
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskFilter {
    pub project_id: Option<ProjectId>,
    pub statuses: Vec<TaskStatus>,
    /// Only tasks scheduled at or before this instant
    pub due_before: Option<DateTime<Utc>>,
}

/// Kinds of events recorded in the task log
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskLogEvent {
    Started,
    Completed,
    RetryScheduled,
    Failed,
    TimedOut,
    StuckRecovered,
    Cancelled,
}

/// Append-only record of something that happened to a task
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskLogEntry {
    pub task_id: TaskId,
    pub event: TaskLogEvent,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Identifiers returned by the publishing API
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub id: String,
    pub url: String,
}

/// Content produced for a task right before publishing
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GeneratedContent {
    pub text: String,
    pub media_ref: Option<String>,
}

impl Task {
    /// Create a pending task scheduled at the given time
    pub fn new(
        project_id: impl Into<ProjectId>,
        content_type: impl Into<String>,
        payload_ref: impl Into<String>,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            project_priority: 3,
            content_type: content_type.into(),
            payload_ref: payload_ref.into(),
            media_ref: None,
            status: TaskStatus::Pending,
            scheduled_time,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            last_error: None,
            error_category: None,
            needs_human_intervention: false,
            published_id: None,
            published_url: None,
        }
    }

    pub fn with_project_priority(mut self, priority: u8) -> Self {
        self.project_priority = priority.clamp(1, 5);
        self
    }

    pub fn with_media(mut self, media_ref: impl Into<String>) -> Self {
        self.media_ref = Some(media_ref.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Whether the scheduler may pick this task up
    pub fn is_runnable(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Retry)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// How long the task has been waiting past its scheduled time
    pub fn overdue_by(&self, now: DateTime<Utc>) -> Duration {
        (now - self.scheduled_time).max(Duration::zero())
    }

    /// Apply a partial update, stamping `updated_at`
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(scheduled_time) = update.scheduled_time {
            self.scheduled_time = scheduled_time;
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(started_at) = update.started_at {
            self.started_at = started_at;
        }
        if let Some(ref last_error) = update.last_error {
            self.last_error = last_error.clone();
        }
        if let Some(ref error_category) = update.error_category {
            self.error_category = error_category.clone();
        }
        if let Some(flag) = update.needs_human_intervention {
            self.needs_human_intervention = flag;
        }
        if let Some(ref id) = update.published_id {
            self.published_id = Some(id.clone());
        }
        if let Some(ref url) = update.published_url {
            self.published_url = Some(url.clone());
        }
        self.updated_at = now;
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retry => "retry",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Move a task into the running state
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            started_at: Some(Some(now)),
            ..Default::default()
        }
    }

    /// Put a task back into the pending state, clearing its start marker
    pub fn reset_to_pending() -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            started_at: Some(None),
            ..Default::default()
        }
    }
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            project_id: None,
            statuses: vec![TaskStatus::Pending, TaskStatus::Retry],
            due_before: None,
        }
    }
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ref project) = self.project_id
            && &task.project_id != project
        {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        match self.due_before {
            Some(due) => task.scheduled_time <= due,
            None => true,
        }
    }
}

impl TaskLogEntry {
    pub fn new(task_id: TaskId, event: TaskLogEvent, message: impl Into<String>) -> Self {
        Self {
            task_id,
            event,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
