use crate::classifier::ErrorCategory;
use crate::store::{PublishReceipt, TaskId};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scheduler configuration (`[scheduler]` in the config file)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent executions
    pub max_workers: usize,
    /// Tasks pulled from the store per batch admission
    pub batch_size: usize,
    pub check_interval_seconds: u64,
    /// Global retry cap applied on top of each error category's own cap
    pub max_retries: u32,
    pub task_timeout_seconds: u64,
    pub stuck_task_timeout_seconds: u64,
    /// Warn at day rollover when fewer tasks were published
    pub daily_min_tasks: u32,
    /// Stop admitting work once this many tasks were published today (0 = no cap)
    pub daily_max_tasks: u32,
    /// Run batch admission when the queue holds fewer entries than this
    pub low_water_mark: usize,
    /// Admit tasks due within this many minutes from now
    pub lookahead_minutes: i64,
    pub shutdown_grace_seconds: u64,
    /// Nudge priorities by publish-time desirability
    pub use_timing_adjustment: bool,
    /// Only admit tasks of this project
    pub project_id: Option<String>,
}

/// One queued attempt at running a task
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskExecution {
    pub execution_id: Uuid,
    pub task_id: TaskId,
    /// Queue priority, 1 (most urgent) to 100
    pub priority: u32,
    pub scheduled_time: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Outcome of a batch admission pass
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResult {
    pub scheduled_count: usize,
    /// Pending and retry tasks in the store after admission
    pub total_pending: usize,
    pub daily_cap_reached: bool,
}

/// Aggregate scheduler statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub queue_size: usize,
    pub running_count: usize,
    /// Outcomes known to the scheduler but not yet stored
    pub pending_outcomes: usize,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
    pub timed_out: u64,
    pub uptime_seconds: u64,
    pub published_today: u32,
    pub errors_by_category: HashMap<ErrorCategory, u64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,
    #[error("Scheduler was stopped and cannot be restarted")]
    Stopped,
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

/// Lifecycle of a [`crate::scheduler::Scheduler`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Publications counted for one UTC day
#[derive(Clone, Debug)]
pub(crate) struct DailyCounter {
    pub day: NaiveDate,
    pub published: u32,
}

/// Events emitted while tasks move through the scheduler
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskStarted {
        task_id: TaskId,
        execution_id: Uuid,
    },
    TaskCompleted {
        task_id: TaskId,
        receipt: PublishReceipt,
    },
    RetryScheduled {
        task_id: TaskId,
        attempt: u32,
        category: ErrorCategory,
        delay_seconds: u64,
    },
    TaskFailed {
        task_id: TaskId,
        category: ErrorCategory,
        needs_human_intervention: bool,
    },
    TaskTimedOut {
        task_id: TaskId,
        timeout_seconds: u64,
    },
    BatchScheduled {
        scheduled: usize,
        total_pending: usize,
    },
    DailyMinimumMissed {
        day: NaiveDate,
        published: u32,
        minimum: u32,
    },
}

/// Handler for scheduler events
pub trait SchedulerEventHandler: Send + Sync {
    fn handle_event(&self, event: &SchedulerEvent) -> Result<()>;
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds.max(1))
    }

    pub fn stuck_task_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_task_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.stuck_task_timeout_seconds <= self.task_timeout_seconds {
            return Err(SchedulerError::InvalidConfig(format!(
                "stuck_task_timeout_seconds ({}) must exceed task_timeout_seconds ({})",
                self.stuck_task_timeout_seconds, self.task_timeout_seconds
            )));
        }
        if self.daily_max_tasks > 0 && self.daily_min_tasks > self.daily_max_tasks {
            return Err(SchedulerError::InvalidConfig(format!(
                "daily_min_tasks ({}) exceeds daily_max_tasks ({})",
                self.daily_min_tasks, self.daily_max_tasks
            )));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            batch_size: 10,
            check_interval_seconds: 30,
            max_retries: 3,
            task_timeout_seconds: 300,
            stuck_task_timeout_seconds: 900,
            daily_min_tasks: 0,
            daily_max_tasks: 50,
            low_water_mark: 5,
            lookahead_minutes: 60,
            shutdown_grace_seconds: 30,
            use_timing_adjustment: false,
            project_id: None,
        }
    }
}

impl TaskExecution {
    pub fn new(task_id: TaskId, priority: u32, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            task_id,
            priority: priority.clamp(1, 100),
            scheduled_time,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Follow-up execution for the next retry
    pub fn retry(&self, retry_count: u32, scheduled_time: DateTime<Utc>, error: String) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            task_id: self.task_id,
            priority: self.priority,
            scheduled_time,
            retry_count,
            last_error: Some(error),
        }
    }

    /// Lock priority for writes made on behalf of this execution.
    /// Urgent work (low queue value) wins lock contention and deadlocks.
    pub fn lock_priority(&self) -> u8 {
        (101 - self.priority.clamp(1, 100)) as u8
    }
}

impl DailyCounter {
    pub fn new(day: NaiveDate) -> Self {
        Self { day, published: 0 }
    }
}

impl SchedulerEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &SchedulerEvent) -> Result<()> {
        match event {
            SchedulerEvent::TaskStarted {
                task_id,
                execution_id,
            } => {
                debug!("Task started: {} (execution {})", task_id, execution_id);
            }
            SchedulerEvent::TaskCompleted { task_id, receipt } => {
                info!("Task published: {} -> {}", task_id, receipt.url);
            }
            SchedulerEvent::RetryScheduled {
                task_id,
                attempt,
                category,
                delay_seconds,
            } => {
                info!(
                    "Task {} retry {} scheduled in {}s ({})",
                    task_id, attempt, delay_seconds, category
                );
            }
            SchedulerEvent::TaskFailed {
                task_id,
                category,
                needs_human_intervention,
            } => {
                warn!(
                    "Task failed: {} ({}, human intervention: {})",
                    task_id, category, needs_human_intervention
                );
            }
            SchedulerEvent::TaskTimedOut {
                task_id,
                timeout_seconds,
            } => {
                warn!("Task {} exceeded {}s timeout", task_id, timeout_seconds);
            }
            SchedulerEvent::BatchScheduled {
                scheduled,
                total_pending,
            } => {
                debug!("Batch admitted {} tasks ({} pending)", scheduled, total_pending);
            }
            SchedulerEvent::DailyMinimumMissed {
                day,
                published,
                minimum,
            } => {
                warn!(
                    "Published {} tasks on {}, below the daily minimum of {}",
                    published, day, minimum
                );
            }
        }
        Ok(())
    }
}
