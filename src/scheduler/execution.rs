use crate::classifier::{ErrorClassification, ExecutionError};
use crate::lock::LockType;
use crate::scheduler::core::{PendingOutcome, RunningTask, SchedulerInner, locked};
use crate::scheduler::types::{SchedulerEvent, TaskExecution};
use crate::store::{
    PublishReceipt, TASKS_RESOURCE, Task, TaskId, TaskLogEntry, TaskLogEvent, TaskStatus, TaskUpdate,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

/// What to write for a failed attempt, decided from the stored task
struct FailureDecision {
    attempt: u32,
    classification: ErrorClassification,
    retry_delay: Option<u64>,
    update: TaskUpdate,
    event: TaskLogEvent,
    note: String,
    message: String,
}

impl SchedulerInner {
    /// Claim `execution` in the running map and run it on a worker
    pub(super) fn spawn_execution(self: &Arc<Self>, execution: TaskExecution, permit: OwnedSemaphorePermit) {
        let task_id = execution.task_id;
        self.running.insert(
            task_id,
            RunningTask {
                execution: execution.clone(),
                started_at: Utc::now(),
                deadline: Instant::now() + self.config.task_timeout(),
                abort: None,
            },
        );

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.execute(execution).await;
            drop(permit);
            inner.wake.notify_one();
        });
        if let Some(mut running) = self.running.get_mut(&task_id) {
            running.abort = Some(handle.abort_handle());
        }
    }

    async fn execute(self: &Arc<Self>, execution: TaskExecution) {
        let timeout = self.config.task_timeout();
        match tokio::time::timeout(timeout, self.attempt(&execution)).await {
            Ok(Ok(Some(receipt))) => {
                if self.release_claim(&execution) {
                    self.record_success(&execution, receipt).await;
                } else {
                    warn!(
                        task_id = %execution.task_id,
                        published_id = %receipt.id,
                        "Publication finished after the execution was cancelled"
                    );
                }
            }
            Ok(Ok(None)) => {
                self.release_claim(&execution);
            }
            Ok(Err(e)) => {
                if self.release_claim(&execution) {
                    self.record_failure(&execution, e, false).await;
                }
            }
            Err(_) => {
                if self.release_claim(&execution) {
                    let seconds = self.config.task_timeout_seconds;
                    self.record_failure(&execution, ExecutionError::TaskTimeout { seconds }.into(), true)
                        .await;
                }
            }
        }
    }

    /// Drop the running-map entry of this execution. Only the caller that
    /// gets `true` may report its outcome.
    fn release_claim(&self, execution: &TaskExecution) -> bool {
        self.running
            .remove_if(&execution.task_id, |_, running| {
                running.execution.execution_id == execution.execution_id
            })
            .is_some()
    }

    /// Claim, generate, publish. `Ok(None)` when the task is no longer runnable.
    async fn attempt(&self, execution: &TaskExecution) -> Result<Option<PublishReceipt>> {
        let Some(task) = self.claim(execution).await? else {
            debug!(task_id = %execution.task_id, "Task no longer runnable; skipping");
            return Ok(None);
        };
        self.emit(SchedulerEvent::TaskStarted {
            task_id: task.id,
            execution_id: execution.execution_id,
        });

        let content = self
            .components
            .generator
            .generate(&task)
            .await
            .context("Content generation failed")?;
        let media_ref = content.media_ref.as_deref().or(task.media_ref.as_deref());
        let receipt = self
            .components
            .publisher
            .publish(&content.text, media_ref)
            .await
            .context("Publishing failed")?;
        Ok(Some(receipt))
    }

    /// Move the task to `running` if it is still pending or awaiting retry
    async fn claim(&self, execution: &TaskExecution) -> Result<Option<Task>> {
        let store = &self.components.store;
        let task_id = execution.task_id;
        let execution_id = execution.execution_id;

        self.guarded_write(execution.lock_priority(), || async move {
            let Some(mut task) = store.get_by_id(task_id).await? else {
                return Ok(None);
            };
            if !task.is_runnable() {
                return Ok(None);
            }
            let now = Utc::now();
            let update = TaskUpdate::start(now);
            store.update(task_id, update.clone()).await?;
            store
                .append_log(TaskLogEntry::new(
                    task_id,
                    TaskLogEvent::Started,
                    format!("Execution {execution_id} started (attempt {})", task.retry_count + 1),
                ))
                .await?;
            task.apply(&update, now);
            Ok(Some(task))
        })
        .await
    }

    /// Store a successful publication, then count it. A failed write is kept
    /// as a pending outcome so the task is not left `running`.
    pub(super) async fn record_success(&self, execution: &TaskExecution, receipt: PublishReceipt) {
        let store = &self.components.store;
        let task_id = execution.task_id;
        let receipt_ref = &receipt;

        let written = self
            .guarded_write(execution.lock_priority(), || async move {
                let Some(task) = store.get_by_id(task_id).await? else {
                    return Ok(false);
                };
                if task.status == TaskStatus::Completed {
                    return Ok(false);
                }
                let update = TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    published_id: Some(receipt_ref.id.clone()),
                    published_url: Some(receipt_ref.url.clone()),
                    last_error: Some(None),
                    error_category: Some(None),
                    ..Default::default()
                };
                store.update(task_id, update).await?;
                store
                    .append_log(TaskLogEntry::new(
                        task_id,
                        TaskLogEvent::Completed,
                        format!("Published as {} ({})", receipt_ref.id, receipt_ref.url),
                    ))
                    .await?;
                Ok(true)
            })
            .await;

        match written {
            Ok(true) => {
                self.counters.successful.fetch_add(1, Ordering::SeqCst);
                self.record_publication();
                info!(
                    task_id = %task_id,
                    published_id = %receipt.id,
                    url = %receipt.url,
                    "Task published"
                );
                self.emit(SchedulerEvent::TaskCompleted { task_id, receipt });
            }
            Ok(false) => {
                debug!(task_id = %task_id, "Task already completed or gone; publication not recorded again");
            }
            Err(e) => {
                error!(
                    task_id = %task_id,
                    published_id = %receipt.id,
                    error = %format!("{e:#}"),
                    "Failed to record publication; will retry"
                );
                self.pending_outcomes.insert(
                    task_id,
                    PendingOutcome::Published {
                        execution: execution.clone(),
                        receipt,
                    },
                );
            }
        }
    }

    /// Classify a failed attempt and either schedule a retry or fail the task.
    ///
    /// The decision is made inside the write transaction from the stored task:
    /// a task that is neither `running` nor runnable already has an outcome
    /// and is left alone.
    pub(super) async fn record_failure(&self, execution: &TaskExecution, error: anyhow::Error, timed_out: bool) {
        let store = &self.components.store;
        let task_id = execution.task_id;
        let error_ref = &error;
        let timeout_note = format!(
            "Execution exceeded {}s and was cancelled",
            self.config.task_timeout_seconds
        );
        let timeout_ref = &timeout_note;

        let written = self
            .guarded_write(execution.lock_priority(), || async move {
                let Some(task) = store.get_by_id(task_id).await? else {
                    return Ok(None);
                };
                if task.status != TaskStatus::Running && !task.is_runnable() {
                    return Ok(None);
                }
                let decision = self.decide_failure(&task, error_ref);
                if timed_out {
                    store
                        .append_log(TaskLogEntry::new(task_id, TaskLogEvent::TimedOut, timeout_ref.clone()))
                        .await?;
                }
                store.update(task_id, decision.update.clone()).await?;
                store
                    .append_log(TaskLogEntry::new(task_id, decision.event, decision.note.clone()))
                    .await?;
                Ok(Some(decision))
            })
            .await;

        let decision = match written {
            Ok(Some(decision)) => decision,
            Ok(None) => {
                debug!(
                    task_id = %task_id,
                    execution_id = %execution.execution_id,
                    error = %format!("{error:#}"),
                    "Task already settled; failure not recorded"
                );
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %format!("{e:#}"), "Failed to record task failure; will retry");
                self.pending_outcomes.insert(
                    task_id,
                    PendingOutcome::Failed {
                        execution: execution.clone(),
                        error,
                        timed_out,
                    },
                );
                return;
            }
        };

        let FailureDecision {
            attempt,
            classification,
            retry_delay,
            update,
            message,
            ..
        } = decision;
        let category = classification.category;

        *locked(&self.errors_by_category).entry(category).or_default() += 1;
        if timed_out {
            self.counters.timed_out.fetch_add(1, Ordering::SeqCst);
            self.emit(SchedulerEvent::TaskTimedOut {
                task_id,
                timeout_seconds: self.config.task_timeout_seconds,
            });
        }

        match retry_delay {
            Some(delay) => {
                self.counters.retried.fetch_add(1, Ordering::SeqCst);
                warn!(
                    task_id = %task_id,
                    category = %category,
                    attempt,
                    delay_secs = delay,
                    "Task failed; retry scheduled"
                );
                if let Some(next) = update.scheduled_time {
                    locked(&self.queue).push(execution.retry(attempt, next, message));
                    self.wake.notify_one();
                }
                self.emit(SchedulerEvent::RetryScheduled {
                    task_id,
                    attempt,
                    category,
                    delay_seconds: delay,
                });
            }
            None => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    task_id = %task_id,
                    category = %category,
                    attempt,
                    needs_human_intervention = classification.needs_human_intervention,
                    "Task failed permanently"
                );
                self.emit(SchedulerEvent::TaskFailed {
                    task_id,
                    category,
                    needs_human_intervention: classification.needs_human_intervention,
                });
            }
        }
    }

    fn decide_failure(&self, task: &Task, error: &anyhow::Error) -> FailureDecision {
        let attempt = task.retry_count + 1;
        let mut classification = self.components.classifier.classify(error, attempt);
        if attempt > self.config.max_retries {
            classification.should_retry = false;
            classification.retry_delay_seconds = None;
        }
        let category = classification.category;
        let message = format!("{error:#}");
        let retry_delay = classification
            .retry_delay_seconds
            .filter(|_| classification.should_retry);

        let (update, event, note) = match retry_delay {
            Some(delay) => (
                TaskUpdate {
                    status: Some(TaskStatus::Retry),
                    scheduled_time: Some(Utc::now() + chrono::Duration::seconds(delay as i64)),
                    retry_count: Some(attempt),
                    started_at: Some(None),
                    last_error: Some(Some(message.clone())),
                    error_category: Some(Some(category.to_string())),
                    ..Default::default()
                },
                TaskLogEvent::RetryScheduled,
                format!("Retry {attempt} in {delay}s after {category} error: {message}"),
            ),
            None => (
                TaskUpdate {
                    status: Some(TaskStatus::Failed),
                    started_at: Some(None),
                    last_error: Some(Some(message.clone())),
                    error_category: Some(Some(category.to_string())),
                    needs_human_intervention: Some(classification.needs_human_intervention),
                    ..Default::default()
                },
                TaskLogEvent::Failed,
                if classification.needs_human_intervention {
                    format!("Needs human intervention ({category}): {message}")
                } else {
                    format!("Failed permanently after attempt {attempt} ({category}): {message}")
                },
            ),
        };

        FailureDecision {
            attempt,
            classification,
            retry_delay,
            update,
            event,
            note,
            message,
        }
    }

    /// Retry outcome writes that failed earlier. Counters move only once a
    /// write lands.
    pub(super) async fn flush_pending_outcomes(&self) -> usize {
        let task_ids: Vec<TaskId> = self.pending_outcomes.iter().map(|entry| *entry.key()).collect();
        let mut flushed = 0;
        for task_id in task_ids {
            let Some((_, outcome)) = self.pending_outcomes.remove(&task_id) else {
                continue;
            };
            match outcome {
                PendingOutcome::Published { execution, receipt } => {
                    self.record_success(&execution, receipt).await;
                }
                PendingOutcome::Failed {
                    execution,
                    error,
                    timed_out,
                } => {
                    self.record_failure(&execution, error, timed_out).await;
                }
            }
            if !self.pending_outcomes.contains_key(&task_id) {
                flushed += 1;
            }
        }
        if flushed > 0 {
            info!(flushed, "Recorded pending task outcomes");
        }
        flushed
    }

    /// Force-cancel executions running past their deadline
    pub(super) fn sweep_timeouts(self: &Arc<Self>) {
        let now = Instant::now();
        let expired: Vec<(TaskId, uuid::Uuid)> = self
            .running
            .iter()
            .filter(|running| running.deadline <= now)
            .map(|running| (*running.key(), running.execution.execution_id))
            .collect();

        for (task_id, execution_id) in expired {
            let Some((_, running)) = self
                .running
                .remove_if(&task_id, |_, r| r.execution.execution_id == execution_id)
            else {
                continue;
            };
            if let Some(abort) = &running.abort {
                abort.abort();
            }
            warn!(
                task_id = %task_id,
                started_at = %running.started_at,
                "Force-cancelling execution past its deadline"
            );

            let inner = Arc::clone(self);
            let seconds = self.config.task_timeout_seconds;
            tokio::spawn(async move {
                inner
                    .record_failure(&running.execution, ExecutionError::TaskTimeout { seconds }.into(), true)
                    .await;
                inner.wake.notify_one();
            });
        }
    }

    /// Wait for in-flight work up to the grace period, then cancel the rest.
    /// Returns how many executions were cancelled.
    pub(super) async fn drain_workers(&self) -> usize {
        let grace = self.config.shutdown_grace();
        let all = self.config.max_workers as u32;
        match tokio::time::timeout(grace, self.workers.acquire_many(all)).await {
            Ok(Ok(permits)) => drop(permits),
            _ => warn!(
                running = self.running.len(),
                grace_secs = grace.as_secs(),
                "Grace period elapsed with executions in flight"
            ),
        }
        self.cancel_running().await
    }

    async fn cancel_running(&self) -> usize {
        let claimed: Vec<TaskId> = self.running.iter().map(|running| *running.key()).collect();
        let store = &self.components.store;
        let mut cancelled = 0;

        for task_id in claimed {
            let Some((_, running)) = self.running.remove(&task_id) else {
                continue;
            };
            if let Some(abort) = &running.abort {
                abort.abort();
            }
            cancelled += 1;

            let reset = self
                .guarded_write(running.execution.lock_priority(), || async move {
                    let Some(task) = store.get_by_id(task_id).await? else {
                        return Ok(false);
                    };
                    if task.status != TaskStatus::Running {
                        return Ok(false);
                    }
                    store.update(task_id, TaskUpdate::reset_to_pending()).await?;
                    store
                        .append_log(TaskLogEntry::new(
                            task_id,
                            TaskLogEvent::Cancelled,
                            "Execution cancelled at shutdown; task reset to pending",
                        ))
                        .await?;
                    Ok(true)
                })
                .await;
            match reset {
                Ok(true) => info!(task_id = %task_id, "Cancelled execution reset to pending"),
                Ok(false) => debug!(task_id = %task_id, "Cancelled execution had not started"),
                Err(e) => error!(task_id = %task_id, error = %format!("{e:#}"), "Failed to reset cancelled task"),
            }
        }
        cancelled
    }

    /// Run `op` in an exclusive transaction on the task table, retrying on
    /// lock contention
    async fn guarded_write<T, F, Fut>(&self, priority: u8, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let manager = self.components.lock_manager.as_ref();
        let op = &op;
        manager
            .execute_with_retry(
                || manager.transaction(TASKS_RESOURCE, LockType::Exclusive, priority, op),
                manager.config().max_retries,
            )
            .await
    }
}
