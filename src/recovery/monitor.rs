use crate::lock::{LockManager, LockType};
use crate::store::{TASKS_RESOURCE, TaskLogEntry, TaskLogEvent, TaskStatus, TaskStore, TaskUpdate};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lock priority used for recovery writes; below urgent publishing work
const RECOVERY_LOCK_PRIORITY: u8 = 40;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// A running task whose last update is older than this is stuck
    pub stuck_timeout: Duration,
    pub check_interval: Duration,
}

/// Outcome of one recovery sweep
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub recovered: Vec<Uuid>,
    /// Tasks that moved on (finished or refreshed) before they could be reset
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Periodically returns tasks stuck in `running` to `pending`.
///
/// Every reset re-reads the task inside an exclusive transaction on the task
/// table and only applies when the task is still running and still stale, so
/// repeated or concurrent sweeps are harmless.
pub struct StuckTaskRecovery {
    store: Arc<dyn TaskStore>,
    lock_manager: Arc<LockManager>,
    config: RecoveryConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stuck_timeout: Duration::from_secs(900),
            check_interval: Duration::from_secs(60),
        }
    }
}

impl RecoveryReport {
    pub fn recovered_count(&self) -> usize {
        self.recovered.len()
    }
}

impl StuckTaskRecovery {
    pub fn new(store: Arc<dyn TaskStore>, lock_manager: Arc<LockManager>, config: RecoveryConfig) -> Self {
        Self {
            store,
            lock_manager,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run a single sweep
    pub async fn recover_once(&self) -> Result<RecoveryReport> {
        let threshold = chrono::Duration::from_std(self.config.stuck_timeout)
            .context("Stuck timeout out of range")?;
        let stuck = self
            .store
            .get_stuck(threshold)
            .await
            .context("Failed to query stuck tasks")?;

        let mut report = RecoveryReport {
            scanned: stuck.len(),
            ..Default::default()
        };

        for task in stuck {
            match self.recover_task(task.id, threshold).await {
                Ok(true) => {
                    info!(
                        task_id = %task.id,
                        started_at = ?task.started_at,
                        updated_at = %task.updated_at,
                        "Recovered stuck task"
                    );
                    report.recovered.push(task.id);
                }
                Ok(false) => {
                    debug!(task_id = %task.id, "Stuck candidate changed before recovery");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to recover stuck task");
                    report.errors.push(format!("{}: {:#}", task.id, e));
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                recovered = report.recovered.len(),
                skipped = report.skipped,
                errors = report.errors.len(),
                "Stuck task sweep finished"
            );
        }
        Ok(report)
    }

    async fn recover_task(&self, id: Uuid, threshold: chrono::Duration) -> Result<bool> {
        let manager = self.lock_manager.as_ref();
        let store = &self.store;

        manager
            .execute_with_retry(
                || async move {
                    manager
                        .transaction(TASKS_RESOURCE, LockType::Exclusive, RECOVERY_LOCK_PRIORITY, || async move {
                            let Some(task) = store.get_by_id(id).await? else {
                                return Ok(false);
                            };
                            if task.status != TaskStatus::Running
                                || task.updated_at >= Utc::now() - threshold
                            {
                                return Ok(false);
                            }

                            store.update(id, TaskUpdate::reset_to_pending()).await?;
                            store
                                .append_log(TaskLogEntry::new(
                                    id,
                                    TaskLogEvent::StuckRecovered,
                                    format!(
                                        "Reset to pending after no progress since {}",
                                        task.updated_at.to_rfc3339()
                                    ),
                                ))
                                .await?;
                            Ok(true)
                        })
                        .await
                },
                manager.config().max_retries,
            )
            .await
    }

    /// Sweep every `check_interval` until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            stuck_timeout_secs = self.config.stuck_timeout.as_secs(),
            interval_secs = self.config.check_interval.as_secs(),
            "Stuck task recovery started"
        );
        let mut interval = tokio::time::interval(self.config.check_interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.recover_once().await {
                        error!(error = %e, "Stuck task sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Stuck task recovery stopped");
    }
}
