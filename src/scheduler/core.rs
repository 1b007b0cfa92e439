use crate::classifier::{ErrorCategory, ErrorClassifier};
use crate::lock::LockManager;
use crate::priority::{PriorityCalculator, PriorityScore};
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::types::*;
use crate::store::{ContentGenerator, PublishReceipt, Publisher, Task, TaskFilter, TaskId, TaskStatus, TaskStore};
use crate::timing::TimingPredictor;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

pub(super) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collaborators and helpers the scheduler runs with
pub struct SchedulerComponents {
    pub store: Arc<dyn TaskStore>,
    pub publisher: Arc<dyn Publisher>,
    pub generator: Arc<dyn ContentGenerator>,
    pub lock_manager: Arc<LockManager>,
    pub classifier: ErrorClassifier,
    pub priority: PriorityCalculator,
    /// Used only when `use_timing_adjustment` is enabled
    pub timing: Option<TimingPredictor>,
    pub event_handlers: Vec<Box<dyn SchedulerEventHandler>>,
}

/// Priority-driven publishing scheduler with a bounded worker pool.
///
/// [`Scheduler::start`] spawns a scheduling loop, which admits work from the
/// store and dispatches due executions, and a monitoring loop for daily
/// bookkeeping. Every store write goes through the lock manager.
pub struct Scheduler {
    pub(super) inner: Arc<SchedulerInner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

pub(super) struct SchedulerInner {
    pub(super) config: SchedulerConfig,
    pub(super) components: SchedulerComponents,
    pub(super) queue: Mutex<TaskQueue>,
    /// Claimed executions. Removing an entry is what entitles the remover to
    /// report the outcome.
    pub(super) running: DashMap<TaskId, RunningTask>,
    /// Outcomes whose store write failed, retried by the monitoring loop
    pub(super) pending_outcomes: DashMap<TaskId, PendingOutcome>,
    pub(super) workers: Arc<Semaphore>,
    pub(super) wake: Notify,
    shutdown: watch::Sender<bool>,
    state: Mutex<RunState>,
    started_at: Mutex<Option<Instant>>,
    pub(super) counters: Counters,
    pub(super) errors_by_category: Mutex<HashMap<ErrorCategory, u64>>,
    daily: Mutex<DailyCounter>,
}

pub(super) struct RunningTask {
    pub execution: TaskExecution,
    pub started_at: DateTime<Utc>,
    pub deadline: Instant,
    pub abort: Option<AbortHandle>,
}

pub(super) enum PendingOutcome {
    Published {
        execution: TaskExecution,
        receipt: PublishReceipt,
    },
    Failed {
        execution: TaskExecution,
        error: anyhow::Error,
        timed_out: bool,
    },
}

#[derive(Default)]
pub(super) struct Counters {
    pub successful: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub timed_out: AtomicU64,
}

impl SchedulerComponents {
    /// Components with default classifier and priority weights, and no
    /// timing adjustment
    pub fn new(
        store: Arc<dyn TaskStore>,
        publisher: Arc<dyn Publisher>,
        generator: Arc<dyn ContentGenerator>,
        lock_manager: Arc<LockManager>,
    ) -> Self {
        Self {
            store,
            publisher,
            generator,
            lock_manager,
            classifier: ErrorClassifier::default(),
            priority: PriorityCalculator::default(),
            timing: None,
            event_handlers: Vec::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_priority(mut self, priority: PriorityCalculator) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timing(mut self, timing: TimingPredictor) -> Self {
        self.timing = Some(timing);
        self
    }

    pub fn with_event_handler(mut self, handler: Box<dyn SchedulerEventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, components: SchedulerComponents) -> Result<Self, SchedulerError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let inner = SchedulerInner {
            workers: Arc::new(Semaphore::new(config.max_workers)),
            queue: Mutex::new(TaskQueue::new()),
            running: DashMap::new(),
            pending_outcomes: DashMap::new(),
            wake: Notify::new(),
            shutdown,
            state: Mutex::new(RunState::Idle),
            started_at: Mutex::new(None),
            counters: Counters::default(),
            errors_by_category: Mutex::new(HashMap::new()),
            daily: Mutex::new(DailyCounter::new(Utc::now().date_naive())),
            config,
            components,
        };
        Ok(Self {
            inner: Arc::new(inner),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> RunState {
        *locked(&self.inner.state)
    }

    /// Spawn the scheduling and monitoring loops and return immediately
    pub fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut state = locked(&self.inner.state);
            match *state {
                RunState::Running => return Err(SchedulerError::AlreadyRunning),
                RunState::Stopped => return Err(SchedulerError::Stopped),
                RunState::Idle => *state = RunState::Running,
            }
        }
        *locked(&self.inner.started_at) = Some(Instant::now());

        let scheduling = tokio::spawn(
            Arc::clone(&self.inner).scheduling_loop(self.inner.shutdown.subscribe()),
        );
        let monitoring = tokio::spawn(
            Arc::clone(&self.inner).monitoring_loop(self.inner.shutdown.subscribe()),
        );
        locked(&self.loops).extend([scheduling, monitoring]);

        info!(
            max_workers = self.inner.config.max_workers,
            batch_size = self.inner.config.batch_size,
            task_timeout_secs = self.inner.config.task_timeout_seconds,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop both loops, give in-flight work `shutdown_grace_seconds` to finish,
    /// then cancel what is left and reset it to pending.
    pub async fn stop(&self) -> SchedulerStats {
        {
            let mut state = locked(&self.inner.state);
            if *state == RunState::Stopped {
                drop(state);
                return self.get_stats();
            }
            *state = RunState::Stopped;
        }
        info!("Stopping scheduler");
        self.inner.shutdown.send_replace(true);
        self.inner.wake.notify_waiters();

        let loops: Vec<JoinHandle<()>> = locked(&self.loops).drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }

        let cancelled = self.inner.drain_workers().await;
        let dropped = locked(&self.inner.queue).drain().len();
        self.inner.flush_pending_outcomes().await;
        let unrecorded = self.inner.pending_outcomes.len();
        if unrecorded > 0 {
            error!(unrecorded, "Stopped with task outcomes that could not be stored");
        }

        let stats = self.get_stats();
        info!(
            successful = stats.successful,
            failed = stats.failed,
            retried = stats.retried,
            timed_out = stats.timed_out,
            cancelled,
            dropped_from_queue = dropped,
            "Scheduler stopped"
        );
        stats
    }

    /// Queue an execution of `task_id` due after `delay`.
    ///
    /// Every call adds a new entry. Returns `false` once the scheduler is
    /// stopped, or when `now + delay` is not a representable instant.
    pub fn schedule_task(&self, task_id: TaskId, priority: u32, delay: Duration) -> bool {
        if self.state() == RunState::Stopped {
            return false;
        }
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay));
        let Some(due) = due else {
            warn!(task_id = %task_id, delay_secs = delay.as_secs(), "Delay out of range; task not scheduled");
            return false;
        };
        let execution = TaskExecution::new(task_id, priority, due);
        debug!(
            task_id = %task_id,
            execution_id = %execution.execution_id,
            priority = execution.priority,
            due = %due,
            "Task scheduled"
        );
        locked(&self.inner.queue).push(execution);
        self.inner.wake.notify_one();
        true
    }

    /// Admit up to `limit` eligible tasks from the store
    pub async fn schedule_batch(&self, limit: usize) -> Result<BatchResult> {
        self.inner.schedule_batch(limit).await
    }

    pub fn get_stats(&self) -> SchedulerStats {
        self.inner.stats()
    }

    pub fn queue_size(&self) -> usize {
        locked(&self.inner.queue).len()
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.inner.running.contains_key(task_id)
    }
}

impl SchedulerInner {
    async fn scheduling_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("Scheduling loop started");
        while !*shutdown.borrow() {
            self.dispatch_due();
            self.sweep_timeouts();

            if locked(&self.queue).len() < self.config.low_water_mark {
                match self.schedule_batch(self.config.batch_size).await {
                    Ok(result) if result.scheduled_count > 0 => self.dispatch_due(),
                    Ok(_) => {}
                    Err(e) => error!(error = %format!("{e:#}"), "Batch admission failed"),
                }
            }

            let pause = self.next_wake_in();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Scheduling loop stopped");
    }

    async fn monitoring_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("Monitoring loop started");
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    self.flush_pending_outcomes().await;
                    self.roll_day(Utc::now().date_naive());
                    let stats = self.stats();
                    debug!(
                        queue = stats.queue_size,
                        running = stats.running_count,
                        successful = stats.successful,
                        failed = stats.failed,
                        published_today = stats.published_today,
                        "Scheduler heartbeat"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Monitoring loop stopped");
    }

    /// Start every due execution a worker slot is free for
    fn dispatch_due(self: &Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                break;
            };
            let next = locked(&self.queue).pop_due(Utc::now());
            let Some(execution) = next else {
                break;
            };
            if self.running.contains_key(&execution.task_id)
                || self.pending_outcomes.contains_key(&execution.task_id)
            {
                debug!(
                    task_id = %execution.task_id,
                    execution_id = %execution.execution_id,
                    "Task already running or settling; dropping duplicate execution"
                );
                continue;
            }
            self.spawn_execution(execution, permit);
        }
    }

    /// How long the scheduling loop may sleep before the queue head is due
    fn next_wake_in(&self) -> Duration {
        let interval = self.config.check_interval();
        if self.workers.available_permits() == 0 {
            // A finishing worker wakes the loop
            return interval;
        }
        let queue = locked(&self.queue);
        match queue.peek() {
            Some(head) => (head.scheduled_time - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(Duration::from_millis(5), interval),
            None => interval,
        }
    }

    pub(super) async fn schedule_batch(&self, limit: usize) -> Result<BatchResult> {
        let now = Utc::now();
        let in_flight = locked(&self.queue).len() + self.running.len();

        let mut budget = limit;
        let mut cap_reached = false;
        if self.config.daily_max_tasks > 0 {
            let cap = self.config.daily_max_tasks as usize;
            let published = self.published_today(now.date_naive()) as usize;
            cap_reached = published >= cap;
            budget = budget.min(cap.saturating_sub(published + in_flight));
        }

        let store = &self.components.store;
        let mut scheduled = 0;
        if budget > 0 {
            let filter = TaskFilter {
                project_id: self.config.project_id.clone(),
                due_before: Some(now + chrono::Duration::minutes(self.config.lookahead_minutes)),
                ..Default::default()
            };
            let candidates = store
                .get_ready(&filter, budget + in_flight)
                .await
                .context("Failed to load ready tasks")?;

            for task in candidates {
                if scheduled >= budget {
                    break;
                }
                if self.running.contains_key(&task.id)
                    || self.pending_outcomes.contains_key(&task.id)
                    || locked(&self.queue).contains(&task.id)
                {
                    continue;
                }
                let score = self.score(&task, now);
                let execution = TaskExecution {
                    retry_count: task.retry_count,
                    last_error: task.last_error.clone(),
                    ..TaskExecution::new(task.id, score.queue_priority(), task.scheduled_time)
                };
                debug!(
                    task_id = %task.id,
                    score = score.value,
                    level = %score.level,
                    queue_priority = execution.priority,
                    "Admitted task"
                );
                locked(&self.queue).push(execution);
                scheduled += 1;
            }
        } else if cap_reached {
            debug!(
                daily_max = self.config.daily_max_tasks,
                "Daily publication cap reached; admission paused"
            );
        }

        let total_pending = store.count_by_status(TaskStatus::Pending).await?
            + store.count_by_status(TaskStatus::Retry).await?;

        if scheduled > 0 {
            info!(scheduled, total_pending, "Batch admitted");
            self.emit(SchedulerEvent::BatchScheduled {
                scheduled,
                total_pending,
            });
            self.wake.notify_one();
        }

        Ok(BatchResult {
            scheduled_count: scheduled,
            total_pending,
            daily_cap_reached: cap_reached,
        })
    }

    fn score(&self, task: &Task, now: DateTime<Utc>) -> PriorityScore {
        let score = self.components.priority.score_at(task, now);
        match (&self.components.timing, self.config.use_timing_adjustment) {
            (Some(timing), true) => {
                let at = task.scheduled_time.max(now);
                score.adjusted(timing.slot_adjustment(&task.content_type, at))
            }
            _ => score,
        }
    }

    /// Close the books on previous days, warning when the minimum was missed
    pub(super) fn roll_day(&self, today: NaiveDate) {
        let previous = {
            let mut daily = locked(&self.daily);
            if daily.day >= today {
                return;
            }
            std::mem::replace(&mut *daily, DailyCounter::new(today))
        };

        info!(
            day = %previous.day,
            published = previous.published,
            "Daily publication counter rolled over"
        );
        let minimum = self.config.daily_min_tasks;
        if minimum > 0 && previous.published < minimum {
            warn!(
                day = %previous.day,
                published = previous.published,
                minimum,
                "Daily publication minimum missed"
            );
            self.emit(SchedulerEvent::DailyMinimumMissed {
                day: previous.day,
                published: previous.published,
                minimum,
            });
        }
    }

    pub(super) fn record_publication(&self) {
        let today = Utc::now().date_naive();
        self.roll_day(today);
        locked(&self.daily).published += 1;
    }

    fn published_today(&self, today: NaiveDate) -> u32 {
        let daily = locked(&self.daily);
        if daily.day == today { daily.published } else { 0 }
    }

    pub(super) fn emit(&self, event: SchedulerEvent) {
        for handler in &self.components.event_handlers {
            if let Err(e) = handler.handle_event(&event) {
                warn!(error = %e, "Scheduler event handler failed");
            }
        }
    }

    pub(super) fn stats(&self) -> SchedulerStats {
        let uptime_seconds = locked(&self.started_at)
            .map(|started| started.elapsed().as_secs())
            .unwrap_or_default();
        SchedulerStats {
            queue_size: locked(&self.queue).len(),
            running_count: self.running.len(),
            pending_outcomes: self.pending_outcomes.len(),
            successful: self.counters.successful.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            retried: self.counters.retried.load(Ordering::SeqCst),
            timed_out: self.counters.timed_out.load(Ordering::SeqCst),
            uptime_seconds,
            published_today: self.published_today(Utc::now().date_naive()),
            errors_by_category: locked(&self.errors_by_category).clone(),
        }
    }
}
