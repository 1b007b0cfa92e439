//! # Autopost
//!
//! Scheduling and concurrency control for time-scheduled publishing jobs
//! against a rate-limited external API.
//!
//! ## Architecture Overview
//!
//! - **[`scheduler`]**: Priority queue, bounded worker pool and per-task timeouts
//! - **[`priority`]**: Weighted multi-factor priority scoring
//! - **[`classifier`]**: Error taxonomy and per-category retry policies
//! - **[`timing`]**: Publish-time prediction inside a window, honoring blackout hours
//! - **[`lock`]**: Datastore connection pool, table-level locks and deadlock detection
//! - **[`recovery`]**: Periodic reset of tasks stuck in `running`
//! - **[`store`]**: Collaborator contracts plus in-memory implementations
//! - **[`integration`]**: The application context that wires everything together
//!
//! ## Flow
//!
//! The scheduler pulls due `pending`/`retry` tasks from the [`store::TaskStore`],
//! scores them, and runs each through [`store::ContentGenerator`] and
//! [`store::Publisher`]. Failures are classified to choose between a delayed
//! retry, permanent failure and human intervention. Every task write happens
//! inside a [`lock::LockManager`] transaction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use autopost::store::{InMemoryTaskStore, Task};
//! use autopost::{AppCollaborators, AppConfig, AppContext};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryTaskStore::new());
//!     store.insert(Task::new("blog", "news", "posts/42", chrono::Utc::now())).await;
//!
//!     let app = AppContext::new(AppConfig::default(), AppCollaborators::in_memory(store)).await?;
//!     let stats = app.run_for(Some(Duration::from_secs(10))).await?;
//!     println!("published: {}", stats.successful);
//!     Ok(())
//! }
//! ```

/// Error taxonomy, pattern rules and retry policies.
pub mod classifier;

/// Priority scoring of publishing tasks.
pub mod priority;

/// Publish-time prediction.
pub mod timing;

/// Connection pool, lock arbitration and deadlock handling.
///
/// Every mutation of task state goes through a transaction obtained here.
pub mod lock;

/// Stuck task recovery.
pub mod recovery;

/// Priority-driven scheduler and worker pool.
pub mod scheduler;

/// Task data model and collaborator traits.
pub mod store;

/// Application context and unified configuration.
pub mod integration;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use classifier::{ErrorCategory, ErrorClassification, ErrorClassifier};
pub use integration::{AppCollaborators, AppConfig, AppContext, RecoverySettings, SystemStatus};
pub use lock::{DatastoreError, LockManager, LockManagerConfig};
pub use priority::{PriorityCalculator, PriorityLevel, PriorityScore};
pub use recovery::{RecoveryReport, StuckTaskRecovery};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, SchedulerStats};
pub use store::{Task, TaskId, TaskStatus, TaskStore};
pub use timing::{TimingPrediction, TimingPredictor};
