//! # Application context
//!
//! Wires the store, lock manager, scheduler and stuck-task recovery into one
//! explicitly owned [`AppContext`], configured through a single [`AppConfig`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   AppContext                     │
//! │  ┌───────────┐ ┌─────────────┐ ┌──────────────┐  │
//! │  │ Scheduler │ │ LockManager │ │ StuckTask    │  │
//! │  │ + workers │ │ + pool      │ │ Recovery     │  │
//! │  └───────────┘ └─────────────┘ └──────────────┘  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use autopost::{AppCollaborators, AppConfig, AppContext};
//! use autopost::store::InMemoryTaskStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryTaskStore::new());
//!     let app = AppContext::new(AppConfig::default(), AppCollaborators::in_memory(store)).await?;
//!
//!     app.start()?;
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     let stats = app.shutdown().await?;
//!     println!("published {}", stats.successful);
//!     Ok(())
//! }
//! ```

use crate::lock::{ConnectionFactory, LockManager, LockManagerConfig, LockStats, PoolStats};
use crate::priority::{PriorityCalculator, PriorityWeights};
use crate::recovery::{RecoveryConfig, StuckTaskRecovery};
use crate::scheduler::{
    LoggingEventHandler, RunState, Scheduler, SchedulerComponents, SchedulerConfig, SchedulerStats,
};
use crate::store::{
    ContentGenerator, InMemoryConnectionFactory, InMemoryTaskStore, MockContentGenerator, MockPublisher, Publisher,
    TaskStore,
};
use crate::timing::{TimingConfig, TimingPredictor};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Complete application configuration, one TOML section per component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub lock: LockManagerConfig,
    pub timing: TimingConfig,
    pub priority: PriorityWeights,
    pub recovery: RecoverySettings,
}

/// `[recovery]` section; the stuck threshold is the scheduler's
/// `stuck_task_timeout_seconds`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoverySettings {
    pub enabled: bool,
    pub check_interval_seconds: u64,
}

/// External capabilities the engine runs against
pub struct AppCollaborators {
    pub store: Arc<dyn TaskStore>,
    pub publisher: Arc<dyn Publisher>,
    pub generator: Arc<dyn ContentGenerator>,
    pub connections: Arc<dyn ConnectionFactory>,
}

/// Owns every long-lived component and the background loops around them
pub struct AppContext {
    config: AppConfig,
    store: Arc<dyn TaskStore>,
    lock_manager: Arc<LockManager>,
    scheduler: Arc<Scheduler>,
    recovery: Arc<StuckTaskRecovery>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub scheduler: SchedulerStats,
    pub locks: LockStats,
    pub pool: PoolStats,
    pub is_healthy: bool,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 60,
        }
    }
}

impl RecoverySettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(1))
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).context("Failed to write config file")
    }

    /// Convert configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Check cross-field constraints of every section
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;

        let pool = &self.lock.pool;
        if pool.max_connections == 0 {
            bail!("lock.pool.max_connections must be at least 1");
        }
        if pool.min_connections > pool.max_connections {
            bail!(
                "lock.pool.min_connections ({}) exceeds max_connections ({})",
                pool.min_connections,
                pool.max_connections
            );
        }
        if !(0.0..=1.0).contains(&self.lock.retry_jitter) {
            bail!("lock.retry_jitter must be within 0.0..=1.0, got {}", self.lock.retry_jitter);
        }
        if self.lock.retry_base_delay_ms > self.lock.retry_max_delay_ms {
            bail!("lock.retry_base_delay_ms exceeds retry_max_delay_ms");
        }

        TimingPredictor::new(self.timing.clone()).context("Invalid [timing] section")?;
        Ok(())
    }
}

impl AppCollaborators {
    /// In-process collaborators around `store`: a mock publisher and content
    /// generator, and in-memory datastore connections
    pub fn in_memory(store: Arc<InMemoryTaskStore>) -> Self {
        Self {
            store,
            publisher: Arc::new(MockPublisher::new()),
            generator: Arc::new(MockContentGenerator::new()),
            connections: Arc::new(InMemoryConnectionFactory::new()),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }
}

impl AppContext {
    /// Validate `config`, warm the connection pool and build every component
    pub async fn new(config: AppConfig, collaborators: AppCollaborators) -> Result<Self> {
        config.validate()?;

        let lock_manager = Arc::new(LockManager::new(collaborators.connections, config.lock.clone()));
        lock_manager
            .initialize()
            .await
            .context("Failed to initialize connection pool")?;

        let timing = TimingPredictor::new(config.timing.clone()).context("Invalid timing configuration")?;
        let components = SchedulerComponents::new(
            collaborators.store.clone(),
            collaborators.publisher,
            collaborators.generator,
            lock_manager.clone(),
        )
        .with_priority(PriorityCalculator::new(config.priority.clone()))
        .with_timing(timing)
        .with_event_handler(Box::new(LoggingEventHandler));
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), components)?);

        let recovery = Arc::new(StuckTaskRecovery::new(
            collaborators.store.clone(),
            lock_manager.clone(),
            RecoveryConfig {
                stuck_timeout: config.scheduler.stuck_task_timeout(),
                check_interval: config.recovery.check_interval(),
            },
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            store: collaborators.store,
            lock_manager,
            scheduler,
            recovery,
            shutdown,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn lock_manager(&self) -> Arc<LockManager> {
        self.lock_manager.clone()
    }

    pub fn recovery(&self) -> Arc<StuckTaskRecovery> {
        self.recovery.clone()
    }

    /// Start the scheduler plus the deadlock detector, idle evictor and
    /// stuck-task sweep
    pub fn start(&self) -> Result<()> {
        self.scheduler.start()?;

        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);

        let manager = self.lock_manager.clone();
        let rx = self.shutdown.subscribe();
        background.push(tokio::spawn(async move { manager.run_deadlock_detector(rx).await }));

        let manager = self.lock_manager.clone();
        let rx = self.shutdown.subscribe();
        background.push(tokio::spawn(async move { manager.run_idle_evictor(rx).await }));

        if self.config.recovery.enabled {
            let recovery = self.recovery.clone();
            let rx = self.shutdown.subscribe();
            background.push(tokio::spawn(async move { recovery.run(rx).await }));
        }

        info!(
            background_loops = background.len(),
            recovery = self.config.recovery.enabled,
            "Application started"
        );
        Ok(())
    }

    /// Run until `duration` elapses (forever when `None`) or Ctrl-C, then shut down
    pub async fn run_for(&self, duration: Option<Duration>) -> Result<SchedulerStats> {
        self.start()?;

        let deadline = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = deadline => info!("Run duration elapsed"),
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => info!("Interrupt received"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
            },
        }

        self.shutdown().await
    }

    /// Stop the scheduler first (its cancellation writes still need locks),
    /// then the background loops, then close the pool
    pub async fn shutdown(&self) -> Result<SchedulerStats> {
        info!("Shutting down");
        let stats = self.scheduler.stop().await;

        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }

        self.lock_manager.close();
        info!("Shutdown complete");
        Ok(stats)
    }

    pub fn status(&self) -> SystemStatus {
        let locks = self.lock_manager.stats();
        let pool = self.lock_manager.pool_stats();
        SystemStatus {
            scheduler: self.scheduler.get_stats(),
            is_healthy: self.scheduler.state() == RunState::Running && pool.total_connections > 0,
            locks,
            pool,
        }
    }
}
