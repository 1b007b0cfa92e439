//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: seed tasks into an in-memory store and run the engine
//! - `classify`: classify an error message and show its retry decision
//! - `best-time`: predict the best publish time for a content type
//! - `score`: score the tasks of a seed file
//! - `show-config`: show configuration discovery information

use super::tasks::TaskInput;
use crate::priority::PriorityLevel;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    Classify(ClassifyConfig),
    BestTime(BestTimeConfig),
    Score(ScoreConfig),
    ShowConfig,
}

#[derive(Debug)]
pub struct RunConfig {
    pub task_input: Option<TaskInput>,
    pub config_override: Option<PathBuf>,
    /// `None` runs until Ctrl-C
    pub duration: Option<Duration>,
    pub verbose: bool,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct ClassifyConfig {
    pub message: String,
    pub attempt: u32,
    pub json: bool,
}

#[derive(Debug)]
pub struct BestTimeConfig {
    pub content_type: String,
    pub level: PriorityLevel,
    pub within_hours: i64,
    pub config_override: Option<PathBuf>,
    pub json: bool,
}

impl BestTimeConfig {
    /// End of the prediction window opened at `start`, or `None` when it
    /// falls outside the representable range
    pub fn window_end(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::try_hours(self.within_hours).and_then(|window| start.checked_add_signed(window))
    }
}

#[derive(Debug)]
pub struct ScoreConfig {
    pub task_input: TaskInput,
    pub config_override: Option<PathBuf>,
    pub json: bool,
}

/// Priority tier accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LevelArg {
    VeryLow,
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Parser)]
#[command(name = "autopost")]
#[command(author = "Autopost Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Priority-driven scheduling engine for time-scheduled publishing jobs")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Seed tasks into an in-memory store and run the scheduler
    Run {
        /// Seed file with tasks (.json or .toml)
        #[arg(short = 't', long = "tasks")]
        tasks: Option<PathBuf>,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(short = 'd', long = "duration")]
        duration_seconds: Option<u64>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
        /// Show the admission order without running anything
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
    },
    /// Classify an error message
    Classify {
        /// Error text as returned by the publishing API
        message: String,
        /// Attempt number the failure happened on (1-based)
        #[arg(short = 'a', long = "attempt", default_value_t = 1)]
        attempt: u32,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Predict the best publish time within a window starting now
    BestTime {
        /// Content type, e.g. news, engagement, promotional
        content_type: String,
        /// Priority tier of the content
        #[arg(short = 'p', long = "priority", value_enum, default_value_t = LevelArg::Normal)]
        priority: LevelArg,
        /// Window length in hours
        #[arg(short = 'w', long = "within", default_value_t = 24)]
        within_hours: i64,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Score every task of a seed file
    Score {
        /// Seed file with tasks (.json or .toml)
        tasks: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl From<LevelArg> for PriorityLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::VeryLow => PriorityLevel::VeryLow,
            LevelArg::Low => PriorityLevel::Low,
            LevelArg::Normal => PriorityLevel::Normal,
            LevelArg::High => PriorityLevel::High,
            LevelArg::Urgent => PriorityLevel::Urgent,
        }
    }
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                tasks,
                config,
                duration_seconds,
                verbose,
                dry_run,
            }) => {
                let task_input = tasks
                    .as_deref()
                    .map(TaskInput::detect)
                    .transpose()
                    .map_err(|e| e.to_string())?;
                Ok(ExecutionMode::Run(RunConfig {
                    task_input,
                    config_override: config.clone(),
                    duration: duration_seconds.map(Duration::from_secs),
                    verbose: *verbose,
                    dry_run: *dry_run,
                }))
            }
            Some(Commands::Classify {
                message,
                attempt,
                json,
            }) => {
                if message.trim().is_empty() {
                    return Err("Error message must not be empty".to_string());
                }
                Ok(ExecutionMode::Classify(ClassifyConfig {
                    message: message.clone(),
                    attempt: *attempt,
                    json: *json,
                }))
            }
            Some(Commands::BestTime {
                content_type,
                priority,
                within_hours,
                config,
                json,
            }) => {
                if *within_hours < 1 {
                    return Err("--within must be at least 1 hour".to_string());
                }
                let best_time = BestTimeConfig {
                    content_type: content_type.clone(),
                    level: (*priority).into(),
                    within_hours: *within_hours,
                    config_override: config.clone(),
                    json: *json,
                };
                if best_time.window_end(Utc::now()).is_none() {
                    return Err(format!("--within {} hours is out of range", within_hours));
                }
                Ok(ExecutionMode::BestTime(best_time))
            }
            Some(Commands::Score {
                tasks,
                config,
                json,
            }) => Ok(ExecutionMode::Score(ScoreConfig {
                task_input: TaskInput::detect(tasks).map_err(|e| e.to_string())?,
                config_override: config.clone(),
                json: *json,
            })),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err(
                "No command specified. Use 'autopost --help' to see available commands.".to_string(),
            ),
        }
    }
}
