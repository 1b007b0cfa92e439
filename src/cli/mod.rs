//! CLI-specific functionality
//!
//! Argument parsing, configuration discovery and seed-task loading.

pub mod args;
pub mod config;
pub mod tasks;

pub use args::{Args, BestTimeConfig, ClassifyConfig, ExecutionMode, RunConfig, ScoreConfig};
pub use config::ConfigDiscovery;
pub use tasks::{FileError, SeedTask, TaskInput, TaskLoader};
