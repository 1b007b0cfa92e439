//! Seed task loading
//!
//! The `run` and `score` commands read tasks from a seed file:
//! - `.json`: an array of tasks, or an object with a `tasks` array
//! - `.toml`: `[[tasks]]` tables

use crate::store::Task;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File '{path}' is not UTF-8 encoded: {hint}")]
    NotUtf8 { path: PathBuf, hint: String },

    #[error("File '{path}' not found")]
    NotFound { path: PathBuf },

    #[error("IO error reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Task parsing error in '{path}': {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Unsupported seed file '{path}': expected a .json or .toml extension")]
    UnsupportedFormat { path: PathBuf },

    #[error("Task '{payload_ref}' has an out of range delay of {delay_minutes} minutes")]
    DelayOutOfRange { payload_ref: String, delay_minutes: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskInput {
    Json(PathBuf),
    Toml(PathBuf),
}

/// One task as written in a seed file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeedTask {
    pub project_id: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub payload_ref: String,
    #[serde(default)]
    pub media_ref: Option<String>,
    /// Absolute publish time; wins over `delay_minutes`
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Publish this many minutes after loading (negative means overdue)
    #[serde(default)]
    pub delay_minutes: Option<i64>,
    #[serde(default = "default_project_priority")]
    pub project_priority: u8,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Deserialize)]
struct SeedFile {
    #[serde(default)]
    tasks: Vec<SeedTask>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonSeed {
    List(Vec<SeedTask>),
    File(SeedFile),
}

fn default_content_type() -> String {
    "general".to_string()
}

fn default_project_priority() -> u8 {
    3
}

impl TaskInput {
    /// Pick the format from the file extension (case-insensitive)
    pub fn detect(path: &Path) -> Result<Self, FileError> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "json" => Ok(TaskInput::Json(path.to_path_buf())),
            "toml" => Ok(TaskInput::Toml(path.to_path_buf())),
            _ => Err(FileError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            TaskInput::Json(path) | TaskInput::Toml(path) => path,
        }
    }
}

impl SeedTask {
    /// Materialize a pending store task relative to `now`
    pub fn into_task(self, now: DateTime<Utc>) -> Result<Task, FileError> {
        let scheduled = match self.scheduled_time {
            Some(at) => at,
            None => {
                let delay_minutes = self.delay_minutes.unwrap_or(0);
                Duration::try_minutes(delay_minutes)
                    .and_then(|delay| now.checked_add_signed(delay))
                    .ok_or_else(|| FileError::DelayOutOfRange {
                        payload_ref: self.payload_ref.clone(),
                        delay_minutes,
                    })?
            }
        };
        let mut task = Task::new(self.project_id, self.content_type, self.payload_ref, scheduled)
            .with_project_priority(self.project_priority)
            .with_retry_count(self.retry_count);
        if let Some(media) = self.media_ref {
            task = task.with_media(media);
        }
        Ok(task)
    }
}

/// Loads seed tasks from disk
pub struct TaskLoader;

impl TaskLoader {
    fn load_utf8_file(path: &Path) -> Result<String, FileError> {
        debug!("Loading seed file: {:?}", path);

        fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::InvalidData => FileError::NotUtf8 {
                path: path.to_path_buf(),
                hint: "Seed files must be UTF-8 JSON or TOML".to_string(),
            },
            _ => FileError::IoError {
                path: path.to_path_buf(),
                source: e,
            },
        })
    }

    pub fn load(input: &TaskInput) -> Result<Vec<SeedTask>, FileError> {
        let content = Self::load_utf8_file(input.path())?;
        let tasks = match input {
            TaskInput::Json(path) => Self::parse_json(&content, path)?,
            TaskInput::Toml(path) => Self::parse_toml(&content, path)?,
        };
        debug!("Parsed {} seed tasks from {:?}", tasks.len(), input.path());
        Ok(tasks)
    }

    /// Load and materialize every task in `input`
    pub fn load_tasks(input: &TaskInput, now: DateTime<Utc>) -> Result<Vec<Task>, FileError> {
        Self::load(input)?
            .into_iter()
            .map(|seed| seed.into_task(now))
            .collect()
    }

    pub fn parse_json(content: &str, source: &Path) -> Result<Vec<SeedTask>, FileError> {
        let seed: JsonSeed = serde_json::from_str(content).map_err(|e| FileError::ParseError {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(match seed {
            JsonSeed::List(tasks) => tasks,
            JsonSeed::File(file) => file.tasks,
        })
    }

    pub fn parse_toml(content: &str, source: &Path) -> Result<Vec<SeedTask>, FileError> {
        let file: SeedFile = toml::from_str(content).map_err(|e| FileError::ParseError {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(file.tasks)
    }
}
