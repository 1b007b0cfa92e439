use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure categories used to pick a retry policy
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Network,
    Content,
    Auth,
    Media,
    System,
    Unknown,
}

/// Static retry behaviour attached to a category
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_seconds: u64,
    pub max_retries: u32,
    pub exponential: bool,
    pub max_delay_seconds: u64,
    /// Never retried automatically; an operator has to look at it
    pub needs_human_intervention: bool,
}

/// Outcome of classifying one failure
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub should_retry: bool,
    pub retry_delay_seconds: Option<u64>,
    pub needs_human_intervention: bool,
    /// Rule pattern or type that decided the category, if any
    pub matched_by: Option<String>,
}

/// Failures raised by collaborators or the scheduler itself.
///
/// Collaborators may return these inside an `anyhow::Error` to skip text
/// matching during classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Content rejected: {0}")]
    ContentRejected(String),
    #[error("Media error: {0}")]
    Media(String),
    #[error("Task timed out after {seconds}s")]
    TaskTimeout { seconds: u64 },
    #[error("Lock timeout on {resource}")]
    LockTimeout { resource: String },
    #[error("Deadlock detected: {0}")]
    Deadlock(String),
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::RateLimit,
        ErrorCategory::Network,
        ErrorCategory::Content,
        ErrorCategory::Auth,
        ErrorCategory::Media,
        ErrorCategory::System,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Network => "network",
            ErrorCategory::Content => "content",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Media => "media",
            ErrorCategory::System => "system",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Default policy table
    pub fn policy(&self) -> RetryPolicy {
        match self {
            ErrorCategory::RateLimit => RetryPolicy::exponential(1800, 3, 7200),
            ErrorCategory::Network => RetryPolicy::exponential(300, 5, 3600),
            ErrorCategory::Content | ErrorCategory::Auth => RetryPolicy::human(),
            ErrorCategory::Media => RetryPolicy::fixed(600, 2),
            ErrorCategory::System => RetryPolicy::exponential(900, 3, 3600),
            ErrorCategory::Unknown => RetryPolicy::fixed(600, 2),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RetryPolicy {
    pub const fn exponential(base: u64, max_retries: u32, cap: u64) -> Self {
        Self {
            base_delay_seconds: base,
            max_retries,
            exponential: true,
            max_delay_seconds: cap,
            needs_human_intervention: false,
        }
    }

    pub const fn fixed(delay: u64, max_retries: u32) -> Self {
        Self {
            base_delay_seconds: delay,
            max_retries,
            exponential: false,
            max_delay_seconds: delay,
            needs_human_intervention: false,
        }
    }

    pub const fn human() -> Self {
        Self {
            base_delay_seconds: 0,
            max_retries: 0,
            exponential: false,
            max_delay_seconds: 0,
            needs_human_intervention: true,
        }
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        !self.needs_human_intervention && attempt.max(1) <= self.max_retries
    }

    /// Delay before retry number `attempt` (1-based), `None` once retries are exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<u64> {
        if !self.allows_retry(attempt) {
            return None;
        }
        let attempt = attempt.max(1);
        let delay = if self.exponential {
            let exponent = (attempt - 1).min(32);
            self.base_delay_seconds.saturating_mul(1u64 << exponent)
        } else {
            self.base_delay_seconds
        };
        Some(delay.min(self.max_delay_seconds))
    }
}
