use crate::classifier::rules::{ClassificationRule, default_rules};
use crate::classifier::types::*;
use crate::lock::DatastoreError;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Maps failures onto an [`ErrorCategory`] and its retry directive.
///
/// Holds no mutable state: the same input always yields the same answer.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<CompiledRule>,
    policies: HashMap<ErrorCategory, RetryPolicy>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    category: ErrorCategory,
    patterns: Vec<Regex>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::with_rules(default_rules())
    }

    /// Build a classifier from a custom rule table.
    ///
    /// Patterns that fail to compile are skipped with a warning.
    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| CompiledRule {
                category: rule.category,
                patterns: rule
                    .patterns
                    .iter()
                    .filter_map(|pattern| {
                        match RegexBuilder::new(pattern).case_insensitive(true).build() {
                            Ok(regex) => Some(regex),
                            Err(e) => {
                                warn!(pattern = %pattern, error = %e, "Skipping invalid classification pattern");
                                None
                            }
                        }
                    })
                    .collect(),
            })
            .collect();

        let policies = ErrorCategory::ALL
            .iter()
            .map(|category| (*category, category.policy()))
            .collect();

        Self { rules, policies }
    }

    /// Override the retry policy of one category
    pub fn with_policy(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
        self.policies.insert(category, policy);
        self
    }

    pub fn policy(&self, category: ErrorCategory) -> RetryPolicy {
        self.policies
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.policy())
    }

    /// Classify a textual error description
    pub fn classify_message(&self, message: &str) -> ErrorCategory {
        self.match_message(message).0
    }

    fn match_message(&self, message: &str) -> (ErrorCategory, Option<String>) {
        for rule in &self.rules {
            if let Some(regex) = rule.patterns.iter().find(|regex| regex.is_match(message)) {
                return (rule.category, Some(regex.as_str().to_string()));
            }
        }
        (ErrorCategory::Unknown, None)
    }

    /// Classify an error, looking at well-known error types before its text
    pub fn classify_error(&self, error: &anyhow::Error) -> ErrorCategory {
        self.match_error(error).0
    }

    fn match_error(&self, error: &anyhow::Error) -> (ErrorCategory, Option<String>) {
        for cause in error.chain() {
            if let Some(execution) = cause.downcast_ref::<ExecutionError>() {
                if let Some(category) = Self::execution_category(execution) {
                    return (category, Some("ExecutionError".to_string()));
                }
            } else if cause.downcast_ref::<DatastoreError>().is_some() {
                return (ErrorCategory::System, Some("DatastoreError".to_string()));
            } else if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
                return (ErrorCategory::Network, Some("Elapsed".to_string()));
            } else if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return (Self::io_category(io), Some("io::Error".to_string()));
            }
        }

        self.match_message(&format!("{error:#}"))
    }

    fn execution_category(error: &ExecutionError) -> Option<ErrorCategory> {
        match error {
            ExecutionError::RateLimited(_) => Some(ErrorCategory::RateLimit),
            ExecutionError::Network(_) | ExecutionError::TaskTimeout { .. } => {
                Some(ErrorCategory::Network)
            }
            ExecutionError::ContentRejected(_) => Some(ErrorCategory::Content),
            ExecutionError::Media(_) => Some(ErrorCategory::Media),
            ExecutionError::LockTimeout { .. } | ExecutionError::Deadlock(_) => {
                Some(ErrorCategory::System)
            }
            ExecutionError::Http { status, .. } => match status {
                429 => Some(ErrorCategory::RateLimit),
                401 | 403 => Some(ErrorCategory::Auth),
                413 | 415 => Some(ErrorCategory::Media),
                400 | 422 => Some(ErrorCategory::Content),
                502..=504 => Some(ErrorCategory::Network),
                500..=599 => Some(ErrorCategory::System),
                // Other statuses fall through to text matching
                _ => None,
            },
        }
    }

    fn io_category(error: &std::io::Error) -> ErrorCategory {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => ErrorCategory::Network,
            ErrorKind::PermissionDenied => ErrorCategory::Auth,
            _ => ErrorCategory::System,
        }
    }

    /// Delay in seconds before retry number `attempt`, `None` when no retry is allowed
    pub fn calculate_retry_delay(&self, category: ErrorCategory, attempt: u32) -> Option<u64> {
        self.policy(category).delay_for(attempt)
    }

    pub fn should_retry(&self, category: ErrorCategory, attempt: u32) -> bool {
        self.policy(category).allows_retry(attempt)
    }

    /// Full directive for a category at the given attempt (1-based)
    pub fn classification_for(&self, category: ErrorCategory, attempt: u32) -> ErrorClassification {
        let policy = self.policy(category);
        let retry_delay_seconds = policy.delay_for(attempt);
        ErrorClassification {
            category,
            should_retry: retry_delay_seconds.is_some(),
            retry_delay_seconds,
            needs_human_intervention: policy.needs_human_intervention,
            matched_by: None,
        }
    }

    /// Classify an error for retry number `attempt`
    pub fn classify(&self, error: &anyhow::Error, attempt: u32) -> ErrorClassification {
        let (category, matched_by) = self.match_error(error);
        let classification = ErrorClassification {
            matched_by,
            ..self.classification_for(category, attempt)
        };
        debug!(
            category = %classification.category,
            attempt,
            should_retry = classification.should_retry,
            "Classified error: {:#}",
            error
        );
        classification
    }

    /// Classify a plain error message for retry number `attempt`
    pub fn classify_text(&self, message: &str, attempt: u32) -> ErrorClassification {
        let (category, matched_by) = self.match_message(message);
        ErrorClassification {
            matched_by,
            ..self.classification_for(category, attempt)
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
