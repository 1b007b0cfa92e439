use crate::classifier::types::ErrorCategory;
use serde::{Deserialize, Serialize};

/// Patterns that map an error description onto a category.
///
/// Patterns are regular expressions matched case-insensitively. Rules are
/// evaluated in table order and the first match wins.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClassificationRule {
    pub category: ErrorCategory,
    pub patterns: Vec<String>,
}

impl ClassificationRule {
    pub fn new(category: ErrorCategory, patterns: &[&str]) -> Self {
        Self {
            category,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Built-in rule table
pub fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::new(
            ErrorCategory::RateLimit,
            &[
                r"rate[\s_-]?limit",
                r"\b429\b",
                r"too many requests",
                r"quota exceeded",
                r"throttl",
                r"daily limit",
            ],
        ),
        ClassificationRule::new(
            ErrorCategory::Auth,
            &[
                r"\b401\b",
                r"\b403\b",
                r"unauthori[sz]ed",
                r"forbidden",
                r"authenticat",
                r"invalid (api )?(key|token)",
                r"credentials",
                r"token (has )?expired",
                r"permission denied",
            ],
        ),
        ClassificationRule::new(
            ErrorCategory::Content,
            &[
                r"duplicate (content|status|post)",
                r"status is a duplicate",
                r"too long",
                r"character limit",
                r"content policy",
                r"violat",
                r"inappropriate",
                r"invalid content",
                r"content rejected",
                r"\b187\b",
            ],
        ),
        ClassificationRule::new(
            ErrorCategory::Media,
            &[
                r"media",
                r"upload",
                r"image",
                r"video",
                r"file size",
                r"unsupported (file )?format",
            ],
        ),
        ClassificationRule::new(
            ErrorCategory::Network,
            &[
                r"timed?[\s_-]?out",
                r"connection (refused|reset|closed|aborted|error)",
                r"network",
                r"\bdns\b",
                r"unreachable",
                r"\b50[234]\b",
                r"service unavailable",
                r"bad gateway",
                r"broken pipe",
                r"ssl|tls",
            ],
        ),
        ClassificationRule::new(
            ErrorCategory::System,
            &[
                r"database",
                r"deadlock",
                r"\block",
                r"disk",
                r"out of memory",
                r"internal (server )?error",
                r"\b500\b",
                r"panic",
            ],
        ),
    ]
}
