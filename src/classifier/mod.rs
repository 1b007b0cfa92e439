pub mod matcher;
pub mod rules;
pub mod types;


pub use matcher::ErrorClassifier;
pub use rules::{ClassificationRule, default_rules};
pub use types::*;
