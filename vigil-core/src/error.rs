//! Error types for vigil-core

use thiserror::Error;

/// Main error type for the vigil-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed escalation rule or threshold set
    #[error("invalid rule {rule_id}: {message}")]
    Rule { rule_id: String, message: String },

    /// Notification sink could not deliver a message
    #[error("delivery error: {0}")]
    Delivery(String),

    /// A configured action failed while executing
    #[error("action error: {0}")]
    Action(String),

    /// Storage rejected a write because the same record already exists
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Scheduler lifecycle error
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl Error {
    /// Build a rule validation error.
    pub fn rule(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Rule {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for vigil-core
pub type Result<T> = std::result::Result<T, Error>;
