//! Unified error types for Forge

use thiserror::Error;

/// Unified error type for all Forge operations
#[derive(Error, Debug)]
pub enum ForgeError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    // Admission control
    #[error("Rate limiter queue is full ({depth}/{max} waiting); retry later")]
    QueueFull { depth: usize, max: usize },

    // Sandbox violations
    #[error("Path rejected: {0}")]
    PathValidation(String),

    #[error("Command rejected: {0}")]
    CommandRejected(String),

    // VCS and code hosting errors
    #[error("Git command failed: {0}")]
    GitCommand(String),

    #[error("Code hosting error: {0}")]
    Hosting(String),

    // LLM errors
    #[error("API error: {0}")]
    Api(String),

    #[error("API limit: {0}")]
    ApiLimit(String),

    // Tool errors
    #[error("Tool error: {0}")]
    Tool(String),

    // Lifecycle errors
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Ticket not found: {0}")]
    TicketNotFound(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Store error: {0}")]
    Store(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl ForgeError {
    /// Whether the caller should retry later instead of treating this as a failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::ApiLimit(_))
    }
}

/// Result type alias using ForgeError
pub type Result<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_is_retryable() {
        let err = ForgeError::QueueFull { depth: 10, max: 10 };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("10/10"));
    }

    #[test]
    fn test_sandbox_errors_not_retryable() {
        assert!(!ForgeError::PathValidation("../x".into()).is_retryable());
        assert!(!ForgeError::Config("missing key".into()).is_retryable());
    }
}
