//! Error types for the orchestrator

use thiserror::Error;

use crate::task::TaskStatus;

/// Main error type for orchestration operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Invalid workflow '{name}': {reason}")]
    InvalidWorkflow { name: String, reason: String },

    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Message bus full (capacity {capacity}, waited {waited_ms}ms)")]
    BusFull { capacity: usize, waited_ms: u64 },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid workflow error
    pub fn invalid_workflow(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidWorkflow {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Errors raised before any task record is created.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnknownWorker(_)
                | Error::UnknownWorkflow(_)
                | Error::InvalidWorkflow { .. }
                | Error::Config(_)
        )
    }

    /// Programming-level invariant violations: these never occur in normal operation.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidTransition { .. } | Error::DuplicateTask(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
