//! Domain errors for the Foreman orchestrator.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::AttemptRecord;

/// Classification of an adapter failure, derived from exit code and message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RateLimited,
    Permission,
    Timeout,
    ToolUnavailable,
    Network,
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::ToolUnavailable => "tool_unavailable",
            Self::Network => "network_error",
            Self::Unknown => "unknown",
        }
    }

    /// Classify a failed adapter invocation by exit code and message patterns.
    pub fn classify(exit_code: i32, message: &str) -> Self {
        let lower = message.to_lowercase();
        if exit_code == 429 || lower.contains("429") || lower.contains("rate limit") {
            Self::RateLimited
        } else if exit_code == 403 || lower.contains("403") || lower.contains("permission denied") {
            Self::Permission
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("command not found") || lower.contains("no such file") {
            Self::ToolUnavailable
        } else if lower.contains("connection") || lower.contains("network") || lower.contains("dns") {
            Self::Network
        } else {
            Self::Unknown
        }
    }
}

/// Domain-level errors that can occur in the Foreman system.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Invalid transition from {from} to {to}: {reason}")]
    Transition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Concurrency conflict: task {0} was modified")]
    Concurrency(Uuid),

    #[error("Lease expired: task {task_id} is no longer owned by {owner}")]
    LeaseExpired { task_id: Uuid, owner: String },

    #[error("Dependency not satisfied for task {task_id}: {missing} is not done")]
    Dependency { task_id: Uuid, missing: Uuid },

    #[error("WIP limit reached for task type {0}")]
    WipLimit(String),

    #[error("Gate retry budget exhausted after {} attempts", .0.len())]
    GateExhausted(Vec<AttemptRecord>),

    #[error("Pipeline cycle detected at block {0}")]
    Cycle(String),

    #[error("Adapter failure ({}): {message}", class.as_str())]
    Adapter {
        class: FailureClass,
        message: String,
    },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Pipeline run not found: {0}")]
    RunNotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}
