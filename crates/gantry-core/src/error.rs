//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Build control errors
    #[error("Job {container_id} of build {build_id} is still running")]
    JobStillRunning {
        build_id: String,
        container_id: String,
    },

    #[error("Task {task_id} is {status} and cannot be retried, only failed or cancelled tasks can")]
    TaskNotRetryable { task_id: String, status: String },

    #[error("Invalid run condition: {0}")]
    InvalidCondition(String),

    #[error("Expression error: {0}")]
    Expression(#[from] crate::expression::ExpressionError),

    // Agent errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Agent {agent_id} is {status} and cannot be imported")]
    AgentStatusException { agent_id: String, status: String },

    #[error("Agent secret mismatch: {0}")]
    Unauthorized(String),

    // Dispatch errors
    #[error("Job limit reached for build {build_id} ({limit} containers)")]
    JobQuotaExceeded { build_id: String, limit: u32 },

    #[error("Job quota unavailable: {0}")]
    QuotaUnavailable(String),

    #[error("No container is ready to debug for pipeline {0}")]
    NoDebugContainer(String),

    #[error("Status exception, please try rebuild the pipeline: {0}")]
    DebugStatusException(String),

    #[error("Builder start failed: {0}")]
    BuilderStartFailed(String),

    #[error("Unsupported dispatch type: {0}")]
    UnsupportedDispatchType(String),

    // Auth errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // Infrastructure errors
    #[error("Platform error: {0}")]
    Platform(String),

    #[error("{operation} did not finish after {attempts} attempts")]
    PlatformTimeout { operation: String, attempts: u32 },

    #[error("Timed out waiting for lock {0}")]
    LockTimeout(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors the caller must surface verbatim and never retry.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::JobStillRunning { .. }
                | Error::TaskNotRetryable { .. }
                | Error::InvalidCondition(_)
                | Error::Expression(_)
                | Error::AgentStatusException { .. }
                | Error::Unauthorized(_)
                | Error::JobQuotaExceeded { .. }
                | Error::NoDebugContainer(_)
                | Error::DebugStatusException(_)
                | Error::BuilderStartFailed(_)
                | Error::PermissionDenied(_)
        )
    }

    /// Infrastructure failures that may succeed when attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Platform(_)
                | Error::PlatformTimeout { .. }
                | Error::LockTimeout(_)
                | Error::Conflict(_)
                | Error::Database(_)
                | Error::Cache(_)
                | Error::QuotaUnavailable(_)
                | Error::EventBus(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
