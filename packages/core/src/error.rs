//! Structured error types for the execution core.
//!
//! `CoreError` is the only error type that crosses component boundaries.
//! Raw failures from processors and external collaborators are wrapped in
//! `CoreError::Execution` and fed to the error classifier, which decides
//! retry behavior; the enum itself stays small and pattern-matchable.

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Durable store failure (connection, protocol, or backend error).
    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Input rejected before any state was touched.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("dead letter entry not found: {0}")]
    DlqEntryNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// No idle agent could be matched to the task type.
    #[error("no available agent for task type: {0}")]
    AgentUnavailable(String),

    #[error("operation timeout after {0}ms")]
    Timeout(u64),

    /// Another executor holds the idempotency lock and did not publish a
    /// result within the wait budget. Distinct from `Execution` so callers
    /// can surface "busy, try again" instead of a generic failure.
    #[error("cannot acquire idempotency lock")]
    IdempotencyBusy,

    /// A processor or agent returned a failure.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The component is shutting down; work should be re-enqueued, not lost.
    #[error("shutting down")]
    Shutdown,
}

impl CoreError {
    /// Wrap an arbitrary processor failure.
    pub fn execution(message: impl Into<String>) -> Self {
        CoreError::Execution(message.into())
    }

    /// True when the failure came from the shutdown path and should be
    /// retried without counting against the error budget.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, CoreError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_displays_message() {
        let err = CoreError::execution("boom");
        assert_eq!(err.to_string(), "execution failed: boom");
    }

    #[test]
    fn idempotency_busy_matches_lock_message() {
        let err = CoreError::IdempotencyBusy;
        assert_eq!(err.to_string(), "cannot acquire idempotency lock");
    }

    #[test]
    fn shutdown_is_detected() {
        assert!(CoreError::Shutdown.is_shutdown());
        assert!(!CoreError::execution("boom").is_shutdown());
    }
}
