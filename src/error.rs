//! Orchestrator error taxonomy.
//!
//! Every failure in the system is classified by kind so that the HTTP layer,
//! the job queue, and the executors agree on retry and surfacing behaviour.

use thiserror::Error;

/// Error taxonomy shared across the orchestrator.
///
/// The kind decides how a failure is handled: validation, authorization,
/// conflict, and not-found errors surface to the caller and are never
/// retried; transient errors are retried by the job queue with backoff;
/// CLI errors consume the per-story retry budget; fatal errors terminate
/// the pipeline.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("CLI session error: {0}")]
    Cli(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl OrchestratorError {
    /// Whether the job queue should retry a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transient(_) | OrchestratorError::Cli(_)
        )
    }

    /// Stable kind label used in logs and persisted error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::Authorization(_) => "authorization",
            OrchestratorError::Conflict(_) => "conflict",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Transient(_) => "transient",
            OrchestratorError::Cli(_) => "cli",
            OrchestratorError::Fatal(_) => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_cli_errors_are_retryable() {
        assert!(OrchestratorError::Transient("503 from platform".into()).is_retryable());
        assert!(OrchestratorError::Cli("exit code 1".into()).is_retryable());
    }

    #[test]
    fn boundary_errors_are_not_retryable() {
        assert!(!OrchestratorError::Validation("bad enum".into()).is_retryable());
        assert!(!OrchestratorError::Conflict("already terminal".into()).is_retryable());
        assert!(!OrchestratorError::NotFound("no such job".into()).is_retryable());
        assert!(!OrchestratorError::Fatal("no commits produced".into()).is_retryable());
    }
}
