//! Error taxonomy for the job-orchestration core.

use thiserror::Error;

/// Errors surfaced by the lifecycle engine and its collaborators.
///
/// The queue's retry policy keys off [`EngineError::is_retryable`]; the REST
/// boundary maps variants to status codes (422 / 404 / 409 / 503 / 500).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input; surfaced to the caller, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing job/user/content.
    #[error("{0} not found")]
    NotFound(String),

    /// Attempted illegal state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No live workers to accept the submission; caller should retry later.
    #[error("no workers available to process generation jobs")]
    WorkersUnavailable,

    /// Network failure reaching the rendering backend.
    #[error("backend connection error: {0}")]
    BackendConnection(String),

    /// Backend reported a non-completed status or produced no outputs.
    #[error("backend workflow error: {0}")]
    BackendWorkflow(String),

    /// Transient database failure.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Wait-for-outputs exceeded the configured ceiling.
    #[error("timed out after {0}s waiting for backend outputs")]
    Timeout(u64),

    /// Unclassified failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the task queue should re-deliver after this error.
    ///
    /// Backend connection/workflow hiccups and transient store failures are
    /// retried with backoff; everything else is terminal for the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::BackendConnection(_)
                | EngineError::BackendWorkflow(_)
                | EngineError::TransientStore(_)
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_variants() {
        assert!(EngineError::BackendConnection("refused".into()).is_retryable());
        assert!(EngineError::BackendWorkflow("bad graph".into()).is_retryable());
        assert!(EngineError::TransientStore("db locked".into()).is_retryable());

        assert!(!EngineError::validation("empty prompt").is_retryable());
        assert!(!EngineError::Timeout(900).is_retryable());
        assert!(!EngineError::WorkersUnavailable.is_retryable());
    }
}
