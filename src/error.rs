use thiserror::Error;

/// Failures callers need to tell apart. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A referenced row (version, deployment, job agent, ...) does not exist.
    /// Fatal to the current evaluation only.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("invalid job status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A job-agent adapter refused or failed to accept a job.
    #[error("job agent integration failed: {0}")]
    Integration(String),

    #[error("lease '{0}' was lost while held")]
    LeaseLost(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// True when the error chain bottoms out in a [`EngineError::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<EngineError>(),
            Some(EngineError::NotFound { .. })
        )
    })
}
