use thiserror::Error;

/// Error classes surfaced by the instance core. Leaf calls (runtime
/// adapters, stores) return `anyhow::Result` with human context; the
/// orchestrator, planner and gateway classify them at their boundary.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// Inputs rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate names, environments still in use.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Startup or running deadline exceeded. Non-fatal at the call site,
    /// fatal for the instance state.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The cluster client returned an error; may be transient.
    #[error("cluster unavailable: {0}")]
    Upstream(anyhow::Error),

    /// Network/HTTP failure in the gateway or the health probe.
    #[error("transport error: {0}")]
    Transport(anyhow::Error),

    /// State inconsistencies, marshal failures.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl InstanceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        InstanceError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        InstanceError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        InstanceError::Conflict(msg.into())
    }

    pub fn upstream(err: impl Into<anyhow::Error>) -> Self {
        InstanceError::Upstream(err.into())
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        InstanceError::Transport(err.into())
    }
}

pub type InstanceResult<T> = Result<T, InstanceError>;
