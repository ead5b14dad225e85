//! Error types for keel.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("apply failed for {resource}: {message}")]
    ApplyFailed { resource: String, message: String },

    #[error("resource {resource} not ready after {timeout:?}")]
    ReadinessTimeout { resource: String, timeout: Duration },

    #[error("drift detected, approval required: {0}")]
    DriftDetected(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("state error: {0}")]
    State(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
