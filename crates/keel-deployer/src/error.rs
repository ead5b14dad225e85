//! Provider error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("API discovery failed for {api_version}/{kind}: {message}")]
    Discovery {
        api_version: String,
        kind: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("helm {command} failed: {output}")]
    Helm { command: String, output: String },

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("invalid resource: {0}")]
    Invalid(String),
}

impl From<DeployError> for keel_core::Error {
    fn from(err: DeployError) -> Self {
        keel_core::Error::Provider(err.to_string())
    }
}

pub type DeployResult<T> = std::result::Result<T, DeployError>;
