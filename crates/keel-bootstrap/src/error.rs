//! Bootstrap error types.

use keel_config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("unknown host '{0}'")]
    UnknownHost(String),
}

pub type BootstrapResult<T> = std::result::Result<T, BootstrapError>;
