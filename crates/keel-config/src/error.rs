//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    #[error("configuration value {0} is not marked secret")]
    NotSecret(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for keel_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::MissingConfig(key) => keel_core::Error::MissingConfig(key),
            ConfigError::InvalidReference(r) => keel_core::Error::InvalidReference(r),
            ConfigError::Duplicate(d) => keel_core::Error::Duplicate(d),
            other => keel_core::Error::InvalidInput(other.to_string()),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
