//! Error types for configuration loading

use thiserror::Error;

/// Errors raised while loading or validating static configuration
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration document could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration parsed but is not usable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Error {
    /// Create an invalid-configuration error with the given message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
