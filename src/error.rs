//! Error types for Berth

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BerthError {
    #[error("Could not connect to Docker endpoint '{endpoint}': {message}")]
    Connection { endpoint: String, message: String },

    #[error("Docker connection was lost. Please try your request again later.")]
    ConnectionLost,

    #[error("{0}")]
    NotFound(String),

    #[error("You can only spawn {limit} containers at a time. Please stop other containers to continue")]
    QuotaExceeded { limit: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl BerthError {
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        BerthError::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Errors the caller can correct by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BerthError::NotFound(_)
                | BerthError::QuotaExceeded { .. }
                | BerthError::InvalidConfiguration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BerthError>;
