use thiserror::Error;

/// Errors that can occur while serving a guarded stream.
#[derive(Error, Debug)]
pub enum GuardStreamError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("API error: HTTP {status_code} - {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Input rejected: {0}")]
    InputRejected(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Internal pipeline fault: {0}")]
    Internal(String),
}
