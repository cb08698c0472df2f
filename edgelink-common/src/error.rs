use thiserror::Error;

/// Common error type for EdgeLink components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid thing message: {0}")]
    Message(String),
}

/// Result type alias using EdgeLink's Error.
pub type Result<T> = std::result::Result<T, Error>;
