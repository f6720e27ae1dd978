//! Error types for okesession

/// Session store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Display name cannot be empty")]
    InvalidDisplayName,

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Specialized Result type for okesession
pub type Result<T> = std::result::Result<T, Error>;
