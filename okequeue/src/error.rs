//! Error types for okequeue

/// Queue store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Specialized Result type for okequeue
pub type Result<T> = std::result::Result<T, Error>;
