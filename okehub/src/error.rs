//! Error types for okehub

/// Hub errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Hub event loop is no longer running")]
    HubClosed,
}

/// Specialized Result type for okehub
pub type Result<T> = std::result::Result<T, Error>;
