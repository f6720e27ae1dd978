//! Handler-level errors, mapped onto error frames for the originating
//! client. Client-addressable errors are never broadcast.

/// What a command handler can fail with. The `Display` form is exactly
/// what goes into the `error` frame payload.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("Not authorized")]
    NotAuthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl From<okequeue::Error> for HandlerError {
    fn from(err: okequeue::Error) -> Self {
        match err {
            okequeue::Error::EntryNotFound(id) => HandlerError::NotFound(id),
            okequeue::Error::Persistence(msg) => HandlerError::Store(msg),
        }
    }
}

impl From<okesession::Error> for HandlerError {
    fn from(err: okesession::Error) -> Self {
        match err {
            okesession::Error::SessionNotFound(key) => HandlerError::NotFound(key),
            okesession::Error::InvalidDisplayName => {
                HandlerError::InvalidArgument("display name cannot be empty".to_string())
            }
            okesession::Error::Persistence(msg) => HandlerError::Store(msg),
        }
    }
}
