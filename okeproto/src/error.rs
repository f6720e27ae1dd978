//! Error types for okeproto

/// Frame decoding errors
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Frame(#[source] serde_json::Error),

    #[error("Invalid payload for '{kind}': {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
