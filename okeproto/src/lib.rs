//! # okeproto - OkeRoom wire protocol and shared room model
//!
//! This crate defines everything that crosses the WebSocket boundary:
//! - The JSON frame envelope `{ "type": ..., "payload": ... }`
//! - The closed set of client-to-server commands ([`ClientMessage`])
//! - The server-to-client messages ([`ServerMessage`])
//! - The snapshot types composing the broadcast room state
//!
//! The stores and the server share these types; nothing in here touches
//! sockets or persistence.

pub mod error;
pub mod message;
pub mod snapshot;

pub use error::DecodeError;
pub use message::{ClientMessage, Decoded, Handshake, ServerMessage, VocalAssist};
pub use snapshot::{
    AvatarDescriptor, CountdownSnapshot, PlayerSnapshot, QueueSnapshot, RoomSnapshot, SearchResult,
    SessionInfo, SessionPublic, SongEntry,
};
