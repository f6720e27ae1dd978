//! Frame envelope and the closed command set.
//!
//! Every frame on the wire is a JSON object `{ "type": <string>,
//! "payload": <value> }`. Inbound frames decode in two phases: first the
//! raw envelope, then the payload against the schema of that type. The
//! two phases keep the error cases distinct — an unknown type is ignored
//! silently, a known type with a malformed payload is a [`DecodeError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;
use crate::snapshot::{AvatarDescriptor, RoomSnapshot, SearchResult, SessionInfo, SessionPublic};

/// Vocal assist level for a song or a singer preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VocalAssist {
    #[default]
    Off,
    Low,
    Med,
    High,
}

impl VocalAssist {
    /// Wire spelling of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            VocalAssist::Off => "OFF",
            VocalAssist::Low => "LOW",
            VocalAssist::Med => "MED",
            VocalAssist::High => "HIGH",
        }
    }
}

impl std::str::FromStr for VocalAssist {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFF" => Ok(VocalAssist::Off),
            "LOW" => Ok(VocalAssist::Low),
            "MED" => Ok(VocalAssist::Med),
            "HIGH" => Ok(VocalAssist::High),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Handshake payload. Both fields are optional: an empty handshake mints
/// a brand-new identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Handshake {
    pub martyn_key: Option<String>,
    pub display_name: Option<String>,
}

/// `queue_add` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueAdd {
    pub song_id: String,
    #[serde(default)]
    pub vocal_assist: VocalAssist,
}

/// `queue_move` payload. Out-of-range indices are clamped by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QueueMove {
    pub from: usize,
    pub to: usize,
}

/// `queue_requeue` payload. `song_id` names the queue entry to clone;
/// `martyn_key` becomes the new entry's owner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueRequeue {
    pub song_id: String,
    pub martyn_key: String,
}

/// `set_display_name` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SetDisplayName {
    pub display_name: String,
    pub avatar_id: Option<String>,
    pub avatar_config: Option<AvatarDescriptor>,
}

/// `admin_set_admin` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdminSetAdmin {
    pub martyn_key: String,
    pub is_admin: bool,
}

/// `admin_kick` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdminKick {
    pub martyn_key: String,
    pub reason: Option<String>,
}

/// `admin_block` payload. A zero duration blocks permanently.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdminBlock {
    pub martyn_key: String,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub reason: String,
}

/// `admin_unblock` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdminUnblock {
    pub martyn_key: String,
}

/// `admin_set_afk` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdminSetAfk {
    pub martyn_key: String,
    pub away: bool,
}

/// A decoded client command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Handshake(Handshake),
    Search(String),
    QueueAdd(QueueAdd),
    QueueRemove(String),
    QueueMove(QueueMove),
    QueueClear,
    QueueShuffle,
    QueueRequeue(QueueRequeue),
    Play,
    Pause,
    Skip,
    Seek(f64),
    VocalAssist(VocalAssist),
    Volume(f64),
    SetDisplayName(SetDisplayName),
    Autoplay(bool),
    SetAfk(bool),
    AdminSetAdmin(AdminSetAdmin),
    AdminKick(AdminKick),
    AdminBlock(AdminBlock),
    AdminUnblock(AdminUnblock),
    AdminSetAfk(AdminSetAfk),
    AdminPlayNext,
    AdminStop,
}

/// Outcome of decoding one inbound frame.
#[derive(Debug)]
pub enum Decoded {
    Message(ClientMessage),
    /// Frame carried a type outside the protocol; ignored silently.
    Unknown(String),
}

impl ClientMessage {
    /// Decodes one inbound text frame.
    pub fn decode(text: &str) -> Result<Decoded, DecodeError> {
        let envelope: RawEnvelope = serde_json::from_str(text).map_err(DecodeError::Frame)?;

        fn payload<T: serde::de::DeserializeOwned>(
            kind: &str,
            value: Value,
        ) -> Result<T, DecodeError> {
            serde_json::from_value(value).map_err(|source| DecodeError::Payload {
                kind: kind.to_string(),
                source,
            })
        }

        let kind = envelope.kind.as_str();
        let message = match kind {
            // A bare handshake (no payload at all) mints a new identity.
            "handshake" if envelope.payload.is_null() => {
                ClientMessage::Handshake(Handshake::default())
            }
            "handshake" => ClientMessage::Handshake(payload(kind, envelope.payload)?),
            "search" => ClientMessage::Search(payload(kind, envelope.payload)?),
            "queue_add" => ClientMessage::QueueAdd(payload(kind, envelope.payload)?),
            "queue_remove" => ClientMessage::QueueRemove(payload(kind, envelope.payload)?),
            "queue_move" => ClientMessage::QueueMove(payload(kind, envelope.payload)?),
            "queue_clear" => ClientMessage::QueueClear,
            "queue_shuffle" => ClientMessage::QueueShuffle,
            "queue_requeue" => ClientMessage::QueueRequeue(payload(kind, envelope.payload)?),
            "play" => ClientMessage::Play,
            "pause" => ClientMessage::Pause,
            "skip" => ClientMessage::Skip,
            "seek" => ClientMessage::Seek(payload(kind, envelope.payload)?),
            "vocal_assist" => ClientMessage::VocalAssist(payload(kind, envelope.payload)?),
            "volume" => ClientMessage::Volume(payload(kind, envelope.payload)?),
            "set_display_name" => ClientMessage::SetDisplayName(payload(kind, envelope.payload)?),
            "autoplay" => ClientMessage::Autoplay(payload(kind, envelope.payload)?),
            "set_afk" => ClientMessage::SetAfk(payload(kind, envelope.payload)?),
            "admin_set_admin" => ClientMessage::AdminSetAdmin(payload(kind, envelope.payload)?),
            "admin_kick" => ClientMessage::AdminKick(payload(kind, envelope.payload)?),
            "admin_block" => ClientMessage::AdminBlock(payload(kind, envelope.payload)?),
            "admin_unblock" => ClientMessage::AdminUnblock(payload(kind, envelope.payload)?),
            "admin_set_afk" => ClientMessage::AdminSetAfk(payload(kind, envelope.payload)?),
            "admin_play_next" => ClientMessage::AdminPlayNext,
            "admin_stop" => ClientMessage::AdminStop,
            _ => return Ok(Decoded::Unknown(envelope.kind)),
        };

        Ok(Decoded::Message(message))
    }

    /// Wire name of this command, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Handshake(_) => "handshake",
            ClientMessage::Search(_) => "search",
            ClientMessage::QueueAdd(_) => "queue_add",
            ClientMessage::QueueRemove(_) => "queue_remove",
            ClientMessage::QueueMove(_) => "queue_move",
            ClientMessage::QueueClear => "queue_clear",
            ClientMessage::QueueShuffle => "queue_shuffle",
            ClientMessage::QueueRequeue(_) => "queue_requeue",
            ClientMessage::Play => "play",
            ClientMessage::Pause => "pause",
            ClientMessage::Skip => "skip",
            ClientMessage::Seek(_) => "seek",
            ClientMessage::VocalAssist(_) => "vocal_assist",
            ClientMessage::Volume(_) => "volume",
            ClientMessage::SetDisplayName(_) => "set_display_name",
            ClientMessage::Autoplay(_) => "autoplay",
            ClientMessage::SetAfk(_) => "set_afk",
            ClientMessage::AdminSetAdmin(_) => "admin_set_admin",
            ClientMessage::AdminKick(_) => "admin_kick",
            ClientMessage::AdminBlock(_) => "admin_block",
            ClientMessage::AdminUnblock(_) => "admin_unblock",
            ClientMessage::AdminSetAfk(_) => "admin_set_afk",
            ClientMessage::AdminPlayNext => "admin_play_next",
            ClientMessage::AdminStop => "admin_stop",
        }
    }

    /// Whether this command is restricted to admin sessions.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            ClientMessage::Autoplay(_)
                | ClientMessage::QueueShuffle
                | ClientMessage::QueueRequeue(_)
                | ClientMessage::AdminSetAdmin(_)
                | ClientMessage::AdminKick(_)
                | ClientMessage::AdminBlock(_)
                | ClientMessage::AdminUnblock(_)
                | ClientMessage::AdminSetAfk(_)
                | ClientMessage::AdminPlayNext
                | ClientMessage::AdminStop
        )
    }
}

/// A server-to-client message, serialized as `{ "type": ..., "payload": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        session: SessionInfo,
        room_state: RoomSnapshot,
    },
    StateUpdate(RoomSnapshot),
    SearchResult(Vec<SearchResult>),
    Error {
        error: String,
    },
    ClientList(Vec<SessionPublic>),
    Kicked {
        reason: String,
    },
}

impl ServerMessage {
    /// Convenience constructor for error frames.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }

    /// Serializes the message to its wire form.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_empty_handshake() {
        let decoded = ClientMessage::decode(r#"{"type":"handshake","payload":{}}"#).unwrap();
        match decoded {
            Decoded::Message(ClientMessage::Handshake(h)) => {
                assert!(h.martyn_key.is_none());
                assert!(h.display_name.is_none());
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_handshake_with_key() {
        let decoded = ClientMessage::decode(
            r#"{"type":"handshake","payload":{"martyn_key":"abc","display_name":"Lou"}}"#,
        )
        .unwrap();
        match decoded {
            Decoded::Message(ClientMessage::Handshake(h)) => {
                assert_eq!(h.martyn_key.as_deref(), Some("abc"));
                assert_eq!(h.display_name.as_deref(), Some("Lou"));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_primitive_payloads() {
        match ClientMessage::decode(r#"{"type":"seek","payload":42.5}"#).unwrap() {
            Decoded::Message(ClientMessage::Seek(pos)) => assert!((pos - 42.5).abs() < 1e-9),
            other => panic!("unexpected decode: {other:?}"),
        }
        match ClientMessage::decode(r#"{"type":"set_afk","payload":true}"#).unwrap() {
            Decoded::Message(ClientMessage::SetAfk(true)) => {}
            other => panic!("unexpected decode: {other:?}"),
        }
        match ClientMessage::decode(r#"{"type":"vocal_assist","payload":"MED"}"#).unwrap() {
            Decoded::Message(ClientMessage::VocalAssist(VocalAssist::Med)) => {}
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn no_payload_commands_tolerate_missing_payload() {
        match ClientMessage::decode(r#"{"type":"queue_clear"}"#).unwrap() {
            Decoded::Message(ClientMessage::QueueClear) => {}
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_reported_not_failed() {
        match ClientMessage::decode(r#"{"type":"dance","payload":1}"#).unwrap() {
            Decoded::Unknown(kind) => assert_eq!(kind, "dance"),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let err = ClientMessage::decode(r#"{"type":"queue_move","payload":"sideways"}"#)
            .expect_err("should fail");
        match err {
            DecodeError::Payload { kind, .. } => assert_eq!(kind, "queue_move"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_is_a_decode_error() {
        let err = ClientMessage::decode("not json").expect_err("should fail");
        assert!(matches!(err, DecodeError::Frame(_)));
    }

    #[test]
    fn privileged_set_matches_protocol() {
        assert!(ClientMessage::QueueShuffle.requires_admin());
        assert!(ClientMessage::Autoplay(true).requires_admin());
        assert!(ClientMessage::AdminPlayNext.requires_admin());
        assert!(!ClientMessage::QueueClear.requires_admin());
        assert!(!ClientMessage::Skip.requires_admin());
        assert!(!ClientMessage::Search("q".into()).requires_admin());
    }

    #[test]
    fn error_frame_wire_shape() {
        let frame = ServerMessage::error("Not authorized").to_frame().unwrap();
        assert_eq!(
            frame,
            r#"{"type":"error","payload":{"error":"Not authorized"}}"#
        );
    }

    #[test]
    fn kicked_frame_wire_shape() {
        let frame = ServerMessage::Kicked {
            reason: "be nice".to_string(),
        }
        .to_frame()
        .unwrap();
        assert_eq!(frame, r#"{"type":"kicked","payload":{"reason":"be nice"}}"#);
    }
}
