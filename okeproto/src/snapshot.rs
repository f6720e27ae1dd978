//! Snapshot types composing the broadcast room state.
//!
//! A snapshot is a point-in-time, read-only view assembled fresh for each
//! broadcast. Clients never mutate these; they re-render from whatever the
//! latest `state_update` carried. The session projection deliberately
//! exposes only public fields: the handshake key doubles as the singer
//! identity that queue entries reference through `added_by`, but device
//! information, network addresses and user agents never leave the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::VocalAssist;

/// Avatar descriptor handed out by the avatar factory.
///
/// `id` selects the base glyph; `colors` is the palette the client-side
/// rasterizer applies to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarDescriptor {
    pub id: String,
    pub colors: Vec<String>,
}

/// One appearance of a song in the queue.
///
/// `entry_id` is unique per appearance: requeueing the same library song
/// produces a new entry with a fresh id. Media paths are bound late, after
/// asynchronous preparation finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongEntry {
    pub entry_id: String,
    pub song_id: String,
    pub title: String,
    pub artist: String,
    pub duration_secs: u32,
    pub vocal_path: Option<String>,
    pub instrumental_path: Option<String>,
    pub vocal_assist: VocalAssist,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
}

/// Queue view: ordered entries, the position cursor, and autoplay.
///
/// Entries at `[0, position)` are history, the entry at `position` (if
/// any) is now playing, entries past it are upcoming. `position == len`
/// means the queue is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub songs: Vec<SongEntry>,
    pub position: usize,
    pub autoplay: bool,
}

impl QueueSnapshot {
    /// Entry currently at the cursor, if the queue is not exhausted.
    pub fn current(&self) -> Option<&SongEntry> {
        self.songs.get(self.position)
    }

    /// First entry after the cursor, if any.
    pub fn next_up(&self) -> Option<&SongEntry> {
        self.songs.get(self.position + 1)
    }
}

/// Player view as last reported by the player collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    /// Entry id of the song loaded in the player, if any.
    pub current_song: Option<String>,
    pub position_secs: f64,
    pub duration_secs: f64,
    pub playing: bool,
    pub volume: f64,
    pub vocal_assist: VocalAssist,
    pub background_music: bool,
    pub background_music_enabled: bool,
    pub idle: bool,
}

impl Default for PlayerSnapshot {
    fn default() -> Self {
        Self {
            current_song: None,
            position_secs: 0.0,
            duration_secs: 0.0,
            playing: false,
            volume: 1.0,
            vocal_assist: VocalAssist::Off,
            background_music: false,
            background_music_enabled: true,
            idle: true,
        }
    }
}

/// Between-songs countdown view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CountdownSnapshot {
    pub active: bool,
    pub seconds_remaining: u32,
    pub next_entry_id: Option<String>,
    pub next_singer: Option<String>,
    /// True when the next entry belongs to a different singer than the
    /// song that just finished; the countdown then waits for an admin.
    pub requires_approval: bool,
}

/// Public projection of a session, broadcast in the room snapshot and in
/// `client_list` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPublic {
    pub martyn_key: String,
    pub display_name: String,
    pub avatar_config: AvatarDescriptor,
    pub vocal_assist: VocalAssist,
    pub is_admin: bool,
    pub away: bool,
    pub connected: bool,
    pub current_song: Option<String>,
}

/// Rich projection of a session, sent only to its owner in the `welcome`
/// frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub martyn_key: String,
    pub display_name: String,
    pub avatar_config: AvatarDescriptor,
    pub vocal_assist: VocalAssist,
    pub search_history: Vec<String>,
    pub current_song: Option<String>,
    pub is_admin: bool,
    pub away: bool,
    pub connected: bool,
    pub name_locked: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One hit returned by the library search collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub song_id: String,
    pub title: String,
    pub artist: String,
    pub duration_secs: u32,
}

/// The complete room state, computed fresh at each broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub player: PlayerSnapshot,
    pub queue: QueueSnapshot,
    pub sessions: Vec<SessionPublic>,
    pub countdown: CountdownSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> SongEntry {
        SongEntry {
            entry_id: id.to_string(),
            song_id: format!("lib-{id}"),
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            duration_secs: 180,
            vocal_path: None,
            instrumental_path: None,
            vocal_assist: VocalAssist::Off,
            added_by: "k".to_string(),
            added_at: Utc::now(),
        }
    }

    #[test]
    fn queue_snapshot_current_and_next() {
        let snap = QueueSnapshot {
            songs: vec![entry("a"), entry("b"), entry("c")],
            position: 1,
            autoplay: true,
        };
        assert_eq!(snap.current().unwrap().entry_id, "b");
        assert_eq!(snap.next_up().unwrap().entry_id, "c");
    }

    #[test]
    fn exhausted_queue_has_no_current() {
        let snap = QueueSnapshot {
            songs: vec![entry("a")],
            position: 1,
            autoplay: false,
        };
        assert!(snap.current().is_none());
        assert!(snap.next_up().is_none());
    }
}
