//! Session and block-list records, plus the collaborator contracts the
//! store needs when minting fresh identities.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use okeproto::{AvatarDescriptor, SessionInfo, SessionPublic, VocalAssist};

/// How many search terms a session remembers (newest first).
pub const SEARCH_HISTORY_LIMIT: usize = 20;

/// One persistent singer identity, keyed by its handshake key.
///
/// The key is a bearer secret shared between the client's storage and
/// this store; it is minted once and never regenerated for a live
/// identity. `connected` and `away` are runtime presence flags; both
/// reset on server restart.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub martyn_key: String,
    pub display_name: String,
    pub avatar: Option<AvatarDescriptor>,
    pub vocal_assist: VocalAssist,
    /// Recent search terms, newest first, capped at
    /// [`SEARCH_HISTORY_LIMIT`]. Duplicates are kept.
    pub search_history: Vec<String>,
    pub current_song: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub remote_addr: String,
    pub device_name: String,
    pub user_agent: String,
    pub is_admin: bool,
    pub connected: bool,
    pub away: bool,
    pub name_locked: bool,
}

impl Session {
    fn avatar_or_default(&self) -> AvatarDescriptor {
        self.avatar.clone().unwrap_or(AvatarDescriptor {
            id: "default".to_string(),
            colors: Vec::new(),
        })
    }

    /// Rich projection sent only to the session's owner.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            martyn_key: self.martyn_key.clone(),
            display_name: self.display_name.clone(),
            avatar_config: self.avatar_or_default(),
            vocal_assist: self.vocal_assist,
            search_history: self.search_history.clone(),
            current_song: self.current_song.clone(),
            is_admin: self.is_admin,
            away: self.away,
            connected: self.connected,
            name_locked: self.name_locked,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }

    /// Public projection broadcast to the whole room.
    pub fn public(&self) -> SessionPublic {
        SessionPublic {
            martyn_key: self.martyn_key.clone(),
            display_name: self.display_name.clone(),
            avatar_config: self.avatar_or_default(),
            vocal_assist: self.vocal_assist,
            is_admin: self.is_admin,
            away: self.away,
            connected: self.connected,
            current_song: self.current_song.clone(),
        }
    }
}

/// One entry of the block list. Expired entries vanish on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub martyn_key: String,
    pub blocked_at: DateTime<Utc>,
    /// None blocks permanently.
    pub blocked_until: Option<DateTime<Utc>>,
    pub reason: String,
}

impl BlockEntry {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.blocked_until, Some(until) if until <= now)
    }
}

/// Block entry joined with its session, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedView {
    pub martyn_key: String,
    pub display_name: Option<String>,
    pub blocked_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub reason: String,
}

/// External display-name generator.
///
/// `generate_unique` only guarantees uniqueness against the names known
/// at call time; a rehydrated session colliding with a freshly generated
/// name later is acceptable. Implementations must not call back into the
/// session store (the store invokes this under its write lock).
pub trait NameGenerator: Send + Sync {
    fn generate_unique(&self, existing: &HashSet<String>) -> String;
}

/// External avatar factory.
pub trait AvatarFactory: Send + Sync {
    fn new_random_with_colors(&self) -> AvatarDescriptor;
}
