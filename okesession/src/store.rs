//! The session store: in-memory map of identities plus the block list,
//! with SQLite write-behind.
//!
//! A single read/write lock guards both maps; every write also persists
//! inside the lock. The in-memory state stays authoritative when a
//! database write fails — the failure is reported through
//! [`Mutated::persist`] so the caller can surface it without losing the
//! change (a persistence hiccup must never lock singers out of a running
//! room).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};
use okeproto::{AvatarDescriptor, SessionPublic, VocalAssist};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::persistence::SessionDb;
use crate::session::{
    AvatarFactory, BlockEntry, BlockedView, NameGenerator, Session, SEARCH_HISTORY_LIMIT,
};

/// Outcome of a session mutation.
///
/// The in-memory store always holds the change; `persist` reports whether
/// the write-behind to SQLite also succeeded.
#[derive(Debug)]
#[must_use]
pub struct Mutated<T> {
    pub value: T,
    pub persist: Result<()>,
}

struct StoreInner {
    sessions: HashMap<String, Session>,
    blocks: HashMap<String, BlockEntry>,
    db: Option<SessionDb>,
}

impl StoreInner {
    fn persist_session(&self, session: &Session) -> Result<()> {
        match &self.db {
            Some(db) => db.save_session(session),
            None => Ok(()),
        }
    }

    fn persist_block(&self, block: &BlockEntry) -> Result<()> {
        match &self.db {
            Some(db) => db.save_block(block),
            None => Ok(()),
        }
    }

    fn delete_block(&self, key: &str) -> Result<()> {
        match &self.db {
            Some(db) => db.delete_block(key),
            None => Ok(()),
        }
    }
}

/// Durable store of singer identities, keyed by handshake key.
pub struct SessionStore {
    inner: RwLock<StoreInner>,
    names: Arc<dyn NameGenerator>,
    avatars: Arc<dyn AvatarFactory>,
}

impl SessionStore {
    /// Opens the store backed by the given SQLite database.
    ///
    /// All sessions and blocks reload into memory; presence flags reset
    /// (nobody is connected right after a restart).
    pub fn open(
        db_path: &Path,
        names: Arc<dyn NameGenerator>,
        avatars: Arc<dyn AvatarFactory>,
    ) -> Result<Self> {
        let db = SessionDb::new(db_path)?;

        let sessions: HashMap<String, Session> = db
            .load_sessions()?
            .into_iter()
            .map(|s| (s.martyn_key.clone(), s))
            .collect();
        let blocks: HashMap<String, BlockEntry> = db
            .load_blocks()?
            .into_iter()
            .map(|b| (b.martyn_key.clone(), b))
            .collect();

        tracing::info!(
            sessions = sessions.len(),
            blocks = blocks.len(),
            "Session store restored from database"
        );

        Ok(Self {
            inner: RwLock::new(StoreInner {
                sessions,
                blocks,
                db: Some(db),
            }),
            names,
            avatars,
        })
    }

    /// Creates a store with no persistence (tests, throwaway rooms).
    pub fn ephemeral(names: Arc<dyn NameGenerator>, avatars: Arc<dyn AvatarFactory>) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                sessions: HashMap::new(),
                blocks: HashMap::new(),
                db: None,
            }),
            names,
            avatars,
        }
    }

    /// Rehydrates a known identity or mints a new one.
    ///
    /// An empty or unknown key creates a session: the key is kept when the
    /// client presented one (its local storage stays valid even if the
    /// server side was flushed), otherwise a fresh UUID is minted together
    /// with a generated display name and a random avatar. Known keys just
    /// get `last_seen` touched — plus an avatar backfill for identities
    /// persisted before avatars existed.
    pub fn get_or_create(
        &self,
        key: Option<&str>,
        suggested_name: Option<&str>,
    ) -> Mutated<Session> {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();

        let provided = key.map(str::trim).filter(|k| !k.is_empty());

        if let Some(k) = provided {
            if inner.sessions.contains_key(k) {
                let session = inner.sessions.get_mut(k).unwrap();
                session.last_seen = now;
                if session.avatar.is_none() {
                    session.avatar = Some(self.avatars.new_random_with_colors());
                }
                let session = session.clone();
                let persist = inner.persist_session(&session);
                return Mutated {
                    value: session,
                    persist,
                };
            }
        }

        let existing_names: HashSet<String> = inner
            .sessions
            .values()
            .map(|s| s.display_name.clone())
            .collect();

        let display_name = match suggested_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => self.names.generate_unique(&existing_names),
        };

        let session = Session {
            martyn_key: provided
                .map(ToString::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            display_name,
            avatar: Some(self.avatars.new_random_with_colors()),
            vocal_assist: VocalAssist::Off,
            search_history: Vec::new(),
            current_song: None,
            first_seen: now,
            last_seen: now,
            remote_addr: String::new(),
            device_name: String::new(),
            user_agent: String::new(),
            is_admin: false,
            connected: false,
            away: false,
            name_locked: false,
        };

        inner
            .sessions
            .insert(session.martyn_key.clone(), session.clone());
        let persist = inner.persist_session(&session);

        tracing::info!(key = %session.martyn_key, name = %session.display_name, "Minted session");

        Mutated {
            value: session,
            persist,
        }
    }

    /// Persists a fully mutated session, touching `last_seen`.
    pub fn update(&self, mut session: Session) -> Mutated<()> {
        let mut inner = self.inner.write().unwrap();
        session.last_seen = Utc::now();
        inner
            .sessions
            .insert(session.martyn_key.clone(), session.clone());
        let persist = inner.persist_session(&session);
        Mutated { value: (), persist }
    }

    fn mutate<F>(&self, key: &str, apply: F) -> Result<Mutated<Session>>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let mut inner = self.inner.write().unwrap();
        let session = inner
            .sessions
            .get_mut(key)
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))?;

        apply(session)?;
        session.last_seen = Utc::now();
        let session = session.clone();
        let persist = inner.persist_session(&session);
        Ok(Mutated {
            value: session,
            persist,
        })
    }

    pub fn set_vocal_assist(&self, key: &str, level: VocalAssist) -> Result<Mutated<Session>> {
        self.mutate(key, |s| {
            s.vocal_assist = level;
            Ok(())
        })
    }

    /// Prepends a search term (newest first, capped, duplicates kept).
    pub fn push_search_term(&self, key: &str, term: &str) -> Result<Mutated<Session>> {
        let term = term.to_string();
        self.mutate(key, move |s| {
            s.search_history.insert(0, term);
            s.search_history.truncate(SEARCH_HISTORY_LIMIT);
            Ok(())
        })
    }

    /// Profile update from the singer themself.
    ///
    /// The display name is ignored while the session is name-locked; the
    /// avatar part still applies. An empty name on an unlocked session is
    /// rejected.
    pub fn set_profile(
        &self,
        key: &str,
        display_name: &str,
        avatar_id: Option<&str>,
        avatar_config: Option<AvatarDescriptor>,
    ) -> Result<Mutated<Session>> {
        let display_name = display_name.trim().to_string();
        let avatar_id = avatar_id.map(ToString::to_string);
        self.mutate(key, move |s| {
            if !s.name_locked {
                if display_name.is_empty() {
                    return Err(Error::InvalidDisplayName);
                }
                s.display_name = display_name;
            }
            if let Some(config) = avatar_config {
                s.avatar = Some(config);
            } else if let Some(id) = avatar_id {
                let colors = s.avatar.as_ref().map(|a| a.colors.clone()).unwrap_or_default();
                s.avatar = Some(AvatarDescriptor { id, colors });
            }
            Ok(())
        })
    }

    /// Admin rename: bypasses the name lock.
    pub fn admin_set_display_name(&self, key: &str, display_name: &str) -> Result<Mutated<Session>> {
        let display_name = display_name.trim().to_string();
        self.mutate(key, move |s| {
            if display_name.is_empty() {
                return Err(Error::InvalidDisplayName);
            }
            s.display_name = display_name;
            Ok(())
        })
    }

    pub fn set_avatar(&self, key: &str, avatar: AvatarDescriptor) -> Result<Mutated<Session>> {
        self.mutate(key, move |s| {
            s.avatar = Some(avatar);
            Ok(())
        })
    }

    pub fn set_device_info(
        &self,
        key: &str,
        remote_addr: &str,
        device_name: &str,
        user_agent: &str,
    ) -> Result<Mutated<Session>> {
        let (remote_addr, device_name, user_agent) = (
            remote_addr.to_string(),
            device_name.to_string(),
            user_agent.to_string(),
        );
        self.mutate(key, move |s| {
            s.remote_addr = remote_addr;
            s.device_name = device_name;
            s.user_agent = user_agent;
            Ok(())
        })
    }

    pub fn set_admin(&self, key: &str, is_admin: bool) -> Result<Mutated<Session>> {
        self.mutate(key, move |s| {
            s.is_admin = is_admin;
            Ok(())
        })
    }

    pub fn set_away(&self, key: &str, away: bool) -> Result<Mutated<Session>> {
        self.mutate(key, move |s| {
            s.away = away;
            Ok(())
        })
    }

    pub fn set_name_locked(&self, key: &str, locked: bool) -> Result<Mutated<Session>> {
        self.mutate(key, move |s| {
            s.name_locked = locked;
            Ok(())
        })
    }

    pub fn set_connected(&self, key: &str, connected: bool) -> Result<Mutated<Session>> {
        self.mutate(key, move |s| {
            s.connected = connected;
            Ok(())
        })
    }

    pub fn set_current_song(&self, key: &str, song: Option<String>) -> Result<Mutated<Session>> {
        self.mutate(key, move |s| {
            s.current_song = song;
            Ok(())
        })
    }

    /// Blocks a key. `duration_secs == 0` blocks permanently. The key does
    /// not need a session (a flushed store must still honor old blocks).
    pub fn block(&self, key: &str, duration_secs: u64, reason: &str) -> Mutated<()> {
        let now = Utc::now();
        let blocked_until = if duration_secs == 0 {
            None
        } else {
            Some(now + Duration::seconds(duration_secs as i64))
        };

        let entry = BlockEntry {
            martyn_key: key.to_string(),
            blocked_at: now,
            blocked_until,
            reason: reason.to_string(),
        };

        let mut inner = self.inner.write().unwrap();
        inner.blocks.insert(key.to_string(), entry.clone());
        let persist = inner.persist_block(&entry);

        tracing::info!(key, reason, permanent = blocked_until.is_none(), "Blocked identity");

        Mutated { value: (), persist }
    }

    /// Lifts a block. Returns whether one existed.
    pub fn unblock(&self, key: &str) -> Mutated<bool> {
        let mut inner = self.inner.write().unwrap();
        let existed = inner.blocks.remove(key).is_some();
        let persist = if existed {
            inner.delete_block(key)
        } else {
            Ok(())
        };
        Mutated {
            value: existed,
            persist,
        }
    }

    /// Whether the key is currently blocked, with the reason.
    ///
    /// An expired entry is removed on the spot and reported as not
    /// blocked; without an intervening [`SessionStore::block`] call the
    /// answer can only flip from blocked to unblocked once.
    pub fn is_blocked(&self, key: &str) -> (bool, Option<String>) {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();

        match inner.blocks.get(key) {
            None => (false, None),
            Some(entry) if entry.expired_at(now) => {
                inner.blocks.remove(key);
                if let Err(e) = inner.delete_block(key) {
                    tracing::warn!(key, error = %e, "Failed to prune expired block");
                }
                (false, None)
            }
            Some(entry) => (true, Some(entry.reason.clone())),
        }
    }

    /// Block list joined with sessions for display, pruning expired
    /// entries on the way.
    pub fn list_blocked(&self) -> Vec<BlockedView> {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();

        let expired: Vec<String> = inner
            .blocks
            .values()
            .filter(|b| b.expired_at(now))
            .map(|b| b.martyn_key.clone())
            .collect();
        for key in &expired {
            inner.blocks.remove(key);
            if let Err(e) = inner.delete_block(key) {
                tracing::warn!(key, error = %e, "Failed to prune expired block");
            }
        }

        let mut views: Vec<BlockedView> = inner
            .blocks
            .values()
            .map(|b| BlockedView {
                martyn_key: b.martyn_key.clone(),
                display_name: inner
                    .sessions
                    .get(&b.martyn_key)
                    .map(|s| s.display_name.clone()),
                blocked_at: b.blocked_at,
                blocked_until: b.blocked_until,
                reason: b.reason.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.blocked_at.cmp(&b.blocked_at));
        views
    }

    /// Admin flush: drops every session. Returns how many were removed.
    pub fn flush_sessions(&self) -> Mutated<usize> {
        let mut inner = self.inner.write().unwrap();
        let count = inner.sessions.len();
        inner.sessions.clear();
        let persist = match &inner.db {
            Some(db) => db.delete_all_sessions(),
            None => Ok(()),
        };
        Mutated {
            value: count,
            persist,
        }
    }

    /// Admin flush: drops the whole block list.
    pub fn flush_blocks(&self) -> Mutated<usize> {
        let mut inner = self.inner.write().unwrap();
        let count = inner.blocks.len();
        inner.blocks.clear();
        let persist = match &inner.db {
            Some(db) => db.delete_all_blocks(),
            None => Ok(()),
        };
        Mutated {
            value: count,
            persist,
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().unwrap().sessions.len()
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().unwrap().blocks.len()
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.inner.read().unwrap().sessions.get(key).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().unwrap().sessions.values().cloned().collect()
    }

    /// Public projections of every session, sorted by display name for a
    /// stable roster.
    pub fn public_sessions(&self) -> Vec<SessionPublic> {
        let mut list: Vec<SessionPublic> = self
            .inner
            .read()
            .unwrap()
            .sessions
            .values()
            .map(Session::public)
            .collect();
        list.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        list
    }

    /// Whether any session currently holds the admin flag.
    pub fn has_admin(&self) -> bool {
        self.inner
            .read()
            .unwrap()
            .sessions
            .values()
            .any(|s| s.is_admin)
    }
}
