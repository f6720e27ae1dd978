//! SQLite persistence for sessions and the block list.
//!
//! Sessions upsert row-by-row (they mutate independently); the block
//! list is small and rewrites whole rows too. Avatars and search
//! histories are stored as JSON text columns.

use crate::error::{Error, Result};
use crate::session::{BlockEntry, Session};
use chrono::DateTime;
use okeproto::VocalAssist;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct SessionDb {
    conn: Arc<Mutex<Connection>>,
}

impl SessionDb {
    /// Opens (or creates) the session database.
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Persistence(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Persistence(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                martyn_key TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                avatar TEXT,
                vocal_assist TEXT NOT NULL,
                search_history TEXT NOT NULL,
                current_song TEXT,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                remote_addr TEXT NOT NULL,
                device_name TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                is_admin INTEGER NOT NULL,
                connected INTEGER NOT NULL,
                away INTEGER NOT NULL,
                name_locked INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| Error::Persistence(format!("Failed to create sessions table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                martyn_key TEXT PRIMARY KEY,
                blocked_at INTEGER NOT NULL,
                blocked_until INTEGER,
                reason TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| Error::Persistence(format!("Failed to create blocks table: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Inserts or replaces one session row.
    pub fn save_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let avatar = match &session.avatar {
            Some(avatar) => Some(
                serde_json::to_string(avatar)
                    .map_err(|e| Error::Persistence(format!("Failed to encode avatar: {}", e)))?,
            ),
            None => None,
        };
        let search_history = serde_json::to_string(&session.search_history)
            .map_err(|e| Error::Persistence(format!("Failed to encode search history: {}", e)))?;

        conn.execute(
            "INSERT OR REPLACE INTO sessions (
                martyn_key, display_name, avatar, vocal_assist, search_history,
                current_song, first_seen, last_seen, remote_addr, device_name,
                user_agent, is_admin, connected, away, name_locked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                session.martyn_key,
                session.display_name,
                avatar,
                session.vocal_assist.as_str(),
                search_history,
                session.current_song,
                session.first_seen.timestamp_nanos_opt().unwrap_or_default(),
                session.last_seen.timestamp_nanos_opt().unwrap_or_default(),
                session.remote_addr,
                session.device_name,
                session.user_agent,
                session.is_admin,
                session.connected,
                session.away,
                session.name_locked,
            ],
        )
        .map_err(|e| Error::Persistence(format!("Failed to save session: {}", e)))?;

        Ok(())
    }

    /// Loads every session. Presence flags are reset: nobody is connected
    /// right after a restart.
    pub fn load_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT martyn_key, display_name, avatar, vocal_assist, search_history,
                        current_song, first_seen, last_seen, remote_addr, device_name,
                        user_agent, is_admin, away, name_locked
                 FROM sessions",
            )
            .map_err(|e| Error::Persistence(format!("Failed to prepare statement: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let avatar: Option<String> = row.get(2)?;
                let vocal_assist: String = row.get(3)?;
                let search_history: String = row.get(4)?;
                let first_seen: i64 = row.get(6)?;
                let last_seen: i64 = row.get(7)?;

                Ok(Session {
                    martyn_key: row.get(0)?,
                    display_name: row.get(1)?,
                    avatar: avatar.and_then(|a| serde_json::from_str(&a).ok()),
                    vocal_assist: vocal_assist.parse().unwrap_or(VocalAssist::Off),
                    search_history: serde_json::from_str(&search_history).unwrap_or_default(),
                    current_song: row.get(5)?,
                    first_seen: DateTime::from_timestamp_nanos(first_seen),
                    last_seen: DateTime::from_timestamp_nanos(last_seen),
                    remote_addr: row.get(8)?,
                    device_name: row.get(9)?,
                    user_agent: row.get(10)?,
                    is_admin: row.get(11)?,
                    connected: false,
                    away: row.get(12)?,
                    name_locked: row.get(13)?,
                })
            })
            .map_err(|e| Error::Persistence(format!("Failed to query sessions: {}", e)))?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions
                .push(row.map_err(|e| Error::Persistence(format!("Failed to read session: {}", e)))?);
        }
        Ok(sessions)
    }

    /// Deletes every session row.
    pub fn delete_all_sessions(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions", [])
            .map_err(|e| Error::Persistence(format!("Failed to flush sessions: {}", e)))?;
        Ok(())
    }

    /// Inserts or replaces one block row.
    pub fn save_block(&self, block: &BlockEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blocks (martyn_key, blocked_at, blocked_until, reason)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                block.martyn_key,
                block.blocked_at.timestamp_nanos_opt().unwrap_or_default(),
                block
                    .blocked_until
                    .map(|t| t.timestamp_nanos_opt().unwrap_or_default()),
                block.reason,
            ],
        )
        .map_err(|e| Error::Persistence(format!("Failed to save block: {}", e)))?;
        Ok(())
    }

    /// Loads the whole block list.
    pub fn load_blocks(&self) -> Result<Vec<BlockEntry>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare("SELECT martyn_key, blocked_at, blocked_until, reason FROM blocks")
            .map_err(|e| Error::Persistence(format!("Failed to prepare statement: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let blocked_at: i64 = row.get(1)?;
                let blocked_until: Option<i64> = row.get(2)?;
                Ok(BlockEntry {
                    martyn_key: row.get(0)?,
                    blocked_at: DateTime::from_timestamp_nanos(blocked_at),
                    blocked_until: blocked_until.map(DateTime::from_timestamp_nanos),
                    reason: row.get(3)?,
                })
            })
            .map_err(|e| Error::Persistence(format!("Failed to query blocks: {}", e)))?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks
                .push(row.map_err(|e| Error::Persistence(format!("Failed to read block: {}", e)))?);
        }
        Ok(blocks)
    }

    /// Deletes one block row.
    pub fn delete_block(&self, martyn_key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM blocks WHERE martyn_key = ?1",
            params![martyn_key],
        )
        .map_err(|e| Error::Persistence(format!("Failed to delete block: {}", e)))?;
        Ok(())
    }

    /// Deletes every block row.
    pub fn delete_all_blocks(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM blocks", [])
            .map_err(|e| Error::Persistence(format!("Failed to flush blocks: {}", e)))?;
        Ok(())
    }
}
