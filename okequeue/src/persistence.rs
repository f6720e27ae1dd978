//! SQLite persistence for the song queue.
//!
//! The whole queue is small (a room's worth of songs), so every save
//! rewrites the entry table, the cursor and the autoplay flag in one
//! transaction. The `ord` column exists only to restore order on load;
//! it is re-densified on every save, so removal gaps can never produce
//! colliding ordering keys.

use crate::error::{Error, Result};
use chrono::DateTime;
use okeproto::{SongEntry, VocalAssist};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Persistence handle for one queue database.
pub struct QueueDb {
    conn: Arc<Mutex<Connection>>,
}

impl QueueDb {
    /// Opens (or creates) the queue database.
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Persistence(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Persistence(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue_entries (
                entry_id TEXT PRIMARY KEY,
                ord INTEGER NOT NULL,
                song_id TEXT NOT NULL,
                title TEXT NOT NULL,
                artist TEXT NOT NULL,
                duration_secs INTEGER NOT NULL,
                vocal_path TEXT,
                instrumental_path TEXT,
                vocal_assist TEXT NOT NULL,
                added_by TEXT NOT NULL,
                added_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| Error::Persistence(format!("Failed to create queue_entries table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                position INTEGER NOT NULL,
                autoplay INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| Error::Persistence(format!("Failed to create queue_state table: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Saves the complete queue state.
    pub fn save(&self, songs: &[SongEntry], position: usize, autoplay: bool) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();

        let tx = conn
            .transaction()
            .map_err(|e| Error::Persistence(format!("Failed to open transaction: {}", e)))?;

        tx.execute("DELETE FROM queue_entries", [])
            .map_err(|e| Error::Persistence(format!("Failed to clear entries: {}", e)))?;

        for (ord, song) in songs.iter().enumerate() {
            tx.execute(
                "INSERT INTO queue_entries (entry_id, ord, song_id, title, artist,
                     duration_secs, vocal_path, instrumental_path, vocal_assist, added_by, added_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    song.entry_id,
                    ord as i64,
                    song.song_id,
                    song.title,
                    song.artist,
                    song.duration_secs as i64,
                    song.vocal_path,
                    song.instrumental_path,
                    song.vocal_assist.as_str(),
                    song.added_by,
                    song.added_at.timestamp_nanos_opt().unwrap_or_default(),
                ],
            )
            .map_err(|e| Error::Persistence(format!("Failed to insert entry: {}", e)))?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO queue_state (id, position, autoplay) VALUES (1, ?1, ?2)",
            params![position as i64, autoplay],
        )
        .map_err(|e| Error::Persistence(format!("Failed to save queue state: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::Persistence(format!("Failed to commit queue save: {}", e)))?;

        Ok(())
    }

    /// Loads the queue exactly as last committed.
    ///
    /// Returns entries in stored order, the cursor, and the autoplay flag.
    /// A fresh database yields an empty queue with autoplay on.
    pub fn load(&self) -> Result<(Vec<SongEntry>, usize, bool)> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT entry_id, song_id, title, artist, duration_secs,
                        vocal_path, instrumental_path, vocal_assist, added_by, added_at
                 FROM queue_entries ORDER BY ord ASC",
            )
            .map_err(|e| Error::Persistence(format!("Failed to prepare statement: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let vocal_assist: String = row.get(7)?;
                let added_at_nanos: i64 = row.get(9)?;

                Ok(SongEntry {
                    entry_id: row.get(0)?,
                    song_id: row.get(1)?,
                    title: row.get(2)?,
                    artist: row.get(3)?,
                    duration_secs: row.get::<_, i64>(4)? as u32,
                    vocal_path: row.get(5)?,
                    instrumental_path: row.get(6)?,
                    vocal_assist: vocal_assist.parse().unwrap_or(VocalAssist::Off),
                    added_by: row.get(8)?,
                    added_at: DateTime::from_timestamp_nanos(added_at_nanos),
                })
            })
            .map_err(|e| Error::Persistence(format!("Failed to query entries: {}", e)))?;

        let mut songs = Vec::new();
        for row in rows {
            songs
                .push(row.map_err(|e| Error::Persistence(format!("Failed to read entry: {}", e)))?);
        }

        let state = conn
            .query_row(
                "SELECT position, autoplay FROM queue_state WHERE id = 1",
                [],
                |row| {
                    let position: i64 = row.get(0)?;
                    let autoplay: bool = row.get(1)?;
                    Ok((position as usize, autoplay))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(Error::Persistence(format!(
                    "Failed to load queue state: {}",
                    e
                ))),
            })?;

        let (position, autoplay) = state.unwrap_or((0, true));

        // Clamp a cursor that outlived its entries (hand-edited database)
        let position = position.min(songs.len());

        Ok((songs, position, autoplay))
    }
}
