//! # okequeue - Persistent song queue for OkeRoom
//!
//! This crate owns the room's ordered song queue and its position cursor:
//! - Entries at `[0, position)` are history
//! - The entry at `position` (if any) is now playing
//! - Entries at `(position, len)` are upcoming; `position == len` means
//!   the queue is exhausted
//!
//! All mutations are atomic with respect to each other and to the cursor:
//! a single mutex guards the queue, and the SQLite write-behind happens
//! before the mutex is released. Change observers registered with
//! [`QueueStore::on_change`] fire after the mutation completes, outside
//! the lock.
//!
//! The in-memory queue is authoritative: a failed database write is
//! reported through [`Mutated::persist`] but never rolls the change back.
//!
//! # Examples
//!
//! ```
//! use okequeue::{NewSong, QueueStore};
//! use okeproto::VocalAssist;
//!
//! let queue = QueueStore::ephemeral();
//! let added = queue.add(NewSong {
//!     song_id: "lib-1".into(),
//!     title: "Bohemian Rhapsody".into(),
//!     artist: "Queen".into(),
//!     duration_secs: 354,
//!     vocal_assist: VocalAssist::Off,
//!     added_by: "singer-key".into(),
//! });
//! assert_eq!(queue.current().unwrap().entry_id, added.value.entry_id);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use okeproto::{QueueSnapshot, SongEntry, VocalAssist};
use rand::seq::SliceRandom;
use uuid::Uuid;

pub mod error;
pub mod persistence;

pub use error::{Error, Result};
use persistence::QueueDb;

/// Outcome of a queue mutation.
///
/// The in-memory queue always holds the change; `persist` reports whether
/// the write-behind to SQLite also succeeded. Callers surface a failed
/// persist to the originating client without rolling anything back.
#[derive(Debug)]
#[must_use]
pub struct Mutated<T> {
    pub value: T,
    pub persist: Result<()>,
}

/// Input for [`QueueStore::add`]; the store mints the entry id and the
/// added-at timestamp.
#[derive(Debug, Clone)]
pub struct NewSong {
    pub song_id: String,
    pub title: String,
    pub artist: String,
    pub duration_secs: u32,
    pub vocal_assist: VocalAssist,
    pub added_by: String,
}

/// Result of [`QueueStore::remove_by_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRemoval {
    /// Number of entries deleted.
    pub removed: usize,
    /// True when one of them was the now-playing entry.
    pub current_removed: bool,
}

struct QueueInner {
    songs: Vec<SongEntry>,
    position: usize,
    autoplay: bool,
    db: Option<QueueDb>,
}

impl QueueInner {
    fn save(&self) -> Result<()> {
        match &self.db {
            Some(db) => db.save(&self.songs, self.position, self.autoplay),
            None => Ok(()),
        }
    }
}

type ChangeObserver = Arc<dyn Fn() + Send + Sync>;

/// Thread-safe, persistent song queue with a moving position cursor.
pub struct QueueStore {
    inner: Mutex<QueueInner>,
    observers: RwLock<HashMap<u64, ChangeObserver>>,
    observer_counter: AtomicU64,
}

impl QueueStore {
    /// Opens the queue backed by the given SQLite database, reloading the
    /// last committed entries, cursor and autoplay flag.
    pub fn open(db_path: &Path) -> Result<Self> {
        let db = QueueDb::new(db_path)?;
        let (songs, position, autoplay) = db.load()?;

        tracing::info!(
            entries = songs.len(),
            position,
            autoplay,
            "Queue restored from database"
        );

        Ok(Self {
            inner: Mutex::new(QueueInner {
                songs,
                position,
                autoplay,
                db: Some(db),
            }),
            observers: RwLock::new(HashMap::new()),
            observer_counter: AtomicU64::new(1),
        })
    }

    /// Creates a queue with no persistence (tests, throwaway rooms).
    pub fn ephemeral() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                songs: Vec::new(),
                position: 0,
                autoplay: true,
                db: None,
            }),
            observers: RwLock::new(HashMap::new()),
            observer_counter: AtomicU64::new(1),
        }
    }

    /// Registers a change observer invoked after every mutation completes.
    ///
    /// The callback runs outside the queue lock; it may freely call back
    /// into the store. Returns a token for [`QueueStore::remove_observer`].
    pub fn on_change<F>(&self, callback: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        let token = self.observer_counter.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .unwrap()
            .insert(token, Arc::new(callback));
        token
    }

    /// Unregisters a change observer.
    pub fn remove_observer(&self, token: u64) {
        self.observers.write().unwrap().remove(&token);
    }

    fn notify_changed(&self) {
        let observers: Vec<ChangeObserver> = {
            let guard = self.observers.read().unwrap();
            guard.values().cloned().collect()
        };
        for observer in observers {
            observer();
        }
    }

    /// Appends a song at the end of the queue; the cursor is unchanged.
    pub fn add(&self, song: NewSong) -> Mutated<SongEntry> {
        let entry = SongEntry {
            entry_id: Uuid::new_v4().to_string(),
            song_id: song.song_id,
            title: song.title,
            artist: song.artist,
            duration_secs: song.duration_secs,
            vocal_path: None,
            instrumental_path: None,
            vocal_assist: song.vocal_assist,
            added_by: song.added_by,
            added_at: Utc::now(),
        };

        let persist = {
            let mut inner = self.inner.lock().unwrap();
            inner.songs.push(entry.clone());
            inner.save()
        };

        self.notify_changed();
        Mutated {
            value: entry,
            persist,
        }
    }

    /// Deletes the entry with the given id.
    ///
    /// Returns true when the removed entry was the now-playing one; the
    /// cursor then stays in place and whatever occupied the next index
    /// becomes current (or the queue goes exhausted).
    pub fn remove(&self, entry_id: &str) -> Result<Mutated<bool>> {
        let (current_removed, persist) = {
            let mut inner = self.inner.lock().unwrap();
            let index = inner
                .songs
                .iter()
                .position(|s| s.entry_id == entry_id)
                .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;

            inner.songs.remove(index);
            let current_removed = index == inner.position;
            if index < inner.position {
                inner.position -= 1;
            }
            (current_removed, inner.save())
        };

        self.notify_changed();
        Ok(Mutated {
            value: current_removed,
            persist,
        })
    }

    /// Deletes every entry added by the given singer.
    pub fn remove_by_user(&self, added_by: &str) -> Mutated<UserRemoval> {
        let (removal, persist) = {
            let mut inner = self.inner.lock().unwrap();

            let mut removed = 0usize;
            let mut current_removed = false;
            let mut shift = 0usize;
            let position = inner.position;

            let mut index = 0usize;
            inner.songs.retain(|song| {
                let keep = song.added_by != added_by;
                if !keep {
                    removed += 1;
                    if index == position {
                        current_removed = true;
                    }
                    if index < position {
                        shift += 1;
                    }
                }
                index += 1;
                keep
            });
            inner.position -= shift;

            (
                UserRemoval {
                    removed,
                    current_removed,
                },
                inner.save(),
            )
        };

        if removal.removed > 0 {
            self.notify_changed();
        }
        Mutated {
            value: removal,
            persist,
        }
    }

    /// Reorders one entry within the current + upcoming region.
    ///
    /// Both indices are inclusive-clamped into that region: history can
    /// never be reordered. When the now-playing entry itself moves, the
    /// cursor follows it; otherwise the cursor keeps pointing at the same
    /// entry.
    pub fn move_entry(&self, from: usize, to: usize) -> Mutated<()> {
        let (moved, persist) = {
            let mut inner = self.inner.lock().unwrap();
            let len = inner.songs.len();

            // Exhausted queue: everything is history, nothing to reorder.
            if inner.position >= len {
                (false, Ok(()))
            } else {
                let lo = inner.position;
                let hi = len - 1;
                let from = from.clamp(lo, hi);
                let mut to = to.clamp(lo, hi);
                if from != inner.position && to == inner.position {
                    // Non-current entries cannot land before the current one.
                    to = (inner.position + 1).min(hi);
                }

                if from == to {
                    (false, Ok(()))
                } else {
                    let current_id = inner.songs[inner.position].entry_id.clone();
                    let item = inner.songs.remove(from);
                    inner.songs.insert(to, item);
                    if let Some(idx) =
                        inner.songs.iter().position(|s| s.entry_id == current_id)
                    {
                        inner.position = idx;
                    }
                    (true, inner.save())
                }
            }
        };

        if moved {
            self.notify_changed();
        }
        Mutated { value: (), persist }
    }

    /// Randomly permutes the upcoming segment; history and the now-playing
    /// entry are left exactly where they are.
    pub fn shuffle(&self) -> Mutated<()> {
        let persist = {
            let mut inner = self.inner.lock().unwrap();
            let start = (inner.position + 1).min(inner.songs.len());
            inner.songs[start..].shuffle(&mut rand::rng());
            inner.save()
        };

        self.notify_changed();
        Mutated { value: (), persist }
    }

    /// Drops all entries and resets the cursor to zero.
    pub fn clear(&self) -> Mutated<()> {
        let persist = {
            let mut inner = self.inner.lock().unwrap();
            inner.songs.clear();
            inner.position = 0;
            inner.save()
        };

        self.notify_changed();
        Mutated { value: (), persist }
    }

    /// Entry at the cursor, or None when the queue is exhausted.
    pub fn current(&self) -> Option<SongEntry> {
        let inner = self.inner.lock().unwrap();
        inner.songs.get(inner.position).cloned()
    }

    /// Advances the cursor by one if an upcoming entry exists and returns
    /// the new current entry.
    pub fn next(&self) -> Mutated<Option<SongEntry>> {
        let (current, advanced, persist) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.position + 1 < inner.songs.len() {
                inner.position += 1;
                let current = inner.songs.get(inner.position).cloned();
                let persist = inner.save();
                (current, true, persist)
            } else {
                let current = inner.songs.get(inner.position).cloned();
                (current, false, Ok(()))
            }
        };

        if advanced {
            self.notify_changed();
        }
        Mutated {
            value: current,
            persist,
        }
    }

    /// Advances the cursor unconditionally, allowing it to pass the last
    /// entry (exhausted queue). Returns the new current entry, if any.
    pub fn skip(&self) -> Mutated<Option<SongEntry>> {
        let (current, persist) = {
            let mut inner = self.inner.lock().unwrap();
            inner.position = (inner.position + 1).min(inner.songs.len());
            let current = inner.songs.get(inner.position).cloned();
            (current, inner.save())
        };

        self.notify_changed();
        Mutated {
            value: current,
            persist,
        }
    }

    /// Clones the named entry (fresh entry id, new owner, new timestamp).
    ///
    /// When the queue is exhausted the clone is inserted at the cursor so
    /// it immediately becomes the new current entry; otherwise it is
    /// appended at the end.
    pub fn requeue(&self, entry_id: &str, new_owner: &str) -> Result<Mutated<SongEntry>> {
        let (clone, persist) = {
            let mut inner = self.inner.lock().unwrap();
            let source = inner
                .songs
                .iter()
                .find(|s| s.entry_id == entry_id)
                .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;

            let mut clone = source.clone();
            clone.entry_id = Uuid::new_v4().to_string();
            clone.added_by = new_owner.to_string();
            clone.added_at = Utc::now();

            if inner.position == inner.songs.len() {
                let at = inner.position;
                inner.songs.insert(at, clone.clone());
            } else {
                inner.songs.push(clone.clone());
            }
            (clone, inner.save())
        };

        self.notify_changed();
        Ok(Mutated {
            value: clone,
            persist,
        })
    }

    /// Moves every upcoming entry added by the given singer to the end of
    /// the queue, preserving their relative order. Returns how many moved.
    pub fn bump_user_to_end(&self, added_by: &str) -> Mutated<usize> {
        let (moved, persist) = {
            let mut inner = self.inner.lock().unwrap();
            let start = (inner.position + 1).min(inner.songs.len());

            let upcoming = inner.songs.split_off(start);
            let (bumped, kept): (Vec<_>, Vec<_>) = upcoming
                .into_iter()
                .partition(|s| s.added_by == added_by);
            let moved = bumped.len();
            inner.songs.extend(kept);
            inner.songs.extend(bumped);

            if moved > 0 {
                (moved, inner.save())
            } else {
                (moved, Ok(()))
            }
        };

        if moved > 0 {
            self.notify_changed();
        }
        Mutated {
            value: moved,
            persist,
        }
    }

    /// Late binding of media paths once asynchronous preparation is done.
    pub fn update_song_paths(
        &self,
        entry_id: &str,
        vocal_path: Option<String>,
        instrumental_path: Option<String>,
    ) -> Result<Mutated<()>> {
        let persist = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .songs
                .iter_mut()
                .find(|s| s.entry_id == entry_id)
                .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;

            entry.vocal_path = vocal_path;
            entry.instrumental_path = instrumental_path;
            inner.save()
        };

        self.notify_changed();
        Ok(Mutated { value: (), persist })
    }

    /// Toggles automatic advancing through the end-of-song countdown.
    pub fn set_autoplay(&self, autoplay: bool) -> Mutated<()> {
        let persist = {
            let mut inner = self.inner.lock().unwrap();
            inner.autoplay = autoplay;
            inner.save()
        };

        self.notify_changed();
        Mutated { value: (), persist }
    }

    pub fn autoplay(&self) -> bool {
        self.inner.lock().unwrap().autoplay
    }

    pub fn position(&self) -> usize {
        self.inner.lock().unwrap().position
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().songs.is_empty()
    }

    /// Copies out the full ordered entry list.
    pub fn entries(&self) -> Vec<SongEntry> {
        self.inner.lock().unwrap().songs.clone()
    }

    /// Point-in-time view of entries, cursor and autoplay.
    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().unwrap();
        QueueSnapshot {
            songs: inner.songs.clone(),
            position: inner.position,
            autoplay: inner.autoplay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn song(title: &str, added_by: &str) -> NewSong {
        NewSong {
            song_id: format!("lib-{title}"),
            title: title.to_string(),
            artist: "Artist".to_string(),
            duration_secs: 200,
            vocal_assist: VocalAssist::Off,
            added_by: added_by.to_string(),
        }
    }

    fn titles(queue: &QueueStore) -> Vec<String> {
        queue.entries().into_iter().map(|s| s.title).collect()
    }

    #[test]
    fn add_leaves_cursor_alone() {
        let queue = QueueStore::ephemeral();
        queue.add(song("A", "k1")).persist.unwrap();
        queue.add(song("B", "k1")).persist.unwrap();

        assert_eq!(queue.position(), 0);
        assert_eq!(queue.current().unwrap().title, "A");
    }

    #[test]
    fn history_boundary_over_remove() {
        // Add A,B,C; advance; remove A; then remove the current B.
        let queue = QueueStore::ephemeral();
        let a = queue.add(song("A", "k1")).value;
        let b = queue.add(song("B", "k1")).value;
        queue.add(song("C", "k1")).persist.unwrap();

        assert_eq!(queue.position(), 0);
        assert_eq!(queue.current().unwrap().title, "A");

        let next = queue.next();
        assert_eq!(next.value.unwrap().title, "B");
        assert_eq!(queue.position(), 1);

        let removed = queue.remove(&a.entry_id).unwrap();
        assert!(!removed.value);
        assert_eq!(queue.position(), 0);
        assert_eq!(queue.current().unwrap().title, "B");
        assert_eq!(titles(&queue), vec!["B", "C"]);

        let removed = queue.remove(&b.entry_id).unwrap();
        assert!(removed.value, "removing the now-playing entry");
        assert_eq!(queue.position(), 0);
        assert_eq!(queue.current().unwrap().title, "C");
    }

    #[test]
    fn remove_unknown_entry_is_not_found() {
        let queue = QueueStore::ephemeral();
        queue.add(song("A", "k1")).persist.unwrap();

        match queue.remove("no-such-entry") {
            Err(Error::EntryNotFound(id)) => assert_eq!(id, "no-such-entry"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn skip_may_exhaust_the_queue() {
        let queue = QueueStore::ephemeral();
        queue.add(song("X", "k1")).persist.unwrap();

        let skipped = queue.skip();
        assert!(skipped.value.is_none());
        assert_eq!(queue.position(), 1);
        assert!(queue.current().is_none());
    }

    #[test]
    fn next_stops_at_last_entry() {
        let queue = QueueStore::ephemeral();
        queue.add(song("A", "k1")).persist.unwrap();
        queue.add(song("B", "k1")).persist.unwrap();

        assert_eq!(queue.next().value.unwrap().title, "B");
        // No upcoming entry left: the cursor must not advance further.
        assert_eq!(queue.next().value.unwrap().title, "B");
        assert_eq!(queue.position(), 1);
    }

    #[test]
    fn requeue_when_exhausted_becomes_current() {
        // Add X, skip past it, requeue it for another singer.
        let queue = QueueStore::ephemeral();
        let x = queue.add(song("X", "k1")).value;
        let _ = queue.skip();
        assert_eq!(queue.position(), 1);

        let clone = queue.requeue(&x.entry_id, "k2").unwrap().value;
        assert_ne!(clone.entry_id, x.entry_id);
        assert_eq!(clone.added_by, "k2");
        assert_eq!(queue.position(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.current().unwrap().entry_id, clone.entry_id);
        assert_eq!(queue.entries()[0].entry_id, x.entry_id, "original stays in history");
    }

    #[test]
    fn requeue_live_queue_appends() {
        let queue = QueueStore::ephemeral();
        let a = queue.add(song("A", "k1")).value;
        queue.add(song("B", "k1")).persist.unwrap();

        let clone = queue.requeue(&a.entry_id, "k2").unwrap().value;
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.position(), 0);
        assert_eq!(queue.entries()[2].entry_id, clone.entry_id);
    }

    #[test]
    fn requeue_ids_stay_unique() {
        let queue = QueueStore::ephemeral();
        let a = queue.add(song("A", "k1")).value;
        for _ in 0..5 {
            queue.requeue(&a.entry_id, "k2").unwrap().persist.unwrap();
        }

        let ids: HashSet<String> = queue.entries().into_iter().map(|s| s.entry_id).collect();
        assert_eq!(ids.len(), queue.len());
    }

    #[test]
    fn shuffle_preserves_history_and_current() {
        // Ten entries, cursor at 2, shuffle the rest.
        let queue = QueueStore::ephemeral();
        for i in 0..10 {
            queue.add(song(&format!("S{i}"), "k1")).persist.unwrap();
        }
        let _ = queue.next();
        let _ = queue.next();
        assert_eq!(queue.position(), 2);

        let before = queue.entries();
        queue.shuffle().persist.unwrap();
        let after = queue.entries();

        for i in 0..3 {
            assert_eq!(before[i].entry_id, after[i].entry_id, "index {i} must not move");
        }

        let before_ids: HashSet<&str> =
            before[3..].iter().map(|s| s.entry_id.as_str()).collect();
        let after_ids: HashSet<&str> = after[3..].iter().map(|s| s.entry_id.as_str()).collect();
        assert_eq!(before_ids, after_ids);
    }

    #[test]
    fn clear_resets_cursor() {
        let queue = QueueStore::ephemeral();
        queue.add(song("A", "k1")).persist.unwrap();
        queue.add(song("B", "k1")).persist.unwrap();
        let _ = queue.next();

        queue.clear().persist.unwrap();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.position(), 0);
        assert!(queue.current().is_none());
    }

    #[test]
    fn cursor_stays_in_bounds_under_mixed_operations() {
        let queue = QueueStore::ephemeral();
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(queue.add(song(&format!("S{i}"), "k1")).value.entry_id);
        }

        let _ = queue.next();
        let _ = queue.skip();
        queue.remove(&ids[0]).unwrap().persist.unwrap();
        queue.shuffle().persist.unwrap();
        let _ = queue.move_entry(4, 1);
        queue.remove(&ids[5]).ok();
        let _ = queue.skip();
        let _ = queue.skip();
        let _ = queue.skip();
        let _ = queue.skip();

        assert!(queue.position() <= queue.len());
    }

    #[test]
    fn move_follows_the_current_entry() {
        let queue = QueueStore::ephemeral();
        for i in 0..4 {
            queue.add(song(&format!("S{i}"), "k1")).persist.unwrap();
        }
        let current = queue.current().unwrap();

        // Move the current entry two slots down: the cursor follows it.
        let _ = queue.move_entry(0, 2);
        assert_eq!(queue.position(), 2);
        assert_eq!(queue.current().unwrap().entry_id, current.entry_id);
    }

    #[test]
    fn move_cannot_reorder_history() {
        let queue = QueueStore::ephemeral();
        for i in 0..4 {
            queue.add(song(&format!("S{i}"), "k1")).persist.unwrap();
        }
        let _ = queue.next();
        let _ = queue.next();
        let history: Vec<String> = queue.entries()[..2]
            .iter()
            .map(|s| s.entry_id.clone())
            .collect();

        // Target index 0 sits in history; the move is clamped.
        let _ = queue.move_entry(3, 0);
        let after: Vec<String> = queue.entries()[..2]
            .iter()
            .map(|s| s.entry_id.clone())
            .collect();
        assert_eq!(history, after);
        assert_eq!(queue.position(), 2);
    }

    #[test]
    fn move_out_of_range_is_clamped() {
        let queue = QueueStore::ephemeral();
        for i in 0..3 {
            queue.add(song(&format!("S{i}"), "k1")).persist.unwrap();
        }

        let _ = queue.move_entry(99, 1);
        assert_eq!(queue.len(), 3);
        assert!(queue.position() <= queue.len());
    }

    #[test]
    fn remove_by_user_deletes_all_their_entries() {
        let queue = QueueStore::ephemeral();
        queue.add(song("A", "k1")).persist.unwrap();
        queue.add(song("B", "k2")).persist.unwrap();
        queue.add(song("C", "k1")).persist.unwrap();
        queue.add(song("D", "k2")).persist.unwrap();
        let _ = queue.next();

        // Cursor on B (k2): removing k2 takes out the current entry too.
        let removal = queue.remove_by_user("k2").value;
        assert_eq!(removal.removed, 2);
        assert!(removal.current_removed);
        assert_eq!(titles(&queue), vec!["A", "C"]);
        assert_eq!(queue.position(), 1);
        assert_eq!(queue.current().unwrap().title, "C");
    }

    #[test]
    fn remove_by_user_adjusts_cursor_for_history_deletions() {
        let queue = QueueStore::ephemeral();
        queue.add(song("A", "k1")).persist.unwrap();
        queue.add(song("B", "k2")).persist.unwrap();
        queue.add(song("C", "k2")).persist.unwrap();
        let _ = queue.next();
        let _ = queue.next();
        assert_eq!(queue.position(), 2);

        let removal = queue.remove_by_user("k1").value;
        assert_eq!(removal.removed, 1);
        assert!(!removal.current_removed);
        assert_eq!(queue.position(), 1);
        assert_eq!(queue.current().unwrap().title, "C");
    }

    #[test]
    fn bump_user_keeps_relative_order_and_spares_current() {
        let queue = QueueStore::ephemeral();
        queue.add(song("A", "k1")).persist.unwrap();
        queue.add(song("B", "k2")).persist.unwrap();
        queue.add(song("C", "k1")).persist.unwrap();
        queue.add(song("D", "k2")).persist.unwrap();
        queue.add(song("E", "k1")).persist.unwrap();

        // Current is A (k1); only upcoming k1 entries move.
        let moved = queue.bump_user_to_end("k1").value;
        assert_eq!(moved, 2);
        assert_eq!(titles(&queue), vec!["A", "B", "D", "C", "E"]);
        assert_eq!(queue.position(), 0);
    }

    #[test]
    fn update_song_paths_binds_media() {
        let queue = QueueStore::ephemeral();
        let a = queue.add(song("A", "k1")).value;

        queue
            .update_song_paths(
                &a.entry_id,
                Some("/media/a.vocal.ogg".into()),
                Some("/media/a.instr.ogg".into()),
            )
            .unwrap()
            .persist
            .unwrap();

        let entry = queue.current().unwrap();
        assert_eq!(entry.vocal_path.as_deref(), Some("/media/a.vocal.ogg"));
        assert_eq!(
            entry.instrumental_path.as_deref(),
            Some("/media/a.instr.ogg")
        );
    }

    #[test]
    fn autoplay_round_trips() {
        let queue = QueueStore::ephemeral();
        assert!(queue.autoplay());
        queue.set_autoplay(false).persist.unwrap();
        assert!(!queue.autoplay());
    }

    #[test]
    fn observers_fire_after_mutations_and_may_reenter() {
        use std::sync::atomic::AtomicUsize;

        let queue = Arc::new(QueueStore::ephemeral());
        let fired = Arc::new(AtomicUsize::new(0));
        let observed_len = Arc::new(AtomicUsize::new(0));

        let token = {
            let fired = fired.clone();
            let observed_len = observed_len.clone();
            let reentrant = queue.clone();
            queue.on_change(move || {
                fired.fetch_add(1, Ordering::SeqCst);
                // Re-entering the store must not deadlock: the callback
                // runs outside the queue lock.
                observed_len.store(reentrant.len(), Ordering::SeqCst);
            })
        };

        queue.add(song("A", "k1")).persist.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(observed_len.load(Ordering::SeqCst), 1);

        queue.remove_observer(token);
        queue.add(song("B", "k1")).persist.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("queue.db");

        let (a_id, b_id) = {
            let queue = QueueStore::open(&db_path).unwrap();
            let a = queue.add(song("A", "k1")).value;
            let b = queue.add(song("B", "k2")).value;
            let _ = queue.next();
            queue.set_autoplay(false).persist.unwrap();
            (a.entry_id, b.entry_id)
        };

        let reopened = QueueStore::open(&db_path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.position(), 1);
        assert!(!reopened.autoplay());

        let entries = reopened.entries();
        assert_eq!(entries[0].entry_id, a_id);
        assert_eq!(entries[1].entry_id, b_id);
        assert_eq!(reopened.current().unwrap().entry_id, b_id);
    }
}
