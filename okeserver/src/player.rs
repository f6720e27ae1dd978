//! Player state and the outbound player contract.
//!
//! The room never renders audio or video. It keeps an authoritative
//! [`PlayerSnapshot`] written by the transport-control ingress and by the
//! player collaborator, and sends commands out through [`PlayerLink`].
//!
//! [`LoopbackPlayer`] is the shipped implementation: it advances the
//! position once per second while playing and reports end-of-song back to
//! the room, so the coordination core runs end-to-end without an external
//! renderer. A real AV player implements the same trait and calls the
//! same ingress.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use okeproto::{PlayerSnapshot, SongEntry, VocalAssist};

use crate::room::RoomContext;

/// Authoritative player view, written only by the transport-control
/// ingress and the player collaborator.
pub struct PlayerState {
    inner: RwLock<PlayerSnapshot>,
}

impl PlayerState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PlayerSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        self.inner.read().unwrap().clone()
    }

    /// Loads a song into the player view and starts it from zero.
    pub fn set_current(&self, entry: &SongEntry) {
        let mut inner = self.inner.write().unwrap();
        inner.current_song = Some(entry.entry_id.clone());
        inner.duration_secs = entry.duration_secs as f64;
        inner.position_secs = 0.0;
        inner.playing = true;
        inner.idle = false;
        inner.background_music = false;
        inner.vocal_assist = entry.vocal_assist;
    }

    /// Puts the player in idle: no song, background music if enabled.
    pub fn set_idle(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.current_song = None;
        inner.duration_secs = 0.0;
        inner.position_secs = 0.0;
        inner.playing = false;
        inner.idle = true;
        inner.background_music = inner.background_music_enabled;
    }

    pub fn set_playing(&self, playing: bool) {
        self.inner.write().unwrap().playing = playing;
    }

    pub fn set_position(&self, position_secs: f64) {
        let mut inner = self.inner.write().unwrap();
        inner.position_secs = position_secs.clamp(0.0, inner.duration_secs.max(0.0));
    }

    /// Progress report from the player collaborator.
    pub fn report_progress(&self, position_secs: f64, duration_secs: f64, playing: bool) {
        let mut inner = self.inner.write().unwrap();
        inner.position_secs = position_secs;
        inner.duration_secs = duration_secs;
        inner.playing = playing;
    }

    pub fn set_volume(&self, volume: f64) {
        self.inner.write().unwrap().volume = volume;
    }

    pub fn set_vocal_assist(&self, level: VocalAssist) {
        self.inner.write().unwrap().vocal_assist = level;
    }

    pub fn set_background_music_enabled(&self, enabled: bool) {
        let mut inner = self.inner.write().unwrap();
        inner.background_music_enabled = enabled;
        inner.background_music = inner.idle && enabled;
    }
}

impl Default for PlayerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport commands the room sends to the player collaborator.
#[async_trait]
pub trait PlayerLink: Send + Sync {
    async fn play(&self, entry: &SongEntry);
    async fn pause(&self);
    async fn resume(&self);
    async fn seek(&self, position_secs: f64);
    async fn stop(&self);
    async fn set_volume(&self, volume: f64);
    async fn set_vocal_assist(&self, level: VocalAssist);
}

/// In-process player: honors every transport command against the shared
/// [`PlayerState`] and simulates playback with a one-second tick.
pub struct LoopbackPlayer {
    state: Arc<PlayerState>,
}

impl LoopbackPlayer {
    pub fn new(state: Arc<PlayerState>) -> Self {
        Self { state }
    }

    /// Spawns the playback tick. While a song is playing the position
    /// advances once per second; reaching the duration reports
    /// end-of-song to the room.
    pub fn spawn_ticker(ctx: RoomContext) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;

                let snapshot = ctx.player.snapshot();
                if !snapshot.playing {
                    continue;
                }

                let position = snapshot.position_secs + 1.0;
                if snapshot.duration_secs > 0.0 && position >= snapshot.duration_secs {
                    ctx.player.set_position(snapshot.duration_secs);
                    ctx.song_ended().await;
                } else {
                    ctx.player.set_position(position);
                    ctx.broadcast_state().await;
                }
            }
        });
    }
}

#[async_trait]
impl PlayerLink for LoopbackPlayer {
    async fn play(&self, entry: &SongEntry) {
        self.state.set_current(entry);
    }

    async fn pause(&self) {
        self.state.set_playing(false);
    }

    async fn resume(&self) {
        let snapshot = self.state.snapshot();
        if snapshot.current_song.is_some() {
            self.state.set_playing(true);
        }
    }

    async fn seek(&self, position_secs: f64) {
        self.state.set_position(position_secs);
    }

    async fn stop(&self) {
        self.state.set_idle();
    }

    async fn set_volume(&self, volume: f64) {
        self.state.set_volume(volume);
    }

    async fn set_vocal_assist(&self, level: VocalAssist) {
        self.state.set_vocal_assist(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry() -> SongEntry {
        SongEntry {
            entry_id: "e1".into(),
            song_id: "s1".into(),
            title: "Song".into(),
            artist: "Artist".into(),
            duration_secs: 120,
            vocal_path: None,
            instrumental_path: None,
            vocal_assist: VocalAssist::Low,
            added_by: "k1".into(),
            added_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn play_loads_the_entry() {
        let state = Arc::new(PlayerState::new());
        let link = LoopbackPlayer::new(state.clone());

        link.play(&entry()).await;
        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_song.as_deref(), Some("e1"));
        assert!(snapshot.playing);
        assert!(!snapshot.idle);
        assert_eq!(snapshot.duration_secs, 120.0);
        assert_eq!(snapshot.vocal_assist, VocalAssist::Low);
    }

    #[tokio::test]
    async fn pause_resume_round_trip() {
        let state = Arc::new(PlayerState::new());
        let link = LoopbackPlayer::new(state.clone());

        link.play(&entry()).await;
        link.pause().await;
        assert!(!state.snapshot().playing);
        link.resume().await;
        assert!(state.snapshot().playing);
    }

    #[tokio::test]
    async fn resume_without_a_song_stays_stopped() {
        let state = Arc::new(PlayerState::new());
        let link = LoopbackPlayer::new(state.clone());
        link.resume().await;
        assert!(!state.snapshot().playing);
    }

    #[tokio::test]
    async fn seek_is_clamped_to_duration() {
        let state = Arc::new(PlayerState::new());
        let link = LoopbackPlayer::new(state.clone());

        link.play(&entry()).await;
        link.seek(500.0).await;
        assert_eq!(state.snapshot().position_secs, 120.0);
        link.seek(-3.0).await;
        assert_eq!(state.snapshot().position_secs, 0.0);
    }

    #[tokio::test]
    async fn stop_goes_idle_with_background_music() {
        let state = Arc::new(PlayerState::new());
        let link = LoopbackPlayer::new(state.clone());

        link.play(&entry()).await;
        link.stop().await;
        let snapshot = state.snapshot();
        assert!(snapshot.idle);
        assert!(snapshot.background_music);
        assert!(snapshot.current_song.is_none());
    }
}
