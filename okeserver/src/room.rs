//! The room context: every store and collaborator the handlers touch,
//! plus snapshot assembly and broadcast.
//!
//! One room lives for the whole process. [`RoomContext`] is a cheap
//! clone over shared inner state, so timer tasks and observers can hold
//! their own handle. Handlers mutate the stores, then ask the context
//! for a fresh snapshot broadcast; the context serializes each outbound
//! message once and hands the frame to the hub. Store locks are never
//! held across a hub send.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use okehub::{ClientId, Frame, Hub};
use okeproto::{RoomSnapshot, ServerMessage, SessionPublic, SongEntry};
use okequeue::QueueStore;
use okesession::{Session, SessionStore};
use tracing::{debug, info, warn};

use crate::countdown::CountdownController;
use crate::library::SongLibrary;
use crate::player::{PlayerLink, PlayerState};

/// Everything a command handler needs. Build one, wrap it in
/// [`RoomContext::new`], then call [`RoomContext::attach_observers`].
pub struct RoomInner {
    pub sessions: Arc<SessionStore>,
    pub queue: Arc<QueueStore>,
    pub hub: Hub,
    pub player: Arc<PlayerState>,
    pub link: Arc<dyn PlayerLink>,
    pub library: Arc<dyn SongLibrary>,
    pub countdown: CountdownController,
    /// Promote the first handshaken session to admin while the room has
    /// none.
    pub bootstrap_admin: bool,
}

/// Shared handle on the room. Long-lived singleton.
#[derive(Clone)]
pub struct RoomContext {
    inner: Arc<RoomInner>,
}

impl Deref for RoomContext {
    type Target = RoomInner;

    fn deref(&self) -> &RoomInner {
        &self.inner
    }
}

impl RoomContext {
    pub fn new(inner: RoomInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    fn from_weak(weak: &Weak<RoomInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Wires the cross-component observers: queue changes re-validate the
    /// countdown, hub disconnects update presence. Call once at startup.
    pub fn attach_observers(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.queue.on_change(move || {
            if let Some(ctx) = RoomContext::from_weak(&weak) {
                ctx.countdown.revalidate(&ctx.queue);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        self.hub.set_disconnect_observer(move |_client, key| {
            if let Some(ctx) = RoomContext::from_weak(&weak) {
                let key = key.to_string();
                tokio::spawn(async move {
                    ctx.handle_disconnect(&key).await;
                });
            }
        });
    }

    /// Assembles the point-in-time room state.
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            player: self.player.snapshot(),
            queue: self.queue.snapshot(),
            sessions: self.sessions.public_sessions(),
            countdown: self.countdown.snapshot(),
        }
    }

    fn frame(message: &ServerMessage) -> Option<Frame> {
        match message.to_frame() {
            Ok(text) => Some(Frame::from(text)),
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound message");
                None
            }
        }
    }

    /// Targeted delivery to one connection.
    pub async fn send_message(&self, client: ClientId, message: &ServerMessage) {
        if let Some(frame) = Self::frame(message) {
            let _ = self.hub.send_to(client, frame).await;
        }
    }

    /// Error frame to the originating client only.
    pub async fn send_error(&self, client: ClientId, error: &str) {
        self.send_message(client, &ServerMessage::error(error)).await;
    }

    pub async fn broadcast_message(&self, message: &ServerMessage) {
        if let Some(frame) = Self::frame(message) {
            let _ = self.hub.broadcast(frame).await;
        }
    }

    /// Broadcasts a freshly computed room snapshot to every client.
    pub async fn broadcast_state(&self) {
        let snapshot = self.snapshot();
        self.broadcast_message(&ServerMessage::StateUpdate(snapshot))
            .await;
    }

    /// Broadcasts the connected roster, one entry per identity.
    pub async fn broadcast_client_list(&self) {
        let connected: Vec<SessionPublic> = self
            .sessions
            .public_sessions()
            .into_iter()
            .filter(|s| s.connected)
            .collect();
        self.broadcast_message(&ServerMessage::ClientList(connected))
            .await;
    }

    /// Post-handshake bookkeeping: admin bootstrap, presence, welcome,
    /// roster broadcast.
    pub async fn after_handshake(&self, client: ClientId, session: &Session) {
        let mut session = session.clone();

        if self.bootstrap_admin && !session.is_admin && !self.sessions.has_admin() {
            match self.sessions.set_admin(&session.martyn_key, true) {
                Ok(updated) => {
                    info!(key = %session.martyn_key, "Bootstrapped first admin");
                    if let Err(e) = updated.persist {
                        warn!(error = %e, "Admin flag write failed");
                    }
                    session = updated.value;
                }
                Err(e) => warn!(error = %e, "Admin bootstrap failed"),
            }
        }

        match self.sessions.set_connected(&session.martyn_key, true) {
            Ok(updated) => {
                if let Err(e) = updated.persist {
                    warn!(error = %e, "Presence write failed");
                }
                session = updated.value;
            }
            Err(e) => warn!(error = %e, "Presence update failed"),
        }

        let welcome = ServerMessage::Welcome {
            session: session.info(),
            room_state: self.snapshot(),
        };
        self.send_message(client, &welcome).await;

        self.broadcast_state().await;
        self.broadcast_client_list().await;
    }

    /// Disconnect observer body: presence drops only when the identity's
    /// last socket is gone.
    pub async fn handle_disconnect(&self, key: &str) {
        if !self.hub.find_by_key(key).is_empty() {
            return;
        }

        debug!(key, "Last connection closed");
        if let Ok(updated) = self.sessions.set_connected(key, false) {
            if let Err(e) = updated.persist {
                warn!(error = %e, "Presence write failed");
            }
        }
        self.broadcast_state().await;
        self.broadcast_client_list().await;
    }

    pub(crate) fn current_singer(&self) -> Option<String> {
        let playing_entry = self.player.snapshot().current_song?;
        self.queue
            .entries()
            .into_iter()
            .find(|e| e.entry_id == playing_entry)
            .map(|e| e.added_by)
    }

    async fn clear_current_singer(&self) {
        if let Some(singer) = self.current_singer() {
            if let Ok(updated) = self.sessions.set_current_song(&singer, None) {
                if let Err(e) = updated.persist {
                    warn!(error = %e, "Current-song write failed");
                }
            }
        }
    }

    /// Loads and starts one queue entry: player, transport, and the
    /// singer's current-song marker.
    pub async fn start_entry(&self, entry: &SongEntry) {
        self.clear_current_singer().await;
        self.player.set_current(entry);
        self.link.play(entry).await;

        match self
            .sessions
            .set_current_song(&entry.added_by, Some(entry.song_id.clone()))
        {
            Ok(updated) => {
                if let Err(e) = updated.persist {
                    warn!(error = %e, "Current-song write failed");
                }
            }
            // The singer may have been flushed while their song queued.
            Err(e) => debug!(error = %e, "No session for current singer"),
        }

        info!(entry = %entry.entry_id, title = %entry.title, "Now playing");
    }

    /// Stops playback and idles the player (admin stop, exhausted queue).
    pub async fn stop_playback(&self) {
        self.countdown.cancel();
        self.clear_current_singer().await;
        self.link.stop().await;
        self.player.set_idle();
    }

    /// Advances past the current song: next entry starts playing, or the
    /// queue exhausts and the player idles. Broadcasts the new state.
    pub async fn advance_to_next_song(&self) {
        self.countdown.cancel();

        if self.queue.snapshot().next_up().is_some() {
            let advanced = self.queue.next();
            if let Err(e) = &advanced.persist {
                warn!(error = %e, "Queue write failed; in-memory state kept");
            }
            if let Some(entry) = advanced.value {
                self.start_entry(&entry).await;
            }
        } else {
            let skipped = self.queue.skip();
            if let Err(e) = &skipped.persist {
                warn!(error = %e, "Queue write failed; in-memory state kept");
            }
            self.stop_playback().await;
        }

        self.broadcast_state().await;
    }

    /// End-of-song ingress from the player collaborator (or the loopback
    /// ticker). Arms the countdown when autoplay has somewhere to go.
    pub async fn song_ended(&self) {
        self.player.set_playing(false);
        let finished = self.queue.current();
        self.clear_current_singer().await;

        let armed = match &finished {
            Some(entry) => self.countdown.arm(self.clone(), &entry.added_by),
            None => false,
        };
        if !armed {
            self.player.set_idle();
        }

        self.broadcast_state().await;
    }
}
