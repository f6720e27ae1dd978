//! Command dispatch: decode, authorize, handle, answer.
//!
//! The handshake is special-cased: it must be the first frame on a
//! connection, and a blocked key is turned away before any welcome. All
//! other commands flow through [`dispatch`], which gates privileged
//! actions on the sender's admin flag and maps handler errors onto
//! `error` frames for the originating client only. Decoding failures are
//! logged and dropped — a malformed frame never costs the client its
//! connection.
//!
//! Store persistence failures follow the write-behind contract: the
//! in-memory change stands, the sender gets an error frame, and the new
//! state still broadcasts.

use okehub::{ClientId, Frame};
use okeproto::{ClientMessage, Decoded, Handshake, ServerMessage};
use okequeue::NewSong;
use okesession::Session;
use tracing::{debug, info, warn};

use crate::error::HandlerError;
use crate::room::RoomContext;

/// Result of the first-frame handshake.
pub enum HandshakeOutcome {
    /// The key is on the block list: close without a welcome.
    Blocked { reason: Option<String> },
    /// Identity minted or rehydrated; proceed to register the client.
    Session(Session),
}

/// Handles the mandatory first frame of a connection.
pub async fn handshake(
    ctx: &RoomContext,
    payload: &Handshake,
    remote_addr: &str,
    user_agent: &str,
) -> HandshakeOutcome {
    if let Some(presented) = payload
        .martyn_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        let (blocked, reason) = ctx.sessions.is_blocked(presented);
        if blocked {
            info!(key = presented, "Blocked identity refused at handshake");
            return HandshakeOutcome::Blocked { reason };
        }
    }

    let minted = ctx
        .sessions
        .get_or_create(payload.martyn_key.as_deref(), payload.display_name.as_deref());
    if let Err(e) = &minted.persist {
        warn!(error = %e, "Session write failed; in-memory state kept");
    }
    let mut session = minted.value;

    match ctx
        .sessions
        .set_device_info(&session.martyn_key, remote_addr, "", user_agent)
    {
        Ok(updated) => {
            if let Err(e) = updated.persist {
                warn!(error = %e, "Session write failed; in-memory state kept");
            }
            session = updated.value;
        }
        Err(e) => warn!(error = %e, "Device info update failed"),
    }

    HandshakeOutcome::Session(session)
}

/// Decodes and executes one post-handshake frame from `key`'s connection.
pub async fn dispatch(ctx: &RoomContext, client: ClientId, key: &str, text: &str) {
    let message = match ClientMessage::decode(text) {
        Ok(Decoded::Message(message)) => message,
        Ok(Decoded::Unknown(kind)) => {
            debug!(kind, "Ignoring unknown message type");
            return;
        }
        Err(e) => {
            debug!(error = %e, "Ignoring malformed frame");
            return;
        }
    };

    if message.requires_admin() {
        let is_admin = ctx.sessions.get(key).map(|s| s.is_admin).unwrap_or(false);
        if !is_admin {
            ctx.send_error(client, "Not authorized").await;
            return;
        }
    }

    debug!(kind = message.kind(), key, "Dispatching command");
    if let Err(error) = handle(ctx, client, key, message).await {
        ctx.send_error(client, &error.to_string()).await;
    }
}

/// Surfaces a failed write-behind to the sender; the in-memory state is
/// already updated and will still broadcast.
async fn report_store_error<E: std::fmt::Display>(
    ctx: &RoomContext,
    client: ClientId,
    persist: &Result<(), E>,
) {
    if let Err(e) = persist {
        warn!(error = %e, "Store write failed; in-memory state kept");
        ctx.send_error(client, &format!("Store error: {e}")).await;
    }
}

async fn handle(
    ctx: &RoomContext,
    client: ClientId,
    key: &str,
    message: ClientMessage,
) -> Result<(), HandlerError> {
    match message {
        // A repeated handshake on a live connection just refreshes the
        // client with its own state.
        ClientMessage::Handshake(_) => {
            if let Some(session) = ctx.sessions.get(key) {
                let welcome = ServerMessage::Welcome {
                    session: session.info(),
                    room_state: ctx.snapshot(),
                };
                ctx.send_message(client, &welcome).await;
            }
            Ok(())
        }

        ClientMessage::Search(query) => {
            let results = ctx.library.search(&query);
            match ctx.sessions.push_search_term(key, &query) {
                Ok(updated) => report_store_error(ctx, client, &updated.persist).await,
                Err(e) => debug!(error = %e, "Search history skipped"),
            }
            ctx.send_message(client, &ServerMessage::SearchResult(results))
                .await;
            Ok(())
        }

        ClientMessage::QueueAdd(payload) => {
            let song = ctx
                .library
                .get_by_id(&payload.song_id)
                .ok_or_else(|| HandlerError::NotFound(payload.song_id.clone()))?;
            let was_idle = ctx.player.snapshot().idle;
            let (vocal, instrumental) = (song.vocal_path.clone(), song.instrumental_path.clone());

            let added = ctx.queue.add(NewSong {
                song_id: song.song_id,
                title: song.title,
                artist: song.artist,
                duration_secs: song.duration_secs,
                vocal_assist: payload.vocal_assist,
                added_by: key.to_string(),
            });
            report_store_error(ctx, client, &added.persist).await;

            // Manifest songs come prepared; bind their media right away.
            if vocal.is_some() || instrumental.is_some() {
                if let Ok(updated) =
                    ctx.queue
                        .update_song_paths(&added.value.entry_id, vocal, instrumental)
                {
                    report_store_error(ctx, client, &updated.persist).await;
                }
            }

            // An idle room starts singing as soon as the new entry landed
            // on the cursor (adding to an exhausted queue does exactly
            // that).
            if was_idle && ctx.queue.autoplay() {
                if let Some(current) = ctx.queue.current() {
                    if current.entry_id == added.value.entry_id {
                        ctx.start_entry(&current).await;
                    }
                }
            }

            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::QueueRemove(entry_id) => {
            let removed = ctx.queue.remove(&entry_id)?;
            report_store_error(ctx, client, &removed.persist).await;

            if removed.value {
                // The now-playing entry vanished: whatever sits on the
                // cursor now takes over, or the room stops.
                let was_playing = !ctx.player.snapshot().idle;
                match ctx.queue.current() {
                    Some(next) if was_playing => ctx.start_entry(&next).await,
                    Some(_) => {}
                    None => ctx.stop_playback().await,
                }
            }

            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::QueueMove(payload) => {
            let moved = ctx.queue.move_entry(payload.from, payload.to);
            report_store_error(ctx, client, &moved.persist).await;
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::QueueClear => {
            let cleared = ctx.queue.clear();
            report_store_error(ctx, client, &cleared.persist).await;
            ctx.stop_playback().await;
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::QueueShuffle => {
            let shuffled = ctx.queue.shuffle();
            report_store_error(ctx, client, &shuffled.persist).await;
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::QueueRequeue(payload) => {
            let requeued = ctx.queue.requeue(&payload.song_id, &payload.martyn_key)?;
            report_store_error(ctx, client, &requeued.persist).await;

            if ctx.player.snapshot().idle && ctx.queue.autoplay() {
                if let Some(current) = ctx.queue.current() {
                    if current.entry_id == requeued.value.entry_id {
                        ctx.start_entry(&current).await;
                    }
                }
            }

            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::Play => {
            if ctx.player.snapshot().current_song.is_some() {
                ctx.link.resume().await;
                ctx.player.set_playing(true);
            } else if let Some(current) = ctx.queue.current() {
                ctx.start_entry(&current).await;
            }
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::Pause => {
            ctx.link.pause().await;
            ctx.player.set_playing(false);
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::Skip => {
            ctx.countdown.cancel();
            let skipped = ctx.queue.skip();
            report_store_error(ctx, client, &skipped.persist).await;
            match skipped.value {
                Some(entry) => ctx.start_entry(&entry).await,
                None => ctx.stop_playback().await,
            }
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::Seek(position) => {
            if !position.is_finite() || position < 0.0 {
                return Err(HandlerError::InvalidArgument(format!(
                    "seek position {position} out of range"
                )));
            }
            ctx.link.seek(position).await;
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::VocalAssist(level) => {
            let updated = ctx.sessions.set_vocal_assist(key, level)?;
            report_store_error(ctx, client, &updated.persist).await;

            // Applies to the player only while this singer's song plays.
            if ctx.current_singer().as_deref() == Some(key) {
                ctx.link.set_vocal_assist(level).await;
            }

            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::Volume(volume) => {
            if !volume.is_finite() || !(0.0..=1.0).contains(&volume) {
                return Err(HandlerError::InvalidArgument(format!(
                    "volume {volume} out of range"
                )));
            }
            ctx.link.set_volume(volume).await;
            ctx.player.set_volume(volume);
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::SetDisplayName(payload) => {
            let updated = ctx.sessions.set_profile(
                key,
                &payload.display_name,
                payload.avatar_id.as_deref(),
                payload.avatar_config,
            )?;
            report_store_error(ctx, client, &updated.persist).await;
            ctx.broadcast_state().await;
            ctx.broadcast_client_list().await;
            Ok(())
        }

        ClientMessage::Autoplay(autoplay) => {
            let toggled = ctx.queue.set_autoplay(autoplay);
            report_store_error(ctx, client, &toggled.persist).await;
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::SetAfk(away) => {
            let updated = ctx.sessions.set_away(key, away)?;
            report_store_error(ctx, client, &updated.persist).await;
            if away {
                // An away singer's upcoming songs step aside.
                let bumped = ctx.queue.bump_user_to_end(key);
                report_store_error(ctx, client, &bumped.persist).await;
            }
            ctx.broadcast_state().await;
            ctx.broadcast_client_list().await;
            Ok(())
        }

        ClientMessage::AdminSetAdmin(payload) => {
            let updated = ctx
                .sessions
                .set_admin(&payload.martyn_key, payload.is_admin)?;
            report_store_error(ctx, client, &updated.persist).await;
            ctx.broadcast_state().await;
            ctx.broadcast_client_list().await;
            Ok(())
        }

        ClientMessage::AdminKick(payload) => {
            if ctx.sessions.get(&payload.martyn_key).is_none() {
                return Err(HandlerError::NotFound(payload.martyn_key));
            }
            let reason = payload
                .reason
                .unwrap_or_else(|| "Kicked by admin".to_string());
            kick_all_connections(ctx, &payload.martyn_key, &reason).await;
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::AdminBlock(payload) => {
            if ctx.sessions.get(&payload.martyn_key).is_none() {
                return Err(HandlerError::NotFound(payload.martyn_key));
            }

            let blocked = ctx
                .sessions
                .block(&payload.martyn_key, payload.duration_secs, &payload.reason);
            report_store_error(ctx, client, &blocked.persist).await;

            // A blocked singer leaves nothing behind: purge their queue
            // entries and drop every open socket.
            let removal = ctx.queue.remove_by_user(&payload.martyn_key);
            report_store_error(ctx, client, &removal.persist).await;
            if removal.value.current_removed {
                let was_playing = !ctx.player.snapshot().idle;
                match ctx.queue.current() {
                    Some(next) if was_playing => ctx.start_entry(&next).await,
                    Some(_) => {}
                    None => ctx.stop_playback().await,
                }
            }

            let reason = if payload.reason.is_empty() {
                "Blocked by admin".to_string()
            } else {
                payload.reason.clone()
            };
            kick_all_connections(ctx, &payload.martyn_key, &reason).await;

            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::AdminUnblock(payload) => {
            let removed = ctx.sessions.unblock(&payload.martyn_key);
            report_store_error(ctx, client, &removed.persist).await;
            if !removed.value {
                return Err(HandlerError::NotFound(payload.martyn_key));
            }
            ctx.broadcast_state().await;
            Ok(())
        }

        ClientMessage::AdminSetAfk(payload) => {
            let updated = ctx.sessions.set_away(&payload.martyn_key, payload.away)?;
            report_store_error(ctx, client, &updated.persist).await;
            if payload.away {
                let bumped = ctx.queue.bump_user_to_end(&payload.martyn_key);
                report_store_error(ctx, client, &bumped.persist).await;
            }
            ctx.broadcast_state().await;
            ctx.broadcast_client_list().await;
            Ok(())
        }

        ClientMessage::AdminPlayNext => {
            ctx.advance_to_next_song().await;
            Ok(())
        }

        ClientMessage::AdminStop => {
            ctx.stop_playback().await;
            ctx.broadcast_state().await;
            Ok(())
        }
    }
}

/// Delivers a final `kicked` frame to every connection of the identity
/// and closes them. Presence updates follow through the hub's disconnect
/// observer.
async fn kick_all_connections(ctx: &RoomContext, martyn_key: &str, reason: &str) {
    let message = ServerMessage::Kicked {
        reason: reason.to_string(),
    };
    let frame = match message.to_frame() {
        Ok(text) => Frame::from(text),
        Err(e) => {
            warn!(error = %e, "Failed to serialize kicked frame");
            return;
        }
    };

    for connection in ctx.hub.find_by_key(martyn_key) {
        let _ = ctx.hub.kick(connection, frame.clone()).await;
    }
}
