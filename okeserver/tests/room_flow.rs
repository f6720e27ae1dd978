//! End-to-end flow over in-process channels: handshake, dispatch,
//! authorization, broadcast, countdown. The WebSocket layer is a thin
//! pump over the same paths.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use okehub::{ClientId, Frame, Hub};
use okeproto::message::Handshake;
use okeproto::AvatarDescriptor;
use okequeue::QueueStore;
use okesession::{AvatarFactory, NameGenerator, SessionStore};
use okeserver::countdown::CountdownController;
use okeserver::dispatch::{self, HandshakeOutcome};
use okeserver::library::{LibrarySong, ManifestLibrary};
use okeserver::player::{LoopbackPlayer, PlayerState};
use okeserver::room::RoomInner;
use okeserver::RoomContext;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct TestNames;
impl NameGenerator for TestNames {
    fn generate_unique(&self, existing: &HashSet<String>) -> String {
        let mut n = 1;
        loop {
            let candidate = format!("Guest {n}");
            if !existing.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

struct TestAvatars;
impl AvatarFactory for TestAvatars {
    fn new_random_with_colors(&self) -> AvatarDescriptor {
        AvatarDescriptor {
            id: "avatar-test".to_string(),
            colors: vec!["#112233".to_string()],
        }
    }
}

fn test_library() -> ManifestLibrary {
    ManifestLibrary::from_songs(vec![
        LibrarySong {
            song_id: "s1".into(),
            title: "Bohemian Rhapsody".into(),
            artist: "Queen".into(),
            duration_secs: 354,
            vocal_path: Some("/media/s1.vocal.ogg".into()),
            instrumental_path: Some("/media/s1.instr.ogg".into()),
        },
        LibrarySong {
            song_id: "s2".into(),
            title: "Dancing Queen".into(),
            artist: "ABBA".into(),
            duration_secs: 231,
            vocal_path: None,
            instrumental_path: None,
        },
    ])
}

fn room(countdown_secs: u32, bootstrap_admin: bool) -> RoomContext {
    let player = Arc::new(PlayerState::new());
    let ctx = RoomContext::new(RoomInner {
        sessions: Arc::new(SessionStore::ephemeral(
            Arc::new(TestNames),
            Arc::new(TestAvatars),
        )),
        queue: Arc::new(QueueStore::ephemeral()),
        hub: Hub::new(32),
        link: Arc::new(LoopbackPlayer::new(player.clone())),
        player,
        library: Arc::new(test_library()),
        countdown: CountdownController::new(countdown_secs),
        bootstrap_admin,
    });
    ctx.attach_observers();
    // No loopback ticker: the tests drive song endings explicitly.
    ctx
}

async fn connect(
    ctx: &RoomContext,
    display_name: Option<&str>,
) -> (ClientId, String, mpsc::Receiver<Frame>) {
    let payload = Handshake {
        martyn_key: None,
        display_name: display_name.map(ToString::to_string),
    };
    let session = match dispatch::handshake(ctx, &payload, "127.0.0.1:40000", "test-agent").await {
        HandshakeOutcome::Session(session) => session,
        HandshakeOutcome::Blocked { .. } => panic!("fresh identity cannot be blocked"),
    };

    let (client, rx) = ctx.hub.register(&session.martyn_key).await.unwrap();
    ctx.after_handshake(client, &session).await;
    (client, session.martyn_key, rx)
}

async fn next_json(rx: &mut mpsc::Receiver<Frame>) -> Value {
    let frame = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("channel closed");
    serde_json::from_str(&frame).expect("frame is JSON")
}

async fn next_of_type(rx: &mut mpsc::Receiver<Frame>, kind: &str) -> Value {
    for _ in 0..50 {
        let value = next_json(rx).await;
        if value["type"] == kind {
            return value;
        }
    }
    panic!("no '{kind}' frame arrived");
}

/// Reads frames until the channel has been quiet for a moment.
async fn drain(rx: &mut mpsc::Receiver<Frame>) {
    while timeout(Duration::from_millis(150), rx.recv())
        .await
        .ok()
        .flatten()
        .is_some()
    {}
}

async fn assert_silent(rx: &mut mpsc::Receiver<Frame>) {
    tokio::time::sleep(Duration::from_millis(150)).await;
    match rx.try_recv() {
        Err(mpsc::error::TryRecvError::Empty) => {}
        other => panic!("expected silence, got {other:?}"),
    }
}

async fn send(ctx: &RoomContext, client: ClientId, key: &str, value: Value) {
    dispatch::dispatch(ctx, client, key, &value.to_string()).await;
}

#[tokio::test]
async fn handshake_mints_a_full_identity() {
    let ctx = room(10, false);
    let (_client, key, mut rx) = connect(&ctx, None).await;

    let welcome = next_of_type(&mut rx, "welcome").await;
    let session = &welcome["payload"]["session"];
    assert_eq!(session["martyn_key"].as_str().unwrap().len(), 36);
    assert!(!session["display_name"].as_str().unwrap().is_empty());
    assert!(session["avatar_config"].is_object());
    assert_eq!(session["search_history"].as_array().unwrap().len(), 0);
    assert!(welcome["payload"]["room_state"]["queue"]["songs"].is_array());

    // A second handshake with the minted key returns the same identity.
    let name = session["display_name"].as_str().unwrap().to_string();
    let payload = Handshake {
        martyn_key: Some(key),
        display_name: None,
    };
    match dispatch::handshake(&ctx, &payload, "127.0.0.1:40001", "test-agent").await {
        HandshakeOutcome::Session(session) => assert_eq!(session.display_name, name),
        HandshakeOutcome::Blocked { .. } => panic!("known key must not be blocked"),
    }
}

#[tokio::test]
async fn non_admin_privileged_command_reaches_only_the_sender() {
    let ctx = room(10, false);
    let (_c1, _k1, mut rx1) = connect(&ctx, Some("Watcher")).await;
    let (c2, k2, mut rx2) = connect(&ctx, Some("Mortal")).await;
    drain(&mut rx1).await;
    drain(&mut rx2).await;

    let before = ctx.snapshot();
    send(&ctx, c2, &k2, json!({"type": "admin_kick", "payload": {"martyn_key": "k"}})).await;

    let error = next_of_type(&mut rx2, "error").await;
    assert_eq!(error["payload"]["error"], "Not authorized");
    assert_silent(&mut rx1).await;
    assert_eq!(ctx.snapshot(), before, "state must be unchanged");
}

#[tokio::test]
async fn bootstrap_promotes_only_the_first_identity() {
    let ctx = room(10, true);
    let (_c1, _k1, mut rx1) = connect(&ctx, Some("First")).await;
    let welcome = next_of_type(&mut rx1, "welcome").await;
    assert_eq!(welcome["payload"]["session"]["is_admin"], true);

    let (_c2, _k2, mut rx2) = connect(&ctx, Some("Second")).await;
    let welcome = next_of_type(&mut rx2, "welcome").await;
    assert_eq!(welcome["payload"]["session"]["is_admin"], false);
}

#[tokio::test]
async fn queue_add_broadcasts_and_starts_an_idle_room() {
    let ctx = room(10, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Lou")).await;
    let (_c2, _k2, mut rx2) = connect(&ctx, Some("Sam")).await;
    drain(&mut rx1).await;
    drain(&mut rx2).await;

    send(&ctx, c1, &k1, json!({"type": "queue_add", "payload": {"song_id": "s1", "vocal_assist": "LOW"}})).await;

    let update = next_of_type(&mut rx1, "state_update").await;
    let queue = &update["payload"]["queue"];
    assert_eq!(queue["songs"].as_array().unwrap().len(), 1);
    assert_eq!(queue["position"], 0);
    assert_eq!(queue["songs"][0]["vocal_path"], "/media/s1.vocal.ogg");
    assert_eq!(update["payload"]["player"]["playing"], true);

    // Every client observes the same update.
    let update2 = next_of_type(&mut rx2, "state_update").await;
    assert_eq!(update2["payload"]["queue"]["songs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_song_errors_only_to_the_sender() {
    let ctx = room(10, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Lou")).await;
    let (_c2, _k2, mut rx2) = connect(&ctx, Some("Sam")).await;
    drain(&mut rx1).await;
    drain(&mut rx2).await;

    send(&ctx, c1, &k1, json!({"type": "queue_add", "payload": {"song_id": "nope"}})).await;

    let error = next_of_type(&mut rx1, "error").await;
    assert_eq!(error["payload"]["error"], "Not found: nope");
    assert_silent(&mut rx2).await;
    assert_eq!(ctx.queue.len(), 0);
}

#[tokio::test]
async fn invalid_volume_is_rejected() {
    let ctx = room(10, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Lou")).await;
    drain(&mut rx1).await;

    send(&ctx, c1, &k1, json!({"type": "volume", "payload": 1.5})).await;
    let error = next_of_type(&mut rx1, "error").await;
    assert!(error["payload"]["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid argument"));

    send(&ctx, c1, &k1, json!({"type": "volume", "payload": 0.5})).await;
    let update = next_of_type(&mut rx1, "state_update").await;
    assert_eq!(update["payload"]["player"]["volume"], 0.5);
}

#[tokio::test]
async fn admin_block_purges_kicks_and_refuses_rehandshake() {
    let ctx = room(10, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Admin")).await;
    let (c2, k2, mut rx2) = connect(&ctx, Some("Target")).await;
    drain(&mut rx1).await;
    drain(&mut rx2).await;

    // The target queues a song that must vanish with the block.
    send(&ctx, c2, &k2, json!({"type": "queue_add", "payload": {"song_id": "s1"}})).await;
    drain(&mut rx1).await;
    drain(&mut rx2).await;
    assert_eq!(ctx.queue.len(), 1);

    send(
        &ctx,
        c1,
        &k1,
        json!({"type": "admin_block", "payload": {"martyn_key": k2, "duration_secs": 0, "reason": "be nice"}}),
    )
    .await;

    let kicked = next_of_type(&mut rx2, "kicked").await;
    assert_eq!(kicked["payload"]["reason"], "be nice");
    assert_eq!(ctx.queue.len(), 0, "the blocked singer's entries are purged");

    // Blocked identities are turned away before any welcome.
    let payload = Handshake {
        martyn_key: Some(k2),
        display_name: None,
    };
    match dispatch::handshake(&ctx, &payload, "127.0.0.1:40002", "test-agent").await {
        HandshakeOutcome::Blocked { reason } => assert_eq!(reason.as_deref(), Some("be nice")),
        HandshakeOutcome::Session(_) => panic!("blocked identity must not get a session"),
    }
}

#[tokio::test]
async fn countdown_auto_advances_for_the_same_singer() {
    let ctx = room(2, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Lou")).await;
    drain(&mut rx1).await;

    send(&ctx, c1, &k1, json!({"type": "queue_add", "payload": {"song_id": "s1"}})).await;
    send(&ctx, c1, &k1, json!({"type": "queue_add", "payload": {"song_id": "s2"}})).await;
    drain(&mut rx1).await;
    assert_eq!(ctx.queue.position(), 0);

    ctx.song_ended().await;
    assert!(ctx.countdown.is_active());
    assert!(!ctx.countdown.snapshot().requires_approval);

    tokio::time::sleep(Duration::from_millis(2600)).await;
    assert!(!ctx.countdown.is_active());
    assert_eq!(ctx.queue.position(), 1, "countdown advanced the queue");
    assert!(ctx.player.snapshot().playing);
}

#[tokio::test]
async fn countdown_stalls_for_a_different_singer_until_admin_plays() {
    let ctx = room(1, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Lou")).await;
    let (c2, k2, mut rx2) = connect(&ctx, Some("Sam")).await;
    drain(&mut rx1).await;
    drain(&mut rx2).await;

    send(&ctx, c1, &k1, json!({"type": "queue_add", "payload": {"song_id": "s1"}})).await;
    send(&ctx, c2, &k2, json!({"type": "queue_add", "payload": {"song_id": "s2"}})).await;

    ctx.song_ended().await;
    let armed = ctx.countdown.snapshot();
    assert!(armed.active);
    assert!(armed.requires_approval, "next singer differs");

    tokio::time::sleep(Duration::from_millis(1600)).await;
    let stalled = ctx.countdown.snapshot();
    assert!(stalled.active, "countdown holds at zero for approval");
    assert_eq!(stalled.seconds_remaining, 0);
    assert_eq!(ctx.queue.position(), 0, "queue must not advance by itself");

    send(&ctx, c1, &k1, json!({"type": "admin_play_next", "payload": null})).await;
    assert!(!ctx.countdown.is_active());
    assert_eq!(ctx.queue.position(), 1);
    assert!(ctx.player.snapshot().playing);
}

#[tokio::test]
async fn removing_the_countdown_target_deactivates_it() {
    let ctx = room(5, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Lou")).await;
    drain(&mut rx1).await;

    send(&ctx, c1, &k1, json!({"type": "queue_add", "payload": {"song_id": "s1"}})).await;
    send(&ctx, c1, &k1, json!({"type": "queue_add", "payload": {"song_id": "s2"}})).await;

    ctx.song_ended().await;
    assert!(ctx.countdown.is_active());

    let next_entry = ctx.queue.entries()[1].entry_id.clone();
    send(&ctx, c1, &k1, json!({"type": "queue_remove", "payload": next_entry})).await;

    assert!(
        !ctx.countdown.is_active(),
        "no upcoming entry left to count down to"
    );
}

#[tokio::test]
async fn set_afk_marks_away_and_bumps_upcoming_songs() {
    let ctx = room(10, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Lou")).await;
    let (c2, k2, mut rx2) = connect(&ctx, Some("Sam")).await;
    drain(&mut rx1).await;
    drain(&mut rx2).await;

    // Lou sings s1; upcoming order is then [Lou s2, Sam s2].
    send(&ctx, c1, &k1, json!({"type": "queue_add", "payload": {"song_id": "s1"}})).await;
    send(&ctx, c1, &k1, json!({"type": "queue_add", "payload": {"song_id": "s2"}})).await;
    send(&ctx, c2, &k2, json!({"type": "queue_add", "payload": {"song_id": "s2"}})).await;
    drain(&mut rx1).await;

    send(&ctx, c1, &k1, json!({"type": "set_afk", "payload": true})).await;

    let entries = ctx.queue.entries();
    assert_eq!(entries[0].added_by, k1, "current entry stays put");
    assert_eq!(entries[1].added_by, k2, "the away singer's song stepped aside");
    assert_eq!(entries[2].added_by, k1);
    assert!(ctx.sessions.get(&k1).unwrap().away);
}

#[tokio::test]
async fn autoplay_toggle_is_admin_only_and_broadcast() {
    let ctx = room(10, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Admin")).await;
    let (c2, k2, mut rx2) = connect(&ctx, Some("Mortal")).await;
    drain(&mut rx1).await;
    drain(&mut rx2).await;

    send(&ctx, c2, &k2, json!({"type": "autoplay", "payload": false})).await;
    let error = next_of_type(&mut rx2, "error").await;
    assert_eq!(error["payload"]["error"], "Not authorized");
    assert!(ctx.queue.autoplay());

    send(&ctx, c1, &k1, json!({"type": "autoplay", "payload": false})).await;
    let update = next_of_type(&mut rx1, "state_update").await;
    assert_eq!(update["payload"]["queue"]["autoplay"], false);
}

#[tokio::test]
async fn search_returns_results_and_records_history() {
    let ctx = room(10, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Lou")).await;
    drain(&mut rx1).await;

    send(&ctx, c1, &k1, json!({"type": "search", "payload": "queen"})).await;

    let results = next_of_type(&mut rx1, "search_result").await;
    let hits = results["payload"].as_array().unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(ctx.sessions.get(&k1).unwrap().search_history, vec!["queen"]);
}

#[tokio::test]
async fn disconnect_drops_presence_only_with_the_last_socket() {
    let ctx = room(10, true);
    let (c1, k1, mut rx1) = connect(&ctx, Some("Lou")).await;
    drain(&mut rx1).await;

    // Second socket for the same identity.
    let (c1b, _rx1b) = ctx.hub.register(&k1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    ctx.hub.unregister(c1b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctx.sessions.get(&k1).unwrap().connected, "one socket remains");

    ctx.hub.unregister(c1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!ctx.sessions.get(&k1).unwrap().connected);
}
