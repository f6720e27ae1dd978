//! # okeserver - The OkeRoom coordination server
//!
//! Glues the stores, the hub and the protocol together:
//! - WebSocket endpoint with the handshake-first rule ([`ws`])
//! - Command dispatch and authorization ([`dispatch`])
//! - Room snapshot assembly and broadcast ([`room`])
//! - Between-songs countdown ([`countdown`])
//! - Player state, transport contract and the loopback player ([`player`])
//! - In-process collaborators: names, avatars, library ([`collab`],
//!   [`library`])

use std::sync::Arc;

use tracing::warn;

pub mod collab;
pub mod config_ext;
pub mod countdown;
pub mod dispatch;
pub mod error;
pub mod library;
pub mod player;
pub mod room;
pub mod ws;

pub use config_ext::ServerConfigExt;
pub use error::HandlerError;
pub use room::{RoomContext, RoomInner};

use collab::{RandomAvatars, WordListNames};
use countdown::CountdownController;
use library::{ManifestLibrary, SongLibrary};
use okehub::Hub;
use okequeue::QueueStore;
use okesession::SessionStore;
use player::{LoopbackPlayer, PlayerState};

/// Builds the fully wired room from configuration: stores reopened from
/// their databases, hub and loopback player spawned, observers attached.
pub fn build_room(config: &okeconfig::Config) -> anyhow::Result<RoomContext> {
    let sessions = Arc::new(SessionStore::open(
        &config.session_db_path(),
        Arc::new(WordListNames),
        Arc::new(RandomAvatars),
    )?);
    let queue = Arc::new(QueueStore::open(&config.queue_db_path())?);

    let library: Arc<dyn SongLibrary> = match config.library_manifest() {
        Some(path) => match ManifestLibrary::load(&path) {
            Ok(library) => Arc::new(library),
            Err(e) => {
                warn!(manifest = %path.display(), error = %e, "Library manifest unreadable, starting empty");
                Arc::new(ManifestLibrary::empty())
            }
        },
        None => Arc::new(ManifestLibrary::empty()),
    };

    let player = Arc::new(PlayerState::new());
    let ctx = RoomContext::new(RoomInner {
        sessions,
        queue,
        hub: Hub::new(config.get_client_buffer()),
        link: Arc::new(LoopbackPlayer::new(player.clone())),
        player,
        library,
        countdown: CountdownController::new(config.countdown_seconds()),
        bootstrap_admin: config.bootstrap_admin(),
    });

    ctx.attach_observers();
    LoopbackPlayer::spawn_ticker(ctx.clone());

    Ok(ctx)
}
