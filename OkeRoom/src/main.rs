use okeproto::ServerMessage;
use okeserver::ws;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== PHASE 1 : Logging + configuration ==========

    let config = okeconfig::get_config();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.get_log_min_level().to_lowercase())
            }),
        )
        .init();

    info!("🎤 OkeRoom starting");

    // ========== PHASE 2 : Stores, hub, collaborators ==========

    let room = okeserver::build_room(&config)?;
    info!(
        sessions = room.sessions.session_count(),
        queued = room.queue.len(),
        "✅ Stores restored"
    );

    // ========== PHASE 3 : Serve until shutdown ==========

    let bind = config.get_bind_address();
    let port = config.get_http_port();

    tokio::select! {
        result = ws::serve(room.clone(), &bind, port) => {
            if let Err(e) = result {
                warn!(error = %e, "Server stopped");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Tell every client goodbye and let the write-behind settle.
    if let Ok(frame) = (ServerMessage::Kicked {
        reason: "Server shutting down".to_string(),
    })
    .to_frame()
    {
        let _ = room.hub.disconnect_all(frame.into()).await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    info!("✅ OkeRoom stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }
}
