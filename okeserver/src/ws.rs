//! WebSocket endpoint: upgrade, handshake gate, per-connection pumps.
//!
//! Each accepted socket runs two cooperating tasks. The reader (this
//! task) parses inbound frames and runs the handlers in issue order; the
//! writer drains the client's bounded hub channel into the socket. The
//! connection tears down when either side stops: the reader issues
//! exactly one unregister, which closes the hub channel, which ends the
//! writer.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use okeproto::{ClientMessage, Decoded, ServerMessage};
use tracing::{debug, info, warn};

use crate::dispatch::{self, HandshakeOutcome};
use crate::room::RoomContext;

/// Builds the HTTP router: the WebSocket endpoint plus a health probe.
pub fn router(ctx: RoomContext) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(|| async { "OK" }))
        .with_state(ctx)
}

/// Binds and serves until the listener fails. Shutdown is orchestrated by
/// the caller (signal select + hub disconnect).
pub async fn serve(ctx: RoomContext, bind: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let app = router(ctx);

    info!("OkeRoom listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn ws_upgrade(
    State(ctx): State<RoomContext>,
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    ws.on_upgrade(move |socket| client_connection(ctx, socket, addr, user_agent))
}

async fn client_connection(
    ctx: RoomContext,
    socket: WebSocket,
    addr: SocketAddr,
    user_agent: String,
) {
    let (mut sink, mut stream) = socket.split();

    // Handshake phase: the first accepted command must be a handshake;
    // anything else only earns an error frame.
    let session = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "Socket read failed before handshake");
                return;
            }
        };

        match ClientMessage::decode(text.as_str()) {
            Ok(Decoded::Message(ClientMessage::Handshake(payload))) => {
                match dispatch::handshake(&ctx, &payload, &addr.to_string(), &user_agent).await {
                    HandshakeOutcome::Blocked { reason } => {
                        if let Some(reason) = reason {
                            if let Ok(frame) = ServerMessage::error(&reason).to_frame() {
                                let _ = sink.send(Message::Text(frame.into())).await;
                            }
                        }
                        let _ = sink.close().await;
                        return;
                    }
                    HandshakeOutcome::Session(session) => break session,
                }
            }
            Ok(Decoded::Message(other)) => {
                debug!(kind = other.kind(), "Command before handshake");
                if let Ok(frame) = ServerMessage::error("Handshake required").to_frame() {
                    let _ = sink.send(Message::Text(frame.into())).await;
                }
            }
            Ok(Decoded::Unknown(kind)) => debug!(kind, "Ignoring pre-handshake message"),
            Err(e) => debug!(error = %e, "Ignoring malformed frame"),
        }
    };

    let key = session.martyn_key.clone();
    let (client, mut outbound) = match ctx.hub.register(&key).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(error = %e, "Hub rejected connection");
            return;
        }
    };
    info!(client, key = %key, addr = %addr, "Client connected");

    // Writer pump: hub channel -> socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink
                .send(Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = sink.close().await;
    });

    ctx.after_handshake(client, &session).await;

    // Reader pump: handlers run here, in issue order.
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                dispatch::dispatch(&ctx, client, &key, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Socket read failed");
                break;
            }
        }
    }

    // Exactly one unregister per connection; dropping the hub's sender
    // lets the writer drain and exit.
    let _ = ctx.hub.unregister(client).await;
    let _ = writer.await;
    info!(client, key = %key, "Client disconnected");
}
