//! HTTP surface and WebSocket sessions.
//!
//! ```text
//! POST /resource/room                 create a room, returns {roomId}
//! GET  /resource/room/{id}            event log + session settings
//! GET  /resource/room/{id}/ws?offset=N  persistent session
//! GET  /resource/intro.js             landing snippet with live stats
//! ```
//!
//! Each session runs one task that multiplexes three sources with
//! `tokio::select!`: the room's outbound queue, the socket, and the
//! heartbeat ticker. The room mutex is only taken to apply inbound
//! messages; fan-out to this session goes through the bounded queue, so a
//! slow socket never stalls the room.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::Settings;
use crate::protocol::{ClientMessage, RoomCreated, RoomSettings, RoomSnapshot, ServerMessage};
use crate::registry::{RegistryError, RoomRegistry, SharedRoom};
use crate::room::OUTBOUND_QUEUE;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/resource/room", post(create_room))
        .route("/resource/room/{room_id}", get(get_room))
        .route("/resource/room/{room_id}/ws", get(room_ws))
        .route("/resource/intro.js", get(intro))
        .with_state(state)
}

/// Bind and serve until ctrl-c. The caller flushes the registry afterwards.
pub async fn serve(state: AppState) -> io::Result<()> {
    let listener = TcpListener::bind(&state.registry.settings().listen_addr).await?;
    let addr = listener.local_addr()?;
    log::info!("listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("shutdown signal received"),
        Err(e) => {
            log::error!("cannot listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    }
}

async fn create_room(State(state): State<AppState>) -> Result<Json<RoomCreated>, StatusCode> {
    match state.registry.create().await {
        Ok((room_id, _)) => Ok(Json(RoomCreated { room_id })),
        Err(e) => {
            log::error!("room creation failed: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSnapshot>, StatusCode> {
    let room = resolve(&state, &room_id).await?;
    let mut guard = room.lock().await;
    guard.touch();
    Ok(Json(RoomSnapshot {
        events: guard.events(0),
        settings: session_settings(state.registry.settings()),
    }))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    /// Offset the client already consumed at bootstrap; replay starts here.
    #[serde(default)]
    offset: usize,
}

async fn room_ws(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<SessionQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let room = match resolve(&state, &room_id).await {
        Ok(room) => room,
        Err(status) => return status.into_response(),
    };
    ws.on_upgrade(move |socket| run_session(socket, state, room, query.offset))
}

async fn resolve(state: &AppState, room_id: &str) -> Result<SharedRoom, StatusCode> {
    match state.registry.get(room_id).await {
        Ok(room) => Ok(room),
        Err(RegistryError::RoomNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            log::error!("failed to resolve room {room_id}: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// One connected participant, driven until the socket closes, the room
/// closes the session, or the heartbeat deadline passes.
async fn run_session(socket: WebSocket, state: AppState, room: SharedRoom, join_offset: usize) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);

    let site_id = match room.lock().await.connect(tx, join_offset) {
        Ok(site_id) => site_id,
        Err(e) => {
            log::warn!("session rejected: {e}");
            let _ = sink.close().await;
            return;
        }
    };

    let heartbit = state.registry.settings().heartbit_interval;
    let deadline = heartbit * 2;
    let mut ticker = tokio::time::interval(heartbit);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the immediate first tick
    let mut last_inbound = Instant::now();

    let close_reason = loop {
        tokio::select! {
            // Outbound first: a session being told about compaction or
            // disconnection must hear it before its inbound noise matters.
            biased;

            outbound = rx.recv() => match outbound {
                Some(message) => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(e) => break format!("encode failure: {e}"),
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break "socket closed while sending".to_string();
                    }
                }
                // The room dropped our queue: disconnect, compaction, or
                // eviction. Remaining messages were already drained above.
                None => break "closed by room".to_string(),
            },
            inbound = stream.next() => {
                last_inbound = Instant::now();
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(reason) =
                            handle_inbound(&state, &room, site_id, text.as_str()).await
                        {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "peer closed".to_string(),
                    Some(Ok(_)) => {} // pings and pongs count as traffic
                    Some(Err(e)) => break format!("socket error: {e}"),
                }
            }
            _ = ticker.tick() => {
                if last_inbound.elapsed() > deadline {
                    break "heartbeat deadline missed".to_string();
                }
                match (ServerMessage::Heartbit {}).encode() {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break "socket closed while sending heartbeat".to_string();
                        }
                    }
                    Err(e) => break format!("encode failure: {e}"),
                }
            }
        }
    };

    log::info!("session for site {site_id} ended: {close_reason}");
    room.lock().await.disconnect(site_id);
    let _ = sink.close().await;
}

/// Apply one inbound frame. Any error terminates the session; the room
/// itself survives.
async fn handle_inbound(
    state: &AppState,
    room: &SharedRoom,
    site_id: u32,
    text: &str,
) -> Result<(), String> {
    let message = ClientMessage::decode(text).map_err(|e| format!("protocol error: {e}"))?;
    match message {
        ClientMessage::CrdtEvents { events } => {
            let settings = state.registry.settings();
            let needs_compaction = {
                let mut guard = room.lock().await;
                guard
                    .apply_events(&events, site_id)
                    .map_err(|e| format!("rejected events: {e}"))?;
                guard.needs_compaction(settings.log_bytes_threshold, settings.log_ops_threshold)
            };
            if needs_compaction {
                state.registry.compact_room(room).await;
            }
            Ok(())
        }
        ClientMessage::SitePresence(presence) => {
            room.lock()
                .await
                .apply_presence(presence, site_id)
                .map_err(|e| format!("rejected presence: {e}"))
        }
    }
}

fn session_settings(settings: &Settings) -> RoomSettings {
    RoomSettings {
        heartbit_interval: settings.heartbit_secs(),
        document_limit: settings.document_limit,
    }
}

async fn intro(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    let settings = state.registry.settings();
    let body = format!(
        "// Welcome to cowrite\n\
         //\n\
         // 1. Create a new room\n\
         // 2. Share the link\n\
         // 3. Start typing together\n\
         \n\
         // Real-time stats:\n\
         const stats = {{\n\
         \x20   activeRooms: {},\n\
         \x20   activeUsers: {},\n\
         \x20   totalRooms: {},\n\
         \x20   uptime: \"{}\",\n\
         }};\n\
         \n\
         // Server config:\n\
         const config = {{\n\
         \x20   heartbitInterval: {},\n\
         \x20   documentLimit: {},\n\
         }};\n",
        stats.active_rooms,
        stats.active_sites,
        stats.total_rooms,
        format_uptime(state.started_at.elapsed()),
        settings.heartbit_secs(),
        settings.document_limit,
    );
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body)
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    format!("{days} days, {hours:02}:{minutes:02}")
}
