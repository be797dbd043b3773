//! WebSocket upgrade handlers and per-socket loops.
//!
//! ## Connection lifecycle
//!
//! 1. A peer connects to its room-scoped path with a passphrase
//!    (`?passphrase=` — headers aren't available on browser WebSocket
//!    upgrades — or `Authorization: Bearer`). The passphrase is validated
//!    before the upgrade completes: `401` absent, `403` mismatch, `409` when
//!    the role (or agent client id) is already taken.
//! 2. Each socket is split into a sink and a stream. Outgoing messages are
//!    funneled through an mpsc channel so room code can send without holding
//!    the socket; the socket task itself only knows its room and tag and
//!    looks all other state up in the room on every inbound message.
//! 3. On disconnect, the room applies the role's lifecycle transition (see
//!    [`crate::room`]).

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::AuthQuery;
use crate::protocol::{AgentCommand, PeerFrame};
use crate::room::peers::{Outbound, PeerHandle, PeerTag};
use crate::room::{router, Room, CLOSE_POLICY};
use crate::state::AppState;

/// Outbound channel depth per socket. Events beyond this are dropped for the
/// slow agent (and counted), not queued unboundedly.
const OUTBOUND_BUFFER: usize = 256;

// ─── Upgrade handlers ────────────────────────────────────────────────────────

/// `GET /room/{roomId}/extension` — the browser-controlling peer.
pub async fn extension_ws(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, room_id, query, headers, ws, PeerTag::Extension).await
}

/// `GET /room/{roomId}/local` — the local-machine peer, anonymous client id.
pub async fn local_ws(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, room_id, query, headers, ws, PeerTag::Local).await
}

/// `GET /room/{roomId}/local/{clientId}` — the local-machine peer. The client
/// id is recorded but does not differentiate admission: one local per room.
pub async fn local_ws_with_id(
    State(state): State<AppState>,
    Path((room_id, client_id)): Path<(String, String)>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade_with_client(state, room_id, query, headers, ws, PeerTag::Local, client_id).await
}

/// `GET /room/{roomId}/mcp` — an agent peer with a generated client id.
pub async fn agent_ws(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let client_id = Uuid::new_v4().to_string();
    upgrade_with_client(
        state,
        room_id,
        query,
        headers,
        ws,
        PeerTag::Agent(client_id.clone()),
        client_id,
    )
    .await
}

/// `GET /room/{roomId}/mcp/{clientId}` — an agent peer with a caller-chosen
/// client id, rejected with `409` when that id is already present.
pub async fn agent_ws_with_id(
    State(state): State<AppState>,
    Path((room_id, client_id)): Path<(String, String)>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade_with_client(
        state,
        room_id,
        query,
        headers,
        ws,
        PeerTag::Agent(client_id.clone()),
        client_id,
    )
    .await
}

async fn upgrade(
    state: AppState,
    room_id: String,
    query: AuthQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    tag: PeerTag,
) -> Response {
    let client_id = Uuid::new_v4().to_string();
    upgrade_with_client(state, room_id, query, headers, ws, tag, client_id).await
}

async fn upgrade_with_client(
    state: AppState,
    room_id: String,
    query: AuthQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    tag: PeerTag,
    client_id: String,
) -> Response {
    let room = state.rooms.get_or_create(&room_id).await;
    if let Err(e) = room.authorize(&headers, &query).await {
        return (e.status(), Json(json!({ "error": e.to_string() }))).into_response();
    }
    if room.peer_connected(&tag).await {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("{tag} already connected") })),
        )
            .into_response();
    }
    let span = info_span!("peer", room = %room_id, peer = %tag);
    ws.on_upgrade(move |socket| {
        async move {
            match tag {
                PeerTag::Extension => extension_socket(socket, room).await,
                PeerTag::Local => local_socket(socket, room, client_id).await,
                PeerTag::Agent(_) => agent_socket(socket, room, client_id).await,
            }
        }
        .instrument(span)
    })
}

// ─── Socket loops ────────────────────────────────────────────────────────────

/// Admit the peer, re-checking the conflict the HTTP precheck screened for.
/// Returns the socket back on a lost race, already closed with a policy
/// frame.
async fn admit_or_close(
    room: &Arc<Room>,
    mut socket: WebSocket,
    handle: PeerHandle,
) -> Option<WebSocket> {
    let tag = handle.tag.clone();
    if room.clone().admit(handle).await.is_err() {
        warn!(room = %room.id, peer = %tag, "Admission lost a connect race");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY,
                reason: format!("{tag} already connected").into(),
            })))
            .await;
        return None;
    }
    Some(socket)
}

/// Forward channel frames to the WebSocket sink until the channel or the
/// socket closes.
fn spawn_send_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Json(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            error!("WS send: failed to serialize message: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    })
}

async fn extension_socket(socket: WebSocket, room: Arc<Room>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let handle = PeerHandle::new(PeerTag::Extension, None, tx);
    let Some(socket) = admit_or_close(&room, socket, handle).await else {
        return;
    };
    info!(room = %room.id, "Extension connected");

    let (sink, mut stream) = socket.split();
    let send_task = spawn_send_task(sink, rx);

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match PeerFrame::parse(&text, true) {
                Ok(frame) => room.on_extension_frame(frame).await,
                Err(e) => error!(room = %room.id, "Dropped malformed extension frame: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    room.on_extension_disconnect().await;
    info!(room = %room.id, "Extension disconnected");
    send_task.abort();
}

async fn local_socket(socket: WebSocket, room: Arc<Room>, client_id: String) {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let handle = PeerHandle::new(PeerTag::Local, Some(client_id.clone()), tx);
    let Some(socket) = admit_or_close(&room, socket, handle).await else {
        return;
    };
    info!(room = %room.id, client_id = %client_id, "Local client connected");

    let (sink, mut stream) = socket.split();
    let send_task = spawn_send_task(sink, rx);

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match PeerFrame::parse(&text, false) {
                Ok(frame) => room.on_local_frame(frame).await,
                Err(e) => error!(room = %room.id, "Dropped malformed local frame: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    room.on_local_disconnect().await;
    info!(room = %room.id, client_id = %client_id, "Local client disconnected");
    send_task.abort();
}

async fn agent_socket(socket: WebSocket, room: Arc<Room>, client_id: String) {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let handle = PeerHandle::new(
        PeerTag::Agent(client_id.clone()),
        Some(client_id.clone()),
        tx.clone(),
    );
    let Some(socket) = admit_or_close(&room, socket, handle).await else {
        return;
    };
    info!(room = %room.id, client_id = %client_id, "Agent connected");

    let (sink, mut stream) = socket.split();
    let send_task = spawn_send_task(sink, rx);

    // Commands are routed inline: this agent's replies stay in command order,
    // and a command in flight simply back-pressures its own socket.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match AgentCommand::parse(&text) {
                Ok(cmd) => router::handle_agent_command(&room, &client_id, &tx, cmd).await,
                Err(e) => error!(room = %room.id, client_id = %client_id, "Dropped malformed agent command: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    room.on_agent_disconnect(&client_id).await;
    info!(room = %room.id, client_id = %client_id, "Agent disconnected");
    send_task.abort();
}
