//! Connection introspection for the back-end peers.
//!
//! Beyond the `connected` flag, each body carries the connection age, the
//! last application-level pong age, and the in-flight request count; the
//! extension body adds the originating agent ids and the count of events
//! dropped by fan-out.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::auth::AuthQuery;
use crate::room::peers::PeerTag;
use crate::state::AppState;

/// `GET /room/{roomId}/extension/status` — `{ connected, ... }`.
pub async fn extension_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    peer_status(state, room_id, query, headers, PeerTag::Extension).await
}

/// `GET /room/{roomId}/local/status` — `{ connected, ... }`.
pub async fn local_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    peer_status(state, room_id, query, headers, PeerTag::Local).await
}

async fn peer_status(
    state: AppState,
    room_id: String,
    query: AuthQuery,
    headers: HeaderMap,
    tag: PeerTag,
) -> Response {
    let room = state.rooms.get_or_create(&room_id).await;
    if let Err(e) = room.authorize(&headers, &query).await {
        return (e.status(), Json(json!({ "error": e.to_string() }))).into_response();
    }
    let connected = room.peer_connected(&tag).await;
    let mut body = json!({ "connected": connected });
    if let Some(age) = room.connected_age_ms(&tag).await {
        body["connected_ms"] = json!(age);
    }
    if let Some(age) = room.last_pong_age_ms(&tag).await {
        body["last_pong_age_ms"] = json!(age);
    }
    let (browser_pending, local_pending) = room.pending_counts().await;
    match tag {
        PeerTag::Extension => {
            body["pending_requests"] = json!(browser_pending);
            body["pending_origins"] = json!(room.pending_origins().await);
            body["dropped_events"] = json!(room.dropped_event_count());
        }
        _ => {
            body["pending_requests"] = json!(local_pending);
        }
    }
    Json(body).into_response()
}
