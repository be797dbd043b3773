//! Liveness endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::auth::AuthQuery;
use crate::state::AppState;

/// `GET /` and `GET /health` — process liveness probe.
///
/// Returns `{"status":"ok","uptime_secs":N,"version":"..."}`. No
/// authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /room/{roomId}` and `GET /room/{roomId}/health` — room liveness.
///
/// Probing needs no passphrase, but a supplied `?passphrase=` is validated —
/// on a fresh room that sets the room's passphrase (first-writer-wins), and a
/// mismatch is a `403`.
pub async fn room_health(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<AuthQuery>,
) -> Response {
    let room = state.rooms.get_or_create(&room_id).await;
    if let Some(passphrase) = &query.passphrase {
        if let Err(e) = room.validate_passphrase(passphrase).await {
            return (e.status(), Json(json!({ "error": e.to_string() }))).into_response();
        }
    }
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "roomId": room_id,
        })),
    )
        .into_response()
}
