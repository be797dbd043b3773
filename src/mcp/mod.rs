//! MCP (Model Context Protocol) JSON-RPC endpoint.
//!
//! Implements the [MCP specification](https://spec.modelcontextprotocol.io/)
//! over HTTP POST at `/room/{roomId}/mcp-server` — each request body is one
//! JSON-RPC 2.0 message, answered in the response body. The passphrase
//! arrives as `Authorization: Bearer <passphrase>` or `?passphrase=`.
//!
//! ## Supported methods
//!
//! | Method       | Description                      |
//! |--------------|----------------------------------|
//! | `initialize` | Handshake, returns capabilities  |
//! | `tools/list` | List available tool definitions  |
//! | `tools/call` | Execute a tool and return result |
//! | `ping`       | Liveness check                   |
//!
//! Notifications (no `id`) are acknowledged with `202 Accepted` and an empty
//! body.

pub mod tools;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::AuthQuery;
use crate::room::Room;
use crate::state::AppState;
use tools::CodeExecutor;

const SERVER_NAME: &str = "roomrelay";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
const PROTOCOL_VERSION: &str = "2024-11-05";

/// `POST /room/{roomId}/mcp-server` — one JSON-RPC message per request.
pub async fn mcp_http(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let room = state.rooms.get_or_create(&room_id).await;
    if let Err(e) = room.authorize(&headers, &query).await {
        return (e.status(), Json(json!({ "error": e.to_string() }))).into_response();
    }

    let request: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            let response = json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {
                    "code": -32700,
                    "message": format!("Parse error: {e}")
                }
            });
            return Json(response).into_response();
        }
    };

    match handle_rpc(&request, &room, &state.executor).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Dispatch one JSON-RPC message. Returns `None` for notifications.
pub async fn handle_rpc(
    request: &Value,
    room: &Arc<Room>,
    executor: &Arc<dyn CodeExecutor>,
) -> Option<Value> {
    let id = request.get("id").cloned();
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");

    // Notifications (no id) — acknowledge silently.
    if id.is_none() {
        match method {
            "notifications/initialized" | "notifications/cancelled" => {}
            _ => debug!(room = %room.id, method, "Unknown MCP notification"),
        }
        return None;
    }

    let response = match method {
        "initialize" => handle_initialize(),
        "tools/list" => json!({
            "jsonrpc": "2.0",
            "result": { "tools": tools::tool_definitions() }
        }),
        "tools/call" => handle_tools_call(request, room, executor).await,
        "ping" => json!({ "jsonrpc": "2.0", "result": {} }),
        _ => json!({
            "jsonrpc": "2.0",
            "error": {
                "code": -32601,
                "message": format!("Method not found: {method}")
            }
        }),
    };

    Some(inject_id(response, id))
}

/// Handle `initialize` — protocol version, capabilities, and server info.
fn handle_initialize() -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": SERVER_VERSION
            }
        }
    })
}

/// Handle `tools/call` — dispatch to the appropriate tool handler.
async fn handle_tools_call(
    request: &Value,
    room: &Arc<Room>,
    executor: &Arc<dyn CodeExecutor>,
) -> Value {
    let params = request.get("params").cloned().unwrap_or(json!({}));
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let args = params.get("arguments").cloned().unwrap_or(json!({}));

    let result = tools::handle_tool_call(name, &args, room, executor).await;

    let mut response_result = json!({ "content": result.content });
    if result.is_error {
        response_result["isError"] = json!(true);
    }
    json!({ "jsonrpc": "2.0", "result": response_result })
}

/// Inject the request `id` into a response object.
fn inject_id(mut response: Value, id: Option<Value>) -> Value {
    if let Some(id) = id {
        response["id"] = id;
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::test_support::test_room;
    use tools::NoExecutor;

    fn executor() -> Arc<dyn CodeExecutor> {
        Arc::new(NoExecutor)
    }

    #[tokio::test]
    async fn initialize_reports_capabilities_and_echoes_the_id() {
        let room = test_room();
        let response = handle_rpc(
            &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            &room,
            &executor(),
        )
        .await
        .unwrap();
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"]["protocolVersion"], json!(PROTOCOL_VERSION));
        assert_eq!(response["result"]["serverInfo"]["name"], json!("roomrelay"));
    }

    #[tokio::test]
    async fn tools_list_returns_the_four_tools() {
        let room = test_room();
        let response = handle_rpc(
            &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            &room,
            &executor(),
        )
        .await
        .unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 4);
    }

    #[tokio::test]
    async fn tools_call_marks_failures_with_is_error() {
        let room = test_room();
        let response = handle_rpc(
            &json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "bash", "arguments": {"command": "ls"}}
            }),
            &room,
            &executor(),
        )
        .await
        .unwrap();
        assert_eq!(response["result"]["isError"], json!(true));
        assert_eq!(
            response["result"]["content"][0]["text"],
            json!("Local client not connected")
        );
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let room = test_room();
        let response = handle_rpc(
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            &room,
            &executor(),
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn unknown_methods_are_method_not_found() {
        let room = test_room();
        let response = handle_rpc(
            &json!({"jsonrpc": "2.0", "id": 4, "method": "resources/list"}),
            &room,
            &executor(),
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], json!(-32601));
        assert_eq!(response["id"], json!(4));
    }
}
