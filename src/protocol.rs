//! Wire envelopes shared by every peer class.
//!
//! All messages are JSON objects, discriminated by the presence of an `id`
//! (reply) versus a `method` (request/event/control). The unions are closed:
//! a frame that carries neither, or a method outside the peer's vocabulary,
//! is rejected at the single parse point and dropped by the caller.
//!
//! ## Agent ⇄ relay
//!
//! | Direction | Shape |
//! |-----------|-------|
//! | agent → relay | `{ id, method, params?, sessionId? }` |
//! | relay → agent | `{ id, result \| error: { message }, sessionId? }` |
//! | relay → agent | `{ method, params?, sessionId? }` (event) |
//!
//! ## Back-end peers ⇄ relay
//!
//! | Direction | Shape |
//! |-----------|-------|
//! | relay → extension | `{ id, method: "forwardCDPCommand", params: { method, sessionId?, params? } }` |
//! | extension → relay | `{ id, result? \| error: string }` |
//! | extension → relay | `{ method: "forwardCDPEvent", params: { method, sessionId?, params? } }` |
//! | relay → local | `{ id, method: "file.read" \| "file.write" \| "bash.execute", params }` |
//! | local → relay | `{ id, result? \| error: string }` |
//! | both directions | `{ method: "ping" }` / `{ method: "pong" }`, `{ method: "log", params: { level, args } }` |

use std::fmt;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Envelope method wrapping a protocol command forwarded to the extension.
pub const FORWARD_CDP_COMMAND: &str = "forwardCDPCommand";
/// Envelope method wrapping a protocol event reported by the extension.
pub const FORWARD_CDP_EVENT: &str = "forwardCDPEvent";

/// A protocol command sent by an agent peer.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentCommand {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

impl AgentCommand {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// A `params` field by name, when params is an object carrying it.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|p| p.get(name))
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(Value::as_str)
    }
}

/// A protocol event reported by the extension, unwrapped from its
/// `forwardCDPEvent` envelope.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub session_id: Option<String>,
    pub params: Value,
}

/// A frame received from a back-end peer (extension or local).
#[derive(Debug)]
pub enum PeerFrame {
    /// Response to a forwarded command, matched to a pending request by id.
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<String>,
    },
    /// Protocol event (extension only).
    Event(CdpEvent),
    /// Peer-side log line, re-emitted through the relay's own log sink.
    Log { level: String, args: Vec<String> },
    /// Reply to the application-level keepalive ping.
    Pong,
}

/// Why an inbound frame was rejected.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown frame discriminator: {0}")]
    Unknown(String),
}

impl PeerFrame {
    /// Single dispatch point for back-end frames. `events_allowed` is false
    /// for the local peer, which never originates protocol events.
    pub fn parse(text: &str, events_allowed: bool) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let error = match value.get("error") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            };
            return Ok(Self::Response {
                id,
                result: value.get("result").cloned(),
                error,
            });
        }
        match value.get("method").and_then(Value::as_str) {
            Some("pong") => Ok(Self::Pong),
            Some("log") => {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                let level = params
                    .get("level")
                    .and_then(Value::as_str)
                    .unwrap_or("info")
                    .to_string();
                let args = params
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|a| match a {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Self::Log { level, args })
            }
            Some(FORWARD_CDP_EVENT) if events_allowed => {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                let method = params
                    .get("method")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FrameError::Unknown("forwardCDPEvent without method".into()))?
                    .to_string();
                Ok(Self::Event(CdpEvent {
                    method,
                    session_id: params
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                    params: params.get("params").cloned().unwrap_or(Value::Null),
                }))
            }
            Some(other) => Err(FrameError::Unknown(other.to_string())),
            None => Err(FrameError::Unknown("<no id, no method>".to_string())),
        }
    }
}

// ─── Outbound constructors ───────────────────────────────────────────────────

/// Successful reply to an agent command.
pub fn reply_ok(id: u64, result: Value, session_id: Option<&str>) -> Value {
    let mut msg = json!({ "id": id, "result": result });
    if let Some(sid) = session_id {
        msg["sessionId"] = json!(sid);
    }
    msg
}

/// Error reply to an agent command.
pub fn reply_err(id: u64, message: &str, session_id: Option<&str>) -> Value {
    let mut msg = json!({ "id": id, "error": { "message": message } });
    if let Some(sid) = session_id {
        msg["sessionId"] = json!(sid);
    }
    msg
}

/// Event envelope delivered to agent peers.
pub fn event(method: &str, params: Value, session_id: Option<&str>) -> Value {
    let mut msg = json!({ "method": method, "params": params });
    if let Some(sid) = session_id {
        msg["sessionId"] = json!(sid);
    }
    msg
}

/// Command envelope forwarded to the extension peer.
pub fn forward_command(
    id: u64,
    method: &str,
    params: Option<&Value>,
    session_id: Option<&str>,
) -> Value {
    let mut inner = json!({ "method": method });
    if let Some(sid) = session_id {
        inner["sessionId"] = json!(sid);
    }
    if let Some(p) = params {
        inner["params"] = p.clone();
    }
    json!({ "id": id, "method": FORWARD_CDP_COMMAND, "params": inner })
}

/// Application-level keepalive ping sent to back-end peers.
pub fn ping() -> Value {
    json!({ "method": "ping" })
}

// ─── RPC failure taxonomy ────────────────────────────────────────────────────

/// Which back-end peer an error string names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLabel {
    Extension,
    LocalClient,
}

impl fmt::Display for PeerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extension => write!(f, "Extension"),
            Self::LocalClient => write!(f, "Local client"),
        }
    }
}

/// Failure of a forwarded RPC. `Display` forms are delivered verbatim to the
/// originating agent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("{0} not connected")]
    NotConnected(PeerLabel),
    #[error("{peer} request timeout after {timeout_ms}ms: {method}")]
    Timeout {
        peer: PeerLabel,
        timeout_ms: u64,
        method: String,
    },
    #[error("{0} connection closed")]
    ConnectionClosed(PeerLabel),
    /// Error string reported by the back-end peer, forwarded without
    /// interpretation.
    #[error("{0}")]
    Peer(String),
}
