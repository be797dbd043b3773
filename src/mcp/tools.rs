//! MCP tool definitions and handlers.
//!
//! Each tool is defined as a JSON schema (returned by [`tool_definitions`])
//! and handled by an async function dispatched from [`handle_tool_call`].
//! All four tools operate on the caller's room:
//!
//! - `execute` — run browser-driving code in the sandboxed runner
//! - `read_file` / `write_file` — the local peer's filesystem, with
//!   write-after-read safety enforced by the room's ledger
//! - `bash` — shell execution on the local peer

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::room::Room;

/// The sandboxed runner behind the `execute` tool. External collaborator:
/// implementations drive the browser through the room's in-process call
/// surface ([`Room::browser_call`]).
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, room: Arc<Room>, code: &str, timeout_ms: u64)
        -> Result<String, String>;
}

/// Stub used when no sandbox runtime is wired in.
pub struct NoExecutor;

#[async_trait]
impl CodeExecutor for NoExecutor {
    async fn execute(
        &self,
        _room: Arc<Room>,
        _code: &str,
        _timeout_ms: u64,
    ) -> Result<String, String> {
        Err("Code executor not configured".to_string())
    }
}

/// Default timeout for the `execute` tool, per its contract.
const EXECUTE_DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Returns the tool definitions advertised by `tools/list`.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "execute",
            "description": "Execute JavaScript code that drives the connected browser through the Chrome DevTools Protocol. The code runs in a sandboxed runtime bound to this room's browser session.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "The code to execute."
                    },
                    "timeout": {
                        "type": "integer",
                        "description": "Execution timeout in milliseconds. Default is 30000 (30s)."
                    }
                },
                "required": ["code"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "read_file",
            "description": "Read a file from the connected local machine. Returns the file content. A file must be read before it can be written.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Absolute path of the file to read."
                    }
                },
                "required": ["path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "write_file",
            "description": "Write a file on the connected local machine. Fails unless the file was read first in this room, or if it was modified since that read.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Absolute path of the file to write."
                    },
                    "content": {
                        "type": "string",
                        "description": "Full new content of the file."
                    }
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "bash",
            "description": "Execute a shell command on the connected local machine and return stdout, stderr, and exit code.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute."
                    },
                    "workdir": {
                        "type": "string",
                        "description": "Working directory for the command (absolute path)."
                    },
                    "timeout": {
                        "type": "integer",
                        "description": "Command timeout in milliseconds. Default is 30000 (30s)."
                    }
                },
                "required": ["command"],
                "additionalProperties": false
            }
        }),
    ]
}

/// Result of an MCP tool call, ready to be serialized into a JSON-RPC
/// response.
pub struct ToolResult {
    /// MCP content blocks (a single `{"type":"text","text":"..."}` entry).
    pub content: Vec<Value>,
    /// Whether the tool call failed (maps to `isError` in the MCP response).
    pub is_error: bool,
}

impl ToolResult {
    fn success(value: &Value) -> Self {
        let text = match value {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        };
        Self {
            content: vec![json!({ "type": "text", "text": text })],
            is_error: false,
        }
    }

    fn error(message: String) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": message })],
            is_error: true,
        }
    }
}

/// Handle a tool call against the caller's room.
pub async fn handle_tool_call(
    name: &str,
    args: &Value,
    room: &Arc<Room>,
    executor: &Arc<dyn CodeExecutor>,
) -> ToolResult {
    match name {
        "execute" => handle_execute(args, room, executor).await,
        "read_file" => handle_read_file(args, room).await,
        "write_file" => handle_write_file(args, room).await,
        "bash" => handle_bash(args, room).await,
        _ => ToolResult::error(format!("Unknown tool: {name}")),
    }
}

async fn handle_execute(
    args: &Value,
    room: &Arc<Room>,
    executor: &Arc<dyn CodeExecutor>,
) -> ToolResult {
    let Some(code) = args.get("code").and_then(Value::as_str) else {
        return ToolResult::error("Missing required parameter: code".to_string());
    };
    let timeout_ms = args
        .get("timeout")
        .and_then(Value::as_u64)
        .unwrap_or(EXECUTE_DEFAULT_TIMEOUT_MS);
    match executor.execute(room.clone(), code, timeout_ms).await {
        Ok(output) => ToolResult::success(&Value::String(output)),
        Err(e) => ToolResult::error(e),
    }
}

async fn handle_read_file(args: &Value, room: &Arc<Room>) -> ToolResult {
    let Some(path) = args.get("path").and_then(Value::as_str) else {
        return ToolResult::error("Missing required parameter: path".to_string());
    };
    match room.file_read(path).await {
        Ok(result) => {
            let content = result
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            ToolResult::success(&Value::String(content.to_string()))
        }
        Err(e) => ToolResult::error(e.to_string()),
    }
}

async fn handle_write_file(args: &Value, room: &Arc<Room>) -> ToolResult {
    let Some(path) = args.get("path").and_then(Value::as_str) else {
        return ToolResult::error("Missing required parameter: path".to_string());
    };
    let Some(content) = args.get("content").and_then(Value::as_str) else {
        return ToolResult::error("Missing required parameter: content".to_string());
    };
    match room.file_write(path, content).await {
        Ok(_) => ToolResult::success(&json!({ "success": true })),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

async fn handle_bash(args: &Value, room: &Arc<Room>) -> ToolResult {
    let Some(command) = args.get("command").and_then(Value::as_str) else {
        return ToolResult::error("Missing required parameter: command".to_string());
    };
    let workdir = args.get("workdir").and_then(Value::as_str);
    let timeout_ms = args.get("timeout").and_then(Value::as_u64);
    match room.bash_execute(command, workdir, timeout_ms).await {
        Ok(result) => ToolResult::success(&result),
        Err(e) => ToolResult::error(e.to_string()),
    }
}
