//! Local-side RPC multiplexing and the read-time ledger.
//!
//! The local peer exposes three methods: `file.read`, `file.write`, and
//! `bash.execute`. Reads record the file's mtime in the room's ledger;
//! writes are admitted only for paths with a ledger entry and carry that
//! mtime as `expectedMtime`, so the local peer can detect a concurrent
//! modification. The ledger is cleared when the local peer disconnects.

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::protocol::{CallError, PeerFrame, PeerLabel};
use crate::room::peers::PeerTag;
use crate::room::{pending, Room};

/// Slack added to a shell command's timeout to cover the RPC round trip.
const EXEC_SLACK_MS: u64 = 5_000;

/// Failure modes of [`Room::file_write`].
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Cannot write to {0}: file has not been read yet. Read the file first to ensure you have the latest content.")]
    NotRead(String),
    #[error(transparent)]
    Call(#[from] CallError),
}

impl Room {
    /// Forward a command to the local peer and await its reply.
    pub async fn local_call(
        &self,
        method: &str,
        params: Value,
        timeout_ms: u64,
    ) -> Result<Value, CallError> {
        let sender = {
            let peers = self.peers.lock().await;
            peers.local().map(|p| p.sender.clone())
        }
        .ok_or(CallError::NotConnected(PeerLabel::LocalClient))?;

        let id = self.local_pending.next_id();
        let envelope = json!({ "id": id, "method": method, "params": params });
        pending::dispatch(
            &self.local_pending,
            &sender,
            id,
            method,
            None,
            envelope,
            timeout_ms,
        )
        .await
    }

    /// `file.read` — returns `{ content, mtime }` and records the observed
    /// mtime so a later write can prove it saw the latest content.
    pub async fn file_read(&self, path: &str) -> Result<Value, CallError> {
        let result = self
            .local_call(
                "file.read",
                json!({ "path": path }),
                self.cfg.request_timeout_ms,
            )
            .await?;
        if let Some(mtime) = result.get("mtime") {
            if !mtime.is_null() {
                self.ledger
                    .lock()
                    .await
                    .insert(path.to_string(), mtime.clone());
            }
        }
        Ok(result)
    }

    /// `file.write` — admitted only after a successful read of the same path.
    ///
    /// The ledger's mtime is passed as `expectedMtime`; the local peer rejects
    /// the write when the file changed underneath (its mtime tolerance is the
    /// peer's contract). On success the ledger moves to the post-write mtime,
    /// so the writer's next write validates against its own.
    pub async fn file_write(&self, path: &str, content: &str) -> Result<Value, WriteError> {
        let expected = self.ledger.lock().await.get(path).cloned();
        let Some(expected) = expected else {
            return Err(WriteError::NotRead(path.to_string()));
        };
        let result = self
            .local_call(
                "file.write",
                json!({ "path": path, "content": content, "expectedMtime": expected }),
                self.cfg.request_timeout_ms,
            )
            .await?;
        if let Some(mtime) = result.get("mtime") {
            if !mtime.is_null() {
                self.ledger
                    .lock()
                    .await
                    .insert(path.to_string(), mtime.clone());
            }
        }
        Ok(result)
    }

    /// `bash.execute` — returns `{ stdout, stderr, exitCode }`. The RPC
    /// deadline is the command timeout plus round-trip slack.
    pub async fn bash_execute(
        &self,
        command: &str,
        workdir: Option<&str>,
        timeout_ms: Option<u64>,
    ) -> Result<Value, CallError> {
        let command_timeout = timeout_ms.unwrap_or(self.cfg.exec_timeout_ms);
        let mut params = json!({ "command": command, "timeout": command_timeout });
        if let Some(workdir) = workdir {
            params["workdir"] = json!(workdir);
        }
        self.local_call(
            "bash.execute",
            params,
            command_timeout.saturating_add(EXEC_SLACK_MS),
        )
        .await
    }

    /// Handle one parsed frame from the local socket.
    pub async fn on_local_frame(&self, frame: PeerFrame) {
        match frame {
            PeerFrame::Response { id, result, error } => {
                let outcome = match error {
                    Some(message) => Err(message),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                if !self.local_pending.resolve(id, outcome).await {
                    debug!(room = %self.id, id, "Dropped unmatched local response");
                }
            }
            PeerFrame::Log { level, args } => self.emit_peer_log("local", &level, &args),
            PeerFrame::Pong => self.touch_pong(&PeerTag::Local).await,
            PeerFrame::Event(event) => {
                debug!(room = %self.id, method = %event.method, "Dropped event from local peer");
            }
        }
    }
}
