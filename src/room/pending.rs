//! Pending-request table pairing asynchronous RPC responses with callers.
//!
//! Each back-end peer gets its own table with its own monotonic id counter.
//! An in-flight request lives from dispatch until a response with a matching
//! id arrives, its deadline fires, or the peer disconnects (which rejects
//! every in-flight request to that peer as a group).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::protocol::{CallError, PeerLabel};
use crate::room::peers::Outbound;

/// One in-flight RPC awaiting a matching response id.
struct PendingEntry {
    resolver: oneshot::Sender<Result<Value, CallError>>,
    method: String,
    origin_client_id: Option<String>,
}

/// Pending-request table for one back-end peer.
pub struct PendingTable {
    label: PeerLabel,
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, PendingEntry>>,
}

impl PendingTable {
    pub fn new(label: PeerLabel) -> Self {
        Self {
            label,
            next_id: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn label(&self) -> PeerLabel {
        self.label
    }

    /// Allocate the next correlation id. Strictly increasing for the life of
    /// the room; never reset, even across peer reconnects.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn register(
        &self,
        id: u64,
        method: &str,
        origin_client_id: Option<&str>,
    ) -> oneshot::Receiver<Result<Value, CallError>> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().await.insert(
            id,
            PendingEntry {
                resolver: tx,
                method: method.to_string(),
                origin_client_id: origin_client_id.map(ToString::to_string),
            },
        );
        rx
    }

    async fn remove(&self, id: u64) -> Option<String> {
        self.entries.lock().await.remove(&id).map(|e| e.method)
    }

    /// Resolve the pending request with a matching id. Returns `false` for a
    /// late or duplicate response, which is dropped harmlessly — the caller
    /// may already have timed out. A caller that disconnected mid-flight has
    /// dropped its receiver; the send result is ignored for the same reason.
    pub async fn resolve(&self, id: u64, outcome: Result<Value, String>) -> bool {
        let Some(entry) = self.entries.lock().await.remove(&id) else {
            return false;
        };
        let _ = entry.resolver.send(outcome.map_err(CallError::Peer));
        true
    }

    /// Reject every in-flight request (the back-end peer disconnected).
    /// Returns how many were rejected.
    pub async fn reject_all(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        for (_, entry) in entries.drain() {
            let _ = entry
                .resolver
                .send(Err(CallError::ConnectionClosed(self.label)));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Origin client ids of the in-flight requests (introspection/logging).
    pub async fn origins(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .values()
            .filter_map(|e| e.origin_client_id.clone())
            .collect()
    }
}

/// Dispatch `envelope` to the peer and await the correlated response.
///
/// On deadline expiry the entry is removed before the timeout error is
/// returned, so a late response cannot resolve a stale caller. A dropped
/// resolver (table drained by [`PendingTable::reject_all`] racing the send)
/// maps to the peer-closed error.
pub async fn dispatch(
    table: &PendingTable,
    sender: &mpsc::Sender<Outbound>,
    id: u64,
    method: &str,
    origin_client_id: Option<&str>,
    envelope: Value,
    timeout_ms: u64,
) -> Result<Value, CallError> {
    let rx = table.register(id, method, origin_client_id).await;

    if sender.send(Outbound::Json(envelope)).await.is_err() {
        table.remove(id).await;
        return Err(CallError::ConnectionClosed(table.label()));
    }

    match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(CallError::ConnectionClosed(table.label())),
        Err(_) => {
            table.remove(id).await;
            Err(CallError::Timeout {
                peer: table.label(),
                timeout_ms,
                method: method.to_string(),
            })
        }
    }
}
