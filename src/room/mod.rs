//! The per-tenant hub.
//!
//! A room is created lazily on the first admission request for its id and
//! holds everything the relay knows about one (extension, local, agents)
//! triple: the passphrase record, the peer registry, the two RPC
//! multiplexers' pending tables, the target mirror, the read-time ledger,
//! and the keepalive task. Rooms own this state exclusively; socket tasks
//! only hold a tag and look the rest up here on every message.
//!
//! ## Lifecycle per role
//!
//! | Role | On disconnect |
//! |------|---------------|
//! | Extension | clear target mirror, reject pending browser RPCs, close every agent socket (code 1000, `"Extension disconnected"`) |
//! | Local | clear the read-time ledger, reject pending local RPCs; agents stay |
//! | Agent | drop from fan-out, free the client id |

pub mod browser;
pub mod local;
pub mod peers;
pub mod pending;
pub mod router;
pub mod targets;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{extract_passphrase, AuthError, AuthQuery, RoomAuth};
use crate::protocol::{self, PeerLabel};
use self::peers::{Conflict, Outbound, PeerHandle, PeerRegistry, PeerTag};
use self::pending::PendingTable;
use self::targets::TargetRegistry;

/// Normal closure — used when the extension's departure tears agents down.
pub const CLOSE_NORMAL: u16 = 1000;
/// Going away — used when the relay itself shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Policy violation — used when an admission race is lost after the HTTP
/// conflict precheck.
pub const CLOSE_POLICY: u16 = 1008;

/// The slice of configuration each room carries.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub request_timeout_ms: u64,
    pub exec_timeout_ms: u64,
    pub keepalive_interval_secs: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            exec_timeout_ms: 30_000,
            keepalive_interval_secs: 5,
        }
    }
}

/// All state for one room. See the module docs for the ownership story.
pub struct Room {
    pub id: String,
    pub(crate) cfg: RoomConfig,
    auth: RoomAuth,
    peers: Mutex<PeerRegistry>,
    targets: Mutex<TargetRegistry>,
    /// Absolute path → last observed mtime, exactly as the local peer
    /// reported it.
    ledger: Mutex<HashMap<String, Value>>,
    browser_pending: PendingTable,
    local_pending: PendingTable,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    empty_since: Mutex<Option<Instant>>,
    dropped_events: AtomicU64,
}

impl Room {
    pub fn new(id: impl Into<String>, cfg: RoomConfig) -> Self {
        Self {
            id: id.into(),
            cfg,
            auth: RoomAuth::default(),
            peers: Mutex::new(PeerRegistry::default()),
            targets: Mutex::new(TargetRegistry::default()),
            ledger: Mutex::new(HashMap::new()),
            browser_pending: PendingTable::new(PeerLabel::Extension),
            local_pending: PendingTable::new(PeerLabel::LocalClient),
            keepalive: Mutex::new(None),
            empty_since: Mutex::new(Some(Instant::now())),
            dropped_events: AtomicU64::new(0),
        }
    }

    // ─── Admission ───────────────────────────────────────────────────────────

    /// Validate the request's passphrase against this room, with first-set
    /// semantics on a fresh room.
    pub async fn authorize(&self, headers: &HeaderMap, query: &AuthQuery) -> Result<(), AuthError> {
        let Some(passphrase) = extract_passphrase(headers, query) else {
            return Err(AuthError::Missing);
        };
        self.validate_passphrase(&passphrase).await
    }

    pub async fn validate_passphrase(&self, passphrase: &str) -> Result<(), AuthError> {
        self.auth.validate(&self.id, passphrase).await
    }

    /// Admit a peer, enforcing the single-peer invariants, and make sure the
    /// keepalive runs when a back-end peer is present.
    pub async fn admit(self: Arc<Self>, handle: PeerHandle) -> Result<(), Conflict> {
        let tag = handle.tag.clone();
        self.peers.lock().await.admit(handle)?;
        *self.empty_since.lock().await = None;
        if matches!(tag, PeerTag::Extension | PeerTag::Local) {
            ensure_keepalive(&self).await;
        }
        Ok(())
    }

    pub async fn peer_connected(&self, tag: &PeerTag) -> bool {
        self.peers.lock().await.contains(tag)
    }

    async fn remove_peer(&self, tag: &PeerTag) -> Option<PeerHandle> {
        let mut peers = self.peers.lock().await;
        let removed = peers.remove(tag);
        if peers.is_empty() {
            *self.empty_since.lock().await = Some(Instant::now());
        }
        removed
    }

    // ─── Lifecycle transitions ───────────────────────────────────────────────

    /// The extension's departure invalidates every agent's protocol state:
    /// their sessions were tied to the live browser connection.
    pub async fn on_extension_disconnect(&self) {
        self.remove_peer(&PeerTag::Extension).await;
        self.targets.lock().await.clear();
        let rejected = self.browser_pending.reject_all().await;
        if rejected > 0 {
            info!(room = %self.id, rejected, "Rejected pending extension requests");
        }
        let agents = self.peers.lock().await.agents();
        for agent in agents {
            let _ = agent
                .sender
                .send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: "Extension disconnected".to_string(),
                })
                .await;
        }
    }

    /// The local client's departure invalidates the ledger but not the
    /// agents — browser tools remain usable.
    pub async fn on_local_disconnect(&self) {
        self.remove_peer(&PeerTag::Local).await;
        self.ledger.lock().await.clear();
        let rejected = self.local_pending.reject_all().await;
        if rejected > 0 {
            info!(room = %self.id, rejected, "Rejected pending local requests");
        }
    }

    pub async fn on_agent_disconnect(&self, client_id: &str) {
        self.remove_peer(&PeerTag::Agent(client_id.to_string()))
            .await;
    }

    // ─── Keepalive ───────────────────────────────────────────────────────────

    /// Record an application-level pong from a back-end peer. Consumed but
    /// never used to drop the peer; transport closure is the only disconnect
    /// signal.
    pub(crate) async fn touch_pong(&self, tag: &PeerTag) {
        let peers = self.peers.lock().await;
        if let Some(handle) = peers.get(tag) {
            *handle.last_pong.lock().await = Some(Instant::now());
        }
    }

    pub async fn last_pong_age_ms(&self, tag: &PeerTag) -> Option<u64> {
        let peers = self.peers.lock().await;
        let handle = peers.get(tag)?;
        let last = (*handle.last_pong.lock().await)?;
        Some(u64::try_from(last.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    /// How long the peer has been connected, in milliseconds.
    pub async fn connected_age_ms(&self, tag: &PeerTag) -> Option<u64> {
        let peers = self.peers.lock().await;
        let handle = peers.get(tag)?;
        Some(u64::try_from(handle.connected_at.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    pub async fn extension_connected(&self) -> bool {
        self.peers.lock().await.extension().is_some()
    }

    pub async fn local_connected(&self) -> bool {
        self.peers.lock().await.local().is_some()
    }

    pub async fn target_count(&self) -> usize {
        self.targets.lock().await.len()
    }

    pub async fn pending_counts(&self) -> (usize, usize) {
        (
            self.browser_pending.len().await,
            self.local_pending.len().await,
        )
    }

    /// Client ids of the agents with requests in flight to the extension.
    pub async fn pending_origins(&self) -> Vec<String> {
        self.browser_pending.origins().await
    }

    /// Events that fan-out could not deliver (agent backpressure or a closed
    /// socket).
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Whether the room has been empty for longer than `grace`.
    pub async fn is_idle(&self, grace: Duration) -> bool {
        match *self.empty_since.lock().await {
            Some(since) => since.elapsed() >= grace,
            None => false,
        }
    }

    // ─── Teardown ────────────────────────────────────────────────────────────

    /// Tear the room down: reject all in-flight work and close every socket.
    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive.lock().await.take() {
            task.abort();
        }
        self.browser_pending.reject_all().await;
        self.local_pending.reject_all().await;
        self.targets.lock().await.clear();
        self.ledger.lock().await.clear();
        let handles: Vec<PeerHandle> = {
            let mut peers = self.peers.lock().await;
            let mut drained = Vec::new();
            for tag in [PeerTag::Extension, PeerTag::Local] {
                if let Some(handle) = peers.remove(&tag) {
                    drained.push(handle);
                }
            }
            for agent in peers.agents() {
                peers.remove(&agent.tag);
                drained.push(agent);
            }
            drained
        };
        for handle in handles {
            let _ = handle
                .sender
                .send(Outbound::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "Relay shutting down".to_string(),
                })
                .await;
        }
    }

    /// Re-emit a back-end peer's log envelope through the relay's own sink.
    pub(crate) fn emit_peer_log(&self, peer: &str, level: &str, args: &[String]) {
        let line = args.join(" ");
        match level {
            "error" => error!(room = %self.id, peer, "{line}"),
            "warn" | "warning" => warn!(room = %self.id, peer, "{line}"),
            "debug" => debug!(room = %self.id, peer, "{line}"),
            _ => info!(room = %self.id, peer, "{line}"),
        }
    }
}

/// Arm the keepalive task if it isn't already running.
async fn ensure_keepalive(room: &Arc<Room>) {
    let mut guard = room.keepalive.lock().await;
    let running = guard.as_ref().is_some_and(|task| !task.is_finished());
    if running {
        return;
    }
    let weak = Arc::downgrade(room);
    let interval_secs = room.cfg.keepalive_interval_secs;
    *guard = Some(tokio::spawn(keepalive_loop(weak, interval_secs)));
}

/// Periodic application-level ping to back-end peers. Exits when the room is
/// gone or when no back-end peer remains; re-armed on the next back-end
/// admission.
async fn keepalive_loop(room: Weak<Room>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.tick().await; // the immediate first tick
    loop {
        interval.tick().await;
        let Some(room) = room.upgrade() else { return };
        let backends = room.peers.lock().await.backends();
        if backends.is_empty() {
            return;
        }
        for sender in backends {
            let _ = sender.send(Outbound::Json(protocol::ping())).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::sync::mpsc;

    pub fn test_room() -> Arc<Room> {
        test_room_with(RoomConfig {
            request_timeout_ms: 2_000,
            exec_timeout_ms: 2_000,
            keepalive_interval_secs: 1,
        })
    }

    pub fn test_room_with(cfg: RoomConfig) -> Arc<Room> {
        Arc::new(Room::new("test-room", cfg))
    }

    /// Admit a fake peer backed by an in-memory channel and return its
    /// receiving end.
    pub async fn admit_peer(room: &Arc<Room>, tag: PeerTag) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(64);
        let client_id = match &tag {
            PeerTag::Agent(id) => Some(id.clone()),
            _ => None,
        };
        room.clone()
            .admit(PeerHandle::new(tag, client_id, tx))
            .await
            .unwrap();
        rx
    }

    /// Next JSON frame from a fake peer's channel.
    pub async fn next_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.recv().await.expect("channel open") {
            Outbound::Json(value) => value,
            Outbound::Close { code, reason } => panic!("unexpected close {code}: {reason}"),
        }
    }
}
