//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::info;

use crate::config::Config;
use crate::mcp::tools::{CodeExecutor, NoExecutor};
use crate::room::Room;

/// Shared state for the relay.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live rooms, created lazily on first admission request.
    pub rooms: Rooms,
    /// Sandboxed runner behind the `execute` tool. A black-box collaborator;
    /// defaults to the unconfigured stub.
    pub executor: Arc<dyn CodeExecutor>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        Self {
            rooms: Rooms::new(config.clone()),
            config,
            start_time: Instant::now(),
            executor: Arc::new(NoExecutor),
        }
    }
}

/// Registry of live rooms keyed by room id.
#[derive(Clone)]
pub struct Rooms {
    config: Arc<Config>,
    inner: Arc<RwLock<HashMap<String, Arc<Room>>>>,
}

impl Rooms {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch a room, creating it on first reference.
    pub async fn get_or_create(&self, id: &str) -> Arc<Room> {
        {
            let rooms = self.inner.read().await;
            if let Some(room) = rooms.get(id) {
                return room.clone();
            }
        }
        let mut rooms = self.inner.write().await;
        if let Some(room) = rooms.get(id) {
            return room.clone();
        }
        info!(room = %id, "Creating room");
        let room = Arc::new(Room::new(id, self.config.room_config()));
        rooms.insert(id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Evict rooms that have been empty past the grace period. Returns the
    /// ids of evicted rooms.
    pub async fn sweep(&self) -> Vec<String> {
        let grace = Duration::from_secs(self.config.server.room_grace_secs);
        let mut idle = Vec::new();
        {
            let rooms = self.inner.read().await;
            for (id, room) in rooms.iter() {
                if room.is_idle(grace).await {
                    idle.push(id.clone());
                }
            }
        }
        let mut evicted = Vec::new();
        if !idle.is_empty() {
            let mut rooms = self.inner.write().await;
            for id in idle {
                // Re-check under the write lock: a peer may have connected
                // between the passes.
                let still_idle = match rooms.get(&id) {
                    Some(room) => room.is_idle(grace).await,
                    None => false,
                };
                if still_idle {
                    if let Some(room) = rooms.remove(&id) {
                        room.shutdown().await;
                        info!(room = %id, "Evicted idle room");
                        evicted.push(id);
                    }
                }
            }
        }
        evicted
    }

    /// Tear every room down (graceful shutdown).
    pub async fn shutdown_all(&self) {
        let mut rooms = self.inner.write().await;
        for (id, room) in rooms.drain() {
            room.shutdown().await;
            info!(room = %id, "Room closed for shutdown");
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::peers::{PeerHandle, PeerTag};
    use tokio::sync::mpsc;

    fn rooms_with_grace(grace_secs: u64) -> Rooms {
        let mut config = Config::default();
        config.server.room_grace_secs = grace_secs;
        Rooms::new(Arc::new(config))
    }

    #[tokio::test]
    async fn rooms_are_created_once_per_id() {
        let rooms = rooms_with_grace(60);
        let a = rooms.get_or_create("r1").await;
        let b = rooms.get_or_create("r1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(rooms.len().await, 1);
        assert!(rooms.get("r2").await.is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_only_empty_rooms_past_grace() {
        let rooms = rooms_with_grace(0);
        let empty = rooms.get_or_create("empty").await;
        let busy = rooms.get_or_create("busy").await;
        let (tx, _rx) = mpsc::channel(1);
        busy.clone()
            .admit(PeerHandle::new(PeerTag::Agent("a".into()), Some("a".into()), tx))
            .await
            .unwrap();

        let evicted = rooms.sweep().await;
        assert_eq!(evicted, vec!["empty".to_string()]);
        assert!(rooms.get("empty").await.is_none());
        assert!(rooms.get("busy").await.is_some());
        drop(empty);
    }
}
