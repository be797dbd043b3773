//! Tag-indexed registry of the WebSocket peers connected to a room.
//!
//! Peers are keyed by [`PeerTag`] rather than held in role-typed collections,
//! so a socket's role (and, for agents, its client id) is recoverable from
//! the tag alone on every inbound message. Admission enforces the single-peer
//! invariants: at most one extension, at most one local client, and agent
//! client ids unique within the room.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Frames funneled to a peer's socket send task.
#[derive(Debug)]
pub enum Outbound {
    Json(Value),
    /// Close the socket with an application close frame, then stop sending.
    Close { code: u16, reason: String },
}

/// Registry key identifying a connected peer's role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerTag {
    /// The browser-controlling extension. One per room.
    Extension,
    /// The local-machine client. One per room; its client id is recorded on
    /// the handle but does not differentiate admission.
    Local,
    /// An agent client, keyed by its unique client id.
    Agent(String),
}

impl fmt::Display for PeerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extension => write!(f, "extension"),
            Self::Local => write!(f, "local"),
            Self::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

/// A connected peer: its tag, recorded client id, and outbound channel.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub tag: PeerTag,
    pub client_id: Option<String>,
    pub sender: mpsc::Sender<Outbound>,
    pub connected_at: Instant,
    /// Last application-level pong (back-end peers only). Never used to drop
    /// a peer; surfaced by the status routes.
    pub last_pong: Arc<Mutex<Option<Instant>>>,
}

impl PeerHandle {
    pub fn new(tag: PeerTag, client_id: Option<String>, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            tag,
            client_id,
            sender,
            connected_at: Instant::now(),
            last_pong: Arc::new(Mutex::new(None)),
        }
    }
}

/// Admission failure: the role (or agent client id) is already taken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0} already connected")]
pub struct Conflict(pub PeerTag);

/// The set of live peers in a room.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerTag, PeerHandle>,
}

impl PeerRegistry {
    /// Admit a peer, enforcing the single-peer invariants.
    pub fn admit(&mut self, handle: PeerHandle) -> Result<(), Conflict> {
        if self.peers.contains_key(&handle.tag) {
            return Err(Conflict(handle.tag));
        }
        self.peers.insert(handle.tag.clone(), handle);
        Ok(())
    }

    pub fn remove(&mut self, tag: &PeerTag) -> Option<PeerHandle> {
        self.peers.remove(tag)
    }

    pub fn contains(&self, tag: &PeerTag) -> bool {
        self.peers.contains_key(tag)
    }

    pub fn get(&self, tag: &PeerTag) -> Option<&PeerHandle> {
        self.peers.get(tag)
    }

    pub fn extension(&self) -> Option<&PeerHandle> {
        self.peers.get(&PeerTag::Extension)
    }

    pub fn local(&self) -> Option<&PeerHandle> {
        self.peers.get(&PeerTag::Local)
    }

    /// Snapshot of the agent peers, taken per fan-out so a disconnect during
    /// iteration cannot disturb the broadcast.
    pub fn agents(&self) -> Vec<PeerHandle> {
        self.peers
            .values()
            .filter(|p| matches!(p.tag, PeerTag::Agent(_)))
            .cloned()
            .collect()
    }

    /// Senders for the connected back-end peers (extension and/or local).
    pub fn backends(&self) -> Vec<mpsc::Sender<Outbound>> {
        [PeerTag::Extension, PeerTag::Local]
            .iter()
            .filter_map(|tag| self.peers.get(tag))
            .map(|p| p.sender.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}
