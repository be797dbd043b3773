#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! roomrelay library — exposes the relay's building blocks:
//!
//! - `room` — the per-tenant hub: peer registry, RPC multiplexers, target
//!   mirror, read-time ledger, keepalive, lifecycle
//! - `auth` — per-room first-writer-wins passphrase digests
//! - `protocol` — wire envelopes shared by every peer class
//! - `config` — configuration loading
//! - `routes` — HTTP route handlers (health, status)
//! - `ws` — WebSocket upgrade handlers and socket loops
//! - `mcp` — the MCP JSON-RPC endpoint and its tool surface

pub mod auth;
pub mod config;
pub mod mcp;
pub mod protocol;
pub mod room;
pub mod routes;
pub mod state;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use room::Room;
pub use state::{AppState, Rooms};
