//! # roomrelay
//!
//! Multi-tenant WebSocket relay bridging three peer classes inside isolated
//! rooms: a browser-controlling extension (Chrome DevTools protocol), a
//! local-machine client (filesystem and shell), and any number of agent
//! clients consuming tools over MCP. The relay holds no persistent data; it
//! routes request/response/event messages and enforces per-room
//! authentication, single-peer invariants, and write-after-read safety for
//! file operations.
//!
//! ## API surface
//!
//! | Method | Path                              | Auth | Description                         |
//! |--------|-----------------------------------|------|-------------------------------------|
//! | GET    | `/`, `/health`                    | No   | Process liveness probe              |
//! | GET    | `/room/{id}`, `/room/{id}/health` | No*  | Room liveness (`?passphrase=` opt.) |
//! | GET    | `/room/{id}/extension`            | Yes  | WS: browser extension peer          |
//! | GET    | `/room/{id}/local[/{clientId}]`   | Yes  | WS: local machine peer              |
//! | GET    | `/room/{id}/mcp[/{clientId}]`     | Yes  | WS: agent peer                      |
//! | POST   | `/room/{id}/mcp-server`           | Yes  | MCP JSON-RPC tool surface           |
//! | GET    | `/room/{id}/extension/status`     | Yes  | `{ connected }`                     |
//! | GET    | `/room/{id}/local/status`         | Yes  | `{ connected }`                     |
//!
//! *A passphrase supplied to a fresh room's health endpoint sets the room's
//! passphrase (first-writer-wins).
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, router setup, graceful shutdown
//! auth.rs        — per-room passphrase digests, constant-time comparison
//! config.rs      — TOML + env-var configuration
//! protocol.rs    — wire envelopes, the single frame-parse point, error taxonomy
//! state.rs       — AppState, lazily-created room registry, idle-room sweep
//! room/
//!   mod.rs       — the per-tenant hub: lifecycle, keepalive, teardown
//!   peers.rs     — tag-indexed peer registry, single-peer invariants
//!   pending.rs   — correlation ids, pending tables, deadline dispatch
//!   targets.rs   — mirror of the browser's attached targets
//!   browser.rs   — extension RPC multiplexer, event bookkeeping + fan-out
//!   local.rs     — local RPC multiplexer, read-time ledger
//!   router.rs    — agent command classification (local / synthesized / forward)
//! ws.rs          — WebSocket upgrades, per-socket loops
//! mcp/           — MCP JSON-RPC endpoint and tool handlers
//! routes/        — health and status endpoints
//! ```

use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use roomrelay::{mcp, routes, ws, AppState, Config};

/// Multi-tenant WebSocket relay for browser, local-machine, and agent peers.
#[derive(Parser)]
#[command(name = "roomrelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("roomrelay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let state = AppState::new(config);

    let app = Router::new()
        .route("/", get(routes::health::health))
        .route("/health", get(routes::health::health))
        .route("/room/{room_id}", get(routes::health::room_health))
        .route("/room/{room_id}/health", get(routes::health::room_health))
        .route("/room/{room_id}/extension", get(ws::extension_ws))
        .route(
            "/room/{room_id}/extension/status",
            get(routes::status::extension_status),
        )
        .route("/room/{room_id}/local", get(ws::local_ws))
        .route("/room/{room_id}/local/status", get(routes::status::local_status))
        .route("/room/{room_id}/local/{client_id}", get(ws::local_ws_with_id))
        .route("/room/{room_id}/mcp", get(ws::agent_ws))
        .route("/room/{room_id}/mcp/{client_id}", get(ws::agent_ws_with_id))
        .route("/room/{room_id}/mcp-server", post(mcp::mcp_http))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: evict rooms that have been empty past the grace period
    let sweep_rooms = state.rooms.clone();
    let sweep_interval = state.config.server.sweep_interval_secs;
    let sweep_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(sweep_interval.max(1)));
        loop {
            interval.tick().await;
            sweep_rooms.sweep().await;
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    state.rooms.shutdown_all().await;
    info!("Goodbye");
}
