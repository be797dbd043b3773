//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `ROOMRELAY_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `roomrelay.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8787"
//! request_timeout_ms = 30000
//! exec_timeout_ms = 30000
//! keepalive_interval_secs = 5
//! room_grace_secs = 60
//! sweep_interval_secs = 30
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::room::RoomConfig;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and room-timing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8787`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Deadline for a forwarded RPC in milliseconds (default 30 000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Default shell-command timeout for `bash.execute` in milliseconds
    /// (default 30 000). The RPC deadline adds round-trip slack on top.
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,
    /// Seconds between application-level pings to back-end peers (default 5).
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Seconds an empty room lingers before the sweep evicts it (default 60).
    #[serde(default = "default_room_grace_secs")]
    pub room_grace_secs: u64,
    /// Seconds between room sweep passes (default 30).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8787".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_exec_timeout_ms() -> u64 {
    30_000
}
fn default_keepalive_interval_secs() -> u64 {
    5
}
fn default_room_grace_secs() -> u64 {
    60
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_ms: default_request_timeout_ms(),
            exec_timeout_ms: default_exec_timeout_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            room_grace_secs: default_room_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `roomrelay.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("roomrelay.toml").exists() {
            let content =
                std::fs::read_to_string("roomrelay.toml").expect("Failed to read roomrelay.toml");
            toml::from_str(&content).expect("Failed to parse roomrelay.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("ROOMRELAY_LISTEN") {
            config.server.listen = listen;
        }

        config
    }

    /// The slice of settings each room carries.
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            request_timeout_ms: self.server.request_timeout_ms,
            exec_timeout_ms: self.server.exec_timeout_ms,
            keepalive_interval_secs: self.server.keepalive_interval_secs,
        }
    }
}
