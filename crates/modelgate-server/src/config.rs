//! Server configuration for modelgate.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `MODELGATE_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Directory holding the database, lock file, generated sidecar
    /// config, and the sidecar's state directory.
    pub data_dir: PathBuf,
    /// Path of the embedded store file.
    pub db_path: PathBuf,
    /// Path to the sidecar executable.
    pub sidecar_binary: PathBuf,
    /// Default loopback port for the sidecar (overridden by the
    /// `proxy_port` setting once set).
    pub proxy_port: u16,
    /// 64-hex-char symmetric key for credential encryption. Changing it
    /// after first run invalidates all stored provider credentials.
    pub encryption_key_hex: String,
    /// Initial admin password; consulted only when no digest is stored.
    pub initial_admin_password: Option<String>,
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Public base URL of this server (OAuth redirect construction).
    pub public_url: String,
    /// Where OAuth callbacks send the browser afterwards.
    pub ui_url: String,
    /// Whether session cookies carry the `Secure` attribute. Defaults to
    /// `true` unless we bind loopback.
    pub secure_cookies: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MODELGATE_BIND_ADDR` — listen address (default: `127.0.0.1:8080`)
    /// - `MODELGATE_DATA_DIR` — data directory (default: `./data`)
    /// - `MODELGATE_DB_PATH` — store file (default: `<data_dir>/modelgate.db`)
    /// - `MODELGATE_SIDECAR_BIN` — sidecar executable (default: `model-router`, resolved via `PATH`)
    /// - `MODELGATE_PROXY_PORT` — sidecar loopback port (default: `8317`)
    /// - `MODELGATE_ENCRYPTION_KEY` — 64 hex chars, required
    /// - `MODELGATE_ADMIN_PASSWORD` — first-run bootstrap password
    /// - `MODELGATE_LOG_LEVEL` — log filter (default: `info`)
    /// - `MODELGATE_PUBLIC_URL` — base URL for OAuth redirects (default: derived from bind address)
    /// - `MODELGATE_UI_URL` — browser destination after OAuth (default: `<public_url>/`)
    /// - `MODELGATE_SECURE_COOKIES` — force the cookie `Secure` attribute on/off
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("MODELGATE_BIND_ADDR")
            .ok()
            .and_then(|addr| addr.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

        let data_dir = PathBuf::from(
            std::env::var("MODELGATE_DATA_DIR").unwrap_or_else(|_| "./data".to_owned()),
        );

        let db_path = std::env::var("MODELGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("modelgate.db"));

        let sidecar_binary = PathBuf::from(
            std::env::var("MODELGATE_SIDECAR_BIN").unwrap_or_else(|_| "model-router".to_owned()),
        );

        let proxy_port = std::env::var("MODELGATE_PROXY_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(8317);

        let encryption_key_hex = std::env::var("MODELGATE_ENCRYPTION_KEY").unwrap_or_default();
        let initial_admin_password = std::env::var("MODELGATE_ADMIN_PASSWORD").ok();

        let log_level =
            std::env::var("MODELGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let public_url = std::env::var("MODELGATE_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://{bind_addr}"));
        let ui_url =
            std::env::var("MODELGATE_UI_URL").unwrap_or_else(|_| format!("{public_url}/"));

        let secure_cookies = std::env::var("MODELGATE_SECURE_COOKIES")
            .map(|v| v == "true" || v == "1")
            .unwrap_or_else(|_| !bind_addr.ip().is_loopback());

        Self {
            bind_addr,
            data_dir,
            db_path,
            sidecar_binary,
            proxy_port,
            encryption_key_hex,
            initial_admin_password,
            log_level,
            public_url,
            ui_url,
            secure_cookies,
        }
    }
}
