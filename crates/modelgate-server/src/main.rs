//! modelgate server entry point.
//!
//! Bootstraps the store, crypto key, and sidecar supervisor, then starts
//! the Axum HTTP server with graceful shutdown. Background workers (the
//! session/state sweep and the daily usage rollup) run alongside the
//! server and are cancelled on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use modelgate_core::crypto::{EncryptionKey, TokenCipher};
use modelgate_sidecar::{Supervisor, SupervisorConfig};
use modelgate_store::{settings as settings_keys, InstanceLock, Store};

use modelgate_server::app::{self, AdminBootstrap};
use modelgate_server::config::ServerConfig;
use modelgate_server::oauth::OAuthRegistry;
use modelgate_server::rate_limit::RateLimiter;
use modelgate_server::state::AppState;
use modelgate_server::workers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(data_dir = %config.data_dir.display(), "modelgate starting");

    // One server per store: refuse to start when the lock is held.
    let _instance_lock = InstanceLock::acquire(&config.data_dir)
        .context("another modelgate instance owns this data directory")?;

    let state = build_app_state(&config).await?;

    // One-way first-run bootstrap of the admin password.
    match app::bootstrap_admin(
        &state.store,
        config.initial_admin_password.as_deref(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("admin bootstrap failed: {e:?}"))?
    {
        AdminBootstrap::Created => info!("admin password set from environment"),
        AdminBootstrap::AlreadySet => {
            if config.initial_admin_password.is_some() {
                info!("admin digest already present, MODELGATE_ADMIN_PASSWORD ignored");
            }
        }
        AdminBootstrap::MissingPassword => {
            anyhow::bail!(
                "no admin password stored and MODELGATE_ADMIN_PASSWORD is unset — cannot bootstrap"
            );
        }
    }

    // Optionally bring the sidecar up at boot.
    if state
        .store
        .bool_setting(settings_keys::AUTO_START_PROXY, false)
        .await
        .unwrap_or(false)
    {
        match app::project_sidecar_yaml(&state).await {
            Ok(yaml) => {
                if let Err(err) = state.supervisor.start(&yaml).await {
                    warn!(error = %err, "sidecar auto-start failed");
                }
            }
            Err(err) => warn!(error = %err, "sidecar config projection failed at boot"),
        }
    }

    // Shutdown signal channel + background workers.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    workers::run_rollup(&state.store).await;
    let sweep_handle = tokio::spawn(workers::sweep_worker(
        state.store.clone(),
        shutdown_rx.clone(),
    ));
    let rollup_handle = tokio::spawn(workers::rollup_worker(
        state.store.clone(),
        shutdown_rx.clone(),
    ));

    let router = app::build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "modelgate listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    // Bring down the sidecar and wait for workers (with timeout).
    info!("stopping sidecar and background workers");
    state.supervisor.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(10), sweep_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), rollup_handle).await;

    info!("modelgate stopped");
    Ok(())
}

/// Build the shared application state.
async fn build_app_state(config: &ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let store = Store::open(&config.db_path)
        .await
        .context("failed to open store")?;

    let key = EncryptionKey::from_hex(&config.encryption_key_hex)
        .context("MODELGATE_ENCRYPTION_KEY must be 64 hex characters")?;
    let cipher = TokenCipher::new(key);

    // The proxy port setting wins over the env default once an admin has
    // set it; the supervisor keeps one port for its whole lifetime.
    let proxy_port = store
        .numeric_setting(settings_keys::PROXY_PORT, u64::from(config.proxy_port))
        .await
        .ok()
        .and_then(|port| u16::try_from(port).ok())
        .unwrap_or(config.proxy_port);

    let supervisor = Supervisor::spawn(SupervisorConfig::new(
        config.sidecar_binary.clone(),
        config.data_dir.join("sidecar.yaml"),
        config.data_dir.join("sidecar-state"),
        proxy_port,
    ));

    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .build()
        .context("failed to build HTTP client")?;

    Ok(Arc::new(AppState {
        store,
        cipher,
        supervisor,
        http,
        rate_limiter: RateLimiter::new(),
        oauth: OAuthRegistry::from_env(),
        config: config.clone(),
    }))
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
