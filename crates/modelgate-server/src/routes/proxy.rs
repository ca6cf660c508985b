//! Sidecar lifecycle endpoints: `/api/proxy/*`.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;

use modelgate_sidecar::ProxyStatus;

use crate::app::project_sidecar_yaml;
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
}

/// `GET /api/proxy/status`
async fn status(State(state): State<Arc<AppState>>) -> Json<ProxyStatus> {
    Json(state.supervisor.status().await)
}

/// `POST /api/proxy/start` — regenerate config, spawn, wait for health.
/// Idempotent when the sidecar is already healthy.
async fn start(State(state): State<Arc<AppState>>) -> Result<Json<ProxyStatus>, ApiError> {
    let yaml = project_sidecar_yaml(&state).await?;
    state.supervisor.start(&yaml).await?;
    info!("proxy started by admin");
    Ok(Json(state.supervisor.status().await))
}

/// `POST /api/proxy/stop`
async fn stop(State(state): State<Arc<AppState>>) -> Json<ProxyStatus> {
    state.supervisor.stop().await;
    info!("proxy stopped by admin");
    Json(state.supervisor.status().await)
}

/// `POST /api/proxy/restart` — stop, then start with freshly projected
/// config on the same port.
async fn restart(State(state): State<Arc<AppState>>) -> Result<Json<ProxyStatus>, ApiError> {
    let yaml = project_sidecar_yaml(&state).await?;
    state.supervisor.stop().await;
    state.supervisor.start(&yaml).await?;
    info!("proxy restarted by admin");
    Ok(Json(state.supervisor.status().await))
}
