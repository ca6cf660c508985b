//! Gateway configuration endpoints: `GET/PUT /api/config`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use modelgate_store::settings as settings_keys;

use crate::app::reload_sidecar;
use crate::error::ApiError;
use crate::extract::ValidatedJson;
use crate::middleware::DEFAULT_RATE_LIMIT_RPM;
use crate::state::AppState;

/// Default data-plane forward timeout.
const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 120;
/// Default usage-log retention horizon.
const DEFAULT_LOG_RETENTION_DAYS: u64 = 90;

#[derive(Debug, Serialize)]
pub struct GatewayConfig {
    proxy_port: u16,
    auto_start_proxy: bool,
    model_mappings: BTreeMap<String, String>,
    rate_limit_rpm: u64,
    forward_timeout_secs: u64,
    log_retention_days: u64,
}

/// `GET /api/config`
pub async fn get_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GatewayConfig>, ApiError> {
    let store = &state.store;
    Ok(Json(GatewayConfig {
        proxy_port: u16::try_from(
            store
                .numeric_setting(settings_keys::PROXY_PORT, u64::from(state.supervisor.port()))
                .await?,
        )
        .unwrap_or_else(|_| state.supervisor.port()),
        auto_start_proxy: store
            .bool_setting(settings_keys::AUTO_START_PROXY, false)
            .await?,
        model_mappings: store.model_mappings().await?,
        rate_limit_rpm: store
            .numeric_setting(settings_keys::RATE_LIMIT_RPM, DEFAULT_RATE_LIMIT_RPM)
            .await?,
        forward_timeout_secs: store
            .numeric_setting(settings_keys::FORWARD_TIMEOUT_SECS, DEFAULT_FORWARD_TIMEOUT_SECS)
            .await?,
        log_retention_days: store
            .numeric_setting(settings_keys::LOG_RETENTION_DAYS, DEFAULT_LOG_RETENTION_DAYS)
            .await?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    proxy_port: Option<u16>,
    #[serde(default)]
    auto_start_proxy: Option<bool>,
    #[serde(default)]
    model_mappings: Option<BTreeMap<String, String>>,
    #[serde(default)]
    rate_limit_rpm: Option<u64>,
    #[serde(default)]
    forward_timeout_secs: Option<u64>,
    #[serde(default)]
    log_retention_days: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ConfigUpdateResponse {
    success: bool,
    /// True when a change (the sidecar port) only takes effect after a
    /// server restart.
    restart_required: bool,
}

/// `PUT /api/config` — apply the provided subset. Model-mapping changes
/// reload the sidecar immediately; a port change is recorded but needs a
/// server restart.
pub async fn put_config(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<ConfigUpdate>,
) -> Result<Json<ConfigUpdateResponse>, ApiError> {
    let store = &state.store;
    let mut restart_required = false;
    let mut mappings_changed = false;

    if let Some(port) = req.proxy_port {
        if port == 0 {
            return Err(ApiError::Validation("proxy_port must be non-zero".to_owned()));
        }
        store
            .set_setting(settings_keys::PROXY_PORT, &port.to_string())
            .await?;
        restart_required = port != state.supervisor.port();
    }
    if let Some(auto_start) = req.auto_start_proxy {
        store
            .set_setting(settings_keys::AUTO_START_PROXY, &auto_start.to_string())
            .await?;
    }
    if let Some(ref mappings) = req.model_mappings {
        let raw = serde_json::to_string(mappings)
            .map_err(|e| ApiError::Internal(format!("mapping serialization: {e}")))?;
        store.set_setting(settings_keys::MODEL_MAPPINGS, &raw).await?;
        mappings_changed = true;
    }
    if let Some(rpm) = req.rate_limit_rpm {
        store
            .set_setting(settings_keys::RATE_LIMIT_RPM, &rpm.to_string())
            .await?;
    }
    if let Some(timeout) = req.forward_timeout_secs {
        if timeout == 0 {
            return Err(ApiError::Validation(
                "forward_timeout_secs must be non-zero".to_owned(),
            ));
        }
        store
            .set_setting(settings_keys::FORWARD_TIMEOUT_SECS, &timeout.to_string())
            .await?;
    }
    if let Some(days) = req.log_retention_days {
        store
            .set_setting(settings_keys::LOG_RETENTION_DAYS, &days.to_string())
            .await?;
    }

    if mappings_changed {
        reload_sidecar(&state).await?;
    }

    info!(restart_required, "gateway config updated");
    Ok(Json(ConfigUpdateResponse {
        success: true,
        restart_required,
    }))
}
