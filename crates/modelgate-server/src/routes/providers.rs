//! Provider management endpoints: `/api/providers*`.
//!
//! Every mutation commits first, then triggers a sidecar reload — the
//! supervisor never calls back into this layer.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use modelgate_core::crypto::ProviderCredentials;
use modelgate_core::settings::{ProviderKind, ProviderSettings};
use modelgate_store::models::{AccountStatus, ProviderAccount};
use modelgate_store::providers;

use crate::app::reload_sidecar;
use crate::error::ApiError;
use crate::extract::ValidatedJson;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list).post(register))
        .route("/{name}", get(get_details).delete(delete_provider))
        .route("/{name}/settings", put(update_settings))
        .route("/{name}/accounts/{id}", delete(delete_account))
        .route("/{name}/health", get(health_check))
}

/// `GET /api/providers`
async fn list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<impl Serialize>, ApiError> {
    let providers = providers::list(state.store.pool()).await?;
    Ok(Json(serde_json::json!({ "providers": providers })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterProviderRequest {
    name: String,
    kind: ProviderKind,
    /// Raw upstream key; required for (and only valid with) `api_key`.
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// `POST /api/providers` — explicit registration. OAuth providers also
/// come into existence implicitly on the first successful callback;
/// raw-key providers are only ever created here.
async fn register(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<RegisterProviderRequest>,
) -> Result<axum::response::Response, ApiError> {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let name = req.name.trim().to_lowercase();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ApiError::Validation(
            "provider name must be non-empty and alphanumeric".to_owned(),
        ));
    }
    match req.kind {
        ProviderKind::ApiKey if req.api_key.as_deref().is_none_or(str::is_empty) => {
            return Err(ApiError::Validation(
                "api_key is required for api_key providers".to_owned(),
            ));
        }
        ProviderKind::OAuth if req.api_key.is_some() => {
            return Err(ApiError::Validation(
                "oauth providers get credentials via the OAuth flow, not a raw key".to_owned(),
            ));
        }
        _ => {}
    }

    let provider = providers::get_or_create(state.store.pool(), &name, req.kind).await?;
    if provider.kind != req.kind.to_string() {
        return Err(ApiError::Conflict(format!(
            "provider '{name}' already exists with kind {}",
            provider.kind
        )));
    }

    if let Some(api_key) = req.api_key {
        let blob = state.cipher.encrypt(&ProviderCredentials {
            access_token: api_key,
            refresh_token: None,
            expires_at: None,
        })?;
        providers::create_account(
            state.store.pool(),
            provider.id,
            req.email.as_deref(),
            &blob,
            None,
        )
        .await?;
    }

    reload_sidecar(&state).await?;
    info!(provider = %provider.name, kind = %provider.kind, "provider registered");

    Ok((StatusCode::CREATED, Json(provider)).into_response())
}

#[derive(Debug, Serialize)]
struct ProviderDetails {
    id: i64,
    name: String,
    kind: String,
    enabled: bool,
    settings: ProviderSettings,
    accounts: Vec<ProviderAccount>,
}

/// `GET /api/providers/{name}` — provider with accounts and settings.
async fn get_details(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ProviderDetails>, ApiError> {
    let provider = providers::get(state.store.pool(), &name).await?;
    let accounts = providers::list_accounts(state.store.pool(), provider.id).await?;
    let settings = provider.parsed_settings()?;

    Ok(Json(ProviderDetails {
        id: provider.id,
        name: provider.name,
        kind: provider.kind,
        enabled: provider.enabled,
        settings,
        accounts,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    settings: Option<ProviderSettings>,
}

/// `PUT /api/providers/{name}/settings` — enabled flag and/or tuning
/// blob; unknown enum values are rejected before anything is stored.
async fn update_settings(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    ValidatedJson(req): ValidatedJson<UpdateSettingsRequest>,
) -> Result<Json<impl Serialize>, ApiError> {
    let settings_json = match req.settings {
        Some(ref settings) => Some(
            serde_json::to_string(settings)
                .map_err(|e| ApiError::Internal(format!("settings serialization: {e}")))?,
        ),
        None => None,
    };

    let provider = providers::update(
        state.store.pool(),
        &name,
        req.enabled,
        settings_json.as_deref(),
    )
    .await?;

    reload_sidecar(&state).await?;
    info!(provider = %provider.name, "provider settings updated");

    Ok(Json(serde_json::json!({ "success": true })))
}

/// `DELETE /api/providers/{name}` — accounts cascade.
async fn delete_provider(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<impl Serialize>, ApiError> {
    providers::delete(state.store.pool(), &name).await?;
    reload_sidecar(&state).await?;
    info!(provider = %name, "provider deleted");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// `DELETE /api/providers/{name}/accounts/{id}`
async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path((name, account_id)): Path<(String, i64)>,
) -> Result<Json<impl Serialize>, ApiError> {
    providers::delete_account(state.store.pool(), &name, account_id).await?;
    reload_sidecar(&state).await?;
    info!(provider = %name, account = account_id, "provider account deleted");
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Serialize)]
struct AccountHealth {
    id: i64,
    email: Option<String>,
    status: AccountStatus,
    /// `null` when the sidecar is not running to answer probes.
    healthy: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ProviderHealth {
    provider: String,
    proxy_running: bool,
    accounts: Vec<AccountHealth>,
}

/// `GET /api/providers/{name}/health` — probe each active account
/// through the sidecar's management interface. Failures annotate the
/// account; they never fail the request.
async fn health_check(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ProviderHealth>, ApiError> {
    let provider = providers::get(state.store.pool(), &name).await?;
    let accounts = providers::list_accounts(state.store.pool(), provider.id).await?;
    let proxy_running = state.supervisor.status().await.running;

    let mut report = Vec::with_capacity(accounts.len());
    for account in accounts {
        let healthy = if proxy_running && account.status == AccountStatus::Active {
            let url = format!(
                "{}/providers/{}/accounts/{}/health",
                state.supervisor.endpoint(),
                provider.name,
                account.id
            );
            Some(
                state
                    .http
                    .get(&url)
                    .timeout(std::time::Duration::from_secs(5))
                    .send()
                    .await
                    .map(|resp| resp.status().is_success())
                    .unwrap_or(false),
            )
        } else {
            None
        };
        report.push(AccountHealth {
            id: account.id,
            email: account.email,
            status: account.status,
            healthy,
        });
    }

    Ok(Json(ProviderHealth {
        provider: provider.name,
        proxy_running,
        accounts: report,
    }))
}
