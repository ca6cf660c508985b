//! OAuth flow endpoints: `/oauth/{provider}/start` and `/callback`.
//!
//! `start` runs behind the admin session middleware and plants a
//! single-use state row tied to that session. The callback is
//! unauthenticated HTTP-wise — the state row is its credential: it must
//! exist, be unexpired, belong to a still-live session, and is consumed
//! on first use, so tampered or replayed callbacks die with `FORBIDDEN`
//! before any code exchange happens.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Extension;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use modelgate_core::settings::ProviderKind;
use modelgate_core::token;
use modelgate_store::{oauth_states, providers, sessions};

use crate::app::reload_sidecar;
use crate::error::ApiError;
use crate::middleware::AdminSession;
use crate::oauth;
use crate::state::AppState;

/// How long a planted state stays valid, in minutes.
const STATE_TTL_MINUTES: i64 = 10;

/// `GET /oauth/{provider}/start` — 302 to the provider's authorize URL.
///
/// # Errors
///
/// `NOT_FOUND` for providers this deployment has no OAuth client for.
pub async fn start(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<AdminSession>,
    Path(provider_name): Path<String>,
) -> Result<Response, ApiError> {
    let provider = state.oauth.get(&provider_name).ok_or_else(|| {
        ApiError::NotFound(format!("OAuth is not configured for '{provider_name}'"))
    })?;

    let state_nonce = token::new_token();
    let verifier = token::new_token();
    let provider_present = providers::get(state.store.pool(), &provider_name)
        .await
        .is_ok();

    oauth_states::insert(
        state.store.pool(),
        &state_nonce,
        &provider_name,
        &session.id_hash,
        &verifier,
        provider_present,
        Utc::now() + Duration::minutes(STATE_TTL_MINUTES),
    )
    .await?;

    let redirect_uri = callback_uri(&state.config.public_url, &provider_name);
    let url = oauth::authorize_url(provider, &redirect_uri, &state_nonce, &verifier);

    info!(provider = %provider_name, "OAuth flow started");
    Ok(Redirect::temporary(&url).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// `GET /oauth/{provider}/callback?code&state` — validate the state,
/// exchange the code, store the encrypted account, reload the sidecar,
/// then send the browser back to the UI with an outcome query.
///
/// # Errors
///
/// `FORBIDDEN` for missing/unknown/expired/foreign states and for states
/// whose owning session has ended; `NOT_FOUND` when the provider row was
/// deleted between start and callback (the exchanged tokens are
/// dropped); `VALIDATION_ERROR` when the provider sent no code.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    // Provider-reported errors (user denied, etc.) go back to the UI.
    if let Some(ref error) = query.error {
        let description = query.error_description.as_deref().unwrap_or("unknown error");
        warn!(provider = %provider_name, error = %error, description, "OAuth provider returned error");
        return Ok(outcome_redirect(
            &state.config.ui_url,
            &provider_name,
            Err(description),
        ));
    }

    let state_nonce = query
        .state
        .as_deref()
        .ok_or_else(|| ApiError::Forbidden("missing state parameter".to_owned()))?;

    // Single-use take: a tampered or replayed state finds nothing.
    let flow = oauth_states::take(state.store.pool(), state_nonce)
        .await?
        .ok_or_else(|| ApiError::Forbidden("unknown or expired state".to_owned()))?;

    if flow.provider != provider_name {
        return Err(ApiError::Forbidden("state does not match provider".to_owned()));
    }

    // The session that started the flow must still be alive — this is
    // what stops cross-user callback injection.
    if sessions::get_live(state.store.pool(), &flow.session_id)
        .await?
        .is_none()
    {
        return Err(ApiError::Forbidden(
            "the session that started this flow has ended".to_owned(),
        ));
    }

    // Provider administratively deleted mid-flow: reject and drop the
    // exchange entirely.
    if flow.provider_present
        && matches!(
            providers::get(state.store.pool(), &provider_name).await,
            Err(modelgate_store::StoreError::NotFound { .. })
        )
    {
        return Err(ApiError::NotFound(format!(
            "provider '{provider_name}' was deleted"
        )));
    }

    let oauth_provider = state.oauth.get(&provider_name).ok_or_else(|| {
        ApiError::NotFound(format!("OAuth is not configured for '{provider_name}'"))
    })?;

    let code = query
        .code
        .as_deref()
        .ok_or_else(|| ApiError::Validation("missing authorization code".to_owned()))?;

    let redirect_uri = callback_uri(&state.config.public_url, &provider_name);
    let exchanged = match oauth::exchange_code(
        &state.http,
        oauth_provider,
        code,
        &redirect_uri,
        &flow.code_verifier,
    )
    .await
    {
        Ok(exchanged) => exchanged,
        Err(err) => {
            warn!(provider = %provider_name, error = %err, "code exchange failed");
            return Ok(outcome_redirect(
                &state.config.ui_url,
                &provider_name,
                Err("token exchange failed"),
            ));
        }
    };

    let provider =
        providers::get_or_create(state.store.pool(), &provider_name, ProviderKind::OAuth).await?;
    let blob = state.cipher.encrypt(&exchanged.credentials)?;
    let expires_at = exchanged.credentials.expires_at;

    // Re-authorization for the same identity rotates in place.
    let existing = match exchanged.email.as_deref() {
        Some(email) => {
            providers::find_account_by_email(state.store.pool(), provider.id, email).await?
        }
        None => None,
    };
    match existing {
        Some(account) => {
            providers::rotate_account_tokens(state.store.pool(), account.id, &blob, expires_at)
                .await?;
            info!(provider = %provider_name, account = account.id, "OAuth account re-authorized");
        }
        None => {
            let account = providers::create_account(
                state.store.pool(),
                provider.id,
                exchanged.email.as_deref(),
                &blob,
                expires_at,
            )
            .await?;
            info!(provider = %provider_name, account = account.id, "OAuth account created");
        }
    }

    // Commit happened above; a reload failure must not lose the account.
    if let Err(err) = reload_sidecar(&state).await {
        warn!(error = %err, "sidecar reload after OAuth success failed");
    }

    Ok(outcome_redirect(
        &state.config.ui_url,
        &provider_name,
        Ok(()),
    ))
}

fn callback_uri(public_url: &str, provider: &str) -> String {
    format!(
        "{}/oauth/{provider}/callback",
        public_url.trim_end_matches('/')
    )
}

fn outcome_redirect(ui_url: &str, provider: &str, outcome: Result<(), &str>) -> Response {
    let url = match outcome {
        Ok(()) => format!(
            "{ui_url}?oauth=success&provider={}",
            urlencoding::encode(provider)
        ),
        Err(message) => format!(
            "{ui_url}?oauth=error&provider={}&message={}",
            urlencoding::encode(provider),
            urlencoding::encode(message)
        ),
    };
    Redirect::temporary(&url).into_response()
}
