//! Admin session endpoints: `/api/auth/*`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use modelgate_core::{apikey, token};
use modelgate_store::{sessions, settings as settings_keys};

use crate::error::ApiError;
use crate::extract::ValidatedJson;
use crate::middleware::{
    build_cookie, parse_cookie, AdminSession, CSRF_COOKIE, SESSION_COOKIE, SESSION_WINDOW_HOURS,
};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    success: bool,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

/// `POST /api/auth/login` — password check, session row, both cookies.
///
/// # Errors
///
/// `UNAUTHORIZED` on a wrong password; `INTERNAL_ERROR` when no admin
/// digest was ever bootstrapped.
pub async fn login(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Response, ApiError> {
    let digest = state
        .store
        .setting(settings_keys::ADMIN_PASSWORD_HASH)
        .await?
        .ok_or_else(|| ApiError::Internal("admin password not bootstrapped".to_owned()))?;

    if !apikey::verify(&req.password, &digest)? {
        return Err(ApiError::Unauthorized("invalid password".to_owned()));
    }

    let session_token = token::new_token();
    let csrf_token = token::new_token();
    let expires_at = Utc::now() + chrono::Duration::hours(SESSION_WINDOW_HOURS);
    sessions::create(
        state.store.pool(),
        &token::hash_token(&session_token),
        &csrf_token,
        expires_at,
    )
    .await?;

    info!("admin logged in");

    let max_age = SESSION_WINDOW_HOURS * 3600;
    let secure = state.config.secure_cookies;
    let cookies = AppendHeaders([
        (
            header::SET_COOKIE,
            build_cookie(SESSION_COOKIE, &session_token, true, secure, max_age),
        ),
        (
            header::SET_COOKIE,
            build_cookie(CSRF_COOKIE, &csrf_token, false, secure, max_age),
        ),
    ]);

    Ok((
        cookies,
        Json(LoginResponse {
            success: true,
            expires_at,
        }),
    )
        .into_response())
}

/// `POST /api/auth/logout` — delete the session row and clear cookies.
///
/// # Errors
///
/// Store failures only; an already-deleted session still logs out.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<AdminSession>,
) -> Result<Response, ApiError> {
    sessions::delete(state.store.pool(), &session.id_hash).await?;

    let secure = state.config.secure_cookies;
    let cookies = AppendHeaders([
        (
            header::SET_COOKIE,
            build_cookie(SESSION_COOKIE, "", true, secure, 0),
        ),
        (
            header::SET_COOKIE,
            build_cookie(CSRF_COOKIE, "", false, secure, 0),
        ),
    ]);

    Ok((cookies, Json(serde_json::json!({ "success": true }))).into_response())
}

/// `GET /api/auth/status` — report whether the caller holds a live
/// session. Never 401s; the UI polls this before showing a login form.
///
/// # Errors
///
/// Store failures only.
pub async fn status(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Result<Json<impl Serialize>, ApiError> {
    let session = match headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookie| parse_cookie(cookie, SESSION_COOKIE))
    {
        Some(cookie_token) => {
            sessions::get_live(state.store.pool(), &token::hash_token(&cookie_token)).await?
        }
        None => None,
    };

    Ok(Json(match session {
        Some(session) => StatusResponse {
            authenticated: true,
            expires_at: Some(session.expires_at),
        },
        None => StatusResponse {
            authenticated: false,
            expires_at: None,
        },
    }))
}
