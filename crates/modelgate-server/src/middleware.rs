//! Request middleware: admin sessions, CSRF double-submit, API-key auth,
//! quota gating, and per-key rate limiting.
//!
//! Admin plane: the session cookie is HTTP-only and carries an opaque
//! token whose SHA-256 hash keys the session row. A companion cookie,
//! readable by the UI, holds the per-session CSRF token; every mutating
//! admin request must echo it in `X-CSRF-Token`, compared in constant
//! time against the session row.
//!
//! Data plane: bearer keys are parsed by prefix, fetched, and verified
//! against the stored Argon2id digest; then the quota gate and the
//! leaky-bucket rate limiter run, in that order.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use subtle::ConstantTimeEq;
use tracing::warn;

use modelgate_core::{apikey, token};
use modelgate_store::models::User;
use modelgate_store::{sessions, settings as settings_keys, users};

use crate::error::ApiError;
use crate::rate_limit::RateDecision;
use crate::state::AppState;

/// HTTP-only cookie carrying the opaque session token.
pub const SESSION_COOKIE: &str = "mg_session";
/// UI-readable cookie carrying the CSRF token (double-submit).
pub const CSRF_COOKIE: &str = "mg_csrf";
/// Header that must echo the CSRF cookie on mutating admin requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Sliding session window, in hours.
pub const SESSION_WINDOW_HOURS: i64 = 24;
/// Absolute session lifetime, in days; the sliding window never extends
/// past it.
pub const SESSION_HARD_CAP_DAYS: i64 = 7;

/// Default data-plane requests per minute when the setting is unset.
pub const DEFAULT_RATE_LIMIT_RPM: u64 = 60;

/// Authenticated admin session, attached to request extensions.
#[derive(Debug, Clone)]
pub struct AdminSession {
    /// SHA-256 hash of the cookie token (the session row key).
    pub id_hash: String,
    pub csrf_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Authenticated data-plane user, attached to request extensions.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub User);

/// Parse a named cookie out of a `Cookie` header value.
#[must_use]
pub fn parse_cookie(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|cookie| {
        let (key, value) = cookie.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim().to_owned())
    })
}

/// Build a `Set-Cookie` value with the attributes the admin plane uses.
#[must_use]
pub fn build_cookie(
    name: &str,
    value: &str,
    http_only: bool,
    secure: bool,
    max_age_secs: i64,
) -> String {
    let mut cookie = format!("{name}={value}; Path=/; SameSite=Strict; Max-Age={max_age_secs}");
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn cookie_from_request(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| parse_cookie(header, name))
}

/// Admin-plane middleware: session check, CSRF on writes, sliding expiry.
///
/// # Errors
///
/// `UNAUTHORIZED` without a live session; `FORBIDDEN` when a mutating
/// request does not echo the session's CSRF token.
pub async fn session_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let cookie_token = cookie_from_request(req.headers(), SESSION_COOKIE)
        .ok_or_else(|| ApiError::Unauthorized("not logged in".to_owned()))?;

    let id_hash = token::hash_token(&cookie_token);
    let session = sessions::get_live(state.store.pool(), &id_hash)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("session expired".to_owned()))?;

    // CSRF double-submit on every mutating request.
    if mutates(req.method()) {
        let presented = req
            .headers()
            .get(CSRF_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Forbidden("missing CSRF token".to_owned()))?;
        let matches: bool = presented
            .as_bytes()
            .ct_eq(session.csrf_token.as_bytes())
            .into();
        if !matches {
            return Err(ApiError::Forbidden("CSRF token mismatch".to_owned()));
        }
    }

    // Sliding window, capped at the absolute lifetime.
    let new_expiry = (Utc::now() + Duration::hours(SESSION_WINDOW_HOURS))
        .min(session.created_at + Duration::days(SESSION_HARD_CAP_DAYS));
    if let Err(err) = sessions::extend(state.store.pool(), &id_hash, new_expiry).await {
        warn!(error = %err, "failed to extend session");
    }

    req.extensions_mut().insert(AdminSession {
        id_hash,
        csrf_token: session.csrf_token,
        expires_at: new_expiry,
    });

    Ok(next.run(req).await)
}

fn mutates(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::DELETE
        || *method == Method::PATCH
}

/// Data-plane middleware: bearer key → prefix lookup → digest verify.
///
/// # Errors
///
/// `UNAUTHORIZED` for missing/malformed/unknown/disabled keys. The
/// message never distinguishes unknown from mismatched keys.
pub async fn api_key_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_owned()))?
        .to_owned();

    let prefix = apikey::parse_prefix(&bearer)?;

    let user = match users::get_by_prefix(state.store.pool(), prefix).await {
        Ok(user) => user,
        Err(modelgate_store::StoreError::NotFound { .. }) => {
            return Err(ApiError::Unauthorized("invalid API key".to_owned()));
        }
        Err(err) => return Err(err.into()),
    };

    if !apikey::verify(&bearer, &user.api_key_hash)? {
        return Err(ApiError::Unauthorized("invalid API key".to_owned()));
    }
    if !user.enabled {
        return Err(ApiError::Unauthorized("API key disabled".to_owned()));
    }

    // Stamp last-used off the request path.
    let pool = state.store.pool().clone();
    let user_id = user.id;
    tokio::spawn(async move {
        let _ = users::touch_last_used(&pool, user_id).await;
    });

    req.extensions_mut().insert(AuthedUser(user));
    Ok(next.run(req).await)
}

/// Quota gate: reject when the user's counter has reached the quota.
///
/// Runs after key auth; no usage row is written for a rejected request.
///
/// # Errors
///
/// `QUOTA_EXCEEDED` when `used_tokens >= quota`.
pub async fn quota_middleware(req: Request, next: Next) -> Result<Response, ApiError> {
    let user = req
        .extensions()
        .get::<AuthedUser>()
        .ok_or_else(|| ApiError::Internal("quota gate ran without auth".to_owned()))?;

    if !user.0.within_quota() {
        return Err(ApiError::QuotaExceeded("token quota exhausted".to_owned()));
    }
    Ok(next.run(req).await)
}

/// Per-key leaky-bucket rate limiting with `X-RateLimit-*` headers on
/// both allowed and rejected responses.
///
/// # Errors
///
/// Returns `INTERNAL_ERROR` if the rpm setting is unreadable.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = req
        .extensions()
        .get::<AuthedUser>()
        .ok_or_else(|| ApiError::Internal("rate limiter ran without auth".to_owned()))?;

    let rpm = state
        .store
        .numeric_setting(settings_keys::RATE_LIMIT_RPM, DEFAULT_RATE_LIMIT_RPM)
        .await?;
    let decision = state.rate_limiter.try_acquire(user.0.id, rpm);

    if !decision.allowed {
        let mut response =
            ApiError::RateLimited("request rate limit exceeded".to_owned()).into_response();
        apply_rate_headers(response.headers_mut(), decision);
        return Ok(response);
    }

    let mut response = next.run(req).await;
    if decision.limit > 0 {
        apply_rate_headers(response.headers_mut(), decision);
    }
    Ok(response)
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: RateDecision) {
    let entries = [
        ("x-ratelimit-limit", decision.limit),
        ("x-ratelimit-remaining", decision.remaining),
        ("x-ratelimit-reset", decision.reset_secs),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_cookie_finds_named_value() {
        let header = "a=1; mg_session=tok-123; b=2";
        assert_eq!(parse_cookie(header, "mg_session").unwrap(), "tok-123");
        assert_eq!(parse_cookie(header, "a").unwrap(), "1");
        assert!(parse_cookie(header, "missing").is_none());
    }

    #[test]
    fn build_cookie_sets_requested_attributes() {
        let cookie = build_cookie("mg_session", "tok", true, true, 3600);
        assert!(cookie.starts_with("mg_session=tok"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Max-Age=3600"));

        let csrf = build_cookie("mg_csrf", "tok", false, false, 3600);
        assert!(!csrf.contains("HttpOnly"));
        assert!(!csrf.contains("Secure"));
    }

    #[test]
    fn only_write_methods_require_csrf() {
        assert!(mutates(&Method::POST));
        assert!(mutates(&Method::PUT));
        assert!(mutates(&Method::DELETE));
        assert!(!mutates(&Method::GET));
        assert!(!mutates(&Method::HEAD));
    }
}
