//! Router assembly and cross-cutting helpers.
//!
//! Everything the binary wires together lives here so integration tests
//! can build the exact production router against an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use modelgate_core::apikey;
use modelgate_sidecar::config_gen;
use modelgate_store::{settings as settings_keys, Store};

use crate::error::ApiError;
use crate::middleware::{
    api_key_middleware, quota_middleware, rate_limit_middleware, session_middleware,
};
use crate::routes;
use crate::state::AppState;

/// Admin-plane request deadline.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Concurrent password checks allowed on the login route. Argon2 is
/// deliberately expensive; unbounded concurrency would be a DoS lever.
const LOGIN_CONCURRENCY: usize = 10;

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Admin control plane: session-protected, CSRF enforced on writes.
    let admin_api = Router::new()
        .nest("/users", routes::users::router())
        .nest("/providers", routes::providers::router())
        .nest("/proxy", routes::proxy::router())
        .nest("/usage", routes::usage::router())
        .route("/config", get(routes::config::get_config).put(routes::config::put_config))
        .route("/logs", get(routes::logs::list))
        .route("/auth/logout", post(routes::auth::logout))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            session_middleware,
        ));

    // Session endpoints reachable without a session.
    let auth_public = Router::new()
        .route(
            "/auth/login",
            post(routes::auth::login)
                .layer(tower::limit::ConcurrencyLimitLayer::new(LOGIN_CONCURRENCY)),
        )
        .route("/auth/status", get(routes::auth::status));

    let api = Router::new()
        .merge(admin_api)
        .merge(auth_public)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(admin_timeout_error))
                .layer(tower::timeout::TimeoutLayer::new(ADMIN_TIMEOUT)),
        );

    // OAuth: start needs an admin session; the callback is validated by
    // its single-use state row instead.
    let oauth_start = Router::new()
        .route("/oauth/{provider}/start", get(routes::oauth::start))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            session_middleware,
        ));
    let oauth_callback = Router::new().route(
        "/oauth/{provider}/callback",
        get(routes::oauth::callback),
    );

    // Data plane: key auth → quota gate → rate limit → handler.
    // `route_layer` composes like `layer`: the last one added runs first.
    let data_plane = Router::new()
        .route("/v1/models", get(routes::gateway::models))
        .route("/v1/chat/completions", post(routes::gateway::forward))
        .route("/v1/completions", post(routes::gateway::forward))
        .route("/v1/embeddings", post(routes::gateway::forward))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .route_layer(axum_mw::from_fn(quota_middleware))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            api_key_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-csrf-token"),
        ]);

    Router::new()
        .route("/healthz", get(routes::health::healthz))
        .nest("/api", api)
        .merge(oauth_start)
        .merge(oauth_callback)
        .merge(data_plane)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

async fn admin_timeout_error(err: tower::BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        ApiError::Internal("request timed out".to_owned()).into_response()
    } else {
        ApiError::Internal(err.to_string()).into_response()
    }
}

/// Project the current database state into sidecar YAML bytes.
///
/// # Errors
///
/// Surfaces projection failures as `PROVIDER_ERROR`.
pub async fn project_sidecar_yaml(state: &AppState) -> Result<Vec<u8>, ApiError> {
    let port = state.supervisor.port();
    let config = config_gen::project(&state.store, &state.cipher, port).await?;
    Ok(config_gen::to_yaml(&config)?)
}

/// Regenerate the sidecar config and reload if it changed. Called after
/// every provider/account/settings mutation — the mutation is already
/// committed; the supervisor never calls back (one-way invocation).
///
/// # Errors
///
/// Surfaces restart failures as `PROVIDER_ERROR`.
pub async fn reload_sidecar(state: &AppState) -> Result<(), ApiError> {
    let yaml = project_sidecar_yaml(state).await?;
    let outcome = state.supervisor.reload(&yaml).await?;
    if outcome.changed {
        info!("sidecar config reloaded");
    }
    Ok(())
}

/// Outcome of the first-run admin bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminBootstrap {
    /// A digest already exists; the env password (if any) was ignored.
    AlreadySet,
    /// The initial password was hashed and stored.
    Created,
    /// No digest exists and no initial password was supplied.
    MissingPassword,
}

/// One-way first-run bootstrap: hash and store the initial admin
/// password when no digest exists yet. On subsequent runs the env var is
/// ignored — changing it cannot rotate the password.
///
/// # Errors
///
/// Store or hashing failures.
pub async fn bootstrap_admin(
    store: &Store,
    initial_password: Option<&str>,
) -> Result<AdminBootstrap, ApiError> {
    if store
        .setting(settings_keys::ADMIN_PASSWORD_HASH)
        .await?
        .is_some()
    {
        return Ok(AdminBootstrap::AlreadySet);
    }

    let Some(password) = initial_password.filter(|p| !p.is_empty()) else {
        return Ok(AdminBootstrap::MissingPassword);
    };

    let digest = apikey::hash(password)?;
    store
        .set_setting(settings_keys::ADMIN_PASSWORD_HASH, &digest)
        .await?;
    info!("admin password bootstrapped");
    Ok(AdminBootstrap::Created)
}
