//! User management endpoints: `/api/users*`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use modelgate_core::apikey;
use modelgate_store::models::User;
use modelgate_store::users;

use crate::error::ApiError;
use crate::extract::ValidatedJson;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", get(get_one).put(update).delete(delete))
        .route("/{id}/regenerate-key", post(regenerate_key))
        .route("/{id}/reset-usage", post(reset_usage))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Serialize)]
struct UserList {
    users: Vec<User>,
    total: i64,
    page: u32,
    limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    name: String,
    #[serde(default)]
    quota_tokens: Option<i64>,
}

/// Create/regenerate responses carry the plaintext key — the only time
/// it ever appears.
#[derive(Debug, Serialize)]
struct UserWithKey {
    user: User,
    api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    name: Option<String>,
    /// Present-but-null clears the quota; absent leaves it untouched.
    #[serde(default, with = "double_option")]
    quota_tokens: Option<Option<i64>>,
    #[serde(default)]
    enabled: Option<bool>,
}

/// Distinguishes an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<i64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<i64>::deserialize(de).map(Some)
    }
}

/// `GET /api/users?page=&limit=`
async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<impl Serialize>, ApiError> {
    let limit = query.limit.clamp(1, 200);
    let page = query.page.max(1);
    let (users, total) = users::list(state.store.pool(), page, limit).await?;
    Ok(Json(UserList {
        users,
        total,
        page,
        limit,
    }))
}

/// `POST /api/users` — 201 with the plaintext key, returned once.
async fn create(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<CreateUserRequest>,
) -> Result<Response, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("name must not be empty".to_owned()));
    }
    if req.quota_tokens.is_some_and(|quota| quota < 0) {
        return Err(ApiError::Validation(
            "quota_tokens must be non-negative".to_owned(),
        ));
    }

    let generated = apikey::generate(name);
    let digest = apikey::hash(&generated.plaintext)?;
    let user = users::create(
        state.store.pool(),
        name,
        &digest,
        &generated.prefix,
        req.quota_tokens,
    )
    .await?;

    info!(user = %user.name, "user created");

    Ok((
        StatusCode::CREATED,
        Json(UserWithKey {
            user,
            api_key: generated.plaintext,
        }),
    )
        .into_response())
}

/// `GET /api/users/{id}`
async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(users::get(state.store.pool(), id).await?))
}

/// `PUT /api/users/{id}` — partial update of name/quota/enabled.
async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    ValidatedJson(req): ValidatedJson<UpdateUserRequest>,
) -> Result<Json<User>, ApiError> {
    if let Some(ref name) = req.name {
        if name.trim().is_empty() {
            return Err(ApiError::Validation("name must not be empty".to_owned()));
        }
    }
    if let Some(Some(quota)) = req.quota_tokens {
        if quota < 0 {
            return Err(ApiError::Validation(
                "quota_tokens must be non-negative".to_owned(),
            ));
        }
    }

    let user = users::update(
        state.store.pool(),
        id,
        users::UserUpdate {
            name: req.name.map(|n| n.trim().to_owned()),
            quota_tokens: req.quota_tokens,
            enabled: req.enabled,
        },
    )
    .await?;
    Ok(Json(user))
}

/// `DELETE /api/users/{id}` — hard delete, usage rows cascade. Admins
/// wanting history must disable instead.
async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    users::delete(state.store.pool(), id).await?;
    info!(user_id = id, "user deleted");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// `POST /api/users/{id}/regenerate-key` — atomic swap; the old key
/// stops authenticating at commit.
async fn regenerate_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<impl Serialize>, ApiError> {
    let current = users::get(state.store.pool(), id).await?;
    let generated = apikey::generate(&current.name);
    let digest = apikey::hash(&generated.plaintext)?;
    let user = users::replace_key(state.store.pool(), id, &digest, &generated.prefix).await?;

    info!(user = %user.name, "API key regenerated");

    Ok(Json(UserWithKey {
        user,
        api_key: generated.plaintext,
    }))
}

#[derive(Debug, Serialize)]
struct ResetUsageResponse {
    success: bool,
    previous_used_tokens: i64,
}

/// `POST /api/users/{id}/reset-usage` — zero the counter, report the
/// previous value for audit.
async fn reset_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<impl Serialize>, ApiError> {
    let previous = users::reset_usage(state.store.pool(), id).await?;
    Ok(Json(ResetUsageResponse {
        success: true,
        previous_used_tokens: previous,
    }))
}
