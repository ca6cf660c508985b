//! Usage reporting endpoints: `/api/usage*`.
//!
//! Closed days come from the rollup table; today is aggregated live, so
//! the numbers are current without scanning pruned history.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use modelgate_store::usage::{self, Period};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(summary))
        .route("/users/{id}", get(user_usage))
        .route("/daily", get(daily))
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    #[serde(default = "default_period")]
    period: String,
}

fn default_period() -> String {
    "today".to_owned()
}

fn parse_period(raw: &str) -> Result<Period, ApiError> {
    raw.parse().map_err(ApiError::Validation)
}

/// `GET /api/usage?period=` — overall totals plus per-provider slices.
async fn summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<impl Serialize>, ApiError> {
    let period = parse_period(&query.period)?;
    let totals = usage::totals(state.store.pool(), period, None).await?;
    let providers = usage::provider_breakdown(state.store.pool(), period).await?;

    Ok(Json(serde_json::json!({
        "period": query.period,
        "totals": totals,
        "providers": providers,
    })))
}

/// `GET /api/usage/users/{id}?period=`
async fn user_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<impl Serialize>, ApiError> {
    let period = parse_period(&query.period)?;
    // 404 for unknown users rather than an empty aggregate.
    let user = modelgate_store::users::get(state.store.pool(), id).await?;
    let totals = usage::totals(state.store.pool(), period, Some(id)).await?;

    Ok(Json(serde_json::json!({
        "user_id": user.id,
        "period": query.period,
        "totals": totals,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    #[serde(default = "default_days")]
    days: u32,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    provider: Option<String>,
}

fn default_days() -> u32 {
    30
}

/// `GET /api/usage/daily?days=&user_id=&provider=`
async fn daily(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DailyQuery>,
) -> Result<Json<impl Serialize>, ApiError> {
    let days = query.days.clamp(1, 366);
    let rows = usage::daily_series(
        state.store.pool(),
        days,
        query.user_id,
        query.provider.as_deref(),
    )
    .await?;

    Ok(Json(serde_json::json!({ "days": days, "usage": rows })))
}
