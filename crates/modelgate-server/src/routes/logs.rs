//! Usage-log listing: `GET /api/logs`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use modelgate_store::models::UsageStatus;
use modelgate_store::usage::{self, LogFilter};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

fn default_limit() -> u32 {
    50
}

/// `GET /api/logs?limit=&offset=&user_id=&provider=&status=`
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<impl Serialize>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(raw.parse::<UsageStatus>().map_err(ApiError::Validation)?),
        None => None,
    };

    let filter = LogFilter {
        limit: query.limit.clamp(1, 500),
        offset: query.offset,
        user_id: query.user_id,
        provider: query.provider,
        status,
    };
    let (logs, total) = usage::list_logs(state.store.pool(), &filter).await?;

    Ok(Json(serde_json::json!({
        "logs": logs,
        "total": total,
        "limit": filter.limit,
        "offset": filter.offset,
    })))
}
