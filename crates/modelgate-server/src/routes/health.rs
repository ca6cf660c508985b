//! Unauthenticated liveness probe.

use axum::Json;
use serde_json::{json, Value};

/// `GET /healthz` — process liveness only; says nothing about the sidecar.
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
