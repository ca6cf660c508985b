//! The data plane: `/v1/*` forwarding to the sidecar.
//!
//! By the time a request reaches these handlers it has passed key auth,
//! the quota gate, and the rate limiter. The forwarder rewrites the path
//! onto the sidecar's loopback endpoint, carries the method, body, and a
//! selective header subset — never the client bearer; the sidecar uses
//! stored provider credentials — and streams the response back while
//! tee-ing it through the usage scanner. The accounting row is written
//! when the stream closes; accounting failures are logged, never
//! user-visible.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::{Extension, Json};
use futures::StreamExt;
use tracing::{error, warn};

use modelgate_store::models::{NewUsageLog, UsageStatus};
use modelgate_store::settings as settings_keys;
use modelgate_store::usage;

use crate::app::reload_sidecar;
use crate::error::ApiError;
use crate::middleware::AuthedUser;
use crate::oauth;
use crate::state::AppState;
use crate::usage_extract::UsageScanner;

/// Largest request body the forwarder will buffer (it must be buffered
/// once to allow the refresh-retry).
const BODY_CAP: usize = 16 << 20;

/// Timeout for the sidecar's model listing.
const MODELS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default forward timeout when the setting is unset.
const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 120;

/// `GET /v1/models` — the sidecar's model list merged with the
/// model-alias table.
pub async fn models(
    State(state): State<Arc<AppState>>,
    Extension(_user): Extension<AuthedUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = format!("{}/v1/models", state.supervisor.endpoint());
    let response = state
        .http
        .get(&url)
        .timeout(MODELS_TIMEOUT)
        .send()
        .await
        .map_err(|e| ApiError::Provider(format!("sidecar unreachable: {e}")))?;

    if !response.status().is_success() {
        return Err(ApiError::Provider(format!(
            "sidecar model listing failed with status {}",
            response.status()
        )));
    }

    let mut listing: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ApiError::Provider(format!("sidecar model listing did not parse: {e}")))?;

    // Aliases show up as models of their own so clients can request them.
    let mappings = state.store.model_mappings().await?;
    if let Some(data) = listing.get_mut("data").and_then(serde_json::Value::as_array_mut) {
        let known: Vec<String> = data
            .iter()
            .filter_map(|model| model.get("id").and_then(serde_json::Value::as_str))
            .map(str::to_owned)
            .collect();
        for alias in mappings.keys() {
            if !known.iter().any(|id| id == alias) {
                data.push(serde_json::json!({
                    "id": alias,
                    "object": "model",
                    "owned_by": "modelgate",
                }));
            }
        }
    }

    Ok(Json(listing))
}

/// `POST /v1/chat/completions` (and siblings) — authenticated forward
/// with streaming tee and usage capture.
pub async fn forward(
    State(state): State<Arc<AppState>>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    req: Request,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();

    let path_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_owned(), |pq| pq.as_str().to_owned());

    let body_bytes = axum::body::to_bytes(body, BODY_CAP)
        .await
        .map_err(|_| ApiError::Validation("request body too large".to_owned()))?;

    let model = requested_model(&body_bytes);
    let mappings = state.store.model_mappings().await?;
    let provider = provider_for_model(model.as_deref(), &mappings);
    let timeout = state
        .store
        .numeric_setting(settings_keys::FORWARD_TIMEOUT_SECS, DEFAULT_FORWARD_TIMEOUT_SECS)
        .await?;

    let url = format!("{}{}", state.supervisor.endpoint(), path_query);
    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);

    let send = || {
        let mut builder = state
            .http
            .request(method.clone(), &url)
            .timeout(Duration::from_secs(timeout))
            .body(body_bytes.clone());
        // Selective header forwarding; the client bearer stays here.
        for name in [header::CONTENT_TYPE, header::ACCEPT] {
            if let Some(value) = parts.headers.get(&name).and_then(|v| v.to_str().ok()) {
                builder = builder.header(name.clone(), value);
            }
        }
        builder.send()
    };

    let mut upstream = match send().await {
        Ok(response) => response,
        Err(err) => {
            record_failed_forward(&state, &user, &provider, model.as_deref(), started, &err).await;
            return Err(ApiError::Provider(format!("sidecar unreachable: {err}")));
        }
    };

    // Upstream 401 means the stored credential went stale: refresh the
    // provider's accounts, push the rotated tokens to the sidecar, and
    // retry once.
    if upstream.status() == reqwest::StatusCode::UNAUTHORIZED {
        match oauth::refresh_provider_accounts(&state, &provider).await {
            Ok(true) => {
                if let Err(err) = reload_sidecar(&state).await {
                    warn!(error = %err, "sidecar reload after refresh failed");
                }
                upstream = match send().await {
                    Ok(response) => response,
                    Err(err) => {
                        record_failed_forward(
                            &state,
                            &user,
                            &provider,
                            model.as_deref(),
                            started,
                            &err,
                        )
                        .await;
                        return Err(ApiError::Provider(format!("sidecar unreachable: {err}")));
                    }
                };
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "credential refresh attempt failed"),
        }
    }

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let success = upstream.status().is_success();
    let upstream_status = upstream.status().as_u16();

    // Stream the body through the scanner; write accounting at close.
    let scanner = UsageScanner::new(content_type.as_deref());
    let store = state.store.clone();
    let entry_seed = NewUsageLog {
        user_id: user.id,
        provider,
        model: model.unwrap_or_else(|| "unknown".to_owned()),
        tokens_input: 0,
        tokens_output: 0,
        duration_ms: 0,
        status: UsageStatus::Success,
        error_message: None,
    };

    let body_stream = async_stream::stream! {
        let mut scanner = scanner;
        let mut stream_error: Option<String> = None;
        let mut bytes = upstream.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    scanner.feed(&chunk);
                    yield Ok::<_, std::io::Error>(chunk);
                }
                Err(err) => {
                    stream_error = Some(err.to_string());
                    yield Err(std::io::Error::other(err.to_string()));
                    break;
                }
            }
        }

        let counted = scanner.finish();
        let failed = !success || stream_error.is_some();
        let entry = NewUsageLog {
            tokens_input: counted.input,
            tokens_output: counted.output,
            duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            status: if failed { UsageStatus::Error } else { UsageStatus::Success },
            error_message: stream_error.or_else(|| {
                (!success).then(|| format!("upstream status {upstream_status}"))
            }),
            ..entry_seed
        };
        // Best-effort by contract: the user response already succeeded.
        if let Err(err) = usage::record(store.pool(), entry).await {
            error!(error = %err, "usage capture failed");
        }
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        if let Ok(value) = axum::http::HeaderValue::from_str(&content_type) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }
    Ok(response)
}

/// The forward never left this process: record the failure row without a
/// response to scan.
async fn record_failed_forward(
    state: &AppState,
    user: &modelgate_store::models::User,
    provider: &str,
    model: Option<&str>,
    started: Instant,
    err: &reqwest::Error,
) {
    let entry = NewUsageLog {
        user_id: user.id,
        provider: provider.to_owned(),
        model: model.unwrap_or("unknown").to_owned(),
        tokens_input: 0,
        tokens_output: 0,
        duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
        status: UsageStatus::Error,
        error_message: Some(err.to_string()),
    };
    if let Err(err) = usage::record(state.store.pool(), entry).await {
        error!(error = %err, "usage capture failed");
    }
}

/// Pull the `model` field out of an OpenAI-shaped request body.
fn requested_model(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(str::to_owned)
}

/// Attribute a model name to a provider: resolve aliases first, then
/// match on well-known name families.
fn provider_for_model(
    model: Option<&str>,
    mappings: &std::collections::BTreeMap<String, String>,
) -> String {
    let Some(model) = model else {
        return "unknown".to_owned();
    };
    let resolved = mappings.get(model).map_or(model, String::as_str);

    if resolved.starts_with("claude") {
        "claude".to_owned()
    } else if resolved.starts_with("gpt")
        || resolved.starts_with("o1")
        || resolved.starts_with("o3")
        || resolved.starts_with("text-")
    {
        "openai".to_owned()
    } else if resolved.starts_with("gemini") {
        "gemini".to_owned()
    } else {
        "unknown".to_owned()
    }
}
