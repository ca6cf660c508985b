//! End-to-end data-plane tests against a fake sidecar.
//!
//! A real HTTP listener stands in for the sidecar: the supervisor is
//! configured with its port, so the gateway forwards to it exactly as it
//! would in production. This exercises the full chain — key auth, quota
//! gate, rate limiter, forwarding, streaming tee, and the usage row
//! committed at stream close.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceExt;

use modelgate_core::crypto::{EncryptionKey, TokenCipher};
use modelgate_sidecar::{Supervisor, SupervisorConfig};
use modelgate_store::Store;

use modelgate_server::app;
use modelgate_server::config::ServerConfig;
use modelgate_server::oauth::OAuthRegistry;
use modelgate_server::rate_limit::RateLimiter;
use modelgate_server::state::AppState;

const ADMIN_PASSWORD: &str = "pw1-for-tests";

/// Serve a fake sidecar on an ephemeral port; returns the port.
async fn spawn_fake_sidecar() -> u16 {
    async fn chat(Json(body): Json<serde_json::Value>) -> axum::response::Response {
        if body.get("stream").and_then(serde_json::Value::as_bool) == Some(true) {
            let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n\
                       data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":4}}\n\n\
                       data: [DONE]\n\n";
            ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
        } else {
            Json(json!({
                "id": "resp-1",
                "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                "usage": {"prompt_tokens": 20, "completion_tokens": 5},
            }))
            .into_response()
        }
    }

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/v1/models",
            get(|| async {
                Json(json!({
                    "object": "list",
                    "data": [{"id": "claude-3-opus", "object": "model"}],
                }))
            }),
        )
        .route("/v1/chat/completions", post(chat))
        .route(
            "/v1/completions",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": "credentials rejected"})),
                )
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    port
}

struct TestServer {
    router: Router,
    _dir: tempfile::TempDir,
}

async fn test_server(sidecar_port: u16) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_in_memory().await.unwrap();
    app::bootstrap_admin(&store, Some(ADMIN_PASSWORD)).await.unwrap();

    let supervisor = Supervisor::spawn(SupervisorConfig::new(
        PathBuf::from("/nonexistent/model-router"),
        dir.path().join("sidecar.yaml"),
        dir.path().join("state"),
        sidecar_port,
    ));

    let config = ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        data_dir: dir.path().to_path_buf(),
        db_path: dir.path().join("unused.db"),
        sidecar_binary: PathBuf::from("/nonexistent/model-router"),
        proxy_port: sidecar_port,
        encryption_key_hex: "cd".repeat(32),
        initial_admin_password: Some(ADMIN_PASSWORD.to_owned()),
        log_level: "info".to_owned(),
        public_url: "http://127.0.0.1:0".to_owned(),
        ui_url: "http://127.0.0.1:0/".to_owned(),
        secure_cookies: false,
    };

    let state = Arc::new(AppState {
        store,
        cipher: TokenCipher::new(EncryptionKey::generate()),
        supervisor,
        http: reqwest::Client::new(),
        rate_limiter: RateLimiter::new(),
        oauth: OAuthRegistry::with_providers(Vec::new()),
        config,
    });

    TestServer {
        router: app::build_router(state),
        _dir: dir,
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

struct AdminCookies {
    cookie_header: String,
    csrf_token: String,
}

async fn login(router: &Router) -> AdminCookies {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(format!(r#"{{"password":"{ADMIN_PASSWORD}"}}"#)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut session = None;
    let mut csrf = None;
    for value in response.headers().get_all(header::SET_COOKIE) {
        let pair = value.to_str().unwrap().split(';').next().unwrap();
        let (name, value) = pair.split_once('=').unwrap();
        match name {
            "mg_session" => session = Some(value.to_owned()),
            "mg_csrf" => csrf = Some(value.to_owned()),
            _ => {}
        }
    }
    let (session, csrf) = (session.unwrap(), csrf.unwrap());
    AdminCookies {
        cookie_header: format!("mg_session={session}; mg_csrf={csrf}"),
        csrf_token: csrf,
    }
}

async fn create_user(router: &Router, cookies: &AdminCookies, body: &str) -> (i64, String) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/users")
                .header(header::COOKIE, &cookies.cookie_header)
                .header("x-csrf-token", &cookies.csrf_token)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_owned()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    (
        body["user"]["id"].as_i64().unwrap(),
        body["api_key"].as_str().unwrap().to_owned(),
    )
}

async fn admin_get(router: &Router, cookies: &AdminCookies, uri: &str) -> serde_json::Value {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .header(header::COOKIE, &cookies.cookie_header)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

fn completion_request(key: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer {key}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_owned()))
        .unwrap()
}

#[tokio::test]
async fn completions_record_usage_and_enforce_quota() {
    let port = spawn_fake_sidecar().await;
    let server = test_server(port).await;
    let cookies = login(&server.router).await;
    // 25 tokens per request, quota 30: the second request still passes
    // the gate (25 < 30), the third is rejected.
    let (user_id, key) = create_user(
        &server.router,
        &cookies,
        r#"{"name":"alice","quota_tokens":30}"#,
    )
    .await;

    let first = server
        .router
        .clone()
        .oneshot(completion_request(&key, r#"{"model":"claude-3-opus","messages":[]}"#))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().contains_key("x-ratelimit-limit"));
    let body = body_json(first).await;
    assert_eq!(body["usage"]["prompt_tokens"], 20);

    // Consuming the body drove the stream to completion, so the usage
    // row and counter update are already committed.
    let user = admin_get(&server.router, &cookies, &format!("/api/users/{user_id}")).await;
    assert_eq!(user["used_tokens"], 25);
    assert!(user["last_used_at"].is_string());

    let logs = admin_get(&server.router, &cookies, "/api/logs").await;
    assert_eq!(logs["total"], 1);
    assert_eq!(logs["logs"][0]["provider"], "claude");
    assert_eq!(logs["logs"][0]["tokens_input"], 20);
    assert_eq!(logs["logs"][0]["status"], "success");

    // Second request: 25 < 30, passes, counter reaches 50.
    let second = server
        .router
        .clone()
        .oneshot(completion_request(&key, r#"{"model":"claude-3-opus","messages":[]}"#))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let _ = body_json(second).await;

    // Third request: 50 >= 30, rejected, and no usage row is written.
    let third = server
        .router
        .clone()
        .oneshot(completion_request(&key, r#"{"model":"claude-3-opus","messages":[]}"#))
        .await
        .unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(third).await["code"], "QUOTA_EXCEEDED");

    let logs = admin_get(&server.router, &cookies, "/api/logs").await;
    assert_eq!(logs["total"], 2);

    let usage = admin_get(
        &server.router,
        &cookies,
        &format!("/api/usage/users/{user_id}?period=today"),
    )
    .await;
    assert_eq!(usage["totals"]["tokens_input"], 40);
    assert_eq!(usage["totals"]["tokens_output"], 10);
    assert_eq!(usage["totals"]["request_count"], 2);
}

#[tokio::test]
async fn streaming_responses_capture_usage_at_close() {
    let port = spawn_fake_sidecar().await;
    let server = test_server(port).await;
    let cookies = login(&server.router).await;
    let (user_id, key) = create_user(&server.router, &cookies, r#"{"name":"bob"}"#).await;

    let response = server
        .router
        .clone()
        .oneshot(completion_request(
            &key,
            r#"{"model":"claude-3-opus","stream":true,"messages":[]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream")));

    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("data: [DONE]"));

    // Counters come from the final usage chunk of the stream.
    let user = admin_get(&server.router, &cookies, &format!("/api/users/{user_id}")).await;
    assert_eq!(user["used_tokens"], 14);
}

#[tokio::test]
async fn model_listing_merges_aliases() {
    let port = spawn_fake_sidecar().await;
    let server = test_server(port).await;
    let cookies = login(&server.router).await;
    let (_, key) = create_user(&server.router, &cookies, r#"{"name":"carol"}"#).await;

    // Register an alias through the config surface.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::PUT)
                .uri("/api/config")
                .header(header::COOKIE, &cookies.cookie_header)
                .header("x-csrf-token", &cookies.csrf_token)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"model_mappings":{"gpt-4":"claude-3-opus"}}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let listing = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .header(header::AUTHORIZATION, format!("Bearer {key}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(listing.status(), StatusCode::OK);
    let body = body_json(listing).await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|model| model["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"claude-3-opus"));
    assert!(ids.contains(&"gpt-4"));
}

#[tokio::test]
async fn upstream_errors_pass_through_and_log_an_error_row() {
    let port = spawn_fake_sidecar().await;
    let server = test_server(port).await;
    let cookies = login(&server.router).await;
    let (_, key) = create_user(&server.router, &cookies, r#"{"name":"dave"}"#).await;

    // The fake sidecar rejects this family with 401; no OAuth provider
    // is configured, so the gateway passes the status through untouched.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/v1/completions")
                .header(header::AUTHORIZATION, format!("Bearer {key}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"model":"claude-3-opus","prompt":"x"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let _ = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();

    let logs = admin_get(&server.router, &cookies, "/api/logs?status=error").await;
    assert_eq!(logs["total"], 1);
    assert_eq!(logs["logs"][0]["tokens_input"], 0);
    assert!(logs["logs"][0]["error_message"]
        .as_str()
        .unwrap()
        .contains("401"));
}
