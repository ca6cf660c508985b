//! modelgate HTTP server.
//!
//! Wires the store, crypto, and sidecar supervisor into a running Axum
//! server: the session-protected admin control plane under `/api`, the
//! OAuth flows under `/oauth`, and the API-key-protected OpenAI-shaped
//! data plane under `/v1`.

pub mod app;
pub mod config;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod oauth;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod usage_extract;
pub mod workers;
