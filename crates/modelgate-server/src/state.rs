//! Shared application state for the modelgate server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`.

use std::sync::Arc;

use modelgate_core::crypto::TokenCipher;
use modelgate_sidecar::Supervisor;
use modelgate_store::Store;

use crate::config::ServerConfig;
use crate::oauth::OAuthRegistry;
use crate::rate_limit::RateLimiter;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// The embedded store.
    pub store: Store,
    /// Credential encryption with the process-lifetime key.
    pub cipher: TokenCipher,
    /// Owner of the sidecar child process.
    pub supervisor: Arc<Supervisor>,
    /// Pooled outbound HTTP client (forwarding, OAuth exchange, probes).
    pub http: reqwest::Client,
    /// Per-key data-plane rate limiter.
    pub rate_limiter: RateLimiter,
    /// Configured OAuth providers.
    pub oauth: OAuthRegistry,
    /// Process configuration.
    pub config: ServerConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
