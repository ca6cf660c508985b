//! OAuth provider integration.
//!
//! One registry entry per supported upstream (claude, openai, gemini),
//! each carrying its authorize/token endpoints and client credentials
//! from the environment. The HTTP flow lives in `routes::oauth`; this
//! module owns the provider-specific pieces: authorize-URL construction
//! with PKCE (S256), the code exchange, and token refresh.

use std::collections::HashMap;

use base64::Engine as _;
use chrono::{Duration, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use modelgate_core::crypto::ProviderCredentials;
use modelgate_store::models::AccountStatus;
use modelgate_store::providers;

use crate::error::ApiError;
use crate::state::AppState;

/// A configured OAuth upstream.
#[derive(Debug, Clone)]
pub struct OAuthProvider {
    pub name: String,
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: String,
}

/// The set of providers enabled via environment configuration.
#[derive(Debug, Default)]
pub struct OAuthRegistry {
    providers: HashMap<String, OAuthProvider>,
}

/// Built-in provider endpoints; every field can be overridden via
/// `MODELGATE_OAUTH_<NAME>_*` environment variables.
const KNOWN_PROVIDERS: &[(&str, &str, &str, &str)] = &[
    (
        "claude",
        "https://claude.ai/oauth/authorize",
        "https://console.anthropic.com/v1/oauth/token",
        "org:create_api_key user:profile",
    ),
    (
        "openai",
        "https://auth.openai.com/authorize",
        "https://auth.openai.com/oauth/token",
        "openid profile email offline_access",
    ),
    (
        "gemini",
        "https://accounts.google.com/o/oauth2/v2/auth",
        "https://oauth2.googleapis.com/token",
        "openid email https://www.googleapis.com/auth/generative-language.retriever",
    ),
];

impl OAuthRegistry {
    /// Build the registry from the environment. A provider is enabled
    /// when its client id is set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut providers = HashMap::new();
        for (name, authorize_url, token_url, scopes) in KNOWN_PROVIDERS {
            let upper = name.to_uppercase();
            let Ok(client_id) = std::env::var(format!("MODELGATE_OAUTH_{upper}_CLIENT_ID")) else {
                continue;
            };
            let provider = OAuthProvider {
                name: (*name).to_owned(),
                authorize_url: std::env::var(format!("MODELGATE_OAUTH_{upper}_AUTHORIZE_URL"))
                    .unwrap_or_else(|_| (*authorize_url).to_owned()),
                token_url: std::env::var(format!("MODELGATE_OAUTH_{upper}_TOKEN_URL"))
                    .unwrap_or_else(|_| (*token_url).to_owned()),
                client_id,
                client_secret: std::env::var(format!("MODELGATE_OAUTH_{upper}_CLIENT_SECRET"))
                    .unwrap_or_default(),
                scopes: (*scopes).to_owned(),
            };
            info!(provider = *name, "OAuth provider enabled");
            providers.insert((*name).to_owned(), provider);
        }
        Self { providers }
    }

    /// Registry with explicit entries (tests).
    #[must_use]
    pub fn with_providers(entries: Vec<OAuthProvider>) -> Self {
        Self {
            providers: entries
                .into_iter()
                .map(|provider| (provider.name.clone(), provider))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OAuthProvider> {
        self.providers.get(name)
    }
}

/// S256 code challenge = BASE64URL(SHA256(verifier)).
#[must_use]
pub fn code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash)
}

/// Construct the provider's authorize URL with PKCE.
#[must_use]
pub fn authorize_url(
    provider: &OAuthProvider,
    redirect_uri: &str,
    state: &str,
    verifier: &str,
) -> String {
    format!(
        "{}?response_type=code\
         &client_id={}\
         &redirect_uri={}\
         &scope={}\
         &state={}\
         &code_challenge={}\
         &code_challenge_method=S256",
        provider.authorize_url,
        urlencoding::encode(&provider.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&provider.scopes),
        urlencoding::encode(state),
        urlencoding::encode(&code_challenge(verifier)),
    )
}

/// Token endpoint response (exchange and refresh share the shape).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Result of a successful code exchange.
#[derive(Debug)]
pub struct ExchangedTokens {
    pub credentials: ProviderCredentials,
    /// Identifying email, when the provider reports one.
    pub email: Option<String>,
}

/// Exchange an authorization code for tokens.
///
/// # Errors
///
/// Returns `PROVIDER_ERROR` when the provider rejects the exchange or
/// the response does not parse.
pub async fn exchange_code(
    http: &reqwest::Client,
    provider: &OAuthProvider,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<ExchangedTokens, ApiError> {
    let response = http
        .post(&provider.token_url)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &provider.client_id),
            ("client_secret", &provider.client_secret),
            ("code_verifier", code_verifier),
        ])
        .send()
        .await
        .map_err(|e| ApiError::Provider(format!("token exchange failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(provider = %provider.name, status = %status, body = %body, "token exchange rejected");
        return Err(ApiError::Provider(format!(
            "token exchange rejected with status {status}"
        )));
    }

    let tokens: TokenResponse = response
        .json()
        .await
        .map_err(|e| ApiError::Provider(format!("token response did not parse: {e}")))?;

    let email = tokens
        .email
        .clone()
        .or_else(|| tokens.id_token.as_deref().and_then(id_token_email));

    Ok(ExchangedTokens {
        credentials: credentials_from(tokens),
        email,
    })
}

/// Refresh an access token.
///
/// Providers may omit the refresh token in the response; the caller keeps
/// the old one in that case (handled here by leaving it `None`).
///
/// # Errors
///
/// Returns `PROVIDER_ERROR` when the refresh is rejected.
pub async fn refresh_tokens(
    http: &reqwest::Client,
    provider: &OAuthProvider,
    refresh_token: &str,
) -> Result<ProviderCredentials, ApiError> {
    let response = http
        .post(&provider.token_url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &provider.client_id),
            ("client_secret", &provider.client_secret),
        ])
        .send()
        .await
        .map_err(|e| ApiError::Provider(format!("token refresh failed: {e}")))?;

    if !response.status().is_success() {
        return Err(ApiError::Provider(format!(
            "token refresh rejected with status {}",
            response.status()
        )));
    }

    let tokens: TokenResponse = response
        .json()
        .await
        .map_err(|e| ApiError::Provider(format!("refresh response did not parse: {e}")))?;

    Ok(credentials_from(tokens))
}

fn credentials_from(tokens: TokenResponse) -> ProviderCredentials {
    ProviderCredentials {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_at: tokens
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs)),
    }
}

/// Pull the `email` claim out of an ID token payload.
///
/// The token arrived over TLS from the provider's own token endpoint, so
/// the signature is not re-verified here.
fn id_token_email(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("email")?.as_str().map(str::to_owned)
}

/// Refresh every active OAuth account of a provider after an upstream
/// 401. Accounts whose refresh fails are marked expired. Returns whether
/// at least one account was rotated.
///
/// # Errors
///
/// Returns store/crypto failures; individual refresh rejections are
/// recorded on the account instead of propagating.
pub async fn refresh_provider_accounts(
    state: &AppState,
    provider_name: &str,
) -> Result<bool, ApiError> {
    let Some(oauth_provider) = state.oauth.get(provider_name) else {
        return Ok(false);
    };
    let provider = match providers::get(state.store.pool(), provider_name).await {
        Ok(provider) => provider,
        Err(modelgate_store::StoreError::NotFound { .. }) => return Ok(false),
        Err(err) => return Err(err.into()),
    };

    let mut rotated = false;
    for account in providers::list_accounts(state.store.pool(), provider.id).await? {
        if account.status != AccountStatus::Active {
            continue;
        }
        let creds = state.cipher.decrypt(&account.encrypted_tokens)?;
        let Some(ref refresh_token) = creds.refresh_token else {
            continue;
        };

        match refresh_tokens(&state.http, oauth_provider, refresh_token).await {
            Ok(mut fresh) => {
                // Providers that rotate refresh tokens send a new one;
                // otherwise the old one stays valid.
                if fresh.refresh_token.is_none() {
                    fresh.refresh_token = creds.refresh_token.clone();
                }
                let blob = state.cipher.encrypt(&fresh)?;
                providers::rotate_account_tokens(
                    state.store.pool(),
                    account.id,
                    &blob,
                    fresh.expires_at,
                )
                .await?;
                info!(provider = provider_name, account = account.id, "credentials refreshed");
                rotated = true;
            }
            Err(err) => {
                warn!(
                    provider = provider_name,
                    account = account.id,
                    error = %err,
                    "refresh failed, marking account expired"
                );
                providers::set_account_status(state.store.pool(), account.id, AccountStatus::Expired)
                    .await?;
            }
        }
    }

    Ok(rotated)
}
