//! Row types for the store.
//!
//! Every struct maps one table. Secret material (`api_key_hash`,
//! `encrypted_tokens`, `csrf_token`) is skipped during serialization so a
//! row can be returned from an API handler without leaking it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ── Users ────────────────────────────────────────────────────────────

/// A data-plane identity. The raw API key is never stored — only its
/// Argon2id digest and displayable prefix.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub api_key_hash: String,
    pub key_prefix: String,
    /// Token budget; `None` means unlimited.
    pub quota_tokens: Option<i64>,
    pub used_tokens: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl User {
    /// Whether a request may pass the quota gate right now.
    ///
    /// Authorization compares strictly: the request is rejected when
    /// `used_tokens >= quota`.
    #[must_use]
    pub fn within_quota(&self) -> bool {
        match self.quota_tokens {
            Some(quota) => self.used_tokens < quota,
            None => true,
        }
    }
}

// ── Usage ────────────────────────────────────────────────────────────

/// Outcome of a forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Success,
    Error,
}

impl std::fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Error => f.write_str("error"),
        }
    }
}

impl std::str::FromStr for UsageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown usage status: {other}")),
        }
    }
}

/// Immutable per-request record. Append-only; pruned by the rollup job
/// past the retention horizon.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UsageLog {
    pub id: i64,
    pub user_id: i64,
    pub provider: String,
    pub model: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub duration_ms: i64,
    pub status: UsageStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for [`crate::usage::record`].
#[derive(Debug, Clone)]
pub struct NewUsageLog {
    pub user_id: i64,
    pub provider: String,
    pub model: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub duration_ms: i64,
    pub status: UsageStatus,
    pub error_message: Option<String>,
}

/// Pre-aggregated per-day row. `user_id`/`provider` are `None` for the
/// "all" granularity.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub user_id: Option<i64>,
    pub provider: Option<String>,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub request_count: i64,
}

/// Summed counters for a reporting period.
#[derive(Debug, Clone, Copy, Default, Serialize, sqlx::FromRow)]
pub struct UsageTotals {
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub request_count: i64,
}

/// Per-provider slice of a period summary.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProviderUsage {
    pub provider: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub request_count: i64,
}

// ── Providers ────────────────────────────────────────────────────────

/// A logical upstream (claude, openai, gemini, ...).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    /// `oauth` or `api_key`; parse with [`modelgate_core::settings::ProviderKind`].
    pub kind: String,
    pub enabled: bool,
    /// JSON blob; parse with [`Provider::parsed_settings`].
    #[serde(skip)]
    pub settings: String,
    pub created_at: DateTime<Utc>,
}

impl Provider {
    /// Parse the settings blob into its closed type.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::Corrupt`] if the stored JSON no longer
    /// parses (it is validated on every write).
    pub fn parsed_settings(
        &self,
    ) -> Result<modelgate_core::settings::ProviderSettings, crate::StoreError> {
        serde_json::from_str(&self.settings).map_err(|e| crate::StoreError::Corrupt {
            reason: format!("provider '{}' settings: {e}", self.name),
        })
    }
}

/// Credential status for a provider account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Expired,
    Revoked,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Expired => f.write_str("expired"),
            Self::Revoked => f.write_str("revoked"),
        }
    }
}

/// One credential belonging to a provider. `encrypted_tokens` is opaque
/// ciphertext — only `modelgate_core::crypto` ever sees the plaintext.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProviderAccount {
    pub id: i64,
    pub provider_id: i64,
    pub email: Option<String>,
    #[serde(skip)]
    pub encrypted_tokens: Vec<u8>,
    pub status: AccountStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Sessions ─────────────────────────────────────────────────────────

/// An admin login session. `id` is the SHA-256 hash of the cookie token.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    #[serde(skip)]
    pub csrf_token: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ── OAuth states ─────────────────────────────────────────────────────

/// Short-lived row backing one OAuth start/callback handshake.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OauthState {
    pub state: String,
    pub provider: String,
    /// Session (hash) that initiated the flow.
    pub session_id: String,
    pub code_verifier: String,
    /// Whether the provider row existed when the flow started.
    pub provider_present: bool,
    pub expires_at: DateTime<Utc>,
}
