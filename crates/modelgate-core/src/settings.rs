//! Typed settings blobs.
//!
//! Provider settings are stored as JSON in the database but parsed into
//! closed types at the edges — unknown values are rejected at write time
//! instead of being stored opaquely.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the sidecar spreads requests across a provider's accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    RoundRobin,
    LeastUsed,
}

impl Default for LoadBalancing {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// How a provider authenticates upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Credentials obtained through an OAuth authorization-code flow.
    OAuth,
    /// A raw API key registered by the admin.
    ApiKey,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OAuth => f.write_str("oauth"),
            Self::ApiKey => f.write_str("api_key"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth" => Ok(Self::OAuth),
            "api_key" => Ok(Self::ApiKey),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

/// Per-provider tuning stored in the `providers.settings` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    /// Account selection policy.
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    /// Upstream request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// How many times the sidecar retries a failed upstream request.
    #[serde(default)]
    pub request_retry: u32,
}

fn default_timeout_seconds() -> u64 {
    120
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancing::default(),
            timeout_seconds: default_timeout_seconds(),
            request_retry: 0,
        }
    }
}

/// Model-name aliasing table: requested name → upstream name.
///
/// A `BTreeMap` keeps the sidecar config projection deterministic.
pub type ModelMappings = BTreeMap<String, String>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn provider_settings_defaults() {
        let settings: ProviderSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.load_balancing, LoadBalancing::RoundRobin);
        assert_eq!(settings.timeout_seconds, 120);
        assert_eq!(settings.request_retry, 0);
    }

    #[test]
    fn unknown_load_balancing_is_rejected() {
        let result: Result<ProviderSettings, _> =
            serde_json::from_str(r#"{"load_balancing":"random"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<ProviderSettings, _> =
            serde_json::from_str(r#"{"surprise":true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn provider_kind_roundtrips_through_str() {
        assert_eq!("oauth".parse::<ProviderKind>().unwrap(), ProviderKind::OAuth);
        assert_eq!(
            "api_key".parse::<ProviderKind>().unwrap(),
            ProviderKind::ApiKey
        );
        assert_eq!(ProviderKind::OAuth.to_string(), "oauth");
        assert!("basic".parse::<ProviderKind>().is_err());
    }
}
