//! Sidecar config projection.
//!
//! Turns database state — enabled providers, their active accounts, the
//! model-alias table — into the sidecar's YAML configuration. The
//! projection is deterministic: identical database state produces
//! byte-identical YAML (providers sorted by name, accounts by id, the
//! alias table a `BTreeMap`), so a byte diff against the previous file
//! decides whether a reload is needed.
//!
//! Writes are atomic: the bytes land in a temp file in the same
//! directory, then rename into place. A partially written config is
//! impossible.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use modelgate_core::crypto::TokenCipher;
use modelgate_core::settings::{LoadBalancing, ModelMappings};
use modelgate_store::models::{Provider, ProviderAccount};
use modelgate_store::{providers, Store};

use crate::error::SidecarError;

/// Root of the sidecar YAML document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarConfig {
    /// Loopback management address the sidecar binds.
    pub listen: String,
    pub providers: Vec<ProviderEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_mappings: ModelMappings,
}

/// One upstream provider with its decrypted credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    pub kind: String,
    pub load_balancing: LoadBalancing,
    pub timeout_seconds: u64,
    pub request_retry: u32,
    pub accounts: Vec<AccountEntry>,
}

/// One credential. The sidecar consumes plaintext; at-rest encryption is
/// this server's concern, not the sidecar's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Project current database state into a config document.
///
/// A credential blob that fails to decrypt aborts the projection — the
/// admin must delete or re-authorize the account. Dropping it silently
/// would shrink the provider pool without anyone noticing.
///
/// # Errors
///
/// Returns [`SidecarError::Credential`] for an unreadable blob and
/// [`SidecarError::Store`] on database failure.
pub async fn project(
    store: &Store,
    cipher: &TokenCipher,
    port: u16,
) -> Result<SidecarConfig, SidecarError> {
    let snapshot = providers::config_snapshot(store.pool()).await?;
    let model_mappings = store.model_mappings().await?;

    let mut entries = Vec::with_capacity(snapshot.len());
    for (provider, accounts) in snapshot {
        entries.push(provider_entry(&provider, &accounts, cipher)?);
    }

    Ok(SidecarConfig {
        listen: format!("127.0.0.1:{port}"),
        providers: entries,
        model_mappings,
    })
}

fn provider_entry(
    provider: &Provider,
    accounts: &[ProviderAccount],
    cipher: &TokenCipher,
) -> Result<ProviderEntry, SidecarError> {
    let settings = provider.parsed_settings()?;

    let mut entries = Vec::with_capacity(accounts.len());
    for account in accounts {
        let creds = cipher
            .decrypt(&account.encrypted_tokens)
            .map_err(|source| SidecarError::Credential {
                account_id: account.id,
                source,
            })?;
        entries.push(AccountEntry {
            id: account.id,
            email: account.email.clone(),
            access_token: creds.access_token,
            refresh_token: creds.refresh_token,
        });
    }

    Ok(ProviderEntry {
        name: provider.name.clone(),
        kind: provider.kind.clone(),
        load_balancing: settings.load_balancing,
        timeout_seconds: settings.timeout_seconds,
        request_retry: settings.request_retry,
        accounts: entries,
    })
}

/// Serialize a config document to YAML bytes.
///
/// # Errors
///
/// Returns [`SidecarError::Yaml`] if serialization fails.
pub fn to_yaml(config: &SidecarConfig) -> Result<Vec<u8>, SidecarError> {
    serde_yaml::to_string(config)
        .map(String::into_bytes)
        .map_err(|e| SidecarError::Yaml {
            reason: e.to_string(),
        })
}

/// Whether the bytes differ from what is on disk (a missing file counts
/// as different).
#[must_use]
pub fn differs_from_disk(path: &Path, bytes: &[u8]) -> bool {
    match std::fs::read(path) {
        Ok(existing) => existing != bytes,
        Err(_) => true,
    }
}

/// Write config bytes atomically: temp file in the same directory, then
/// rename over the target.
///
/// # Errors
///
/// Returns [`SidecarError::ConfigWrite`] on filesystem failure.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SidecarError> {
    let config_write = |source: std::io::Error| SidecarError::ConfigWrite {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(config_write)?;
    }

    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, bytes).map_err(config_write)?;
    std::fs::rename(&tmp, path).map_err(config_write)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use modelgate_core::crypto::{EncryptionKey, ProviderCredentials};
    use modelgate_core::settings::ProviderKind;

    async fn seeded_store(cipher: &TokenCipher) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        for (name, email) in [("openai", "o@x.y"), ("claude", "c@x.y")] {
            let provider = providers::get_or_create(store.pool(), name, ProviderKind::OAuth)
                .await
                .unwrap();
            let blob = cipher
                .encrypt(&ProviderCredentials {
                    access_token: format!("at-{name}"),
                    refresh_token: Some(format!("rt-{name}")),
                    expires_at: None,
                })
                .unwrap();
            providers::create_account(store.pool(), provider.id, Some(email), &blob, None)
                .await
                .unwrap();
        }
        store
            .set_setting(
                modelgate_store::settings::MODEL_MAPPINGS,
                r#"{"gpt-4":"claude-3-opus"}"#,
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn projection_is_deterministic() {
        let cipher = TokenCipher::new(EncryptionKey::generate());
        let store = seeded_store(&cipher).await;

        let a = to_yaml(&project(&store, &cipher, 8317).await.unwrap()).unwrap();
        let b = to_yaml(&project(&store, &cipher, 8317).await.unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn providers_are_sorted_and_decrypted() {
        let cipher = TokenCipher::new(EncryptionKey::generate());
        let store = seeded_store(&cipher).await;

        let config = project(&store, &cipher, 8317).await.unwrap();
        assert_eq!(config.listen, "127.0.0.1:8317");
        assert_eq!(config.providers.len(), 2);
        // Sorted by name: claude before openai.
        assert_eq!(config.providers[0].name, "claude");
        assert_eq!(config.providers[0].accounts[0].access_token, "at-claude");
        assert_eq!(
            config.model_mappings.get("gpt-4").map(String::as_str),
            Some("claude-3-opus")
        );
    }

    #[tokio::test]
    async fn unreadable_credentials_abort_projection() {
        let cipher = TokenCipher::new(EncryptionKey::generate());
        let store = seeded_store(&cipher).await;

        // A different key cannot read the stored blobs.
        let wrong = TokenCipher::new(EncryptionKey::generate());
        let result = project(&store, &wrong, 8317).await;
        assert!(matches!(result, Err(SidecarError::Credential { .. })));
    }

    #[test]
    fn write_atomic_then_diff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.yaml");

        assert!(differs_from_disk(&path, b"a: 1\n"));
        write_atomic(&path, b"a: 1\n").unwrap();
        assert!(!differs_from_disk(&path, b"a: 1\n"));
        assert!(differs_from_disk(&path, b"a: 2\n"));

        // No temp file left behind.
        assert!(!dir.path().join("sidecar.yaml.tmp").exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"a: 1\n");
    }

    #[test]
    fn yaml_roundtrips() {
        let config = SidecarConfig {
            listen: "127.0.0.1:9000".to_owned(),
            providers: vec![ProviderEntry {
                name: "claude".to_owned(),
                kind: "oauth".to_owned(),
                load_balancing: LoadBalancing::LeastUsed,
                timeout_seconds: 60,
                request_retry: 2,
                accounts: vec![AccountEntry {
                    id: 1,
                    email: None,
                    access_token: "at".to_owned(),
                    refresh_token: None,
                }],
            }],
            model_mappings: BTreeMap::new(),
        };
        let yaml = to_yaml(&config).unwrap();
        let parsed: SidecarConfig = serde_yaml::from_slice(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
