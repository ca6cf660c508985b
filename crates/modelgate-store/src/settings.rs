//! Process-wide scalar settings.
//!
//! A key/value table fronted by an advisory in-memory cache. Reads hit
//! the cache; every write goes to the database first and then updates the
//! cache, so a single process never observes a stale value. (Two
//! processes against one store are already undefined — see
//! [`crate::InstanceLock`].)

use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::Store;

/// Argon2id digest of the admin password (set once at first run).
pub const ADMIN_PASSWORD_HASH: &str = "admin_password_hash";
/// Loopback port the sidecar listens on.
pub const PROXY_PORT: &str = "proxy_port";
/// Whether to start the sidecar at server boot.
pub const AUTO_START_PROXY: &str = "auto_start_proxy";
/// JSON map of requested model name → upstream model name.
pub const MODEL_MAPPINGS: &str = "model_mappings";
/// Per-key data-plane requests per minute (0 disables the limiter).
pub const RATE_LIMIT_RPM: &str = "rate_limit_rpm";
/// Data-plane forward timeout in seconds.
pub const FORWARD_TIMEOUT_SECS: &str = "forward_timeout_secs";
/// Usage-log retention horizon in days.
pub const LOG_RETENTION_DAYS: &str = "log_retention_days";

impl Store {
    /// Read a setting, consulting the cache first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failure.
    pub async fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(value) = self.settings_cache().read().await.get(key) {
            return Ok(Some(value.clone()));
        }

        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;

        if let Some(ref value) = value {
            self.settings_cache()
                .write()
                .await
                .insert(key.to_owned(), value.clone());
        }
        Ok(value)
    }

    /// Upsert a setting and refresh the cache.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failure.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO settings (key, value) VALUES (?, ?)
              ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;

        self.settings_cache()
            .write()
            .await
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    /// Parsed model-alias table (empty when unset).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the stored JSON no longer parses.
    pub async fn model_mappings(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match self.setting(MODEL_MAPPINGS).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                reason: format!("model mappings: {e}"),
            }),
            None => Ok(BTreeMap::new()),
        }
    }

    /// A numeric setting with a default.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the stored value is not a number.
    pub async fn numeric_setting(&self, key: &str, default: u64) -> Result<u64, StoreError> {
        match self.setting(key).await? {
            Some(raw) => raw.parse().map_err(|_| StoreError::Corrupt {
                reason: format!("setting '{key}' is not numeric: {raw}"),
            }),
            None => Ok(default),
        }
    }

    /// A boolean setting with a default (`"true"`/`"1"` are truthy).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failure.
    pub async fn bool_setting(&self, key: &str, default: bool) -> Result<bool, StoreError> {
        Ok(self
            .setting(key)
            .await?
            .map_or(default, |raw| raw == "true" || raw == "1"))
    }

    pub(crate) fn settings_cache(
        &self,
    ) -> &tokio::sync::RwLock<std::collections::HashMap<String, String>> {
        &self.settings_cache
    }
}
