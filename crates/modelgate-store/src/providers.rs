//! Provider and provider-account repository.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::models::{AccountStatus, Provider, ProviderAccount};

/// A provider row joined with its account count (admin listing).
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ProviderSummary {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub account_count: i64,
}

/// Fetch a provider by name, creating it on first use.
///
/// Providers come into existence implicitly on the first successful OAuth
/// exchange or explicit registration.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn get_or_create(
    pool: &SqlitePool,
    name: &str,
    kind: modelgate_core::settings::ProviderKind,
) -> Result<Provider, StoreError> {
    if let Some(provider) = sqlx::query_as::<_, Provider>("SELECT * FROM providers WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?
    {
        return Ok(provider);
    }

    let provider = sqlx::query_as::<_, Provider>(
        r"INSERT INTO providers (name, kind, settings, created_at)
          VALUES (?, ?, '{}', ?)
          RETURNING *",
    )
    .bind(name)
    .bind(kind.to_string())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(provider)
}

/// Get a provider by name.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the provider does not exist.
pub async fn get(pool: &SqlitePool, name: &str) -> Result<Provider, StoreError> {
    sqlx::query_as::<_, Provider>("SELECT * FROM providers WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound { entity: "provider" })
}

/// List providers with their account counts, alphabetically.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn list(pool: &SqlitePool) -> Result<Vec<ProviderSummary>, StoreError> {
    let providers = sqlx::query_as::<_, ProviderSummary>(
        r"SELECT p.id, p.name, p.kind, p.enabled, p.created_at,
                 COUNT(a.id) AS account_count
          FROM providers p
          LEFT JOIN provider_accounts a ON a.provider_id = p.id
          GROUP BY p.id
          ORDER BY p.name",
    )
    .fetch_all(pool)
    .await?;

    Ok(providers)
}

/// Update a provider's enabled flag and/or settings blob.
///
/// The settings JSON must already be validated against the closed type.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the provider does not exist.
pub async fn update(
    pool: &SqlitePool,
    name: &str,
    enabled: Option<bool>,
    settings_json: Option<&str>,
) -> Result<Provider, StoreError> {
    let current = get(pool, name).await?;
    let enabled = enabled.unwrap_or(current.enabled);
    let settings = settings_json.unwrap_or(&current.settings);

    let provider = sqlx::query_as::<_, Provider>(
        r"UPDATE providers SET enabled = ?, settings = ?
          WHERE name = ?
          RETURNING *",
    )
    .bind(enabled)
    .bind(settings)
    .bind(name)
    .fetch_one(pool)
    .await?;

    Ok(provider)
}

/// Delete a provider; accounts cascade.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the provider does not exist.
pub async fn delete(pool: &SqlitePool, name: &str) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM providers WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound { entity: "provider" });
    }
    Ok(())
}

// ── Accounts ─────────────────────────────────────────────────────────

/// Create a credential row for a provider.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn create_account(
    pool: &SqlitePool,
    provider_id: i64,
    email: Option<&str>,
    encrypted_tokens: &[u8],
    expires_at: Option<DateTime<Utc>>,
) -> Result<ProviderAccount, StoreError> {
    let account = sqlx::query_as::<_, ProviderAccount>(
        r"INSERT INTO provider_accounts
              (provider_id, email, encrypted_tokens, status, expires_at, created_at)
          VALUES (?, ?, ?, 'active', ?, ?)
          RETURNING *",
    )
    .bind(provider_id)
    .bind(email)
    .bind(encrypted_tokens)
    .bind(expires_at)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(account)
}

/// Get one account.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the account does not exist.
pub async fn get_account(pool: &SqlitePool, id: i64) -> Result<ProviderAccount, StoreError> {
    sqlx::query_as::<_, ProviderAccount>("SELECT * FROM provider_accounts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "provider account",
        })
}

/// Find an account by its identifying email within a provider.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn find_account_by_email(
    pool: &SqlitePool,
    provider_id: i64,
    email: &str,
) -> Result<Option<ProviderAccount>, StoreError> {
    let account = sqlx::query_as::<_, ProviderAccount>(
        "SELECT * FROM provider_accounts WHERE provider_id = ? AND email = ?",
    )
    .bind(provider_id)
    .bind(email)
    .fetch_optional(pool)
    .await?;

    Ok(account)
}

/// List a provider's accounts, oldest first.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn list_accounts(
    pool: &SqlitePool,
    provider_id: i64,
) -> Result<Vec<ProviderAccount>, StoreError> {
    let accounts = sqlx::query_as::<_, ProviderAccount>(
        "SELECT * FROM provider_accounts WHERE provider_id = ? ORDER BY id",
    )
    .bind(provider_id)
    .fetch_all(pool)
    .await?;

    Ok(accounts)
}

/// Replace an account's credential blob in place (refresh rotation).
///
/// Also flips the status back to active: a refreshed credential is usable
/// again regardless of an earlier expiry marking.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the account does not exist.
pub async fn rotate_account_tokens(
    pool: &SqlitePool,
    id: i64,
    encrypted_tokens: &[u8],
    expires_at: Option<DateTime<Utc>>,
) -> Result<ProviderAccount, StoreError> {
    sqlx::query_as::<_, ProviderAccount>(
        r"UPDATE provider_accounts
          SET encrypted_tokens = ?, expires_at = ?, status = 'active'
          WHERE id = ?
          RETURNING *",
    )
    .bind(encrypted_tokens)
    .bind(expires_at)
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound {
        entity: "provider account",
    })
}

/// Set an account's status (expired on refresh failure, revoked by admin).
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the account does not exist.
pub async fn set_account_status(
    pool: &SqlitePool,
    id: i64,
    status: AccountStatus,
) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE provider_accounts SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "provider account",
        });
    }
    Ok(())
}

/// Stamp an account's last-used instant.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn touch_account(pool: &SqlitePool, id: i64) -> Result<(), StoreError> {
    sqlx::query("UPDATE provider_accounts SET last_used_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete an account belonging to the named provider.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the pair does not exist.
pub async fn delete_account(
    pool: &SqlitePool,
    provider_name: &str,
    account_id: i64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r"DELETE FROM provider_accounts
          WHERE id = ? AND provider_id = (SELECT id FROM providers WHERE name = ?)",
    )
    .bind(account_id)
    .bind(provider_name)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "provider account",
        });
    }
    Ok(())
}

/// Snapshot of every enabled provider with its active accounts, ordered
/// by name then account id. The sidecar config projection reads this.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn config_snapshot(
    pool: &SqlitePool,
) -> Result<Vec<(Provider, Vec<ProviderAccount>)>, StoreError> {
    let providers = sqlx::query_as::<_, Provider>(
        "SELECT * FROM providers WHERE enabled = 1 ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let mut snapshot = Vec::with_capacity(providers.len());
    for provider in providers {
        let accounts = sqlx::query_as::<_, ProviderAccount>(
            "SELECT * FROM provider_accounts WHERE provider_id = ? AND status = 'active' ORDER BY id",
        )
        .bind(provider.id)
        .fetch_all(pool)
        .await?;
        snapshot.push((provider, accounts));
    }

    Ok(snapshot)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Store;
    use modelgate_core::settings::ProviderKind;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let first = get_or_create(store.pool(), "claude", ProviderKind::OAuth)
            .await
            .unwrap();
        let second = get_or_create(store.pool(), "claude", ProviderKind::OAuth)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, "oauth");
    }

    #[tokio::test]
    async fn delete_provider_cascades_accounts() {
        let store = Store::open_in_memory().await.unwrap();
        let provider = get_or_create(store.pool(), "claude", ProviderKind::OAuth)
            .await
            .unwrap();
        create_account(store.pool(), provider.id, Some("a@b.c"), b"blob", None)
            .await
            .unwrap();

        delete(store.pool(), "claude").await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM provider_accounts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn rotate_reactivates_an_expired_account() {
        let store = Store::open_in_memory().await.unwrap();
        let provider = get_or_create(store.pool(), "claude", ProviderKind::OAuth)
            .await
            .unwrap();
        let account = create_account(store.pool(), provider.id, None, b"old", None)
            .await
            .unwrap();
        set_account_status(store.pool(), account.id, AccountStatus::Expired)
            .await
            .unwrap();

        let rotated = rotate_account_tokens(store.pool(), account.id, b"new", None)
            .await
            .unwrap();
        assert_eq!(rotated.status, AccountStatus::Active);
        assert_eq!(rotated.encrypted_tokens, b"new");
    }

    #[tokio::test]
    async fn config_snapshot_skips_disabled_and_inactive() {
        let store = Store::open_in_memory().await.unwrap();
        let claude = get_or_create(store.pool(), "claude", ProviderKind::OAuth)
            .await
            .unwrap();
        let openai = get_or_create(store.pool(), "openai", ProviderKind::ApiKey)
            .await
            .unwrap();
        update(store.pool(), "openai", Some(false), None).await.unwrap();

        let active = create_account(store.pool(), claude.id, None, b"a", None)
            .await
            .unwrap();
        let expired = create_account(store.pool(), claude.id, None, b"b", None)
            .await
            .unwrap();
        set_account_status(store.pool(), expired.id, AccountStatus::Expired)
            .await
            .unwrap();
        create_account(store.pool(), openai.id, None, b"c", None)
            .await
            .unwrap();

        let snapshot = config_snapshot(store.pool()).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0.name, "claude");
        assert_eq!(snapshot[0].1.len(), 1);
        assert_eq!(snapshot[0].1[0].id, active.id);
    }

    #[tokio::test]
    async fn find_account_by_email_matches_within_provider() {
        let store = Store::open_in_memory().await.unwrap();
        let claude = get_or_create(store.pool(), "claude", ProviderKind::OAuth)
            .await
            .unwrap();
        create_account(store.pool(), claude.id, Some("a@b.c"), b"x", None)
            .await
            .unwrap();

        assert!(find_account_by_email(store.pool(), claude.id, "a@b.c")
            .await
            .unwrap()
            .is_some());
        assert!(find_account_by_email(store.pool(), claude.id, "z@b.c")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_reports_account_counts() {
        let store = Store::open_in_memory().await.unwrap();
        let claude = get_or_create(store.pool(), "claude", ProviderKind::OAuth)
            .await
            .unwrap();
        create_account(store.pool(), claude.id, None, b"x", None)
            .await
            .unwrap();
        get_or_create(store.pool(), "gemini", ProviderKind::OAuth)
            .await
            .unwrap();

        let summaries = list(store.pool()).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].name, "claude");
        assert_eq!(summaries[0].account_count, 1);
        assert_eq!(summaries[1].account_count, 0);
    }
}
