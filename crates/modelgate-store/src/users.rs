//! User repository.
//!
//! Every function takes the pool and returns `Result<T, StoreError>`.
//! Queries are parameterized throughout.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::models::User;

/// Fields an admin may change on an existing user.
///
/// `quota_tokens` is tri-state: `None` leaves the quota untouched,
/// `Some(None)` clears it (unlimited), `Some(Some(n))` sets it.
#[derive(Debug, Default, Clone)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub quota_tokens: Option<Option<i64>>,
    pub enabled: Option<bool>,
}

/// Create a user with a freshly hashed key.
///
/// # Errors
///
/// Returns [`StoreError::Conflict`] when the name or prefix is taken.
pub async fn create(
    pool: &SqlitePool,
    name: &str,
    api_key_hash: &str,
    key_prefix: &str,
    quota_tokens: Option<i64>,
) -> Result<User, StoreError> {
    let user = sqlx::query_as::<_, User>(
        r"INSERT INTO users (name, api_key_hash, key_prefix, quota_tokens, created_at)
          VALUES (?, ?, ?, ?, ?)
          RETURNING *",
    )
    .bind(name)
    .bind(api_key_hash)
    .bind(key_prefix)
    .bind(quota_tokens)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(user)
}

/// Get a user by id.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the user does not exist.
pub async fn get(pool: &SqlitePool, id: i64) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound { entity: "user" })
}

/// Get a user by key prefix (data-plane lookup path).
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if no user has the prefix.
pub async fn get_by_prefix(pool: &SqlitePool, key_prefix: &str) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE key_prefix = ?")
        .bind(key_prefix)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound { entity: "user" })
}

/// List users, newest first, with the total row count for pagination.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn list(
    pool: &SqlitePool,
    page: u32,
    limit: u32,
) -> Result<(Vec<User>, i64), StoreError> {
    let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
    let users = sqlx::query_as::<_, User>(
        "SELECT * FROM users ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
    )
    .bind(i64::from(limit))
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;

    Ok((users, total))
}

/// Apply a partial update and return the new row.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id and
/// [`StoreError::Conflict`] when a new name collides.
pub async fn update(pool: &SqlitePool, id: i64, update: UserUpdate) -> Result<User, StoreError> {
    let current = get(pool, id).await?;

    let name = update.name.unwrap_or(current.name);
    let quota = update.quota_tokens.unwrap_or(current.quota_tokens);
    let enabled = update.enabled.unwrap_or(current.enabled);

    let user = sqlx::query_as::<_, User>(
        r"UPDATE users SET name = ?, quota_tokens = ?, enabled = ?
          WHERE id = ?
          RETURNING *",
    )
    .bind(name)
    .bind(quota)
    .bind(enabled)
    .bind(id)
    .fetch_one(pool)
    .await?;

    Ok(user)
}

/// Hard-delete a user; usage rows cascade.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the user does not exist.
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound { entity: "user" });
    }
    Ok(())
}

/// Atomically replace the key digest and prefix.
///
/// The old key stops authenticating at commit; counters are untouched.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id and
/// [`StoreError::Conflict`] if the new prefix collides.
pub async fn replace_key(
    pool: &SqlitePool,
    id: i64,
    api_key_hash: &str,
    key_prefix: &str,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>(
        r"UPDATE users SET api_key_hash = ?, key_prefix = ?
          WHERE id = ?
          RETURNING *",
    )
    .bind(api_key_hash)
    .bind(key_prefix)
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound { entity: "user" })
}

/// Stamp the user's last-used instant (data-plane touch).
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn touch_last_used(pool: &SqlitePool, id: i64) -> Result<(), StoreError> {
    sqlx::query("UPDATE users SET last_used_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Zero the usage counter, returning the previous value for audit.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the user does not exist.
pub async fn reset_usage(pool: &SqlitePool, id: i64) -> Result<i64, StoreError> {
    let mut tx = pool.begin().await?;

    let previous: Option<i64> = sqlx::query_scalar("SELECT used_tokens FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let previous = previous.ok_or(StoreError::NotFound { entity: "user" })?;

    sqlx::query("UPDATE users SET used_tokens = 0 WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(previous)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Store;

    async fn seed(pool: &SqlitePool, name: &str) -> User {
        create(pool, name, "$argon2id$stub", &format!("sk-{name}"), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let user = seed(store.pool(), "alice").await;
        assert_eq!(user.used_tokens, 0);
        assert!(user.enabled);

        let fetched = get(store.pool(), user.id).await.unwrap();
        assert_eq!(fetched.name, "alice");
        assert_eq!(fetched.key_prefix, "sk-alice");
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        seed(store.pool(), "alice").await;
        let result = create(store.pool(), "alice", "h", "sk-alice2", None).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn duplicate_prefix_is_a_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        seed(store.pool(), "alice").await;
        let result = create(store.pool(), "bob", "h", "sk-alice", None).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn update_is_partial() {
        let store = Store::open_in_memory().await.unwrap();
        let user = seed(store.pool(), "alice").await;

        let updated = update(
            store.pool(),
            user.id,
            UserUpdate {
                quota_tokens: Some(Some(1000)),
                ..UserUpdate::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.quota_tokens, Some(1000));
        assert_eq!(updated.name, "alice");

        // Clearing the quota is distinct from leaving it untouched.
        let cleared = update(
            store.pool(),
            user.id,
            UserUpdate {
                quota_tokens: Some(None),
                ..UserUpdate::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(cleared.quota_tokens, None);
    }

    #[tokio::test]
    async fn replace_key_swaps_hash_and_prefix() {
        let store = Store::open_in_memory().await.unwrap();
        let user = seed(store.pool(), "alice").await;

        let replaced = replace_key(store.pool(), user.id, "new-hash", "sk-alice2")
            .await
            .unwrap();
        assert_eq!(replaced.api_key_hash, "new-hash");
        assert_eq!(replaced.key_prefix, "sk-alice2");
        // Counters untouched.
        assert_eq!(replaced.used_tokens, user.used_tokens);

        assert!(matches!(
            get_by_prefix(store.pool(), "sk-alice").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reset_usage_returns_previous_value() {
        let store = Store::open_in_memory().await.unwrap();
        let user = seed(store.pool(), "alice").await;
        sqlx::query("UPDATE users SET used_tokens = 42 WHERE id = ?")
            .bind(user.id)
            .execute(store.pool())
            .await
            .unwrap();

        let previous = reset_usage(store.pool(), user.id).await.unwrap();
        assert_eq!(previous, 42);
        assert_eq!(get(store.pool(), user.id).await.unwrap().used_tokens, 0);
    }

    #[tokio::test]
    async fn list_paginates_with_total() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..5 {
            seed(store.pool(), &format!("user{i}")).await;
        }
        let (page1, total) = list(store.pool(), 1, 2).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(total, 5);
        let (page3, _) = list(store.pool(), 3, 2).await.unwrap();
        assert_eq!(page3.len(), 1);
    }

    #[tokio::test]
    async fn within_quota_compares_strictly() {
        let store = Store::open_in_memory().await.unwrap();
        let user = seed(store.pool(), "alice").await;
        let at_quota = update(
            store.pool(),
            user.id,
            UserUpdate {
                quota_tokens: Some(Some(0)),
                ..UserUpdate::default()
            },
        )
        .await
        .unwrap();
        // used (0) >= quota (0) → rejected.
        assert!(!at_quota.within_quota());
    }
}
