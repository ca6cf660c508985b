//! Admin session repository.
//!
//! Rows are keyed by the SHA-256 hash of the cookie token. Expiry slides
//! forward on each admin request up to a hard cap; a background sweep
//! deletes rows past expiry.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::models::Session;

/// Insert a session row after a successful password check.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn create(
    pool: &SqlitePool,
    id_hash: &str,
    csrf_token: &str,
    expires_at: DateTime<Utc>,
) -> Result<Session, StoreError> {
    let now = Utc::now();
    let session = sqlx::query_as::<_, Session>(
        r"INSERT INTO sessions (id, csrf_token, created_at, last_accessed_at, expires_at)
          VALUES (?, ?, ?, ?, ?)
          RETURNING *",
    )
    .bind(id_hash)
    .bind(csrf_token)
    .bind(now)
    .bind(now)
    .bind(expires_at)
    .fetch_one(pool)
    .await?;

    Ok(session)
}

/// Fetch a live session; expired rows are treated as absent.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn get_live(pool: &SqlitePool, id_hash: &str) -> Result<Option<Session>, StoreError> {
    let session = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE id = ? AND expires_at > ?",
    )
    .bind(id_hash)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;

    Ok(session)
}

/// Slide the expiry window forward and stamp last access.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn extend(
    pool: &SqlitePool,
    id_hash: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE sessions SET last_accessed_at = ?, expires_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(expires_at)
        .bind(id_hash)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a session (logout).
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn delete(pool: &SqlitePool, id_hash: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id_hash)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete every session past expiry; returns the count removed.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn sweep_expired(pool: &SqlitePool) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
