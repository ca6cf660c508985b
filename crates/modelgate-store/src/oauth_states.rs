//! OAuth state repository.
//!
//! One row per in-flight authorization handshake. States are single-use:
//! [`take`] removes the row while returning it, so a replayed callback
//! finds nothing.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::models::OauthState;

/// Persist a state nonce for an authenticated admin session.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn insert(
    pool: &SqlitePool,
    state: &str,
    provider: &str,
    session_id: &str,
    code_verifier: &str,
    provider_present: bool,
    expires_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r"INSERT INTO oauth_states
              (state, provider, session_id, code_verifier, provider_present, expires_at)
          VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(state)
    .bind(provider)
    .bind(session_id)
    .bind(code_verifier)
    .bind(provider_present)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Atomically consume a live state row.
///
/// Returns `None` for unknown, expired, or already-consumed states.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn take(pool: &SqlitePool, state: &str) -> Result<Option<OauthState>, StoreError> {
    let row = sqlx::query_as::<_, OauthState>(
        "DELETE FROM oauth_states WHERE state = ? AND expires_at > ? RETURNING *",
    )
    .bind(state)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Drop states past their TTL; returns the count removed.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn sweep_expired(pool: &SqlitePool) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= ?")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
