//! Background workers.
//!
//! Both loops follow the same shape: tick on an interval, do the work,
//! exit when the shutdown channel flips. They are spawned from `main`
//! and joined (with a timeout) during graceful shutdown.

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use modelgate_store::{oauth_states, sessions, settings as settings_keys, usage, Store};

/// Cadence of the session/state sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Cadence of the rollup check. The rollup itself is idempotent per
/// calendar day, so running hourly just means yesterday is compacted
/// within an hour of midnight (and immediately at startup).
const ROLLUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Default retention horizon for usage logs.
const DEFAULT_LOG_RETENTION_DAYS: u64 = 90;

/// Deletes expired sessions and OAuth states.
pub async fn sweep_worker(store: Store, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    info!(interval_secs = SWEEP_INTERVAL.as_secs(), "sweep worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match sessions::sweep_expired(store.pool()).await {
                    Ok(0) => {}
                    Ok(count) => debug!(count, "expired sessions swept"),
                    Err(err) => warn!(error = %err, "session sweep failed"),
                }
                match oauth_states::sweep_expired(store.pool()).await {
                    Ok(0) => {}
                    Ok(count) => debug!(count, "expired OAuth states swept"),
                    Err(err) => warn!(error = %err, "OAuth state sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("sweep worker shutting down");
                return;
            }
        }
    }
}

/// Compacts yesterday's usage logs into `daily_usage` and prunes rows
/// past the retention horizon.
pub async fn rollup_worker(store: Store, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ROLLUP_INTERVAL);
    info!(interval_secs = ROLLUP_INTERVAL.as_secs(), "rollup worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_rollup(&store).await;
            }
            _ = shutdown.changed() => {
                info!("rollup worker shutting down");
                return;
            }
        }
    }
}

/// One rollup pass; also used by startup to compact immediately.
pub async fn run_rollup(store: &Store) {
    let yesterday = Utc::now().date_naive() - ChronoDuration::days(1);
    match usage::rollup_day(store.pool(), yesterday).await {
        Ok(rows) if rows > 0 => info!(date = %yesterday, rows, "daily usage rolled up"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "daily rollup failed"),
    }

    let retention_days = match store
        .numeric_setting(settings_keys::LOG_RETENTION_DAYS, DEFAULT_LOG_RETENTION_DAYS)
        .await
    {
        Ok(days) => days,
        Err(err) => {
            warn!(error = %err, "retention setting unreadable, using default");
            DEFAULT_LOG_RETENTION_DAYS
        }
    };
    let horizon = Utc::now() - ChronoDuration::days(i64::try_from(retention_days).unwrap_or(90));
    match usage::prune_logs(store.pool(), horizon).await {
        Ok(0) => {}
        Ok(count) => info!(count, retention_days, "old usage logs pruned"),
        Err(err) => warn!(error = %err, "usage log pruning failed"),
    }
}
