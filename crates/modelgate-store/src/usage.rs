//! Usage accounting repository.
//!
//! The invariant the gateway depends on lives here: a usage log row and
//! the matching `used_tokens` increment commit in the same transaction,
//! so an observer never sees accounting drift.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::StoreError;
use crate::models::{DailyUsage, NewUsageLog, ProviderUsage, UsageLog, UsageStatus, UsageTotals};

/// Reporting window for the admin usage APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Today,
    Week,
    Month,
    All,
}

impl std::str::FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today" => Ok(Self::Today),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "all" => Ok(Self::All),
            other => Err(format!("unknown period: {other}")),
        }
    }
}

impl Period {
    /// First calendar day included in the window (`None` = unbounded).
    fn start_date(self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            Self::Today => Some(today),
            Self::Week => Some(today - Duration::days(6)),
            Self::Month => Some(today - Duration::days(29)),
            Self::All => None,
        }
    }
}

/// Filter for the admin log listing.
#[derive(Debug, Default, Clone)]
pub struct LogFilter {
    pub limit: u32,
    pub offset: u32,
    pub user_id: Option<i64>,
    pub provider: Option<String>,
    pub status: Option<UsageStatus>,
}

/// Append a usage log row and bump the user's counter in one transaction.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure; nothing is committed.
pub async fn record(pool: &SqlitePool, entry: NewUsageLog) -> Result<UsageLog, StoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let log = sqlx::query_as::<_, UsageLog>(
        r"INSERT INTO usage_logs
              (user_id, provider, model, tokens_input, tokens_output,
               duration_ms, status, error_message, created_at)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
          RETURNING *",
    )
    .bind(entry.user_id)
    .bind(&entry.provider)
    .bind(&entry.model)
    .bind(entry.tokens_input)
    .bind(entry.tokens_output)
    .bind(entry.duration_ms)
    .bind(entry.status)
    .bind(&entry.error_message)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE users SET used_tokens = used_tokens + ?, last_used_at = ? WHERE id = ?")
        .bind(entry.tokens_input + entry.tokens_output)
        .bind(now)
        .bind(entry.user_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(log)
}

/// List usage logs, newest first, with the filtered total.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn list_logs(
    pool: &SqlitePool,
    filter: &LogFilter,
) -> Result<(Vec<UsageLog>, i64), StoreError> {
    fn push_conditions<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a LogFilter) {
        if let Some(user_id) = filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(ref provider) = filter.provider {
            builder.push(" AND provider = ").push_bind(provider.as_str());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
    }

    let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM usage_logs WHERE 1 = 1");
    push_conditions(&mut query, filter);
    query
        .push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(i64::from(filter.limit))
        .push(" OFFSET ")
        .push_bind(i64::from(filter.offset));
    let logs = query.build_query_as::<UsageLog>().fetch_all(pool).await?;

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM usage_logs WHERE 1 = 1");
    push_conditions(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    Ok((logs, total))
}

/// Regenerate the daily rollup for one calendar day.
///
/// Idempotent: rows are keyed by `(date, user, provider)` and overwritten
/// with fresh sums, so re-running for the same day converges.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn rollup_day(pool: &SqlitePool, day: NaiveDate) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r"INSERT INTO daily_usage (date, user_id, provider, tokens_input, tokens_output, request_count)
          SELECT date(created_at), user_id, provider,
                 SUM(tokens_input), SUM(tokens_output), COUNT(*)
          FROM usage_logs
          WHERE date(created_at) = ?
          GROUP BY user_id, provider
          ON CONFLICT (date, user_id, provider) DO UPDATE SET
              tokens_input = excluded.tokens_input,
              tokens_output = excluded.tokens_output,
              request_count = excluded.request_count",
    )
    .bind(day)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Delete usage logs older than the retention horizon.
///
/// Aggregates survive in `daily_usage`.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn prune_logs(pool: &SqlitePool, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM usage_logs WHERE created_at < ?")
        .bind(older_than)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Period totals, optionally scoped to one user.
///
/// Closed days come from `daily_usage`; today comes from a live aggregate
/// of `usage_logs`, so pruned history and fresh traffic both count.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn totals(
    pool: &SqlitePool,
    period: Period,
    user_id: Option<i64>,
) -> Result<UsageTotals, StoreError> {
    let today = Utc::now().date_naive();
    let start = period.start_date(today);

    let mut closed = QueryBuilder::<Sqlite>::new(
        r"SELECT COALESCE(SUM(tokens_input), 0) AS tokens_input,
                 COALESCE(SUM(tokens_output), 0) AS tokens_output,
                 COALESCE(SUM(request_count), 0) AS request_count
          FROM daily_usage WHERE date < ",
    );
    closed.push_bind(today);
    if let Some(start) = start {
        closed.push(" AND date >= ").push_bind(start);
    }
    if let Some(user_id) = user_id {
        closed.push(" AND user_id = ").push_bind(user_id);
    }
    let closed_totals: UsageTotals = closed.build_query_as().fetch_one(pool).await?;

    let live = live_day_totals(pool, today, user_id).await?;

    Ok(UsageTotals {
        tokens_input: closed_totals.tokens_input + live.tokens_input,
        tokens_output: closed_totals.tokens_output + live.tokens_output,
        request_count: closed_totals.request_count + live.request_count,
    })
}

async fn live_day_totals(
    pool: &SqlitePool,
    day: NaiveDate,
    user_id: Option<i64>,
) -> Result<UsageTotals, StoreError> {
    let mut live = QueryBuilder::<Sqlite>::new(
        r"SELECT COALESCE(SUM(tokens_input), 0) AS tokens_input,
                 COALESCE(SUM(tokens_output), 0) AS tokens_output,
                 COUNT(*) AS request_count
          FROM usage_logs WHERE date(created_at) = ",
    );
    live.push_bind(day);
    if let Some(user_id) = user_id {
        live.push(" AND user_id = ").push_bind(user_id);
    }
    Ok(live.build_query_as().fetch_one(pool).await?)
}

/// Per-provider breakdown for a period.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn provider_breakdown(
    pool: &SqlitePool,
    period: Period,
) -> Result<Vec<ProviderUsage>, StoreError> {
    let today = Utc::now().date_naive();
    let start = period.start_date(today);

    let mut query = QueryBuilder::<Sqlite>::new(
        r"SELECT provider,
                 COALESCE(SUM(tokens_input), 0) AS tokens_input,
                 COALESCE(SUM(tokens_output), 0) AS tokens_output,
                 COALESCE(SUM(request_count), 0) AS request_count
          FROM (
              SELECT provider, tokens_input, tokens_output, request_count
              FROM daily_usage WHERE provider <> '' AND date < ",
    );
    query.push_bind(today);
    if let Some(start) = start {
        query.push(" AND date >= ").push_bind(start);
    }
    query.push(
        r" UNION ALL
              SELECT provider, tokens_input, tokens_output, 1
              FROM usage_logs WHERE date(created_at) = ",
    );
    query.push_bind(today);
    query.push(") GROUP BY provider ORDER BY provider");

    Ok(query.build_query_as().fetch_all(pool).await?)
}

/// Daily series for the last `days` days, optionally filtered.
///
/// Closed days come from the rollup; today is aggregated live.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on database failure.
pub async fn daily_series(
    pool: &SqlitePool,
    days: u32,
    user_id: Option<i64>,
    provider: Option<&str>,
) -> Result<Vec<DailyUsage>, StoreError> {
    let today = Utc::now().date_naive();
    let start = today - Duration::days(i64::from(days.saturating_sub(1)));

    let mut query = QueryBuilder::<Sqlite>::new(
        r"SELECT date,
                 NULLIF(user_id, 0) AS user_id,
                 NULLIF(provider, '') AS provider,
                 SUM(tokens_input) AS tokens_input,
                 SUM(tokens_output) AS tokens_output,
                 SUM(request_count) AS request_count
          FROM (
              SELECT date, user_id, provider, tokens_input, tokens_output, request_count
              FROM daily_usage WHERE date >= ",
    );
    query.push_bind(start);
    query.push(" AND date < ").push_bind(today);
    query.push(
        r" UNION ALL
              SELECT date(created_at) AS date, user_id, provider,
                     tokens_input, tokens_output, 1
              FROM usage_logs WHERE date(created_at) = ",
    );
    query.push_bind(today);
    query.push(") WHERE 1 = 1");
    if let Some(user_id) = user_id {
        query.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(provider) = provider {
        query.push(" AND provider = ").push_bind(provider);
    }
    query.push(" GROUP BY date, user_id, provider ORDER BY date, user_id, provider");

    Ok(query.build_query_as().fetch_all(pool).await?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{users, Store};

    async fn seed_user(pool: &SqlitePool, name: &str) -> i64 {
        users::create(pool, name, "hash", &format!("sk-{name}"), None)
            .await
            .unwrap()
            .id
    }

    fn entry(user_id: i64, provider: &str, tokens_in: i64, tokens_out: i64) -> NewUsageLog {
        NewUsageLog {
            user_id,
            provider: provider.to_owned(),
            model: "m-1".to_owned(),
            tokens_input: tokens_in,
            tokens_output: tokens_out,
            duration_ms: 12,
            status: UsageStatus::Success,
            error_message: None,
        }
    }

    /// Backdate a log row so rollup tests can target a closed day.
    async fn backdate(pool: &SqlitePool, log_id: i64, day: NaiveDate) {
        let stamp = day
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        sqlx::query("UPDATE usage_logs SET created_at = ? WHERE id = ?")
            .bind(stamp)
            .bind(log_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn record_increments_counter_in_same_transaction() {
        let store = Store::open_in_memory().await.unwrap();
        let user_id = seed_user(store.pool(), "alice").await;

        record(store.pool(), entry(user_id, "claude", 20, 5))
            .await
            .unwrap();

        let user = users::get(store.pool(), user_id).await.unwrap();
        assert_eq!(user.used_tokens, 25);
        assert!(user.last_used_at.is_some());
    }

    #[tokio::test]
    async fn record_failure_leaves_counter_untouched() {
        let store = Store::open_in_memory().await.unwrap();
        // Unknown user violates the FK → the whole transaction rolls back.
        let result = record(store.pool(), entry(4242, "claude", 20, 5)).await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_logs")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn list_logs_filters_and_counts() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = seed_user(store.pool(), "alice").await;
        let bob = seed_user(store.pool(), "bob").await;
        record(store.pool(), entry(alice, "claude", 1, 1))
            .await
            .unwrap();
        record(store.pool(), entry(alice, "openai", 1, 1))
            .await
            .unwrap();
        record(store.pool(), entry(bob, "claude", 1, 1))
            .await
            .unwrap();

        let filter = LogFilter {
            limit: 10,
            offset: 0,
            user_id: Some(alice),
            ..LogFilter::default()
        };
        let (logs, total) = list_logs(store.pool(), &filter).await.unwrap();
        assert_eq!(total, 2);
        assert!(logs.iter().all(|l| l.user_id == alice));

        let filter = LogFilter {
            limit: 10,
            offset: 0,
            provider: Some("claude".to_owned()),
            ..LogFilter::default()
        };
        let (_, total) = list_logs(store.pool(), &filter).await.unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn rollup_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = seed_user(store.pool(), "alice").await;
        let bob = seed_user(store.pool(), "bob").await;
        let yesterday = Utc::now().date_naive() - Duration::days(1);

        for (user, provider, tokens_in) in
            [(alice, "claude", 10), (alice, "openai", 20), (bob, "claude", 30)]
        {
            let log = record(store.pool(), entry(user, provider, tokens_in, 5))
                .await
                .unwrap();
            backdate(store.pool(), log.id, yesterday).await;
        }

        rollup_day(store.pool(), yesterday).await.unwrap();
        rollup_day(store.pool(), yesterday).await.unwrap();

        let rows: Vec<DailyUsage> =
            sqlx::query_as("SELECT date, user_id, provider, tokens_input, tokens_output, request_count FROM daily_usage ORDER BY user_id, provider")
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert_eq!(rows.len(), 3);
        let total_in: i64 = rows.iter().map(|r| r.tokens_input).sum();
        assert_eq!(total_in, 60);
        assert!(rows.iter().all(|r| r.request_count == 1));
    }

    #[tokio::test]
    async fn rollup_overwrites_with_fresh_sums() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = seed_user(store.pool(), "alice").await;
        let yesterday = Utc::now().date_naive() - Duration::days(1);

        let log = record(store.pool(), entry(alice, "claude", 10, 0))
            .await
            .unwrap();
        backdate(store.pool(), log.id, yesterday).await;
        rollup_day(store.pool(), yesterday).await.unwrap();

        // A late-arriving row for the same day is absorbed by a re-run.
        let late = record(store.pool(), entry(alice, "claude", 7, 0))
            .await
            .unwrap();
        backdate(store.pool(), late.id, yesterday).await;
        rollup_day(store.pool(), yesterday).await.unwrap();

        let row: DailyUsage = sqlx::query_as(
            "SELECT date, user_id, provider, tokens_input, tokens_output, request_count FROM daily_usage",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(row.tokens_input, 17);
        assert_eq!(row.request_count, 2);
    }

    #[tokio::test]
    async fn totals_combine_closed_days_and_today() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = seed_user(store.pool(), "alice").await;
        let yesterday = Utc::now().date_naive() - Duration::days(1);

        let old = record(store.pool(), entry(alice, "claude", 100, 10))
            .await
            .unwrap();
        backdate(store.pool(), old.id, yesterday).await;
        rollup_day(store.pool(), yesterday).await.unwrap();
        // Logs for the closed day may be pruned; aggregates must survive.
        prune_logs(store.pool(), Utc::now()).await.unwrap();

        record(store.pool(), entry(alice, "claude", 5, 5))
            .await
            .unwrap();

        let week = totals(store.pool(), Period::Week, Some(alice)).await.unwrap();
        assert_eq!(week.tokens_input, 105);
        assert_eq!(week.tokens_output, 15);
        assert_eq!(week.request_count, 2);

        let today = totals(store.pool(), Period::Today, Some(alice)).await.unwrap();
        assert_eq!(today.tokens_input, 5);
        assert_eq!(today.request_count, 1);
    }

    #[tokio::test]
    async fn daily_series_includes_today_live() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = seed_user(store.pool(), "alice").await;
        record(store.pool(), entry(alice, "claude", 3, 4))
            .await
            .unwrap();

        let series = daily_series(store.pool(), 2, None, None).await.unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].tokens_input, 3);
        assert_eq!(series[0].date, Utc::now().date_naive());
    }

    #[tokio::test]
    async fn prune_respects_horizon() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = seed_user(store.pool(), "alice").await;
        let old = record(store.pool(), entry(alice, "claude", 1, 1))
            .await
            .unwrap();
        backdate(
            store.pool(),
            old.id,
            Utc::now().date_naive() - Duration::days(120),
        )
        .await;
        record(store.pool(), entry(alice, "claude", 1, 1))
            .await
            .unwrap();

        let removed = prune_logs(store.pool(), Utc::now() - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_logs")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn provider_breakdown_groups_by_provider() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = seed_user(store.pool(), "alice").await;
        record(store.pool(), entry(alice, "claude", 2, 0))
            .await
            .unwrap();
        record(store.pool(), entry(alice, "openai", 3, 0))
            .await
            .unwrap();

        let breakdown = provider_breakdown(store.pool(), Period::Today).await.unwrap();
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[0].provider, "claude");
        assert_eq!(breakdown[0].tokens_input, 2);
    }
}
