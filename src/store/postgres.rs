//! Postgres-backed store.
//!
//! Every increment is a single `INSERT ... ON CONFLICT DO UPDATE` statement
//! with the arithmetic done by the database, so concurrent requests from
//! many processes are all counted.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

use super::{CounterStore, Outcome, QuotaUsageRecord, UsageStore};
use crate::error::Result;
use crate::ratelimit::{start_of_day, PeriodKey};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tollgate_counters (
        identity     TEXT        NOT NULL,
        period_key   TEXT        NOT NULL,
        period_start TIMESTAMPTZ NOT NULL,
        count        BIGINT      NOT NULL DEFAULT 0,
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (identity, period_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tollgate_usage (
        identity      TEXT   NOT NULL,
        date          DATE   NOT NULL,
        request_count BIGINT NOT NULL DEFAULT 0,
        success_count BIGINT NOT NULL DEFAULT 0,
        error_count   BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (identity, date)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS tollgate_usage_date_idx ON tollgate_usage (date)",
];

#[derive(Debug, FromRow)]
struct UsageRow {
    identity: String,
    date: NaiveDate,
    request_count: i64,
    success_count: i64,
    error_count: i64,
}

impl From<UsageRow> for QuotaUsageRecord {
    fn from(row: UsageRow) -> Self {
        Self {
            identity: row.identity,
            date: row.date,
            request_count: row.request_count.max(0) as u64,
            success_count: row.success_count.max(0) as u64,
            error_count: row.error_count.max(0) as u64,
        }
    }
}

fn outcome_increments(outcome: Outcome) -> (i64, i64) {
    match outcome {
        Outcome::Success => (1, 0),
        Outcome::Error => (0, 1),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// A store persisting counters in Postgres.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to `url` and make sure the tables exist.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self::from_pool(pool);
        store.ensure_schema().await?;
        info!(max_connections = max_connections, "Connected to Postgres counter store");
        Ok(store)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the counter tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for PgStore {
    async fn increment_and_get(
        &self,
        identity: &str,
        period: PeriodKey,
        amount: i64,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tollgate_counters (identity, period_key, period_start, count)
            VALUES ($1, $2, $3, GREATEST($4, 0))
            ON CONFLICT (identity, period_key) DO UPDATE SET
                count = GREATEST(tollgate_counters.count + $4, 0),
                updated_at = NOW()
            RETURNING count
            "#,
        )
        .bind(identity)
        .bind(period.to_storage_key())
        .bind(period.start())
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn get_count(&self, identity: &str, period: PeriodKey) -> Result<u64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM tollgate_counters WHERE identity = $1 AND period_key = $2",
        )
        .bind(identity)
        .bind(period.to_storage_key())
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn increment_if_below(
        &self,
        identity: &str,
        period: PeriodKey,
        amount: u64,
        limit: u64,
    ) -> Result<Option<u64>> {
        if amount > limit {
            return Ok(None);
        }
        // The update arm only fires when the WHERE holds; otherwise no row is
        // returned and the increment is refused.
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO tollgate_counters (identity, period_key, period_start, count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (identity, period_key) DO UPDATE SET
                count = tollgate_counters.count + $4,
                updated_at = NOW()
            WHERE tollgate_counters.count + $4 <= $5
            RETURNING count
            "#,
        )
        .bind(identity)
        .bind(period.to_storage_key())
        .bind(period.start())
        .bind(to_i64(amount))
        .bind(to_i64(limit))
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map(|c| c.max(0) as u64))
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn record_usage(
        &self,
        identity: &str,
        date: NaiveDate,
        outcome: Outcome,
    ) -> Result<QuotaUsageRecord> {
        let (success_inc, error_inc) = outcome_increments(outcome);
        let row: UsageRow = sqlx::query_as(
            r#"
            INSERT INTO tollgate_usage (identity, date, request_count, success_count, error_count)
            VALUES ($1, $2, 1, $3, $4)
            ON CONFLICT (identity, date) DO UPDATE SET
                request_count = tollgate_usage.request_count + 1,
                success_count = tollgate_usage.success_count + $3,
                error_count = tollgate_usage.error_count + $4
            RETURNING identity, date, request_count, success_count, error_count
            "#,
        )
        .bind(identity)
        .bind(date)
        .bind(success_inc)
        .bind(error_inc)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn reserve_request(
        &self,
        identity: &str,
        date: NaiveDate,
        limit: u64,
    ) -> Result<Option<u64>> {
        if limit == 0 {
            return Ok(None);
        }
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO tollgate_usage (identity, date, request_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (identity, date) DO UPDATE SET
                request_count = tollgate_usage.request_count + 1
            WHERE tollgate_usage.request_count < $3
            RETURNING request_count
            "#,
        )
        .bind(identity)
        .bind(date)
        .bind(to_i64(limit))
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map(|c| c.max(0) as u64))
    }

    async fn release_request(&self, identity: &str, date: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tollgate_usage
            SET request_count = GREATEST(request_count - 1, 0)
            WHERE identity = $1 AND date = $2
            "#,
        )
        .bind(identity)
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        identity: &str,
        date: NaiveDate,
        outcome: Outcome,
    ) -> Result<QuotaUsageRecord> {
        let (success_inc, error_inc) = outcome_increments(outcome);
        let row: UsageRow = sqlx::query_as(
            r#"
            INSERT INTO tollgate_usage (identity, date, success_count, error_count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (identity, date) DO UPDATE SET
                success_count = tollgate_usage.success_count + $3,
                error_count = tollgate_usage.error_count + $4
            RETURNING identity, date, request_count, success_count, error_count
            "#,
        )
        .bind(identity)
        .bind(date)
        .bind(success_inc)
        .bind(error_inc)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn usage(&self, identity: &str, date: NaiveDate) -> Result<Option<QuotaUsageRecord>> {
        let row: Option<UsageRow> = sqlx::query_as(
            r#"
            SELECT identity, date, request_count, success_count, error_count
            FROM tollgate_usage
            WHERE identity = $1 AND date = $2
            "#,
        )
        .bind(identity)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn usage_range(
        &self,
        identity: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<QuotaUsageRecord>> {
        let rows: Vec<UsageRow> = sqlx::query_as(
            r#"
            SELECT identity, date, request_count, success_count, error_count
            FROM tollgate_usage
            WHERE identity = $1 AND date >= $2 AND date <= $3
            ORDER BY date DESC
            "#,
        )
        .bind(identity)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn active_usage(&self, date: NaiveDate) -> Result<Vec<QuotaUsageRecord>> {
        let rows: Vec<UsageRow> = sqlx::query_as(
            r#"
            SELECT identity, date, request_count, success_count, error_count
            FROM tollgate_usage
            WHERE date = $1 AND request_count > 0
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn purge_before(&self, date: NaiveDate) -> Result<u64> {
        let counters = sqlx::query("DELETE FROM tollgate_counters WHERE period_start < $1")
            .bind(start_of_day(date))
            .execute(&self.pool)
            .await?
            .rows_affected();
        let usage = sqlx::query("DELETE FROM tollgate_usage WHERE date < $1")
            .bind(date)
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(cutoff = %date, counters = counters, usage = usage, "Purged expired counters");
        Ok(counters + usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    // Needs a live database: DATABASE_URL=postgres://... cargo test --features postgres -- --ignored
    async fn connect() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(PgStore::connect(&url, 8).await.unwrap())
    }

    fn unique_identity() -> String {
        format!("ip:test-{}", Uuid::new_v4())
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn test_increment_if_below_never_overshoots() {
        let Some(store) = connect().await else {
            return;
        };
        let store = Arc::new(store);
        let identity = unique_identity();
        let period = PeriodKey::Day(day());

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                let identity = identity.clone();
                tokio::spawn(async move {
                    store.increment_if_below(&identity, period, 1, 20).await.unwrap()
                })
            })
            .collect();
        let granted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();

        assert_eq!(granted, 20);
        assert_eq!(store.get_count(&identity, period).await.unwrap(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn test_reserve_request_never_overshoots() {
        let Some(store) = connect().await else {
            return;
        };
        let store = Arc::new(store);
        let identity = unique_identity();

        let tasks: Vec<_> = (0..60)
            .map(|_| {
                let store = store.clone();
                let identity = identity.clone();
                tokio::spawn(async move { store.reserve_request(&identity, day(), 25).await.unwrap() })
            })
            .collect();
        let granted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();

        assert_eq!(granted, 25);
        let usage = store.usage(&identity, day()).await.unwrap().unwrap();
        assert_eq!(usage.request_count, 25);

        store.release_request(&identity, day()).await.unwrap();
        assert_eq!(store.reserve_request(&identity, day(), 25).await.unwrap(), Some(25));
    }
}
