//! PostgreSQL durable store.
//!
//! Enable with the `postgres` feature flag.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

use super::records::{CacheEntry, CacheStatus, QuotaRecord, UsageEvent};
use super::{Persistence, StorageResultExt, StoreError, StoreResult};
use crate::domain::{Feature, MonthKey, PathId, QuotaKey, StudentId, TokenUsage};

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub table_prefix: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            table_prefix: "pathgate_".to_string(),
        }
    }
}

impl PostgresConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::Storage {
                message: format!(
                    "Invalid table prefix '{}': only ASCII alphanumeric and underscore allowed",
                    prefix
                ),
            });
        }
        self.table_prefix = prefix;
        Ok(self)
    }

    fn quotas(&self) -> String {
        format!("{}quota_records", self.table_prefix)
    }

    fn entries(&self) -> String {
        format!("{}path_cache_entries", self.table_prefix)
    }

    fn events(&self) -> String {
        format!("{}usage_events", self.table_prefix)
    }
}

pub struct PostgresPersistence {
    pool: Arc<PgPool>,
    config: PostgresConfig,
}

impl PostgresPersistence {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            config: PostgresConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PostgresConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let quotas = self.config.quotas();
        let entries = self.config.entries();
        let events = self.config.events();

        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {quotas} (
                    student_id VARCHAR(255) NOT NULL,
                    feature VARCHAR(64) NOT NULL,
                    month DATE NOT NULL,
                    used_count INTEGER NOT NULL DEFAULT 0 CHECK (used_count >= 0),
                    quota_limit INTEGER NOT NULL CHECK (quota_limit >= 0),
                    reset_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (student_id, feature, month)
                )
                "#
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {entries} (
                    path_id UUID PRIMARY KEY,
                    student_id VARCHAR(255) NOT NULL,
                    generated_at TIMESTAMPTZ NOT NULL,
                    expires_at TIMESTAMPTZ NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    status_changed_at TIMESTAMPTZ,
                    recommendations JSONB NOT NULL,
                    reasoning TEXT NOT NULL,
                    tokens_in BIGINT NOT NULL,
                    tokens_out BIGINT NOT NULL,
                    cost_usd NUMERIC(20, 8) NOT NULL,
                    confidence REAL,
                    CHECK (expires_at > generated_at)
                )
                "#
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_{entries}_active \
                 ON {entries} (student_id) WHERE status = 'active'"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{entries}_expires \
                 ON {entries} (expires_at) WHERE status = 'active'"
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {events} (
                    event_id UUID PRIMARY KEY,
                    student_id VARCHAR(255) NOT NULL,
                    feature VARCHAR(64) NOT NULL,
                    occurred_at TIMESTAMPTZ NOT NULL,
                    tokens_in BIGINT NOT NULL,
                    tokens_out BIGINT NOT NULL,
                    cost_usd NUMERIC(20, 8) NOT NULL
                )
                "#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{events}_student \
                 ON {events} (student_id, feature, occurred_at)"
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{events}_time ON {events} (occurred_at)"),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&*self.pool).await?;
        }
        Ok(())
    }

    fn quota_from_row(row: &PgRow) -> StoreResult<QuotaRecord> {
        let feature: String = row.get("feature");
        let month: NaiveDate = row.get("month");
        Ok(QuotaRecord {
            student_id: StudentId::from(row.get::<String, _>("student_id")),
            feature: parse_feature(&feature)?,
            month: MonthKey::from(month),
            used_count: to_count(row.get("used_count"))?,
            limit: to_count(row.get("quota_limit"))?,
            reset_at: row.get("reset_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn entry_from_row(row: &PgRow) -> StoreResult<CacheEntry> {
        let status: String = row.get("status");
        Ok(CacheEntry {
            path_id: PathId::from(row.get::<Uuid, _>("path_id")),
            student_id: StudentId::from(row.get::<String, _>("student_id")),
            generated_at: row.get("generated_at"),
            expires_at: row.get("expires_at"),
            status: status
                .parse()
                .map_err(|message| StoreError::Corrupt { message })?,
            status_changed_at: row.get("status_changed_at"),
            recommendations: row.get("recommendations"),
            reasoning: row.get("reasoning"),
            usage: TokenUsage::new(
                to_tokens(row.get("tokens_in"))?,
                to_tokens(row.get("tokens_out"))?,
                row.get::<Decimal, _>("cost_usd"),
            ),
            confidence: row.get("confidence"),
        })
    }

    fn event_from_row(row: &PgRow) -> StoreResult<UsageEvent> {
        let feature: String = row.get("feature");
        Ok(UsageEvent {
            event_id: row.get("event_id"),
            student_id: StudentId::from(row.get::<String, _>("student_id")),
            feature: parse_feature(&feature)?,
            occurred_at: row.get("occurred_at"),
            tokens_in: to_tokens(row.get("tokens_in"))?,
            tokens_out: to_tokens(row.get("tokens_out"))?,
            cost_usd: row.get("cost_usd"),
        })
    }
}

fn parse_feature(raw: &str) -> StoreResult<Feature> {
    raw.parse().map_err(|e: crate::domain::UnknownFeature| StoreError::Corrupt {
        message: e.to_string(),
    })
}

fn to_count(raw: i32) -> StoreResult<u32> {
    u32::try_from(raw).map_err(|_| StoreError::Corrupt {
        message: format!("negative count {}", raw),
    })
}

fn to_tokens(raw: i64) -> StoreResult<u64> {
    u64::try_from(raw).map_err(|_| StoreError::Corrupt {
        message: format!("negative token count {}", raw),
    })
}

fn as_sql_count(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn as_sql_tokens(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

const QUOTA_COLUMNS: &str =
    "student_id, feature, month, used_count, quota_limit, reset_at, created_at, updated_at";

const ENTRY_COLUMNS: &str = "path_id, student_id, generated_at, expires_at, status, \
     status_changed_at, recommendations, reasoning, tokens_in, tokens_out, cost_usd, confidence";

#[async_trait]
impl Persistence for PostgresPersistence {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn ensure_quota_record(
        &self,
        key: &QuotaKey,
        limit: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<QuotaRecord> {
        let query = format!(
            r#"
            INSERT INTO {table} ({QUOTA_COLUMNS})
            VALUES ($1, $2, $3, 0, $4, $5, $6, $6)
            ON CONFLICT (student_id, feature, month) DO UPDATE
                SET student_id = EXCLUDED.student_id
            RETURNING {QUOTA_COLUMNS}
            "#,
            table = self.config.quotas()
        );

        let row = sqlx::query(&query)
            .bind(key.student_id.as_str())
            .bind(key.feature.as_str())
            .bind(key.month.first_day())
            .bind(as_sql_count(limit))
            .bind(key.resets_at())
            .bind(at)
            .fetch_one(&*self.pool)
            .await
            .storage_err_ctx("ensure quota record")?;

        Self::quota_from_row(&row)
    }

    async fn load_quota_record(&self, key: &QuotaKey) -> StoreResult<Option<QuotaRecord>> {
        let query = format!(
            "SELECT {QUOTA_COLUMNS} FROM {} WHERE student_id = $1 AND feature = $2 AND month = $3",
            self.config.quotas()
        );

        let row = sqlx::query(&query)
            .bind(key.student_id.as_str())
            .bind(key.feature.as_str())
            .bind(key.month.first_day())
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;

        row.as_ref().map(Self::quota_from_row).transpose()
    }

    async fn list_quota_records(&self, student_id: &StudentId) -> StoreResult<Vec<QuotaRecord>> {
        let query = format!(
            "SELECT {QUOTA_COLUMNS} FROM {} WHERE student_id = $1 ORDER BY month, feature",
            self.config.quotas()
        );

        let rows = sqlx::query(&query)
            .bind(student_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .storage_err()?;

        rows.iter().map(Self::quota_from_row).collect()
    }

    async fn merge_quota_usage(
        &self,
        key: &QuotaKey,
        observed: u32,
        limit: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<QuotaRecord> {
        let query = format!(
            r#"
            INSERT INTO {table} ({QUOTA_COLUMNS})
            VALUES ($1, $2, $3, LEAST($4, $5), $5, $6, $7, $7)
            ON CONFLICT (student_id, feature, month) DO UPDATE SET
                used_count = LEAST(GREATEST({table}.used_count, $4), $5),
                quota_limit = $5,
                updated_at = $7
            RETURNING {QUOTA_COLUMNS}
            "#,
            table = self.config.quotas()
        );

        let row = sqlx::query(&query)
            .bind(key.student_id.as_str())
            .bind(key.feature.as_str())
            .bind(key.month.first_day())
            .bind(as_sql_count(observed))
            .bind(as_sql_count(limit))
            .bind(key.resets_at())
            .bind(at)
            .fetch_one(&*self.pool)
            .await
            .storage_err_ctx("merge quota usage")?;

        Self::quota_from_row(&row)
    }

    async fn try_increment_quota(
        &self,
        key: &QuotaKey,
        limit: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<u32>> {
        // A fresh row starts at 1, so a zero limit must be rejected up front.
        if limit == 0 {
            return Ok(None);
        }

        let query = format!(
            r#"
            INSERT INTO {table} ({QUOTA_COLUMNS})
            VALUES ($1, $2, $3, 1, $4, $5, $6, $6)
            ON CONFLICT (student_id, feature, month) DO UPDATE SET
                used_count = {table}.used_count + 1,
                quota_limit = $4,
                updated_at = $6
            WHERE {table}.used_count < $4
            RETURNING used_count
            "#,
            table = self.config.quotas()
        );

        let row = sqlx::query(&query)
            .bind(key.student_id.as_str())
            .bind(key.feature.as_str())
            .bind(key.month.first_day())
            .bind(as_sql_count(limit))
            .bind(key.resets_at())
            .bind(at)
            .fetch_optional(&*self.pool)
            .await
            .storage_err_ctx("increment quota")?;

        row.map(|r| to_count(r.get("used_count"))).transpose()
    }

    async fn release_quota(&self, key: &QuotaKey, at: DateTime<Utc>) -> StoreResult<u32> {
        let query = format!(
            r#"
            UPDATE {} SET used_count = GREATEST(used_count - 1, 0), updated_at = $4
            WHERE student_id = $1 AND feature = $2 AND month = $3
            RETURNING used_count
            "#,
            self.config.quotas()
        );

        let row = sqlx::query(&query)
            .bind(key.student_id.as_str())
            .bind(key.feature.as_str())
            .bind(key.month.first_day())
            .bind(at)
            .fetch_optional(&*self.pool)
            .await
            .storage_err_ctx("release quota")?;

        match row {
            Some(r) => to_count(r.get("used_count")),
            None => Ok(0),
        }
    }

    async fn activate_cache_entry(&self, entry: &CacheEntry) -> StoreResult<Option<PathId>> {
        if entry.status != CacheStatus::Active {
            return Err(StoreError::InvalidTransition {
                path_id: entry.path_id,
                message: format!("cannot activate an entry with status {}", entry.status),
            });
        }

        let table = self.config.entries();
        let mut tx = self.pool.begin().await.storage_err_ctx("begin")?;

        // Serialize activations per student inside this transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(entry.student_id.as_str())
            .execute(&mut *tx)
            .await
            .storage_err()?;

        let superseded = sqlx::query(&format!(
            r#"
            UPDATE {table} SET status = 'superseded', status_changed_at = $2
            WHERE student_id = $1 AND status = 'active'
            RETURNING path_id
            "#
        ))
        .bind(entry.student_id.as_str())
        .bind(entry.generated_at)
        .fetch_optional(&mut *tx)
        .await
        .storage_err_ctx("supersede")?
        .map(|row| PathId::from(row.get::<Uuid, _>("path_id")));

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} ({ENTRY_COLUMNS})
            VALUES ($1, $2, $3, $4, 'active', NULL, $5, $6, $7, $8, $9, $10)
            "#
        ))
        .bind(entry.path_id.as_uuid())
        .bind(entry.student_id.as_str())
        .bind(entry.generated_at)
        .bind(entry.expires_at)
        .bind(&entry.recommendations)
        .bind(&entry.reasoning)
        .bind(as_sql_tokens(entry.usage.tokens_in))
        .bind(as_sql_tokens(entry.usage.tokens_out))
        .bind(entry.usage.cost_usd)
        .bind(entry.confidence)
        .execute(&mut *tx)
        .await
        .storage_err_ctx("insert cache entry")?;

        tx.commit().await.storage_err_ctx("commit")?;
        Ok(superseded)
    }

    async fn load_active_cache_entry(
        &self,
        student_id: &StudentId,
    ) -> StoreResult<Option<CacheEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM {} WHERE student_id = $1 AND status = 'active'",
            self.config.entries()
        );

        let row = sqlx::query(&query)
            .bind(student_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;

        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn load_cache_entry(&self, path_id: &PathId) -> StoreResult<Option<CacheEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM {} WHERE path_id = $1",
            self.config.entries()
        );

        let row = sqlx::query(&query)
            .bind(path_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;

        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn expire_cache_entry(
        &self,
        student_id: &StudentId,
        path_id: &PathId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let query = format!(
            r#"
            UPDATE {} SET status = 'expired', status_changed_at = $3
            WHERE student_id = $1 AND path_id = $2 AND status = 'active'
            "#,
            self.config.entries()
        );

        let result = sqlx::query(&query)
            .bind(student_id.as_str())
            .bind(path_id.as_uuid())
            .bind(at)
            .execute(&*self.pool)
            .await
            .storage_err_ctx("expire cache entry")?;

        Ok(result.rows_affected() > 0)
    }

    async fn expire_stale_cache_entries(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let query = format!(
            r#"
            UPDATE {} SET status = 'expired', status_changed_at = $1
            WHERE status = 'active' AND expires_at <= $1
            "#,
            self.config.entries()
        );

        let result = sqlx::query(&query)
            .bind(now)
            .execute(&*self.pool)
            .await
            .storage_err_ctx("expire stale entries")?;

        Ok(result.rows_affected() as usize)
    }

    async fn append_usage_event(&self, event: &UsageEvent) -> StoreResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (event_id, student_id, feature, occurred_at, tokens_in, tokens_out, cost_usd)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id) DO NOTHING
            "#,
            self.config.events()
        );

        sqlx::query(&query)
            .bind(event.event_id)
            .bind(event.student_id.as_str())
            .bind(event.feature.as_str())
            .bind(event.occurred_at)
            .bind(as_sql_tokens(event.tokens_in))
            .bind(as_sql_tokens(event.tokens_out))
            .bind(event.cost_usd)
            .execute(&*self.pool)
            .await
            .storage_err_ctx("append usage event")?;

        Ok(())
    }

    async fn usage_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEvent>> {
        let query = format!(
            r#"
            SELECT event_id, student_id, feature, occurred_at, tokens_in, tokens_out, cost_usd
            FROM {} WHERE occurred_at >= $1 AND occurred_at < $2
            ORDER BY occurred_at
            "#,
            self.config.events()
        );

        let rows = sqlx::query(&query)
            .bind(from)
            .bind(to)
            .fetch_all(&*self.pool)
            .await
            .storage_err()?;

        rows.iter().map(Self::event_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_use_prefix() {
        let config = PostgresConfig::default().prefix("lms_").unwrap();
        assert_eq!(config.quotas(), "lms_quota_records");
        assert_eq!(config.entries(), "lms_path_cache_entries");
        assert_eq!(config.events(), "lms_usage_events");
    }

    #[test]
    fn test_rejects_unsafe_prefix() {
        assert!(PostgresConfig::default().prefix("x; DROP TABLE").is_err());
    }

    #[test]
    fn test_count_conversions() {
        assert_eq!(to_count(3).unwrap(), 3);
        assert!(to_count(-1).is_err());
        assert_eq!(as_sql_count(u32::MAX), i32::MAX);
    }
}
