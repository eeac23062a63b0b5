use async_trait::async_trait;
use bytes::Bytes;
use sqlx::query;
use time::OffsetDateTime;

use crate::{
    application::repos::{LockAttempt, RepoError, RowLock, TierStore},
    domain::{
        entities::{CacheEntry, CacheKey, CacheRecord},
        types::{RecordSource, Tier},
    },
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct CacheEntryRow {
    cache_key: String,
    function: String,
    version: String,
    namespace: String,
    effort: f64,
    modified_at: OffsetDateTime,
    expires_hint: Option<OffsetDateTime>,
    value: Vec<u8>,
}

impl From<CacheEntryRow> for CacheEntry {
    fn from(row: CacheEntryRow) -> Self {
        Self {
            function: row.function,
            version: row.version,
            namespace: row.namespace,
            key: CacheKey::from_stored(row.cache_key),
            effort: row.effort,
            modified_at: row.modified_at,
            expires_hint: row.expires_hint,
            value: Bytes::from(row.value),
        }
    }
}

/// Durable metadata shown by `tierstash inspect`.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub entry: CacheEntry,
    pub locked_at: Option<OffsetDateTime>,
}

#[derive(sqlx::FromRow)]
struct StoredEntryRow {
    #[sqlx(flatten)]
    entry: CacheEntryRow,
    locked_at: Option<OffsetDateTime>,
}

impl PostgresRepositories {
    /// Full row for `key`, lock flag included.
    pub async fn fetch_entry(&self, key: &CacheKey) -> Result<Option<StoredEntry>, RepoError> {
        let row = sqlx::query_as::<_, StoredEntryRow>(
            r#"
            SELECT cache_key, function, version, namespace, effort,
                   modified_at, expires_hint, value, locked_at
            FROM cache_entries
            WHERE cache_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(|row| StoredEntry {
            entry: row.entry.into(),
            locked_at: row.locked_at,
        }))
    }
}

#[async_trait]
impl TierStore for PostgresRepositories {
    fn tier(&self) -> Tier {
        Tier::Durable
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>, RepoError> {
        let row = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            SELECT cache_key, function, version, namespace, effort,
                   modified_at, expires_hint, value
            FROM cache_entries
            WHERE cache_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(|row| CacheEntry::from(row).into_record(RecordSource::Durable)))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), RepoError> {
        query(
            r#"
            INSERT INTO cache_entries (
                cache_key, function, version, namespace, effort,
                modified_at, expires_hint, value
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (cache_key) DO UPDATE
            SET value = EXCLUDED.value,
                expires_hint = EXCLUDED.expires_hint,
                modified_at = EXCLUDED.modified_at,
                effort = EXCLUDED.effort
            "#,
        )
        .bind(entry.key.as_str())
        .bind(&entry.function)
        .bind(&entry.version)
        .bind(&entry.namespace)
        .bind(entry.effort)
        .bind(entry.modified_at)
        .bind(entry.expires_hint)
        .bind(entry.value.as_ref())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[async_trait]
impl RowLock for PostgresRepositories {
    async fn try_lock(&self, key: &CacheKey) -> Result<LockAttempt, RepoError> {
        let locked = query(
            r#"
            UPDATE cache_entries
            SET locked_at = now()
            WHERE cache_key = $1 AND locked_at IS NULL
            RETURNING cache_key
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if locked.is_some() {
            return Ok(LockAttempt::Acquired);
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM cache_entries WHERE cache_key = $1)",
        )
        .bind(key.as_str())
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(if exists {
            LockAttempt::Held
        } else {
            LockAttempt::NoRow
        })
    }

    async fn unlock(&self, key: &CacheKey) -> Result<(), RepoError> {
        query("UPDATE cache_entries SET locked_at = NULL WHERE cache_key = $1")
            .bind(key.as_str())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn clear_all_locks(&self) -> Result<u64, RepoError> {
        let result = query("UPDATE cache_entries SET locked_at = NULL WHERE locked_at IS NOT NULL")
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
