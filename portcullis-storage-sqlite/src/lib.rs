//! SQLite counter store
//!
//! The durable fallback used when no fast primary store is configured. Data is
//! spread across three tables (plain values, windowed counters and set
//! members), each row carrying millisecond `expires_at` and `updated_at`
//! stamps taken from the injected clock. Expired rows are invisible to reads
//! and are physically removed by [`CounterStore::purge_expired`].
//!
//! Windowed increments and set-if-absent are single UPSERT statements, so they
//! stay atomic across every process sharing the database file.
//!
//! # Example
//!
//! ```rust,ignore
//! use portcullis_core::clock::system_clock;
//! use portcullis_storage_sqlite::SqliteCounterStore;
//!
//! let store = SqliteCounterStore::connect("sqlite://portcullis.db?mode=rwc", system_clock()).await?;
//! store.migrate().await?;
//! ```
pub mod migrations;

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use portcullis_core::{
    Error,
    clock::Clock,
    error::StorageError,
    storage::{CounterSnapshot, CounterStore, StoreKind},
};
use portcullis_migration::MigrationManager;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

use crate::migrations::SqliteMigrationManager;

/// Map a sqlx error into the portcullis taxonomy.
///
/// Connection-level failures mean the store is unreachable; anything the
/// database itself rejected is a database error.
pub fn map_sqlx_error(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => StorageError::Unavailable(e.to_string()).into(),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Constraint(db.to_string()).into()
        }
        other => StorageError::Database(other.to_string()).into(),
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {millis}")).into())
}

fn snapshot(count: i64, window_start: i64, updated_at: i64) -> Result<CounterSnapshot, Error> {
    Ok(CounterSnapshot {
        count: u32::try_from(count).unwrap_or(u32::MAX),
        window_start: from_millis(window_start)?,
        last_updated: from_millis(updated_at)?,
    })
}

/// Escape `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'` pattern.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

pub struct SqliteCounterStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteCounterStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Open a pool for `database_url`.
    pub async fn connect(database_url: &str, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool, clock))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Durable
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        ttl: Duration,
    ) -> Result<CounterSnapshot, Error> {
        let now = self.now_millis();
        let (count, window_start, updated_at): (i64, i64, i64) = sqlx::query_as(
            r#"
            INSERT INTO counters (key, count, window_start, updated_at, expires_at)
            VALUES (?1, 1, ?2, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                count = CASE
                    WHEN counters.expires_at > ?2 AND ?2 - counters.window_start < ?4
                    THEN counters.count + 1
                    ELSE 1
                END,
                window_start = CASE
                    WHEN counters.expires_at > ?2 AND ?2 - counters.window_start < ?4
                    THEN counters.window_start
                    ELSE ?2
                END,
                updated_at = ?2,
                expires_at = ?3
            RETURNING count, window_start, updated_at
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(now.saturating_add(ttl.num_milliseconds()))
        .bind(window.num_milliseconds())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        snapshot(count, window_start, updated_at)
    }

    async fn counter(&self, key: &str) -> Result<Option<CounterSnapshot>, Error> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT count, window_start, updated_at FROM counters WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(self.now_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|(count, window_start, updated_at)| snapshot(count, window_start, updated_at))
            .transpose()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        sqlx::query_scalar("SELECT value FROM kv_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(self.now_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let now = self.now_millis();
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now.saturating_add(ttl.num_milliseconds()))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        let now = self.now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            WHERE kv_entries.expires_at <= excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now.saturating_add(ttl.num_milliseconds()))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        let now = self.now_millis();
        let result = sqlx::query(
            "UPDATE kv_entries SET value = ?, expires_at = ?, updated_at = ? WHERE key = ? AND expires_at > ?",
        )
        .bind(value)
        .bind(now.saturating_add(ttl.num_milliseconds()))
        .bind(now)
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let now = self.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let mut expiries: Vec<i64> = Vec::new();
        for statement in [
            "DELETE FROM kv_entries WHERE key = ? RETURNING expires_at",
            "DELETE FROM counters WHERE key = ? RETURNING expires_at",
            "DELETE FROM set_members WHERE key = ? RETURNING expires_at",
        ] {
            let removed: Vec<i64> = sqlx::query_scalar(statement)
                .bind(key)
                .fetch_all(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            expiries.extend(removed);
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(expiries.into_iter().any(|expires_at| expires_at > now))
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), Error> {
        let now = self.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query("DELETE FROM set_members WHERE key = ? AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(expires_at) FROM set_members WHERE key = ?")
                .bind(key)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        let expires_at = current
            .unwrap_or(i64::MIN)
            .max(now.saturating_add(ttl.num_milliseconds()));

        sqlx::query(
            r#"
            INSERT INTO set_members (key, member, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key, member) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(member)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("UPDATE set_members SET expires_at = ?, updated_at = ? WHERE key = ?")
            .bind(expires_at)
            .bind(now)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, Error> {
        let removed: Option<i64> = sqlx::query_scalar(
            "DELETE FROM set_members WHERE key = ? AND member = ? RETURNING expires_at",
        )
        .bind(key)
        .bind(member)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(removed.is_some_and(|expires_at| expires_at > self.now_millis()))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, Error> {
        sqlx::query_scalar(
            "SELECT member FROM set_members WHERE key = ? AND expires_at > ? ORDER BY member",
        )
        .bind(key)
        .bind(self.now_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        sqlx::query_scalar(
            r#"
            SELECT key FROM kv_entries WHERE key LIKE ?1 ESCAPE '\' AND expires_at > ?2
            UNION
            SELECT key FROM counters WHERE key LIKE ?1 ESCAPE '\' AND expires_at > ?2
            UNION
            SELECT key FROM set_members WHERE key LIKE ?1 ESCAPE '\' AND expires_at > ?2
            ORDER BY key
            "#,
        )
        .bind(like_prefix(prefix))
        .bind(self.now_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let cutoff = cutoff.timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let mut removed = 0;
        for statement in [
            "DELETE FROM kv_entries WHERE updated_at < ?",
            "DELETE FROM counters WHERE updated_at < ?",
        ] {
            removed += sqlx::query(statement)
                .bind(cutoff)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected();
        }

        let set_keys: Vec<String> =
            sqlx::query_scalar("DELETE FROM set_members WHERE updated_at < ? RETURNING key")
                .bind(cutoff)
                .fetch_all(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        removed += set_keys.into_iter().collect::<HashSet<_>>().len() as u64;

        tx.commit().await.map_err(map_sqlx_error)?;
        tracing::debug!(removed, cutoff, "Expired SQLite store entries");
        Ok(removed)
    }

    async fn purge_expired(&self, prefix: &str) -> Result<u64, Error> {
        let now = self.now_millis();
        let pattern = like_prefix(prefix);
        let mut removed = 0;
        for statement in [
            r"DELETE FROM kv_entries WHERE key LIKE ? ESCAPE '\' AND expires_at <= ?",
            r"DELETE FROM counters WHERE key LIKE ? ESCAPE '\' AND expires_at <= ?",
            r"DELETE FROM set_members WHERE key LIKE ? ESCAPE '\' AND expires_at <= ?",
        ] {
            removed += sqlx::query(statement)
                .bind(&pattern)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected();
        }
        if removed > 0 {
            tracing::debug!(removed, "Purged expired SQLite store rows");
        }
        Ok(removed)
    }

    async fn migrate(&self) -> Result<(), Error> {
        let manager = SqliteMigrationManager::new(self.pool.clone());
        manager.initialize().await?;
        manager.up(&migrations::all()).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}
