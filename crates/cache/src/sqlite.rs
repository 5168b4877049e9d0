//! SQLite list store.
//!
//! Two tables:
//! - `cache_keys` — one row per list with its absolute expiry (unix millis)
//! - `cache_values` — list elements, ordered by an autoincrement id
//!
//! `push_trim_expire` runs inside one transaction, so the append, the TTL
//! refresh and the head trim land together or not at all.

use async_trait::async_trait;
use chatline_core::cache::{ListStore, resolve_range};
use chatline_core::error::CacheError;
use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::debug;

/// A list store sharing the application's SQLite pool.
pub struct SqliteListStore {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn unavailable(what: &str, e: sqlx::Error) -> CacheError {
    CacheError::Unavailable(format!("{what}: {e}"))
}

impl SqliteListStore {
    /// Wrap an existing pool and create the cache tables if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, CacheError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_keys (
                key         TEXT PRIMARY KEY NOT NULL,
                expires_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("cache_keys table", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_values (
                id     INTEGER PRIMARY KEY AUTOINCREMENT,
                key    TEXT NOT NULL,
                value  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("cache_values table", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_values_key ON cache_values(key, id)")
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("cache_values index", e))?;

        debug!("SQLite cache migrations complete");
        Ok(())
    }

    /// Expiry of `key` if it exists and has not lapsed.
    async fn live_expiry(conn: &mut SqliteConnection, key: &str) -> Result<Option<i64>, CacheError> {
        let row = sqlx::query("SELECT expires_at FROM cache_keys WHERE key = ?1")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| unavailable("expiry lookup", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at: i64 = row
            .try_get("expires_at")
            .map_err(|e| unavailable("expires_at column", e))?;
        Ok((now_ms() < expires_at).then_some(expires_at))
    }

    async fn remove_key(conn: &mut SqliteConnection, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM cache_values WHERE key = ?1")
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(|e| unavailable("delete values", e))?;
        sqlx::query("DELETE FROM cache_keys WHERE key = ?1")
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(|e| unavailable("delete key", e))?;
        Ok(())
    }

    async fn live_len(conn: &mut SqliteConnection, key: &str) -> Result<usize, CacheError> {
        if Self::live_expiry(conn, key).await?.is_none() {
            return Ok(0);
        }
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM cache_values WHERE key = ?1")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| unavailable("COUNT", e))?;
        let cnt: i64 = row.try_get("cnt").map_err(|e| unavailable("cnt column", e))?;
        Ok(cnt as usize)
    }
}

#[async_trait]
impl ListStore for SqliteListStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn push_trim_expire(
        &self,
        key: &str,
        values: Vec<String>,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| unavailable("begin", e))?;

        if Self::live_expiry(&mut tx, key).await?.is_none() {
            Self::remove_key(&mut tx, key).await?;
        }

        for value in &values {
            sqlx::query("INSERT INTO cache_values (key, value) VALUES (?1, ?2)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(|e| unavailable("INSERT value", e))?;
        }

        sqlx::query(
            r#"
            INSERT INTO cache_keys (key, expires_at) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(now_ms().saturating_add(ttl_ms(ttl)))
        .execute(&mut *tx)
        .await
        .map_err(|e| unavailable("refresh expiry", e))?;

        if max_len > 0 {
            sqlx::query(
                r#"
                DELETE FROM cache_values
                WHERE key = ?1 AND id NOT IN (
                    SELECT id FROM cache_values WHERE key = ?1 ORDER BY id DESC LIMIT ?2
                )
                "#,
            )
            .bind(key)
            .bind(max_len as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| unavailable("trim", e))?;
        }

        tx.commit().await.map_err(|e| unavailable("commit", e))?;
        debug!(key, pushed = values.len(), "Cache list appended");
        Ok(())
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CacheError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| unavailable("acquire", e))?;

        let len = Self::live_len(&mut conn, key).await?;
        let Some((from, to)) = resolve_range(len, start, stop) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT value FROM cache_values WHERE key = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
        )
        .bind(key)
        .bind((to - from + 1) as i64)
        .bind(from as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| unavailable("range", e))?;

        rows.iter()
            .map(|r| r.try_get("value").map_err(|e| unavailable("value column", e)))
            .collect()
    }

    async fn len(&self, key: &str) -> Result<usize, CacheError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| unavailable("acquire", e))?;
        Self::live_len(&mut conn, key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| unavailable("acquire", e))?;
        Ok(Self::live_expiry(&mut conn, key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| unavailable("begin", e))?;
        Self::remove_key(&mut tx, key).await?;
        tx.commit().await.map_err(|e| unavailable("commit", e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let result = sqlx::query("UPDATE cache_keys SET expires_at = ?2 WHERE key = ?1 AND expires_at > ?3")
            .bind(key)
            .bind(now_ms().saturating_add(ttl_ms(ttl)))
            .bind(now_ms())
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("expire", e))?;
        Ok(result.rows_affected() > 0)
    }
}
