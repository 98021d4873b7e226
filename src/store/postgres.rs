//! Postgres-backed store.
//!
//! Maps the store interface onto three tables: a key-value table with an
//! optional expiry, an append-only list table and a set-membership table.
//! Blocking dequeues poll; the scheduler's result waits are coarse enough
//! that a short poll interval is fine.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::{Error, Result};
use crate::store::StateStore;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// [`StateStore`] over a shared Postgres instance.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and create the backing tables if they do not exist.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPool::connect(dsn)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS filament_kv (
                key TEXT PRIMARY KEY,
                value BYTEA NOT NULL,
                expires_at TIMESTAMPTZ
            )",
            "CREATE TABLE IF NOT EXISTS filament_list (
                id BIGSERIAL PRIMARY KEY,
                key TEXT NOT NULL,
                value BYTEA NOT NULL,
                expires_at TIMESTAMPTZ
            )",
            "CREATE INDEX IF NOT EXISTS filament_list_key_idx ON filament_list (key, id)",
            "CREATE TABLE IF NOT EXISTS filament_set (
                key TEXT NOT NULL,
                member TEXT NOT NULL,
                expires_at TIMESTAMPTZ,
                PRIMARY KEY (key, member)
            )",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Store(e.to_string()))?;
        }
        Ok(())
    }

    async fn try_dequeue(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "DELETE FROM filament_list
             WHERE id = (
                 SELECT id FROM filament_list
                 WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())
                 ORDER BY id
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING value",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO filament_set (key, member) VALUES ($1, $2)
             ON CONFLICT (key, member) DO UPDATE SET expires_at = NULL",
        )
        .bind(key)
        .bind(member)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        sqlx::query("DELETE FROM filament_set WHERE key = $1 AND member = $2")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT member FROM filament_set
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("member"))
            .collect())
    }

    async fn enqueue_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        sqlx::query("INSERT INTO filament_list (key, value) VALUES ($1, $2)")
            .bind(key)
            .bind(bytes)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    async fn dequeue_bytes(&self, key: &str, timeout_ms: u64) -> Result<Vec<u8>> {
        if timeout_ms == 0 {
            return self.try_dequeue(key).await?.ok_or(Error::NoResponse);
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(bytes) = self.try_dequeue(key).await? {
                return Ok(bytes);
            }
            if Instant::now() >= deadline {
                return Err(Error::NoResponse);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO filament_kv (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = $2, expires_at = NULL",
        )
        .bind(key)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let row = sqlx::query(
            "SELECT value FROM filament_kv
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;

        row.map(|r| r.get::<Vec<u8>, _>("value"))
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        for table in ["filament_kv", "filament_list", "filament_set"] {
            let sql = format!(
                "UPDATE {table} SET expires_at = now() + make_interval(secs => $2) WHERE key = $1"
            );
            sqlx::query(&sql)
                .bind(key)
                .bind(ttl_secs as f64)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Store(e.to_string()))?;
        }
        Ok(())
    }
}
