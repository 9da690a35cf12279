//! SQLite-backed durable key-value store.
//!
//! One table of JSON records keyed by namespaced strings. The physical
//! encoding is an implementation choice; records stay self-describing via
//! their schema version tags.

use crate::domain::ports::StateStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (and create if needed) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .context("invalid sqlite path")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("opening sqlite store")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database, used by tests exercising the sqlx path.
    pub async fn open_ephemeral() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("opening ephemeral sqlite store")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_records (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating kv_records table")?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let serialized = serde_json::to_string(&value)?;
        sqlx::query(
            "INSERT INTO kv_records (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
        )
        .bind(key)
        .bind(serialized)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing {key}"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM kv_records WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading {key}"))?;
        row.map(|r| {
            let raw: String = r.get("value");
            serde_json::from_str(&raw).with_context(|| format!("decoding {key}"))
        })
        .transpose()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_records WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting {key}"))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            "SELECT key, value FROM kv_records WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing {prefix}"))?;

        rows.into_iter()
            .map(|r| {
                let key: String = r.get("key");
                let raw: String = r.get("value");
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("decoding {key}"))?;
                Ok((key, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn roundtrip_and_upsert() {
        let store = SqliteStateStore::open_ephemeral().await.unwrap();
        store
            .put("drawdown/peak", json!({"schema_version": 1, "peak": "120000"}))
            .await
            .unwrap();
        store
            .put("drawdown/peak", json!({"schema_version": 1, "peak": "125000"}))
            .await
            .unwrap();

        let value = store.get("drawdown/peak").await.unwrap().unwrap();
        assert_eq!(value["peak"], "125000");
    }

    #[tokio::test]
    async fn list_respects_namespaces() {
        let store = SqliteStateStore::open_ephemeral().await.unwrap();
        store.put("positions/b", json!(2)).await.unwrap();
        store.put("positions/a", json!(1)).await.unwrap();
        store.put("performance/cumulative", json!(3)).await.unwrap();

        let positions = store.list("positions/").await.unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].0, "positions/a");

        let all = store.list("").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStateStore::open(&path).await.unwrap();
            store
                .put("performance/cumulative", json!({"trades": 7}))
                .await
                .unwrap();
        }
        let store = SqliteStateStore::open(&path).await.unwrap();
        let value = store.get("performance/cumulative").await.unwrap().unwrap();
        assert_eq!(value["trades"], 7);
    }
}
