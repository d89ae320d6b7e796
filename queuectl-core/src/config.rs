use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;

/// Connection parameters for the on-disk SQLite store, passable across API
/// boundaries the way a Postgres `PoolConfig` would be.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_path: String,
    pub max_connections: Option<u32>,
    pub acquire_timeout_seconds: Option<u64>,
    pub busy_timeout_seconds: Option<u64>,
}

impl PoolConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            max_connections: None,
            acquire_timeout_seconds: None,
            busy_timeout_seconds: None,
        }
    }

    pub async fn connect(&self) -> Result<SqlitePool> {
        let connect_options = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(self.busy_timeout_seconds.unwrap_or(30)));

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(5))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ))
            .connect_with(connect_options)
            .await?;

        Ok(pool)
    }
}

/// Keys the core recognizes and their defaults, seeded into the `config`
/// table on first open if absent.
pub const DEFAULTS: &[(&str, &str)] = &[
    ("max_retries", "3"),
    ("backoff_base", "2"),
    ("worker_poll_interval", "2"),
    ("job_timeout", "300"),
];

pub fn default_for(key: &str) -> Option<&'static str> {
    DEFAULTS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Thin typed accessor over the store's `config` table. No caching: reads hit
/// the store directly, since the access rate (once per worker poll iteration)
/// is low enough that a cache would only add staleness risk.
#[derive(Clone)]
pub struct Config {
    pool: SqlitePool,
}

impl Config {
    /// Opens the config accessor, seeding any default key that is missing.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let config = Self { pool };
        config.seed_defaults().await?;
        Ok(config)
    }

    async fn seed_defaults(&self) -> Result<()> {
        for (key, value) in DEFAULTS {
            sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
                .bind(*key)
                .bind(*value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v).or_else(|| default_for(key).map(String::from)))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM config ORDER BY key")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn max_retries(&self) -> Result<i64> {
        self.get_i64("max_retries", 3).await
    }

    pub async fn backoff_base(&self) -> Result<i64> {
        self.get_i64("backoff_base", 2).await
    }

    pub async fn worker_poll_interval(&self) -> Result<u64> {
        self.get_i64("worker_poll_interval", 2).await.map(|v| v.max(0) as u64)
    }

    pub async fn job_timeout(&self) -> Result<i64> {
        self.get_i64("job_timeout", 300).await
    }

    async fn get_i64(&self, key: &str, fallback: i64) -> Result<i64> {
        match self.get(key).await? {
            Some(v) => Ok(v.parse().unwrap_or(fallback)),
            None => Ok(fallback),
        }
    }
}
