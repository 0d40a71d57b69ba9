use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;
use crate::error::HarvestError;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| HarvestError::Fatal(format!("database unavailable: {}", e)))
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    Ok(pool)
}

/// Timestamps are stored as Unix seconds.
pub fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub fn to_ts_opt(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_ts)
}

pub fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

pub fn from_ts_opt(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(from_ts)
}

/// Current time truncated to the stored precision.
pub fn now() -> DateTime<Utc> {
    from_ts(Utc::now().timestamp())
}
