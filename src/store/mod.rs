//! SQLite persistence for datasets, versions, sets, documents, harvest
//! states, cached resources and pipeline batches.
//!
//! [`Store`] wraps a [`SqlitePool`]. Queries are grouped by record type in
//! the submodules; JSON columns (`pipeline`, `tasks`, `properties`, …) are
//! stored as TEXT and decoded into typed views when read.

mod batches;
mod datasets;
mod documents;
mod harvest_states;
mod locks;
mod resources;
mod sets;

pub use documents::DocumentFilter;
pub use locks::LockGuard;
pub use sets::SetCounts;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::migrate;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode JSON column")
}

pub(crate) fn from_json<T: DeserializeOwned + Default>(raw: &str) -> Result<T> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).with_context(|| format!("Failed to decode JSON column: {}", raw))
}
