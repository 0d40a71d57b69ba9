use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use harvester_core::models::{DeletePolicy, DocumentState};
use harvester_core::tasks::TaskMap;

use super::{from_json, to_json, Store};
use crate::db::{self, from_ts, from_ts_opt, to_ts, to_ts_opt};
use crate::models::Set;

fn set_from_row(row: &SqliteRow) -> Result<Set> {
    let policy: String = row.get("delete_policy");
    let pipeline: String = row.get("pipeline");
    let tasks: String = row.get("tasks");
    Ok(Set {
        id: row.get("id"),
        dataset_version_id: row.get("dataset_version_id"),
        name: row.get("name"),
        entity: row.get("entity"),
        identifier: row.get("identifier"),
        delete_policy: policy.parse()?,
        pipeline: from_json(&pipeline)?,
        tasks: from_json(&tasks)?,
        retries: row.get::<i64, _>("retries") as u32,
        pending_at: from_ts_opt(row.get("pending_at")),
        finished_at: from_ts_opt(row.get("finished_at")),
        created_at: from_ts(row.get("created_at")),
        modified_at: from_ts(row.get("modified_at")),
    })
}

/// Per-state document counts of one set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetCounts {
    pub active: i64,
    pub deleted: i64,
    pub inactive: i64,
    pub skipped: i64,
    pub pending: i64,
}

impl SetCounts {
    pub fn total(&self) -> i64 {
        self.active + self.deleted + self.inactive + self.skipped
    }
}

impl Store {
    /// Create a set, or return the existing one with the same name.
    pub async fn create_set(
        &self,
        dataset_version_id: i64,
        name: &str,
        entity: &str,
        identifier: &str,
        delete_policy: DeletePolicy,
        tasks: &TaskMap,
    ) -> Result<Set> {
        let now = to_ts(db::now());
        sqlx::query(
            r#"
            INSERT INTO sets
                (dataset_version_id, name, entity, identifier, delete_policy, tasks,
                 pending_at, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dataset_version_id, name) DO NOTHING
            "#,
        )
        .bind(dataset_version_id)
        .bind(name)
        .bind(entity)
        .bind(identifier)
        .bind(delete_policy.as_str())
        .bind(to_json(tasks)?)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_set(dataset_version_id, name)
            .await?
            .with_context(|| format!("set '{}' vanished after insert", name))
    }

    pub async fn get_set(&self, id: i64) -> Result<Set> {
        let row = sqlx::query("SELECT * FROM sets WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("set {} not found", id))?;
        set_from_row(&row)
    }

    pub async fn find_set(&self, dataset_version_id: i64, name: &str) -> Result<Option<Set>> {
        let row = sqlx::query("SELECT * FROM sets WHERE dataset_version_id = ? AND name = ?")
            .bind(dataset_version_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(set_from_row).transpose()
    }

    pub async fn list_sets(&self, dataset_version_id: i64) -> Result<Vec<Set>> {
        let rows = sqlx::query("SELECT * FROM sets WHERE dataset_version_id = ? ORDER BY id")
            .bind(dataset_version_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(set_from_row).collect()
    }

    pub async fn update_set(&self, set: &Set) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sets SET
                pipeline = ?, tasks = ?, retries = ?, pending_at = ?, finished_at = ?,
                modified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to_json(&set.pipeline)?)
        .bind(to_json(&set.tasks)?)
        .bind(set.retries as i64)
        .bind(to_ts_opt(set.pending_at))
        .bind(to_ts_opt(set.finished_at))
        .bind(to_ts(db::now()))
        .bind(set.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_counts(&self, set_id: i64) -> Result<SetCounts> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS n,
                   SUM(CASE WHEN pending_at IS NOT NULL AND finished_at IS NULL THEN 1 ELSE 0 END) AS pending
            FROM documents WHERE set_id = ? GROUP BY state
            "#,
        )
        .bind(set_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = SetCounts::default();
        for row in &rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            counts.pending += row.get::<i64, _>("pending");
            match state.parse::<DocumentState>()? {
                DocumentState::Active => counts.active = n,
                DocumentState::Deleted => counts.deleted = n,
                DocumentState::Inactive => counts.inactive = n,
                DocumentState::Skipped => counts.skipped = n,
            }
        }
        Ok(counts)
    }
}
