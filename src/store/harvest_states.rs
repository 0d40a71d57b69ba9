use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::Store;
use crate::db::{self, from_ts, from_ts_opt, to_ts, to_ts_opt};
use crate::models::HarvestState;

fn state_from_row(row: &SqliteRow) -> HarvestState {
    HarvestState {
        id: row.get("id"),
        dataset_id: row.get("dataset_id"),
        source: row.get("source"),
        entity: row.get("entity"),
        set_specification: row.get("set_specification"),
        set_id: row.get("set_id"),
        harvested_at: from_ts_opt(row.get("harvested_at")),
        pending_harvested_at: from_ts_opt(row.get("pending_harvested_at")),
        purge_after: from_ts_opt(row.get("purge_after")),
        created_at: from_ts(row.get("created_at")),
        modified_at: from_ts(row.get("modified_at")),
    }
}

impl Store {
    pub async fn upsert_harvest_state(
        &self,
        dataset_id: i64,
        source: &str,
        entity: &str,
        set_specification: &str,
    ) -> Result<HarvestState> {
        let now = to_ts(db::now());
        sqlx::query(
            r#"
            INSERT INTO harvest_states
                (dataset_id, source, entity, set_specification, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(dataset_id, source, entity, set_specification) DO NOTHING
            "#,
        )
        .bind(dataset_id)
        .bind(source)
        .bind(entity)
        .bind(set_specification)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT * FROM harvest_states
            WHERE dataset_id = ? AND source = ? AND entity = ? AND set_specification = ?
            "#,
        )
        .bind(dataset_id)
        .bind(source)
        .bind(entity)
        .bind(set_specification)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("harvest state {}:{} vanished after upsert", source, entity))?;
        Ok(state_from_row(&row))
    }

    pub async fn list_harvest_states(&self, dataset_id: i64) -> Result<Vec<HarvestState>> {
        let rows = sqlx::query("SELECT * FROM harvest_states WHERE dataset_id = ? ORDER BY id")
            .bind(dataset_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(state_from_row).collect())
    }

    pub async fn update_harvest_state(&self, state: &HarvestState) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE harvest_states SET
                set_id = ?, harvested_at = ?, pending_harvested_at = ?, purge_after = ?,
                modified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.set_id)
        .bind(to_ts_opt(state.harvested_at))
        .bind(to_ts_opt(state.pending_harvested_at))
        .bind(to_ts_opt(state.purge_after))
        .bind(to_ts(db::now()))
        .bind(state.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance `harvested_at` to what the last harvest reported. Called
    /// only after the version built from it was promoted or indexed.
    pub async fn commit_harvested_at(&self, dataset_id: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE harvest_states SET
                harvested_at = pending_harvested_at,
                pending_harvested_at = NULL,
                modified_at = ?
            WHERE dataset_id = ? AND pending_harvested_at IS NOT NULL
            "#,
        )
        .bind(to_ts(db::now()))
        .bind(dataset_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
