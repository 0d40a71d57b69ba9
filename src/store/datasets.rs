use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use harvester_core::models::VersionState;
use harvester_core::tasks::TaskMap;

use super::{from_json, to_json, Store};
use crate::config::DatasetConfig;
use crate::db::{self, from_ts, from_ts_opt, to_ts, to_ts_opt};
use crate::models::{Dataset, DatasetVersion, IndexRecord};

fn dataset_from_row(row: &SqliteRow) -> Result<Dataset> {
    let indexing: String = row.get("indexing");
    Ok(Dataset {
        id: row.get("id"),
        name: row.get("name"),
        is_harvested: row.get::<i64, _>("is_harvested") != 0,
        indexing: indexing.parse()?,
        created_at: from_ts(row.get("created_at")),
        modified_at: from_ts(row.get("modified_at")),
    })
}

fn version_from_row(row: &SqliteRow) -> Result<DatasetVersion> {
    let state: String = row.get("state");
    let pipeline: String = row.get("pipeline");
    let tasks: String = row.get("tasks");
    let historic: String = row.get("historic_sets");
    Ok(DatasetVersion {
        id: row.get("id"),
        dataset_id: row.get("dataset_id"),
        version: row.get("version"),
        state: state.parse()?,
        is_current: row.get::<i64, _>("is_current") != 0,
        is_index_promoted: row.get::<i64, _>("is_index_promoted") != 0,
        index_id: row.get("index_id"),
        pipeline: from_json(&pipeline)?,
        tasks: from_json(&tasks)?,
        historic_sets: from_json(&historic)?,
        retries: row.get::<i64, _>("retries") as u32,
        pending_at: from_ts_opt(row.get("pending_at")),
        finished_at: from_ts_opt(row.get("finished_at")),
        created_at: from_ts(row.get("created_at")),
        modified_at: from_ts(row.get("modified_at")),
    })
}

fn index_from_row(row: &SqliteRow) -> Result<IndexRecord> {
    let languages: String = row.get("languages");
    Ok(IndexRecord {
        id: row.get("id"),
        name: row.get("name"),
        dataset_id: row.get("dataset_id"),
        languages: from_json(&languages)?,
        error_count: row.get("error_count"),
        pushed_at: from_ts_opt(row.get("pushed_at")),
    })
}

impl Store {
    // ─── Datasets ────────────────────────────────────────────────────

    pub async fn upsert_dataset(&self, name: &str, config: &DatasetConfig) -> Result<Dataset> {
        let now = to_ts(db::now());
        sqlx::query(
            r#"
            INSERT INTO datasets (name, is_harvested, indexing, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                is_harvested = excluded.is_harvested,
                indexing = excluded.indexing,
                modified_at = excluded.modified_at
            "#,
        )
        .bind(name)
        .bind(config.is_harvested as i64)
        .bind(config.indexing.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_dataset(name)
            .await?
            .with_context(|| format!("dataset '{}' vanished after upsert", name))
    }

    pub async fn get_dataset(&self, name: &str) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    pub async fn get_dataset_by_id(&self, id: i64) -> Result<Dataset> {
        let row = sqlx::query("SELECT * FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("dataset {} not found", id))?;
        dataset_from_row(&row)
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT * FROM datasets ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dataset_from_row).collect()
    }

    // ─── Versions ────────────────────────────────────────────────────

    pub async fn create_version(
        &self,
        dataset_id: i64,
        version: &str,
        tasks: &TaskMap,
        historic_sets: &[i64],
    ) -> Result<DatasetVersion> {
        let now = to_ts(db::now());
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dataset_versions
                (dataset_id, version, state, tasks, historic_sets, pending_at, created_at, modified_at)
            VALUES (?, ?, 'building', ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(dataset_id)
        .bind(version)
        .bind(to_json(tasks)?)
        .bind(to_json(&historic_sets)?)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create version '{}'", version))?;

        self.get_version(id).await
    }

    pub async fn get_version(&self, id: i64) -> Result<DatasetVersion> {
        let row = sqlx::query("SELECT * FROM dataset_versions WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("dataset version {} not found", id))?;
        version_from_row(&row)
    }

    pub async fn find_version(
        &self,
        dataset_id: i64,
        version: &str,
    ) -> Result<Option<DatasetVersion>> {
        let row =
            sqlx::query("SELECT * FROM dataset_versions WHERE dataset_id = ? AND version = ?")
                .bind(dataset_id)
                .bind(version)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    pub async fn current_version(&self, dataset_id: i64) -> Result<Option<DatasetVersion>> {
        let row = sqlx::query(
            "SELECT * FROM dataset_versions WHERE dataset_id = ? AND is_current = 1",
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    /// The newest version that was indexed or promoted. Its sets are the
    /// history the next harvest reconciles against, which for `index_only`
    /// datasets is not the current version.
    pub async fn latest_successful_version(
        &self,
        dataset_id: i64,
    ) -> Result<Option<DatasetVersion>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM dataset_versions
            WHERE dataset_id = ? AND state IN (?, ?)
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(dataset_id)
        .bind(VersionState::Indexed.as_str())
        .bind(VersionState::Promoted.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    /// The newest version that has not reached a terminal state.
    pub async fn latest_unfinished_version(
        &self,
        dataset_id: i64,
    ) -> Result<Option<DatasetVersion>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM dataset_versions
            WHERE dataset_id = ? AND finished_at IS NULL
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    pub async fn list_versions(&self, dataset_id: i64) -> Result<Vec<DatasetVersion>> {
        let rows = sqlx::query("SELECT * FROM dataset_versions WHERE dataset_id = ? ORDER BY id")
            .bind(dataset_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(version_from_row).collect()
    }

    pub async fn update_version(&self, version: &DatasetVersion) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dataset_versions SET
                state = ?, is_index_promoted = ?, index_id = ?, pipeline = ?, tasks = ?,
                retries = ?, pending_at = ?, finished_at = ?, modified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(version.state.as_str())
        .bind(version.is_index_promoted as i64)
        .bind(version.index_id)
        .bind(to_json(&version.pipeline)?)
        .bind(to_json(&version.tasks)?)
        .bind(version.retries as i64)
        .bind(to_ts_opt(version.pending_at))
        .bind(to_ts_opt(version.finished_at))
        .bind(to_ts(db::now()))
        .bind(version.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_version_state(&self, id: i64, state: VersionState) -> Result<()> {
        sqlx::query("UPDATE dataset_versions SET state = ?, modified_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(to_ts(db::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Make one version current: clear every flag of the dataset, then set
    /// exactly one, in a single transaction.
    pub async fn set_current_version(&self, dataset_id: i64, version_id: i64) -> Result<()> {
        let now = to_ts(db::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE dataset_versions SET is_current = 0, modified_at = ? WHERE dataset_id = ? AND is_current = 1",
        )
        .bind(now)
        .bind(dataset_id)
        .execute(&mut *tx)
        .await?;
        let updated = sqlx::query(
            "UPDATE dataset_versions SET is_current = 1, modified_at = ? WHERE id = ? AND dataset_id = ?",
        )
        .bind(now)
        .bind(version_id)
        .bind(dataset_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            anyhow::bail!(
                "version {} does not belong to dataset {}",
                version_id,
                dataset_id
            );
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete a version with its sets, documents and bookkeeping rows.
    pub async fn delete_version(&self, version_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM process_results WHERE batch_id IN (
                SELECT b.id FROM batches b JOIN sets s ON s.id = b.set_id
                WHERE s.dataset_version_id = ?
            )
            "#,
        )
        .bind(version_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM batches WHERE set_id IN (SELECT id FROM sets WHERE dataset_version_id = ?)",
        )
        .bind(version_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM documents WHERE set_id IN (SELECT id FROM sets WHERE dataset_version_id = ?)",
        )
        .bind(version_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE harvest_states SET set_id = NULL WHERE set_id IN (SELECT id FROM sets WHERE dataset_version_id = ?)")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sets WHERE dataset_version_id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dataset_versions WHERE id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ─── Indices ─────────────────────────────────────────────────────

    pub async fn get_or_create_index(
        &self,
        name: &str,
        dataset_id: i64,
        languages: &[String],
    ) -> Result<IndexRecord> {
        let now = to_ts(db::now());
        sqlx::query(
            r#"
            INSERT INTO indices (name, dataset_id, languages, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                languages = excluded.languages,
                modified_at = excluded.modified_at
            "#,
        )
        .bind(name)
        .bind(dataset_id)
        .bind(to_json(&languages)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM indices WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        index_from_row(&row)
    }

    pub async fn get_index(&self, id: i64) -> Result<IndexRecord> {
        let row = sqlx::query("SELECT * FROM indices WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("index {} not found", id))?;
        index_from_row(&row)
    }

    pub async fn record_index_push(&self, id: i64, error_count: i64) -> Result<()> {
        let now = to_ts(db::now());
        sqlx::query(
            "UPDATE indices SET error_count = ?, pushed_at = ?, modified_at = ? WHERE id = ?",
        )
        .bind(error_count)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_index_errors(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE indices SET error_count = 0, modified_at = ? WHERE id = ?")
            .bind(to_ts(db::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of dataset versions pointing at an index.
    pub async fn index_reference_count(&self, index_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dataset_versions WHERE index_id = ?")
                .bind(index_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn delete_index_record(&self, index_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM indices WHERE id = ?")
            .bind(index_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
