use anyhow::Result;
use sqlx::Row;

use super::Store;
use crate::db::{self, from_ts, from_ts_opt, to_ts};
use crate::models::{Batch, ProcessResult};

impl Store {
    pub async fn create_batch(&self, set_id: i64, task: &str) -> Result<Batch> {
        let now = db::now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO batches (set_id, task, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(set_id)
        .bind(task)
        .bind(to_ts(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(Batch {
            id,
            set_id,
            task: task.to_string(),
            created_at: now,
            finished_at: None,
        })
    }

    pub async fn add_process_result(
        &self,
        batch_id: i64,
        document_id: i64,
        resource_id: Option<i64>,
    ) -> Result<ProcessResult> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO process_results (batch_id, document_id, resource_id, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(batch_id)
        .bind(document_id)
        .bind(resource_id)
        .bind(to_ts(db::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(ProcessResult {
            id,
            batch_id,
            document_id,
            resource_id,
        })
    }

    pub async fn list_process_results(&self, batch_id: i64) -> Result<Vec<ProcessResult>> {
        let rows = sqlx::query("SELECT * FROM process_results WHERE batch_id = ? ORDER BY id")
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| ProcessResult {
                id: row.get("id"),
                batch_id: row.get("batch_id"),
                document_id: row.get("document_id"),
                resource_id: row.get("resource_id"),
            })
            .collect())
    }

    /// Close a batch. Synchronous batches drop their process results;
    /// asynchronous ones keep them for bookkeeping.
    pub async fn finish_batch(&self, batch_id: i64, keep_results: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !keep_results {
            sqlx::query("DELETE FROM process_results WHERE batch_id = ?")
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE batches SET finished_at = ? WHERE id = ?")
            .bind(to_ts(db::now()))
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_batches(&self, set_id: i64) -> Result<Vec<Batch>> {
        let rows = sqlx::query("SELECT * FROM batches WHERE set_id = ? ORDER BY id")
            .bind(set_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Batch {
                id: row.get("id"),
                set_id: row.get("set_id"),
                task: row.get("task"),
                created_at: from_ts(row.get("created_at")),
                finished_at: from_ts_opt(row.get("finished_at")),
            })
            .collect())
    }
}
