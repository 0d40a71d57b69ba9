use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{to_json, Store};
use crate::db::{self, from_ts, from_ts_opt, to_ts, to_ts_opt};
use crate::models::Resource;

fn resource_from_row(row: &SqliteRow) -> Result<Resource> {
    let request: String = row.get("request");
    let head: String = row.get("head");
    Ok(Resource {
        id: row.get("id"),
        kind: row.get("kind"),
        uri: row.get("uri"),
        data_hash: row.get("data_hash"),
        method: row.get("method"),
        request: serde_json::from_str(&request).context("Failed to decode resource request")?,
        head: serde_json::from_str(&head).context("Failed to decode resource head")?,
        body: row.get("body"),
        status: row.get::<i64, _>("status") as u16,
        is_extracted: row.get::<i64, _>("is_extracted") != 0,
        since: from_ts(row.get("since")),
        purge_at: from_ts_opt(row.get("purge_at")),
        created_at: from_ts(row.get("created_at")),
        modified_at: from_ts(row.get("modified_at")),
    })
}

impl Store {
    pub async fn find_resource(
        &self,
        kind: &str,
        uri: &str,
        data_hash: &str,
    ) -> Result<Option<Resource>> {
        let row = sqlx::query("SELECT * FROM resources WHERE kind = ? AND uri = ? AND data_hash = ?")
            .bind(kind)
            .bind(uri)
            .bind(data_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    pub async fn get_resource(&self, id: i64) -> Result<Resource> {
        let row = sqlx::query("SELECT * FROM resources WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("resource {} not found", id))?;
        resource_from_row(&row)
    }

    /// Insert or refresh the record for `(kind, uri, data_hash)`. A
    /// concurrent writer of the same key simply overwrites the payload.
    pub async fn upsert_resource(&self, resource: &Resource) -> Result<Resource> {
        let now = to_ts(db::now());
        sqlx::query(
            r#"
            INSERT INTO resources
                (kind, uri, data_hash, method, request, head, body, status, is_extracted,
                 since, purge_at, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
            ON CONFLICT(kind, uri, data_hash) DO UPDATE SET
                method = excluded.method,
                request = excluded.request,
                head = excluded.head,
                body = excluded.body,
                status = excluded.status,
                is_extracted = 0,
                since = excluded.since,
                purge_at = excluded.purge_at,
                modified_at = excluded.modified_at
            "#,
        )
        .bind(&resource.kind)
        .bind(&resource.uri)
        .bind(&resource.data_hash)
        .bind(&resource.method)
        .bind(to_json(&resource.request)?)
        .bind(to_json(&resource.head)?)
        .bind(&resource.body)
        .bind(resource.status as i64)
        .bind(to_ts(resource.since))
        .bind(to_ts_opt(resource.purge_at))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_resource(&resource.kind, &resource.uri, &resource.data_hash)
            .await?
            .with_context(|| format!("resource {} vanished after upsert", resource.uri))
    }

    pub async fn mark_resource_extracted(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE resources SET is_extracted = 1, modified_at = ? WHERE id = ?")
            .bind(to_ts(db::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark resources of a kind extractable again, optionally only those
    /// whose URI starts with `uri_prefix`.
    pub async fn invalidate_resources(&self, kind: &str, uri_prefix: Option<&str>) -> Result<u64> {
        let escaped = uri_prefix
            .unwrap_or("")
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("{}%", escaped);
        let result = sqlx::query(
            r#"
            UPDATE resources SET is_extracted = 0, modified_at = ?
            WHERE kind = ? AND uri LIKE ? ESCAPE '\'
            "#,
        )
        .bind(to_ts(db::now()))
        .bind(kind)
        .bind(pattern)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete resources whose retention ran out, and those fetched before
    /// `fetched_before` when given.
    pub async fn purge_resources(
        &self,
        kind: Option<&str>,
        now: DateTime<Utc>,
        fetched_before: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM resources
            WHERE (? IS NULL OR kind = ?)
              AND ((purge_at IS NOT NULL AND purge_at <= ?) OR (? IS NOT NULL AND since < ?))
            "#,
        )
        .bind(kind)
        .bind(kind)
        .bind(to_ts(now))
        .bind(to_ts_opt(fetched_before))
        .bind(to_ts_opt(fetched_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Cached resource count per kind.
    pub async fn resource_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT kind, COUNT(*) AS n FROM resources GROUP BY kind ORDER BY kind")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| (r.get("kind"), r.get("n"))).collect())
    }
}
