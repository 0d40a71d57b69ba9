use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use harvester_core::document::Document;

use super::{from_json, to_json, Store};
use crate::db::{self, from_ts, from_ts_opt, to_ts, to_ts_opt};
use crate::models::Overwrite;

/// Which documents of a set to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFilter {
    All,
    Active,
    /// `pending_at` set and `finished_at` unset.
    Pending,
}

impl DocumentFilter {
    fn clause(&self) -> &'static str {
        match self {
            Self::All => "",
            Self::Active => " AND state = 'active'",
            Self::Pending => " AND pending_at IS NOT NULL AND finished_at IS NULL",
        }
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let state: String = row.get("state");
    let properties: String = row.get("properties");
    let metadata: String = row.get("metadata");
    let pipeline: String = row.get("pipeline");
    let derivatives: String = row.get("derivatives");
    let tasks: String = row.get("tasks");
    Ok(Document {
        id: Some(row.get("id")),
        set_id: row.get("set_id"),
        entity: row.get("entity"),
        identity: row.get("identity"),
        state: state.parse()?,
        properties: from_json(&properties)?,
        metadata: from_json(&metadata)?,
        pipeline: from_json(&pipeline)?,
        derivatives: from_json(&derivatives)?,
        tasks: from_json(&tasks)?,
        is_not_found: row.get::<i64, _>("is_not_found") != 0,
        status_code: row
            .get::<Option<i64>, _>("status_code")
            .map(|code| code as u16),
        redirects: row.get("redirects"),
        pending_at: from_ts_opt(row.get("pending_at")),
        finished_at: from_ts_opt(row.get("finished_at")),
        created_at: from_ts(row.get("created_at")),
        modified_at: from_ts(row.get("modified_at")),
    })
}

async fn insert_in(tx: &mut Transaction<'_, Sqlite>, doc: &Document) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO documents
            (set_id, entity, identity, state, properties, metadata, pipeline, derivatives,
             tasks, is_not_found, status_code, redirects, pending_at, finished_at,
             created_at, modified_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(doc.set_id)
    .bind(&doc.entity)
    .bind(&doc.identity)
    .bind(doc.state.as_str())
    .bind(to_json(&doc.properties)?)
    .bind(to_json(&doc.metadata)?)
    .bind(to_json(&doc.pipeline)?)
    .bind(to_json(&doc.derivatives)?)
    .bind(to_json(&doc.tasks)?)
    .bind(doc.is_not_found as i64)
    .bind(doc.status_code.map(i64::from))
    .bind(&doc.redirects)
    .bind(to_ts_opt(doc.pending_at))
    .bind(to_ts_opt(doc.finished_at))
    .bind(to_ts(doc.created_at))
    .bind(to_ts(doc.modified_at))
    .fetch_one(&mut **tx)
    .await
    .with_context(|| format!("Failed to insert document '{}'", doc.identity))?;
    Ok(id)
}

async fn update_in(tx: &mut Transaction<'_, Sqlite>, doc: &Document) -> Result<()> {
    let id = doc
        .id
        .with_context(|| format!("document '{}' has no id", doc.identity))?;
    sqlx::query(
        r#"
        UPDATE documents SET
            state = ?, properties = ?, metadata = ?, pipeline = ?, derivatives = ?,
            tasks = ?, is_not_found = ?, status_code = ?, redirects = ?, pending_at = ?,
            finished_at = ?, modified_at = ?
        WHERE id = ?
        "#,
    )
    .bind(doc.state.as_str())
    .bind(to_json(&doc.properties)?)
    .bind(to_json(&doc.metadata)?)
    .bind(to_json(&doc.pipeline)?)
    .bind(to_json(&doc.derivatives)?)
    .bind(to_json(&doc.tasks)?)
    .bind(doc.is_not_found as i64)
    .bind(doc.status_code.map(i64::from))
    .bind(&doc.redirects)
    .bind(to_ts_opt(doc.pending_at))
    .bind(to_ts_opt(doc.finished_at))
    .bind(to_ts(doc.modified_at))
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl Store {
    /// Insert new documents and update existing ones in one transaction.
    /// Newly inserted documents get their id assigned.
    pub async fn save_documents(&self, docs: &mut [Document]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for doc in docs.iter_mut() {
            match doc.id {
                Some(_) => update_in(&mut tx, doc).await?,
                None => doc.id = Some(insert_in(&mut tx, doc).await?),
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn save_document(&self, doc: &mut Document) -> Result<()> {
        self.save_documents(std::slice::from_mut(doc)).await
    }

    pub async fn get_document(&self, id: i64) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("document {} not found", id))?;
        document_from_row(&row)
    }

    pub async fn find_document(&self, set_id: i64, identity: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE set_id = ? AND identity = ?")
            .bind(set_id)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn list_documents(&self, set_id: i64, filter: DocumentFilter) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT * FROM documents WHERE set_id = ?{} ORDER BY id",
            filter.clause()
        );
        let rows = sqlx::query(&sql).bind(set_id).fetch_all(&self.pool).await?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn load_documents(&self, ids: &[i64]) -> Result<Vec<Document>> {
        let mut docs = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT * FROM documents WHERE id IN ({}) ORDER BY id",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in &rows {
                docs.push(document_from_row(row)?);
            }
        }
        Ok(docs)
    }

    pub async fn identities(&self, set_id: i64) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT identity FROM documents WHERE set_id = ?")
            .bind(set_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn count_pending_documents(&self, set_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE set_id = ? AND pending_at IS NOT NULL AND finished_at IS NULL",
        )
        .bind(set_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Replace every document of `target` with copies of the documents of
    /// `source`, in one transaction.
    pub async fn replace_set_documents(&self, target: i64, source: i64) -> Result<u64> {
        let docs = self.list_documents(source, DocumentFilter::All).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM document_locks WHERE document_id IN (SELECT id FROM documents WHERE set_id = ?)",
        )
        .bind(target)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents WHERE set_id = ?")
            .bind(target)
            .execute(&mut *tx)
            .await?;
        for doc in &docs {
            insert_in(&mut tx, &doc.copy_to_set(target)).await?;
        }
        tx.commit().await?;
        Ok(docs.len() as u64)
    }

    // ─── Overwrites ──────────────────────────────────────────────────

    pub async fn upsert_overwrite(
        &self,
        entity: &str,
        identity: &str,
        properties: &Map<String, Value>,
    ) -> Result<()> {
        let now = to_ts(db::now());
        sqlx::query(
            r#"
            INSERT INTO overwrites (entity, identity, properties, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity, identity) DO UPDATE SET
                properties = excluded.properties,
                modified_at = excluded.modified_at
            "#,
        )
        .bind(entity)
        .bind(identity)
        .bind(to_json(properties)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn overwrites(&self, entity: &str) -> Result<HashMap<String, Overwrite>> {
        let rows = sqlx::query("SELECT entity, identity, properties FROM overwrites WHERE entity = ?")
            .bind(entity)
            .fetch_all(&self.pool)
            .await?;
        let mut result = HashMap::with_capacity(rows.len());
        for row in &rows {
            let properties: String = row.get("properties");
            let overwrite = Overwrite {
                entity: row.get("entity"),
                identity: row.get("identity"),
                properties: from_json(&properties)?,
            };
            result.insert(overwrite.identity.clone(), overwrite);
        }
        Ok(result)
    }
}
