use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Datasets and their versions
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS datasets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            is_harvested INTEGER NOT NULL DEFAULT 1,
            indexing TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dataset_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset_id INTEGER NOT NULL,
            version TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'building',
            is_current INTEGER NOT NULL DEFAULT 0,
            is_index_promoted INTEGER NOT NULL DEFAULT 0,
            index_id INTEGER,
            pipeline TEXT NOT NULL DEFAULT '{}',
            tasks TEXT NOT NULL DEFAULT '{}',
            historic_sets TEXT NOT NULL DEFAULT '[]',
            retries INTEGER NOT NULL DEFAULT 0,
            pending_at INTEGER,
            finished_at INTEGER,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            UNIQUE(dataset_id, version),
            FOREIGN KEY (dataset_id) REFERENCES datasets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Sets and documents
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset_version_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            entity TEXT NOT NULL,
            identifier TEXT NOT NULL,
            delete_policy TEXT NOT NULL DEFAULT 'no',
            pipeline TEXT NOT NULL DEFAULT '{}',
            tasks TEXT NOT NULL DEFAULT '{}',
            retries INTEGER NOT NULL DEFAULT 0,
            pending_at INTEGER,
            finished_at INTEGER,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            UNIQUE(dataset_version_id, name),
            FOREIGN KEY (dataset_version_id) REFERENCES dataset_versions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            set_id INTEGER NOT NULL,
            entity TEXT NOT NULL,
            identity TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'active',
            properties TEXT NOT NULL DEFAULT '{}',
            metadata TEXT NOT NULL DEFAULT '{}',
            pipeline TEXT NOT NULL DEFAULT '{}',
            derivatives TEXT NOT NULL DEFAULT '{}',
            tasks TEXT NOT NULL DEFAULT '{}',
            is_not_found INTEGER NOT NULL DEFAULT 0,
            status_code INTEGER,
            redirects TEXT,
            pending_at INTEGER,
            finished_at INTEGER,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            UNIQUE(set_id, identity),
            FOREIGN KEY (set_id) REFERENCES sets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Advisory row locks, one row per locked document
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_locks (
            document_id INTEGER PRIMARY KEY,
            owner TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvest_states (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset_id INTEGER NOT NULL,
            source TEXT NOT NULL,
            entity TEXT NOT NULL,
            set_specification TEXT NOT NULL,
            set_id INTEGER,
            harvested_at INTEGER,
            pending_harvested_at INTEGER,
            purge_after INTEGER,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            UNIQUE(dataset_id, source, entity, set_specification),
            FOREIGN KEY (dataset_id) REFERENCES datasets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Resource cache
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            uri TEXT NOT NULL,
            data_hash TEXT NOT NULL DEFAULT '',
            method TEXT NOT NULL,
            request TEXT NOT NULL DEFAULT '{}',
            head TEXT NOT NULL DEFAULT '{}',
            body TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL,
            is_extracted INTEGER NOT NULL DEFAULT 0,
            since INTEGER NOT NULL,
            purge_at INTEGER,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            UNIQUE(kind, uri, data_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Pipeline bookkeeping
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            set_id INTEGER NOT NULL,
            task TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            finished_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS process_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id INTEGER NOT NULL,
            document_id INTEGER NOT NULL,
            resource_id INTEGER,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (batch_id) REFERENCES batches(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Search indices
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            dataset_id INTEGER NOT NULL,
            languages TEXT NOT NULL DEFAULT '[]',
            error_count INTEGER NOT NULL DEFAULT 0,
            pushed_at INTEGER,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS overwrites (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity TEXT NOT NULL,
            identity TEXT NOT NULL,
            properties TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            UNIQUE(entity, identity)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_set_id ON documents(set_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_pending ON documents(set_id, finished_at, pending_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sets_version ON sets(dataset_version_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_versions_dataset ON dataset_versions(dataset_id, is_current)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_resources_purge ON resources(kind, purge_at)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_process_results_batch ON process_results(batch_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
