//! Index manager: per-version search indices and atomic alias promotion.
//!
//! Every dataset version gets one all-languages index named
//! `<dataset>-<version>-<id>` plus one index per declared language
//! (`<index>-<lang>`). The public alias `<dataset>` points at exactly one
//! all-languages index; per-language aliases follow it as
//! `<dataset>-<lang>`.
//!
//! The backend is a [`SearchBackend`]: [`OpenSearchBackend`] against a
//! real cluster, [`InMemoryBackend`] for tests and dry runs.

mod memory;
mod opensearch;

pub use memory::InMemoryBackend;
pub use opensearch::OpenSearchBackend;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{SearchBackendKind, SearchConfig};
use crate::models::IndexRecord;
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter, NoProgress};

/// One operation of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    Index { id: String, source: Value },
    Delete { id: String },
}

impl BulkOp {
    pub fn id(&self) -> &str {
        match self {
            Self::Index { id, .. } | Self::Delete { id } => id,
        }
    }
}

/// An alias change. A list of actions is applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasAction {
    Add { index: String, alias: String },
    Remove { index: String, alias: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub errors: usize,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Create an index, analysing text for `language` when given. Creating
    /// an existing index is not an error.
    async fn create_index(&self, index: &str, language: Option<&str>) -> Result<()>;

    /// Delete an index. Deleting a missing index is not an error.
    async fn delete_index(&self, index: &str) -> Result<()>;

    async fn bulk(&self, index: &str, ops: &[BulkOp], timeout: Duration) -> Result<BulkOutcome>;

    async fn refresh(&self, index: &str) -> Result<()>;

    async fn count(&self, index: &str) -> Result<u64>;

    /// Indices an alias currently points at.
    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>>;

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()>;
}

pub fn backend_from_config(config: &SearchConfig) -> Result<Arc<dyn SearchBackend>> {
    Ok(match config.backend {
        SearchBackendKind::OpenSearch => Arc::new(OpenSearchBackend::new(config)?),
        SearchBackendKind::Memory => Arc::new(InMemoryBackend::new()),
    })
}

/// Index name for a dataset version. Lowercase with only characters
/// search backends accept.
pub fn index_name(dataset: &str, version: &str, version_id: i64) -> String {
    let raw = format!("{}-{}-{}", dataset, version, version_id);
    raw.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '_') => c,
            _ => '-',
        })
        .collect()
}

pub fn language_index(index: &str, language: &str) -> String {
    format!("{}-{}", index, language.to_ascii_lowercase())
}

/// Documents prepared for a push.
#[derive(Debug, Clone)]
pub struct PushDocument {
    pub id: String,
    pub language: Option<String>,
    /// `None` removes the document from the index.
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub errors: usize,
}

pub struct IndexManager {
    backend: Arc<dyn SearchBackend>,
    chunk_size: usize,
    timeout: Duration,
    progress: Arc<dyn HarvestProgressReporter>,
}

impl IndexManager {
    pub fn new(backend: Arc<dyn SearchBackend>, config: &SearchConfig) -> Self {
        Self {
            backend,
            chunk_size: config.bulk_chunk_size.max(1),
            timeout: Duration::from_secs(config.bulk_timeout_secs),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn HarvestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    fn all_indices(record: &IndexRecord) -> Vec<(String, Option<&str>)> {
        let mut names = vec![(record.name.clone(), None)];
        for language in &record.languages {
            names.push((language_index(&record.name, language), Some(language.as_str())));
        }
        names
    }

    /// Make sure the version's indices exist; with `recreate`, drop and
    /// create them again. Safe to call repeatedly.
    pub async fn prepare_push(&self, record: &IndexRecord, recreate: bool) -> Result<()> {
        for (name, language) in Self::all_indices(record) {
            if recreate {
                self.backend.delete_index(&name).await?;
            }
            if recreate || !self.backend.index_exists(&name).await? {
                self.backend.create_index(&name, language).await?;
                info!(index = %name, language = language.unwrap_or("all"), "index created");
            }
        }
        Ok(())
    }

    /// Bulk-write documents in chunks. Every document goes to the
    /// all-languages index and, when its language is declared, to that
    /// language's index. Failed operations are counted, not raised.
    pub async fn push(
        &self,
        record: &IndexRecord,
        docs: &[PushDocument],
        is_done: bool,
    ) -> Result<PushReport> {
        let mut report = PushReport::default();
        let total = docs.len() as u64;
        for chunk in docs.chunks(self.chunk_size) {
            let ops: Vec<BulkOp> = chunk.iter().map(to_op).collect();
            let outcome = self.backend.bulk(&record.name, &ops, self.timeout).await?;
            report.pushed += outcome.succeeded;
            report.errors += outcome.errors;

            for language in &record.languages {
                let ops: Vec<BulkOp> = chunk
                    .iter()
                    .filter(|d| d.language.as_deref() == Some(language.as_str()))
                    .map(to_op)
                    .collect();
                if ops.is_empty() {
                    continue;
                }
                let outcome = self
                    .backend
                    .bulk(&language_index(&record.name, language), &ops, self.timeout)
                    .await?;
                report.errors += outcome.errors;
            }
            self.progress.report(HarvestProgressEvent::Indexing {
                index: record.name.clone(),
                n: report.pushed as u64,
                total,
            });
        }
        if is_done {
            for (name, _) in Self::all_indices(record) {
                self.backend.refresh(&name).await?;
            }
        }
        if report.errors > 0 {
            warn!(index = %record.name, errors = report.errors, "bulk push reported errors");
        }
        debug!(index = %record.name, pushed = report.pushed, "push complete");
        Ok(report)
    }

    /// Point the dataset alias (and language aliases) at this version's
    /// indices in one atomic alias update. Safe to call repeatedly.
    pub async fn promote_to_latest(&self, dataset: &str, record: &IndexRecord) -> Result<()> {
        let mut actions = Vec::new();
        let mut aliases = vec![(dataset.to_string(), record.name.clone())];
        for language in &record.languages {
            aliases.push((
                format!("{}-{}", dataset, language.to_ascii_lowercase()),
                language_index(&record.name, language),
            ));
        }
        for (alias, target) in &aliases {
            for current in self.backend.alias_targets(alias).await? {
                if &current != target {
                    actions.push(AliasAction::Remove {
                        index: current,
                        alias: alias.clone(),
                    });
                }
            }
            actions.push(AliasAction::Add {
                index: target.clone(),
                alias: alias.clone(),
            });
        }
        self.backend.update_aliases(&actions).await?;
        info!(alias = dataset, index = %record.name, "alias promoted");
        Ok(())
    }

    /// Remove language aliases of languages no longer declared. Failures
    /// are logged and ignored.
    pub async fn clean_legacy_aliases(&self, dataset: &str, stale_languages: &[String]) {
        for language in stale_languages {
            let alias = format!("{}-{}", dataset, language.to_ascii_lowercase());
            let targets = match self.backend.alias_targets(&alias).await {
                Ok(targets) => targets,
                Err(err) => {
                    warn!(alias = %alias, error = %err, "could not look up legacy alias");
                    continue;
                }
            };
            let actions: Vec<AliasAction> = targets
                .into_iter()
                .map(|index| AliasAction::Remove {
                    index,
                    alias: alias.clone(),
                })
                .collect();
            if actions.is_empty() {
                continue;
            }
            if let Err(err) = self.backend.update_aliases(&actions).await {
                warn!(alias = %alias, error = %err, "could not remove legacy alias");
            }
        }
    }

    /// Delete the version's remote indices when `references` (versions
    /// pointing at the index record) is at most one. Returns whether they
    /// were deleted.
    pub async fn delete(&self, record: &IndexRecord, references: i64) -> Result<bool> {
        if references > 1 {
            info!(index = %record.name, references, "index still referenced; keeping");
            return Ok(false);
        }
        for (name, _) in Self::all_indices(record) {
            self.backend.delete_index(&name).await?;
        }
        info!(index = %record.name, "index deleted");
        Ok(true)
    }

    pub async fn count(&self, record: &IndexRecord) -> Result<u64> {
        self.backend.count(&record.name).await
    }
}

fn to_op(doc: &PushDocument) -> BulkOp {
    match &doc.data {
        Some(source) => BulkOp::Index {
            id: doc.id.clone(),
            source: source.clone(),
        },
        None => BulkOp::Delete { id: doc.id.clone() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(languages: &[&str]) -> IndexRecord {
        IndexRecord {
            id: 1,
            name: index_name("Products", "2024.1", 7),
            dataset_id: 1,
            languages: languages.iter().map(|l| l.to_string()).collect(),
            error_count: 0,
            pushed_at: None,
        }
    }

    fn manager(backend: Arc<InMemoryBackend>) -> IndexManager {
        IndexManager::new(
            backend,
            &SearchConfig {
                bulk_chunk_size: 2,
                ..Default::default()
            },
        )
    }

    fn doc(id: &str, language: Option<&str>) -> PushDocument {
        PushDocument {
            id: id.into(),
            language: language.map(str::to_string),
            data: Some(json!({"id": id})),
        }
    }

    #[test]
    fn index_names_are_sanitized() {
        assert_eq!(index_name("Products", "2024.1", 7), "products-2024-1-7");
        assert_eq!(language_index("products-1", "NL"), "products-1-nl");
    }

    #[tokio::test]
    async fn push_routes_languages_and_deletes() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(backend.clone());
        let record = record(&["nl", "en"]);
        manager.prepare_push(&record, false).await.unwrap();
        manager.prepare_push(&record, false).await.unwrap();

        let docs = vec![doc("a", Some("nl")), doc("b", Some("en")), doc("c", None)];
        let report = manager.push(&record, &docs, true).await.unwrap();
        assert_eq!(report, PushReport { pushed: 3, errors: 0 });
        assert_eq!(backend.count(&record.name).await.unwrap(), 3);
        assert_eq!(backend.count(&language_index(&record.name, "nl")).await.unwrap(), 1);

        let removal = vec![PushDocument {
            id: "a".into(),
            language: Some("nl".into()),
            data: None,
        }];
        manager.push(&record, &removal, true).await.unwrap();
        assert_eq!(backend.count(&record.name).await.unwrap(), 2);
        assert_eq!(backend.count(&language_index(&record.name, "nl")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn promotion_swaps_alias_atomically() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(backend.clone());
        let old = IndexRecord {
            name: index_name("products", "v2", 2),
            ..record(&["nl"])
        };
        let new = IndexRecord {
            name: index_name("products", "v3", 3),
            ..record(&["nl"])
        };
        for r in [&old, &new] {
            manager.prepare_push(r, false).await.unwrap();
        }
        manager.promote_to_latest("products", &old).await.unwrap();
        manager.promote_to_latest("products", &new).await.unwrap();
        manager.promote_to_latest("products", &new).await.unwrap();
        assert_eq!(backend.alias_targets("products").await.unwrap(), vec![new.name.clone()]);
        assert_eq!(
            backend.alias_targets("products-nl").await.unwrap(),
            vec![language_index(&new.name, "nl")]
        );

        manager.clean_legacy_aliases("products", &["nl".into()]).await;
        assert!(backend.alias_targets("products-nl").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_honours_references() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(backend.clone());
        let record = record(&[]);
        manager.prepare_push(&record, false).await.unwrap();
        assert!(!manager.delete(&record, 2).await.unwrap());
        assert!(backend.index_exists(&record.name).await.unwrap());
        assert!(manager.delete(&record, 1).await.unwrap());
        assert!(!backend.index_exists(&record.name).await.unwrap());
    }
}
