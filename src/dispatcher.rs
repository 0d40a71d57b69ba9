//! Task dispatcher: documents → sets → dataset version → index promotion.
//!
//! Each level advances only when its children are done:
//!
//! - **Set.** The pipeline processor runs the set's document tasks. While
//!   documents stay pending the set is retried, up to
//!   `harvest.dispatch_max_retries` times; on the final retry pending
//!   documents are force-canceled. Then set tasks run (built-in:
//!   `check_set_integrity`) and the set is finished.
//! - **Version.** Once every set is finished the version tasks run in
//!   dependency order: `create_opensearch_index` builds and fills the
//!   version's indices, `set_current_dataset_version` swaps the alias and
//!   makes the version current. `harvested_at` of the dataset's harvest
//!   states advances only after that (or after indexing for `index_only`
//!   datasets).
//!
//! Every level records its outcomes in its `pipeline` map, so a dispatch
//! that is interrupted resumes where it stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{error, info, warn};

use harvester_core::models::{IndexingOption, PipelineEntry, VersionState};
use harvester_core::tasks::{execution_order, TaskConfig, TaskMap};

use crate::config::{Config, IntegritySettings, CHECK_SET_INTEGRITY};
use crate::db;
use crate::error::HarvestError;
use crate::index::{index_name, IndexManager, PushDocument};
use crate::integrity::check_set_integrity;
use crate::kinds::KindRegistry;
use crate::models::{Dataset, DatasetVersion, IndexRecord, Set};
use crate::pipeline::PipelineProcessor;
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter, NoProgress};
use crate::store::{DocumentFilter, Store};

pub const CREATE_INDEX: &str = "create_opensearch_index";
pub const SET_CURRENT: &str = "set_current_dataset_version";

/// Version tasks for a dataset's indexing option.
pub fn version_tasks(indexing: IndexingOption) -> TaskMap {
    let mut tasks = TaskMap::new();
    if indexing.creates_index() {
        tasks.insert(CREATE_INDEX.to_string(), TaskConfig::default());
    }
    if indexing == IndexingOption::IndexAndPromote {
        tasks.insert(
            SET_CURRENT.to_string(),
            TaskConfig {
                depends_on: vec![CREATE_INDEX.to_string()],
                ..Default::default()
            },
        );
    }
    tasks
}

/// Where a dispatch of a version stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Children still in flight; dispatch again after the delay.
    Pending { retry_in: Duration },
    Done(VersionState),
}

pub struct Dispatcher {
    config: Arc<Config>,
    store: Store,
    pipeline: PipelineProcessor,
    index: Arc<IndexManager>,
    kinds: Arc<KindRegistry>,
    progress: Arc<dyn HarvestProgressReporter>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        pipeline: PipelineProcessor,
        index: Arc<IndexManager>,
        kinds: Arc<KindRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            pipeline,
            index,
            kinds,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn HarvestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Historic sets of a version by name.
    async fn historic_sets(&self, version: &DatasetVersion) -> Result<HashMap<String, Set>> {
        let mut sets = HashMap::new();
        for id in &version.historic_sets {
            match self.store.get_set(*id).await {
                Ok(set) => {
                    sets.insert(set.name.clone(), set);
                }
                Err(err) => warn!(set = id, error = %err, "historic set unavailable"),
            }
        }
        Ok(sets)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Set level
    // ═══════════════════════════════════════════════════════════════════

    /// Advance a set. Returns whether it is finished.
    pub async fn dispatch_set_tasks(&self, set: &mut Set, historic: Option<&Set>) -> Result<bool> {
        if set.is_finished() {
            return Ok(true);
        }
        let report = self.pipeline.process_set(set).await?;
        if report.pending > 0 {
            set.retries += 1;
            if set.retries < self.config.harvest.dispatch_max_retries {
                info!(
                    set = %set.name,
                    pending = report.pending,
                    retry = set.retries,
                    "documents still pending; set will be retried"
                );
                self.store.update_set(set).await?;
                return Ok(false);
            }
            let canceled = self.cancel_pending_documents(set).await?;
            warn!(set = %set.name, canceled, "retries exhausted; pending documents canceled");
        }

        let order = execution_order(&set.tasks)
            .with_context(|| format!("set tasks of '{}'", set.name))?;
        for task in order {
            if set.pipeline.get(&task).is_some_and(|e| e.success) {
                continue;
            }
            let entry = match task.as_str() {
                CHECK_SET_INTEGRITY => {
                    let settings = IntegritySettings::from_task(set.tasks.get(&task))?;
                    check_set_integrity(&self.store, set, historic, &settings)
                        .await?
                        .entry()
                }
                other => {
                    warn!(set = %set.name, task = other, "unknown set task");
                    PipelineEntry::failure().with_extra("error", json!("unknown set task"))
                }
            };
            set.pipeline.insert(task, entry);
        }

        let now = db::now();
        set.pending_at = None;
        set.finished_at = Some(now);
        self.store.update_set(set).await?;
        info!(set = %set.name, "set finished");
        Ok(true)
    }

    /// Cancel every pending document of a set without waiting for locks.
    async fn cancel_pending_documents(&self, set: &Set) -> Result<usize> {
        let now = db::now();
        let max_attempts = self.config.harvest.max_fetch_attempts;
        let mut docs = self
            .store
            .list_documents(set.id, DocumentFilter::Pending)
            .await?;
        for doc in &mut docs {
            let canceled = doc.cancel_pending(max_attempts, now);
            info!(set = %set.name, document = %doc.identity, tasks = ?canceled, "document canceled");
        }
        self.store.save_documents(&mut docs).await?;
        Ok(docs.len())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Version level
    // ═══════════════════════════════════════════════════════════════════

    /// One dispatch of a version: advance its sets, then, when all are
    /// finished, run the version tasks.
    pub async fn dispatch_version(
        &self,
        dataset: &Dataset,
        version: &mut DatasetVersion,
    ) -> Result<Step> {
        if version.state.is_terminal() {
            return Ok(Step::Done(version.state));
        }
        let historic = self.historic_sets(version).await?;
        let mut all_finished = true;
        for mut set in self.store.list_sets(version.id).await? {
            let previous = historic.get(&set.name);
            let finished = self
                .dispatch_set_tasks(&mut set, previous)
                .await
                .with_context(|| format!("set '{}'", set.name))?;
            all_finished &= finished;
        }
        if !all_finished {
            version.retries += 1;
            self.store.update_version(version).await?;
            return Ok(Step::Pending {
                retry_in: Duration::from_secs(self.config.harvest.dispatch_retry_delay_secs),
            });
        }

        match self.run_version_tasks(dataset, version).await {
            Ok(state) => Ok(Step::Done(state)),
            Err(err) if !HarvestError::is_fatal(&err) => {
                // Pipeline entries so far are saved; the next dispatch resumes.
                warn!(version = %version.version, error = %format!("{:#}", err), "version tasks interrupted");
                Err(err)
            }
            Err(err) => {
                error!(version = %version.version, error = %format!("{:#}", err), "version tasks failed");
                version.state = VersionState::Error;
                version.finished_at = Some(db::now());
                version.pending_at = None;
                self.store.update_version(version).await?;
                self.report_state(version);
                Err(err)
            }
        }
    }

    /// Dispatch until the version reaches a terminal state, sleeping
    /// between retries.
    pub async fn run_to_completion(
        &self,
        dataset: &Dataset,
        version: &mut DatasetVersion,
    ) -> Result<VersionState> {
        loop {
            match self.dispatch_version(dataset, version).await? {
                Step::Done(state) => return Ok(state),
                Step::Pending { retry_in } => {
                    info!(
                        version = %version.version,
                        retry_in_secs = retry_in.as_secs(),
                        "sets pending; waiting"
                    );
                    tokio::time::sleep(retry_in).await;
                }
            }
        }
    }

    async fn run_version_tasks(
        &self,
        dataset: &Dataset,
        version: &mut DatasetVersion,
    ) -> Result<VersionState> {
        let dataset_config = self.config.dataset(&dataset.name)?;
        for task in execution_order(&version.tasks)? {
            if version.pipeline.get(&task).is_some_and(|e| e.success) {
                continue;
            }
            let entry = match task.as_str() {
                CREATE_INDEX => {
                    version.state = VersionState::Indexing;
                    self.store.update_version(version).await?;
                    self.report_state(version);
                    self.create_index(dataset, version, &dataset_config.languages)
                        .await?
                }
                SET_CURRENT => {
                    let record = self.index_record(version).await?;
                    match dataset_config.max_error_count {
                        Some(max) if record.error_count as u64 > max => {
                            warn!(
                                version = %version.version,
                                errors = record.error_count,
                                max,
                                "error budget exceeded; not promoting"
                            );
                            version.pipeline.insert(
                                task,
                                PipelineEntry::failure()
                                    .with_extra("error_count", json!(record.error_count)),
                            );
                            return self.finish_version(version, VersionState::Error).await;
                        }
                        _ => {}
                    }
                    self.promote(dataset, version).await?;
                    PipelineEntry::success()
                }
                other => {
                    warn!(version = %version.version, task = other, "unknown version task");
                    PipelineEntry::failure().with_extra("error", json!("unknown version task"))
                }
            };
            version.pipeline.insert(task, entry);
            self.store.update_version(version).await?;
        }

        let state = match dataset.indexing {
            IndexingOption::IndexAndPromote => VersionState::Promoted,
            IndexingOption::IndexOnly => VersionState::Indexed,
            IndexingOption::None => {
                self.store
                    .set_current_version(dataset.id, version.id)
                    .await?;
                VersionState::Promoted
            }
        };
        let committed = self.store.commit_harvested_at(dataset.id).await?;
        info!(dataset = %dataset.name, harvest_states = committed, "harvested_at advanced");
        self.finish_version(version, state).await
    }

    async fn finish_version(
        &self,
        version: &mut DatasetVersion,
        state: VersionState,
    ) -> Result<VersionState> {
        version.state = state;
        version.pending_at = None;
        version.finished_at = Some(db::now());
        self.store.update_version(version).await?;
        self.report_state(version);
        info!(version = %version.version, state = %state, "version finished");
        Ok(state)
    }

    fn report_state(&self, version: &DatasetVersion) {
        self.progress.report(HarvestProgressEvent::Version {
            version: version.version.clone(),
            state: version.state.to_string(),
        });
    }

    async fn index_record(&self, version: &DatasetVersion) -> Result<IndexRecord> {
        let id = version
            .index_id
            .with_context(|| format!("version '{}' has no index", version.version))?;
        self.store.get_index(id).await
    }

    // ─── create_opensearch_index ─────────────────────────────────────

    async fn create_index(
        &self,
        dataset: &Dataset,
        version: &mut DatasetVersion,
        languages: &[String],
    ) -> Result<PipelineEntry> {
        let name = index_name(&dataset.name, &version.version, version.id);
        let record = self
            .store
            .get_or_create_index(&name, dataset.id, languages)
            .await?;
        version.index_id = Some(record.id);
        self.store.update_version(version).await?;

        // Pushed before: start from empty indices so removed documents go.
        let recreate = record.pushed_at.is_some();
        self.index.prepare_push(&record, recreate).await?;
        self.store.reset_index_errors(record.id).await?;

        let docs = self.search_documents(version).await?;
        let report = match self.index.push(&record, &docs, true).await {
            Ok(report) => report,
            Err(err) => {
                if HarvestError::is_fatal(&err) {
                    version.pipeline.insert(
                        CREATE_INDEX.to_string(),
                        PipelineEntry::failure().with_extra("error", json!(format!("{:#}", err))),
                    );
                }
                return Err(err);
            }
        };
        self.store
            .record_index_push(record.id, report.errors as i64)
            .await?;
        info!(
            index = %record.name,
            pushed = report.pushed,
            errors = report.errors,
            "index pushed"
        );
        Ok(PipelineEntry::success()
            .with_extra("pushed", json!(report.pushed))
            .with_extra("errors", json!(report.errors)))
    }

    /// Search data of every active document of a version.
    async fn search_documents(&self, version: &DatasetVersion) -> Result<Vec<PushDocument>> {
        let mut docs = Vec::new();
        let mut overwrites = HashMap::new();
        for set in self.store.list_sets(version.id).await? {
            let kind = self.kinds.get(
                self.config
                    .entities
                    .get(&set.entity)
                    .map(|e| e.kind.as_str())
                    .unwrap_or("generic"),
            )?;
            if !overwrites.contains_key(&set.entity) {
                overwrites.insert(set.entity.clone(), self.store.overwrites(&set.entity).await?);
            }
            let entity_overwrites = overwrites.get(&set.entity);
            for doc in self
                .store
                .list_documents(set.id, DocumentFilter::Active)
                .await?
            {
                let overwrite = entity_overwrites.and_then(|o| o.get(&doc.identity));
                docs.push(PushDocument {
                    id: doc.identity.clone(),
                    language: doc.metadata.language.clone(),
                    data: Some(kind.to_search_data(&doc, overwrite)),
                });
            }
        }
        Ok(docs)
    }

    // ─── set_current_dataset_version ─────────────────────────────────

    /// Swap the alias to this version's index and make it current.
    pub async fn promote(&self, dataset: &Dataset, version: &mut DatasetVersion) -> Result<()> {
        let previous = self.store.current_version(dataset.id).await?;
        if dataset.indexing.creates_index() {
            let record = self.index_record(version).await?;
            self.index.promote_to_latest(&dataset.name, &record).await?;
            if let Some(previous_index) = previous.as_ref().and_then(|p| p.index_id) {
                if previous_index != record.id {
                    if let Ok(old) = self.store.get_index(previous_index).await {
                        let stale: Vec<String> = old
                            .languages
                            .into_iter()
                            .filter(|l| !record.languages.contains(l))
                            .collect();
                        self.index.clean_legacy_aliases(&dataset.name, &stale).await;
                    }
                }
            }
            version.is_index_promoted = true;
        }
        self.store
            .set_current_version(dataset.id, version.id)
            .await?;
        version.is_current = true;
        self.store.update_version(version).await?;
        info!(dataset = %dataset.name, version = %version.version, "version is current");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tasks_follow_indexing() {
        assert!(version_tasks(IndexingOption::None).is_empty());
        let only = version_tasks(IndexingOption::IndexOnly);
        assert_eq!(only.keys().collect::<Vec<_>>(), vec![CREATE_INDEX]);
        let promote = version_tasks(IndexingOption::IndexAndPromote);
        assert_eq!(
            execution_order(&promote).unwrap(),
            vec![CREATE_INDEX.to_string(), SET_CURRENT.to_string()]
        );
    }
}
