//! Harvest orchestration.
//!
//! [`Harvester`] wires the store, resource cache, source and kind
//! registries, index manager and progress reporter together and exposes
//! the operations behind the CLI: `init`, `run`, `dispatch`, `promote` and
//! `delete_version`.
//!
//! A run creates a new dataset version, seeds one set per configured
//! harvest entry and then dispatches the version to completion:
//!
//! ```text
//! harvest entry ─▶ harvest state ─▶ collect ─▶ reconcile ─▶ set
//!                                                            │
//!          version ◀─ set tasks ◀─ document tasks ◀──────────┘
//!             │
//!             └─▶ create index ─▶ push ─▶ promote alias
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{error, info};

use harvester_core::models::{DeletePolicy, PipelineEntry, VersionState};

use crate::blob::{BlobStore, FsBlobStore};
use crate::config::{Config, HarvestEntry, SourceEntityConfig};
use crate::db;
use crate::dispatcher::{version_tasks, Dispatcher};
use crate::error::HarvestError;
use crate::index::{backend_from_config, IndexManager};
use crate::kinds::KindRegistry;
use crate::models::{Dataset, DatasetVersion, HarvestState, Set};
use crate::pipeline::PipelineProcessor;
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter, NoProgress};
use crate::resources::ResourceCache;
use crate::seeder::{Seeder, Unseen};
use crate::sources::SourceRegistry;
use crate::store::Store;

/// Options of `harvest run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore `harvested_at` and harvest everything.
    pub full: bool,
    /// Serve every outbound call from the resource cache.
    pub cache_only: bool,
    /// Version label; defaults to the start time.
    pub version: Option<String>,
}

/// Outcome of `harvest run`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub version: String,
    pub state: VersionState,
    pub sets: usize,
    pub documents: usize,
    /// Sets whose seeding failed and fell back to historic documents.
    pub failed_sets: Vec<String>,
}

pub struct Harvester {
    config: Arc<Config>,
    store: Store,
    cache: ResourceCache,
    sources: Arc<SourceRegistry>,
    kinds: Arc<KindRegistry>,
    index: Arc<IndexManager>,
    blobs: Option<Arc<dyn BlobStore>>,
    progress: Arc<dyn HarvestProgressReporter>,
}

/// Whether a harvest state is harvested from scratch.
pub fn is_full_harvest(
    forced: bool,
    state: &HarvestState,
    entity: &SourceEntityConfig,
    now: DateTime<Utc>,
) -> bool {
    forced
        || state.harvested_at.is_none()
        || state.purge_after.is_some_and(|at| at <= now)
        || entity.delete_policy == DeletePolicy::Transient
}

fn default_version_label(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S").to_string()
}

impl Harvester {
    /// Harvester with the production collaborators: SQLite store from
    /// `[db]`, HTTP and shell resources, the configured search backend and
    /// a filesystem blob store under `[blobs].path`.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = Store::open(&config).await?;
        let cache = ResourceCache::from_config(store.clone(), &config)?;
        let backend = backend_from_config(&config.search)?;
        let index = IndexManager::new(backend, &config.search);
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.blobs.path.clone()));
        Ok(Self::new(config, store, cache, index).with_blobs(blobs))
    }

    pub fn new(config: Config, store: Store, cache: ResourceCache, index: IndexManager) -> Self {
        Self {
            config: Arc::new(config),
            store,
            cache,
            sources: Arc::new(SourceRegistry::with_builtins()),
            kinds: Arc::new(KindRegistry::with_builtins()),
            index: Arc::new(index),
            blobs: None,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = Arc::new(sources);
        self
    }

    pub fn with_kinds(mut self, kinds: KindRegistry) -> Self {
        self.kinds = Arc::new(kinds);
        self
    }

    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn HarvestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    fn seeder(&self, cache: &ResourceCache) -> Seeder {
        Seeder::new(
            self.config.clone(),
            self.store.clone(),
            cache.clone(),
            self.sources.clone(),
        )
    }

    fn dispatcher(&self, cache: &ResourceCache) -> Dispatcher {
        let mut pipeline = PipelineProcessor::new(
            self.config.clone(),
            self.store.clone(),
            cache.clone(),
            self.kinds.clone(),
        )
        .with_progress(self.progress.clone());
        if let Some(blobs) = &self.blobs {
            pipeline = pipeline.with_blobs(blobs.clone());
        }
        Dispatcher::new(
            self.config.clone(),
            self.store.clone(),
            pipeline,
            self.index.clone(),
            self.kinds.clone(),
        )
        .with_progress(self.progress.clone())
    }

    /// Upsert every configured dataset. Safe to run repeatedly.
    pub async fn init(&self) -> Result<Vec<Dataset>> {
        let mut datasets = Vec::new();
        for (name, dataset) in &self.config.datasets {
            let record = self.store.upsert_dataset(name, dataset).await?;
            info!(dataset = %name, indexing = %record.indexing, "dataset ready");
            datasets.push(record);
        }
        Ok(datasets)
    }

    /// The stored dataset, created from config on first use.
    pub async fn dataset(&self, name: &str) -> Result<Dataset> {
        let config = self.config.dataset(name)?;
        match self.store.get_dataset(name).await? {
            Some(dataset) => Ok(dataset),
            None => self.store.upsert_dataset(name, config).await,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // run
    // ═══════════════════════════════════════════════════════════════════

    /// Harvest a dataset into a new version and dispatch it to completion.
    pub async fn run(&self, dataset_name: &str, options: &RunOptions) -> Result<RunSummary> {
        let dataset = self.dataset(dataset_name).await?;
        if !dataset.is_harvested {
            bail!("dataset '{}' is not harvested", dataset_name);
        }
        let dataset_config = self.config.dataset(dataset_name)?;
        let started = db::now();
        let label = options
            .version
            .clone()
            .unwrap_or_else(|| default_version_label(started));
        if self.store.find_version(dataset.id, &label).await?.is_some() {
            bail!("version '{}' of '{}' already exists", label, dataset_name);
        }

        let previous = self.store.latest_successful_version(dataset.id).await?;
        let historic_sets: Vec<i64> = match &previous {
            Some(version) => self
                .store
                .list_sets(version.id)
                .await?
                .iter()
                .map(|s| s.id)
                .collect(),
            None => Vec::new(),
        };
        let mut version = self
            .store
            .create_version(
                dataset.id,
                &label,
                &version_tasks(dataset.indexing),
                &historic_sets,
            )
            .await?;
        info!(
            dataset = %dataset_name,
            version = %label,
            historic_sets = historic_sets.len(),
            "version created"
        );

        let cache = self.cache.clone().with_cache_only(options.cache_only);
        let seeder = self.seeder(&cache);
        let mut summary = RunSummary {
            version: label.clone(),
            state: VersionState::Building,
            sets: 0,
            documents: 0,
            failed_sets: Vec::new(),
        };
        for entry in &dataset_config.harvest {
            let seeded = self
                .harvest_entry(&seeder, &dataset, &version, entry, options.full, started)
                .await
                .with_context(|| format!("harvesting {}.{}", entry.source, entry.entity))?;
            match seeded {
                Some(Seeded::Ok { documents, .. }) => {
                    summary.sets += 1;
                    summary.documents += documents;
                }
                Some(Seeded::Failed { set }) => {
                    summary.sets += 1;
                    summary.failed_sets.push(set);
                }
                None => {}
            }
        }

        let dispatcher = self.dispatcher(&cache);
        summary.state = dispatcher.run_to_completion(&dataset, &mut version).await?;
        Ok(summary)
    }

    /// Seed the set of one harvest entry. Unavailable and manual source
    /// entities carry their historic set forward; `None` when there is none.
    async fn harvest_entry(
        &self,
        seeder: &Seeder,
        dataset: &Dataset,
        version: &DatasetVersion,
        entry: &HarvestEntry,
        forced_full: bool,
        started: DateTime<Utc>,
    ) -> Result<Option<Seeded>> {
        let source = self
            .config
            .sources
            .get(&entry.source)
            .with_context(|| format!("Unknown source: '{}'", entry.source))?;
        let entity_config = self
            .config
            .source_entity(&entry.source, &entry.entity)
            .with_context(|| {
                format!("Unknown source entity: '{}.{}'", entry.source, entry.entity)
            })?;
        let entity = self.config.entity(&entry.entity)?;
        let name = Set::name_for(&entry.source, &entity_config.set_specification);
        let historic = self.historic_set(version, &name).await?;
        let is_available = source.is_available && entity_config.is_available;
        if !is_available || entity_config.is_manual {
            let Some(historic) = historic else {
                info!(set = %name, available = is_available, "source not harvested; no history to keep");
                return Ok(None);
            };
            let set = self
                .store
                .create_set(
                    version.id,
                    &name,
                    &entry.entity,
                    &entity.identifier,
                    entity_config.delete_policy,
                    &entity.set_tasks,
                )
                .await?;
            let copied = self.store.replace_set_documents(set.id, historic.id).await?;
            info!(set = %name, available = is_available, copied, "source not harvested; historic documents kept");
            return Ok(Some(Seeded::Ok {
                documents: copied as usize,
            }));
        }

        let mut state = self
            .store
            .upsert_harvest_state(
                dataset.id,
                &entry.source,
                &entry.entity,
                &entity_config.set_specification,
            )
            .await?;
        let is_full = is_full_harvest(forced_full, &state, entity_config, started);
        let since = if is_full { None } else { state.harvested_at };

        let set = self
            .store
            .create_set(
                version.id,
                &name,
                &entry.entity,
                &entity.identifier,
                entity_config.delete_policy,
                &entity.set_tasks,
            )
            .await?;
        info!(
            set = %name,
            full = is_full,
            since = ?since,
            historic = historic.is_some(),
            "seeding set"
        );
        self.progress.report(HarvestProgressEvent::Seeding {
            set: name.clone(),
            pages: 0,
        });

        let outcome = async {
            let output = seeder
                .collect(&entry.source, &entry.entity, &entity_config.set_specification, since)
                .await?;
            let unseen = Unseen::for_harvest(is_full, entity_config.delete_policy);
            let report = seeder
                .reconcile(&set, historic.as_ref(), &output, unseen)
                .await?;
            anyhow::Ok((output.harvested_at, output.pages, report))
        }
        .await;

        match outcome {
            Ok((harvested_at, pages, report)) => {
                state.set_id = Some(set.id);
                state.pending_harvested_at = Some(harvested_at.unwrap_or(started));
                if is_full {
                    state.purge_after = entity_config
                        .purge_interval_days
                        .map(|days| started + Duration::days(days));
                }
                self.store.update_harvest_state(&state).await?;
                self.progress.report(HarvestProgressEvent::Seeding {
                    set: name.clone(),
                    pages: pages as u64,
                });
                self.progress.report(HarvestProgressEvent::Seeded {
                    set: name.clone(),
                    documents: report.total() as u64,
                });
                Ok(Some(Seeded::Ok {
                    documents: report.total(),
                }))
            }
            Err(err) if HarvestError::is_cache_miss(&err) || HarvestError::is_fatal(&err) => {
                Err(err)
            }
            Err(err) => {
                error!(set = %name, error = %format!("{:#}", err), "seeding failed; keeping historic documents");
                self.fail_seeding(set, historic.as_ref(), &err).await?;
                Ok(Some(Seeded::Failed { set: name }))
            }
        }
    }

    /// Record a seeding failure on the set and carry the historic
    /// documents forward so the version stays complete.
    async fn fail_seeding(
        &self,
        mut set: Set,
        historic: Option<&Set>,
        err: &anyhow::Error,
    ) -> Result<()> {
        let copied = match historic {
            Some(historic) => self.store.replace_set_documents(set.id, historic.id).await?,
            None => 0,
        };
        set.pipeline.insert(
            "seeding".to_string(),
            PipelineEntry::failure()
                .with_extra("error", json!(format!("{:#}", err)))
                .with_extra("copied", json!(copied)),
        );
        self.store.update_set(&set).await
    }

    async fn historic_set(&self, version: &DatasetVersion, name: &str) -> Result<Option<Set>> {
        for id in &version.historic_sets {
            let set = self.store.get_set(*id).await?;
            if set.name == name {
                return Ok(Some(set));
            }
        }
        Ok(None)
    }

    // ═══════════════════════════════════════════════════════════════════
    // dispatch / promote / delete
    // ═══════════════════════════════════════════════════════════════════

    /// Resume the newest unfinished version of a dataset.
    pub async fn dispatch(&self, dataset_name: &str, cache_only: bool) -> Result<DatasetVersion> {
        let dataset = self.dataset(dataset_name).await?;
        let mut version = self
            .store
            .latest_unfinished_version(dataset.id)
            .await?
            .with_context(|| format!("dataset '{}' has no unfinished version", dataset_name))?;
        let cache = self.cache.clone().with_cache_only(cache_only);
        self.dispatcher(&cache)
            .run_to_completion(&dataset, &mut version)
            .await?;
        Ok(version)
    }

    /// Promote an existing version: alias swap and `is_current`.
    pub async fn promote(&self, dataset_name: &str, label: &str) -> Result<DatasetVersion> {
        let dataset = self.dataset(dataset_name).await?;
        let mut version = self.find_version(&dataset, label).await?;
        match version.state {
            VersionState::Indexed | VersionState::Promoted => {}
            state => bail!(
                "version '{}' is {}; only indexed versions can be promoted",
                label,
                state
            ),
        }
        self.dispatcher(&self.cache).promote(&dataset, &mut version).await?;
        if version.state != VersionState::Promoted {
            version.state = VersionState::Promoted;
            self.store.update_version(&version).await?;
        }
        Ok(version)
    }

    /// Delete a non-current version. Its indices are deleted remotely when
    /// no other version references them.
    pub async fn delete_version(&self, dataset_name: &str, label: &str) -> Result<bool> {
        let dataset = self.dataset(dataset_name).await?;
        let version = self.find_version(&dataset, label).await?;
        if version.is_current {
            bail!("version '{}' is current and cannot be deleted", label);
        }
        let mut removed_index = false;
        if let Some(index_id) = version.index_id {
            let record = self.store.get_index(index_id).await?;
            let references = self.store.index_reference_count(index_id).await?;
            removed_index = self.index.delete(&record, references).await?;
            self.store.delete_version(version.id).await?;
            if removed_index {
                self.store.delete_index_record(index_id).await?;
            }
        } else {
            self.store.delete_version(version.id).await?;
        }
        info!(dataset = %dataset_name, version = %label, removed_index, "version deleted");
        Ok(removed_index)
    }

    async fn find_version(&self, dataset: &Dataset, label: &str) -> Result<DatasetVersion> {
        self.store
            .find_version(dataset.id, label)
            .await?
            .with_context(|| format!("dataset '{}' has no version '{}'", dataset.name, label))
    }
}

enum Seeded {
    Ok { documents: usize },
    Failed { set: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(harvested_at: Option<DateTime<Utc>>, purge_after: Option<DateTime<Utc>>) -> HarvestState {
        let now = Utc::now();
        HarvestState {
            id: 1,
            dataset_id: 1,
            source: "s".into(),
            entity: "e".into(),
            set_specification: "all".into(),
            set_id: None,
            harvested_at,
            pending_harvested_at: None,
            purge_after,
            created_at: now,
            modified_at: now,
        }
    }

    fn entity(policy: DeletePolicy) -> SourceEntityConfig {
        SourceEntityConfig {
            set_specification: "all".into(),
            delete_policy: policy,
            purge_interval_days: None,
            is_available: true,
            is_manual: false,
            allows_update: false,
            phases: Vec::new(),
        }
    }

    #[test]
    fn harvest_mode() {
        let now = Utc::now();
        let earlier = now - Duration::days(1);
        let later = now + Duration::days(1);
        let persistent = entity(DeletePolicy::Persistent);

        assert!(is_full_harvest(false, &state(None, None), &persistent, now));
        assert!(!is_full_harvest(false, &state(Some(earlier), None), &persistent, now));
        assert!(is_full_harvest(true, &state(Some(earlier), None), &persistent, now));
        assert!(is_full_harvest(false, &state(Some(earlier), Some(earlier)), &persistent, now));
        assert!(!is_full_harvest(false, &state(Some(earlier), Some(later)), &persistent, now));
        assert!(is_full_harvest(
            false,
            &state(Some(earlier), None),
            &entity(DeletePolicy::Transient),
            now
        ));
    }

    #[test]
    fn version_labels_sort_by_time() {
        let a = default_version_label("2024-01-02T03:04:05Z".parse().unwrap());
        assert_eq!(a, "20240102-030405");
    }
}
