//! Pipeline processor: runs document tasks in batches.
//!
//! One round over a set:
//!
//! 1. Load the set's pending documents and compute every document's pending
//!    tasks (dependencies succeeded, watched paths present, checks hold, no
//!    terminal outcome yet). Documents without pending tasks are finished.
//! 2. Group documents by task and split each group into batches of the
//!    task's `batch_size`.
//! 3. Per batch: create a `batches` row, fetch one resource per document
//!    through the [`ResourceCache`] and record a `process_results` row for
//!    each.
//! 4. Lock the batch's documents (no-wait, retried), reload them and merge
//!    the outcomes into `pipeline`, `derivatives` or `properties`, then save
//!    and release. A batch that cannot be locked is left for the next pass.
//!
//! [`PipelineProcessor::process_set`] repeats rounds until a round makes
//! no progress, so dependent tasks run as soon as their dependencies
//! succeed and transient failures are retried up to
//! `harvest.max_fetch_attempts`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use harvester_core::document::Document;
use harvester_core::models::PipelineEntry;
use harvester_core::objective::Objective;
use harvester_core::tasks::{execution_order, TaskConfig};

use crate::blob::BlobStore;
use crate::config::{Config, TaskSettings};
use crate::db;
use crate::error::HarvestError;
use crate::kinds::{EntityKind, KindChecks, KindRegistry};
use crate::models::{Resource, Set};
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter, NoProgress};
use crate::resources::{ResourceCache, ResourceRequest};
use crate::store::{DocumentFilter, Store};
use crate::template::TemplateContext;

/// Outcome counts of one task over one or more batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retried: usize,
    pub not_found: usize,
    pub auto_succeeded: usize,
    /// Documents left for the next pass because their locks were held.
    pub deferred: usize,
}

impl TaskReport {
    fn add(&mut self, other: &TaskReport) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.retried += other.retried;
        self.not_found += other.not_found;
        self.auto_succeeded += other.auto_succeeded;
        self.deferred += other.deferred;
    }

    /// Outcomes written to documents.
    fn recorded(&self) -> usize {
        self.succeeded + self.failed + self.retried + self.not_found + self.auto_succeeded
    }
}

/// Result of one or more rounds over a set.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub rounds: usize,
    pub tasks: BTreeMap<String, TaskReport>,
    /// Documents marked finished because nothing was pending any more.
    pub finished: usize,
    /// Documents still pending afterwards.
    pub pending: usize,
}

impl PassReport {
    pub fn deferred(&self) -> usize {
        self.tasks.values().map(|t| t.deferred).sum()
    }
}

/// What happened when fetching the resource of one document.
enum Fetched {
    Resource(Resource),
    /// The call itself failed (connection refused, timeout …).
    Transport(String),
    /// The request could not be built from the document.
    Invalid(String),
}

#[derive(Clone)]
pub struct PipelineProcessor {
    config: Arc<Config>,
    store: Store,
    cache: ResourceCache,
    kinds: Arc<KindRegistry>,
    blobs: Option<Arc<dyn BlobStore>>,
    progress: Arc<dyn HarvestProgressReporter>,
}

impl PipelineProcessor {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        cache: ResourceCache,
        kinds: Arc<KindRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            kinds,
            blobs: None,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn HarvestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    fn max_attempts(&self) -> u32 {
        self.config.harvest.max_fetch_attempts
    }

    fn kind_for(&self, entity: &str) -> Result<Arc<dyn EntityKind>> {
        let kind = self
            .config
            .entities
            .get(entity)
            .map(|e| e.kind.as_str())
            .unwrap_or("generic");
        self.kinds.get(kind)
    }

    // ─── Rounds ──────────────────────────────────────────────────────

    /// Run rounds over the pending documents of a set until nothing moves.
    pub async fn process_set(&self, set: &Set) -> Result<PassReport> {
        let entity_tasks = self.config.entity(&set.entity)?.tasks.len().max(1);
        let max_rounds = entity_tasks * (self.max_attempts().max(1) as usize) + 2;
        let mut report = PassReport::default();

        for _ in 0..max_rounds {
            let ids: Vec<i64> = self
                .store
                .list_documents(set.id, DocumentFilter::Pending)
                .await?
                .into_iter()
                .filter_map(|d| d.id)
                .collect();
            if ids.is_empty() {
                break;
            }
            let round = self.dispatch_document_tasks(set, &ids).await?;
            report.rounds += 1;
            report.finished += round.finished;
            let mut recorded = 0;
            for (task, task_report) in &round.tasks {
                recorded += task_report.recorded();
                report
                    .tasks
                    .entry(task.clone())
                    .or_default()
                    .add(task_report);
            }
            if recorded == 0 && round.finished == 0 {
                break;
            }
        }

        report.pending = self.store.count_pending_documents(set.id).await? as usize;
        info!(
            set = %set.name,
            rounds = report.rounds,
            finished = report.finished,
            pending = report.pending,
            deferred = report.deferred(),
            "pipeline pass complete"
        );
        Ok(report)
    }

    /// One round over the given documents: group their pending tasks by
    /// name and run each group.
    pub async fn dispatch_document_tasks(&self, set: &Set, ids: &[i64]) -> Result<PassReport> {
        let now = db::now();
        let kind = self.kind_for(&set.entity)?;
        let docs = self.store.load_documents(ids).await?;

        let mut groups: BTreeMap<String, (TaskConfig, Vec<i64>)> = BTreeMap::new();
        let mut idle = Vec::new();
        for doc in docs {
            let Some(id) = doc.id else { continue };
            let checks = KindChecks {
                kind: kind.as_ref(),
                doc: &doc,
            };
            let pending = doc
                .pending_tasks(&checks, self.max_attempts())
                .with_context(|| format!("document '{}'", doc.identity))?;
            if pending.is_empty() {
                if doc.is_pending() {
                    idle.push(doc);
                }
                continue;
            }
            for task in pending {
                if let Some(config) = doc.tasks.get(&task) {
                    groups
                        .entry(task)
                        .or_insert_with(|| (config.clone(), Vec::new()))
                        .1
                        .push(id);
                }
            }
        }

        let mut report = PassReport {
            rounds: 1,
            ..Default::default()
        };
        if !idle.is_empty() {
            report.finished = self.finish_documents(idle, now).await?;
        }

        // Dependencies first; names outside the entity's graph come last.
        let mut order = execution_order(&self.config.entity(&set.entity)?.tasks)?;
        let extra: Vec<String> = groups
            .keys()
            .filter(|k| !order.contains(k))
            .cloned()
            .collect();
        order.extend(extra);
        for task in order {
            let Some((config, ids)) = groups.remove(&task) else {
                continue;
            };
            let task_report = self.run_task(set, &task, &config, ids).await?;
            report.tasks.insert(task, task_report);
        }
        Ok(report)
    }

    async fn finish_documents(&self, docs: Vec<Document>, now: DateTime<Utc>) -> Result<usize> {
        let ids: Vec<i64> = docs.iter().filter_map(|d| d.id).collect();
        let guard = match self.lock(&ids).await? {
            Some(guard) => guard,
            None => return Ok(0),
        };
        let result = async {
            let mut fresh = self.store.load_documents(&ids).await?;
            let mut finished = 0;
            for doc in &mut fresh {
                if doc.is_pending() {
                    doc.mark_finished(now);
                    finished += 1;
                }
            }
            self.store.save_documents(&mut fresh).await?;
            anyhow::Ok(finished)
        }
        .await;
        self.store.release_locks(guard).await?;
        result
    }

    /// Lock documents, or `None` when they stay contended.
    async fn lock(&self, ids: &[i64]) -> Result<Option<crate::store::LockGuard>> {
        let harvest = &self.config.harvest;
        match self
            .store
            .lock_documents(
                ids,
                harvest.lock_attempts,
                Duration::from_secs(harvest.lock_retry_delay_secs),
            )
            .await
        {
            Ok(guard) => Ok(Some(guard)),
            Err(err) if HarvestError::is_contention(&err) => {
                warn!(documents = ids.len(), error = %err, "documents locked elsewhere; deferring");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    // ─── Tasks ───────────────────────────────────────────────────────

    async fn run_task(
        &self,
        set: &Set,
        task: &str,
        config: &TaskConfig,
        ids: Vec<i64>,
    ) -> Result<TaskReport> {
        let settings = TaskSettings::from_task(config)
            .with_context(|| format!("task '{}'", task))?;
        let batch_size = settings
            .batch_size
            .unwrap_or(self.config.harvest.default_batch_size)
            .max(1);
        let total = ids.len() as u64;
        let batches: Vec<Vec<i64>> = ids.chunks(batch_size).map(<[i64]>::to_vec).collect();
        debug!(set = %set.name, task, documents = total, batches = batches.len(), "running task");

        let mut report = TaskReport::default();
        if settings.is_async {
            let semaphore = Arc::new(Semaphore::new(self.config.harvest.concurrency.max(1)));
            let mut join_set = JoinSet::new();
            for batch in batches {
                let processor = self.clone();
                let set = set.clone();
                let task = task.to_string();
                let config = config.clone();
                let settings = settings.clone();
                let semaphore = Arc::clone(&semaphore);
                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await?;
                    processor
                        .process_batch(&set, &task, &config, &settings, &batch)
                        .await
                });
            }
            // Single finisher: collect every batch before reporting.
            while let Some(joined) = join_set.join_next().await {
                let batch_report = joined.context("pipeline batch task failed")??;
                report.add(&batch_report);
                self.report_progress(set, task, &report, total);
            }
        } else {
            for batch in batches {
                let batch_report = self
                    .process_batch(set, task, config, &settings, &batch)
                    .await?;
                report.add(&batch_report);
                self.report_progress(set, task, &report, total);
            }
        }
        info!(
            set = %set.name,
            task,
            succeeded = report.succeeded,
            failed = report.failed,
            retried = report.retried,
            not_found = report.not_found,
            auto_succeeded = report.auto_succeeded,
            deferred = report.deferred,
            "task processed"
        );
        Ok(report)
    }

    fn report_progress(&self, set: &Set, task: &str, report: &TaskReport, total: u64) {
        self.progress.report(HarvestProgressEvent::Processing {
            set: set.name.clone(),
            task: task.to_string(),
            n: (report.processed + report.deferred) as u64,
            total,
        });
    }

    /// Fetch, lock, merge and save one batch.
    pub async fn process_batch(
        &self,
        set: &Set,
        task: &str,
        config: &TaskConfig,
        settings: &TaskSettings,
        ids: &[i64],
    ) -> Result<TaskReport> {
        let mut report = TaskReport::default();
        let batch = self.store.create_batch(set.id, task).await?;

        // Tasks without resources have nothing to fetch.
        let Some(resource_kind) = config.resources.first() else {
            let Some(guard) = self.lock(ids).await? else {
                report.deferred = ids.len();
                self.store.finish_batch(batch.id, false).await?;
                return Ok(report);
            };
            let result = async {
                let mut docs = self.store.load_documents(ids).await?;
                for doc in &mut docs {
                    if let Some(id) = doc.id {
                        self.store.add_process_result(batch.id, id, None).await?;
                    }
                    doc.record_task(task, PipelineEntry::auto_succeed());
                    report.processed += 1;
                    report.auto_succeeded += 1;
                }
                self.store.save_documents(&mut docs).await
            }
            .await;
            self.store.release_locks(guard).await?;
            result?;
            self.store.finish_batch(batch.id, settings.is_async).await?;
            return Ok(report);
        };

        let docs = self.store.load_documents(ids).await?;
        let mut fetched: HashMap<i64, Fetched> = HashMap::new();
        for doc in &docs {
            let Some(id) = doc.id else { continue };
            let outcome = match self.request_for(resource_kind, settings, doc) {
                Err(err) => Fetched::Invalid(format!("{:#}", err)),
                Ok(request) => match self.cache.fetch(&request).await {
                    Ok((resource, fresh)) => {
                        debug!(document = %doc.identity, resource = resource.id, fresh, status = resource.status, "resource fetched");
                        Fetched::Resource(resource)
                    }
                    Err(err) if HarvestError::is_cache_miss(&err) => return Err(err),
                    Err(err) => Fetched::Transport(format!("{:#}", err)),
                },
            };
            let resource_id = match &outcome {
                Fetched::Resource(resource) => Some(resource.id),
                _ => None,
            };
            self.store
                .add_process_result(batch.id, id, resource_id)
                .await?;
            fetched.insert(id, outcome);
        }

        let Some(guard) = self.lock(ids).await? else {
            report.deferred = ids.len();
            self.store.finish_batch(batch.id, false).await?;
            return Ok(report);
        };
        let kind = self.kind_for(&set.entity)?;
        let result = async {
            // Reload under the lock so concurrent writers are not overwritten.
            let mut docs = self.store.load_documents(ids).await?;
            let now = db::now();
            for doc in &mut docs {
                let Some(outcome) = doc.id.and_then(|id| fetched.remove(&id)) else {
                    continue;
                };
                report.processed += 1;
                self.merge(
                    doc,
                    task,
                    resource_kind,
                    settings,
                    kind.as_ref(),
                    outcome,
                    now,
                    &mut report,
                )
                .await?;
            }
            self.store.save_documents(&mut docs).await
        }
        .await;
        self.store.release_locks(guard).await?;
        result?;
        self.store.finish_batch(batch.id, settings.is_async).await?;
        Ok(report)
    }

    fn request_for(
        &self,
        resource_kind: &str,
        settings: &TaskSettings,
        doc: &Document,
    ) -> Result<ResourceRequest> {
        let properties = doc.properties_value();
        let ctx = TemplateContext {
            identity: Some(&doc.identity),
            properties: Some(&properties),
            ..Default::default()
        };
        let uri = ctx.render(settings.url_template())?;
        let is_shell = self
            .config
            .resource(resource_kind)
            .map(|r| r.resource_type == crate::config::ResourceType::Shell)
            .unwrap_or(false);
        if uri.trim().is_empty() && !is_shell {
            anyhow::bail!("request uri '{}' rendered empty", settings.url_template());
        }
        Ok(ResourceRequest {
            kind: resource_kind.to_string(),
            method: settings.method.clone(),
            uri,
            params: ctx.render_params(&settings.params)?,
            body: settings
                .body
                .as_ref()
                .map(|b| ctx.render_value(b))
                .transpose()?,
            args: ctx.render_args(&settings.args)?,
        })
    }

    // ─── Merge ───────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn merge(
        &self,
        doc: &mut Document,
        task: &str,
        resource_kind: &str,
        settings: &TaskSettings,
        kind: &dyn EntityKind,
        outcome: Fetched,
        now: DateTime<Utc>,
        report: &mut TaskReport,
    ) -> Result<()> {
        let resource = match outcome {
            Fetched::Invalid(reason) => {
                warn!(document = %doc.identity, task, %reason, "cannot build request");
                doc.record_task(task, PipelineEntry::failure().with_extra("error", json!(reason)));
                report.failed += 1;
                return Ok(());
            }
            Fetched::Transport(reason) => {
                warn!(document = %doc.identity, task, %reason, "fetch failed; will retry");
                doc.record_retry(task, PipelineEntry::failure().with_extra("error", json!(reason)));
                report.retried += 1;
                return Ok(());
            }
            Fetched::Resource(resource) => resource,
        };

        if resource.is_transient_failure() {
            doc.record_retry(
                task,
                PipelineEntry::from_resource(resource_kind, resource.id, false),
            );
            report.retried += 1;
            return Ok(());
        }

        if settings.apply_resource {
            kind.apply_resource(doc, &resource, now);
        }
        if resource.is_not_found() {
            info!(
                document = %doc.identity,
                task,
                error = %HarvestError::NotFound { uri: resource.uri.clone() },
                "document gone upstream"
            );
            doc.record_task(
                task,
                PipelineEntry::from_resource(resource_kind, resource.id, false),
            );
            doc.apply_not_found(now);
            report.not_found += 1;
            return Ok(());
        }
        if !resource.is_success() {
            doc.record_task(
                task,
                PipelineEntry::from_resource(resource_kind, resource.id, false),
            );
            report.failed += 1;
            return Ok(());
        }

        match self.contribution(task, settings, &resource).await {
            Ok(contribution) => {
                match &settings.to_property {
                    Some(key) => {
                        doc.properties.insert(key.clone(), contribution);
                    }
                    None if !contribution.is_null() => doc.record_derivative(task, contribution),
                    None => {}
                }
                doc.record_task(
                    task,
                    PipelineEntry::from_resource(resource_kind, resource.id, true),
                );
                report.succeeded += 1;
            }
            Err(err) => {
                warn!(document = %doc.identity, task, resource = resource.id, error = %err, "contribution extraction failed");
                doc.record_task(
                    task,
                    PipelineEntry::from_resource(resource_kind, resource.id, false)
                        .with_extra("error", json!(format!("{:#}", err))),
                );
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// The value a successful resource contributes to its document.
    ///
    /// With an objective the first extracted record; without one the whole
    /// payload. A stored blob adds `blob`, `content_type` and `size`.
    async fn contribution(
        &self,
        task: &str,
        settings: &TaskSettings,
        resource: &Resource,
    ) -> Result<Value> {
        let payload = resource.payload()?;
        let mut contribution = if settings.objective.is_empty() {
            payload
        } else if payload.is_null() {
            Value::Object(Map::new())
        } else {
            let objective = Objective::from_paths(&settings.objective)?;
            match objective.extract(&payload).into_iter().next() {
                Some(record) => Value::Object(record?),
                None => Value::Object(Map::new()),
            }
        };

        if settings.store_blob {
            let blobs = self
                .blobs
                .as_ref()
                .with_context(|| format!("task '{}' stores blobs but no blob store is set", task))?;
            let bytes = resource.bytes()?;
            let key = blobs
                .put(task, extension_for(resource.content_type()), &bytes)
                .await?;
            let mut object = match contribution {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("payload".to_string(), other);
                    map
                }
            };
            object.insert("blob".to_string(), json!(key));
            object.insert("content_type".to_string(), json!(resource.content_type()));
            object.insert("size".to_string(), json!(bytes.len()));
            contribution = Value::Object(object);
        }
        Ok(contribution)
    }
}

fn extension_for(content_type: Option<&str>) -> Option<&'static str> {
    let mime = content_type?.split(';').next()?.trim().to_ascii_lowercase();
    Some(match mime.as_str() {
        "application/pdf" => "pdf",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "text/html" => "html",
        "text/plain" => "txt",
        "application/json" => "json",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_from_content_types() {
        assert_eq!(extension_for(Some("application/pdf")), Some("pdf"));
        assert_eq!(extension_for(Some("image/JPEG; charset=binary")), Some("jpg"));
        assert_eq!(extension_for(Some("application/x-unknown")), None);
        assert_eq!(extension_for(None), None);
    }

    #[test]
    fn reports_add_up() {
        let mut total = TaskReport::default();
        total.add(&TaskReport {
            processed: 3,
            succeeded: 2,
            not_found: 1,
            ..Default::default()
        });
        total.add(&TaskReport {
            deferred: 4,
            ..Default::default()
        });
        assert_eq!(total.processed, 3);
        assert_eq!(total.recorded(), 3);
        assert_eq!(total.deferred, 4);
    }
}
