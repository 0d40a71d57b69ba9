//! Seeding: paginated retrieval, extraction and reconciliation.
//!
//! Seeding one set happens in two steps:
//!
//! 1. [`Seeder::collect`] runs the source entity's phases in order.
//!    `initial` phases page through list responses and produce seeds,
//!    `delta` phases fetch one follow-up resource per seed and merge the
//!    contribution into it, `back_fill` phases page through state-change
//!    records. Post-initialization phases are skipped on full harvests.
//! 2. [`Seeder::reconcile`] turns the seeds into documents of the new set,
//!    inheriting work from the historic set and deciding what happens to
//!    historic documents the harvest did not see.
//!
//! Within a phase seeds keep source order; phases run in declared order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use harvester_core::document::Document;
use harvester_core::models::{DeletePolicy, DocumentState, Seed, Strategy};

use crate::config::{Config, PhaseConfig, RetrieveConfig};
use crate::db;
use crate::error::HarvestError;
use crate::models::Set;
use crate::resources::{ResourceCache, ResourceRequest};
use crate::sources::{extract_seeds, PageRequest, Source, SourceRegistry};
use crate::store::{DocumentFilter, Store};
use crate::template::TemplateContext;

/// Upper bound on pages per phase, guarding against endless pagination.
const MAX_PAGES: usize = 100_000;

/// What reconciliation does with historic documents the harvest did not
/// see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unseen {
    /// Incremental harvest: copy them forward unchanged.
    Keep,
    /// Full harvest with transient deletes: copy them forward as deleted.
    MarkDeleted,
    /// Full harvest otherwise: leave them behind.
    Drop,
    /// Pushed records: only touch what was pushed.
    Ignore,
}

impl Unseen {
    pub fn for_harvest(is_full: bool, policy: DeletePolicy) -> Self {
        match (is_full, policy) {
            (false, _) => Self::Keep,
            (true, DeletePolicy::Transient) => Self::MarkDeleted,
            (true, _) => Self::Drop,
        }
    }
}

/// Seeds collected from a source for one set.
#[derive(Debug, Default)]
pub struct SeedOutput {
    /// Seeds from `initial` phases, enriched by `delta` phases.
    pub seeds: Vec<Seed>,
    /// State-change records from `back_fill` phases.
    pub state_changes: Vec<Seed>,
    /// Harvest time reported by the source (first page that reported one).
    pub harvested_at: Option<DateTime<Utc>>,
    pub pages: usize,
    /// Records skipped because extraction failed.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub copied: usize,
    pub skipped: usize,
}

impl SeedReport {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.copied
    }
}

pub struct Seeder {
    config: Arc<Config>,
    store: Store,
    cache: ResourceCache,
    sources: Arc<SourceRegistry>,
}

fn format_since(since: Option<DateTime<Utc>>, retrieve: &RetrieveConfig) -> String {
    match (since, &retrieve.since_format) {
        (None, _) => String::new(),
        (Some(at), Some(format)) => at.format(format).to_string(),
        (Some(at), None) => at.to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

impl Seeder {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        cache: ResourceCache,
        sources: Arc<SourceRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            sources,
        }
    }

    fn source_for(&self, source_name: &str) -> Result<Arc<dyn Source>> {
        let source = self
            .config
            .sources
            .get(source_name)
            .with_context(|| format!("Unknown source: '{}'", source_name))?;
        self.sources.get(&source.extractor)
    }

    fn phases(&self, source_name: &str, entity: &str) -> Result<&[PhaseConfig]> {
        let entity_config = self
            .config
            .source_entity(source_name, entity)
            .with_context(|| format!("Unknown source entity: '{}.{}'", source_name, entity))?;
        Ok(&entity_config.phases)
    }

    // ─── Retrieval ───────────────────────────────────────────────────

    /// Run every applicable phase of a source entity.
    pub async fn collect(
        &self,
        source_name: &str,
        entity: &str,
        set_specification: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<SeedOutput> {
        let source = self.source_for(source_name)?;
        let identifier = self.config.entity(entity)?.identifier.clone();
        let is_full = since.is_none();
        let mut output = SeedOutput::default();

        for phase in self.phases(source_name, entity)? {
            if is_full && phase.is_post_initialization {
                debug!(phase = %phase.phase, "skipping post-initialization phase on full harvest");
                continue;
            }
            info!(
                source = source_name,
                entity,
                phase = %phase.phase,
                strategy = %phase.strategy,
                "running seeding phase"
            );
            match phase.strategy {
                Strategy::Initial => {
                    let seeds = self
                        .page_through(&*source, phase, set_specification, since, &mut output)
                        .await?;
                    merge_seeds(&mut output.seeds, seeds, &identifier);
                }
                Strategy::BackFill => {
                    let seeds = self
                        .page_through(&*source, phase, set_specification, since, &mut output)
                        .await?;
                    output.state_changes.extend(seeds);
                }
                Strategy::Delta => {
                    self.enrich(&source, phase, set_specification, since, &mut output)
                        .await?;
                }
            }
        }
        Ok(output)
    }

    async fn page_through(
        &self,
        source: &dyn Source,
        phase: &PhaseConfig,
        set_specification: &str,
        since: Option<DateTime<Utc>>,
        output: &mut SeedOutput,
    ) -> Result<Vec<Seed>> {
        let retrieve = &phase.retrieve_data;
        let since_text = format_since(since, retrieve);
        let ctx = TemplateContext {
            set_specification,
            since: &since_text,
            identity: None,
            properties: None,
        };
        let mut request = PageRequest::first(
            &retrieve.pagination,
            ctx.render(&retrieve.url)?,
            ctx.render_params(&retrieve.params)?,
        );
        let body = retrieve.body.as_ref().map(|b| ctx.render_value(b)).transpose()?;
        let args = ctx.render_args(&retrieve.args)?;

        let mut seeds = Vec::new();
        for _ in 0..MAX_PAGES {
            let (resource, _) = self
                .cache
                .refresh(&ResourceRequest {
                    kind: retrieve.resource.clone(),
                    method: retrieve.method.clone(),
                    uri: request.url.clone(),
                    params: request.params.clone(),
                    body: body.clone(),
                    args: args.clone(),
                })
                .await
                .with_context(|| format!("phase '{}' page {}", phase.phase, request.url))?;
            if resource.is_transient_failure() {
                return Err(HarvestError::TransientFetch {
                    uri: resource.uri.clone(),
                    reason: format!("status {}", resource.status),
                }
                .into());
            }
            if !resource.is_success() {
                bail!(
                    "phase '{}': {} answered status {}",
                    phase.phase,
                    resource.uri,
                    resource.status
                );
            }

            let page = resource.payload()?;
            output.pages += 1;
            if output.harvested_at.is_none() {
                output.harvested_at = source.harvested_at(phase, &page)?;
            }
            let mut extracted = 0;
            for record in extract_seeds(source, phase, &page)? {
                match record {
                    Ok(seed) => {
                        extracted += 1;
                        seeds.push(seed);
                    }
                    Err(err) => {
                        output.skipped += 1;
                        let err = HarvestError::Extraction {
                            source_name: source.name().to_string(),
                            message: err.to_string(),
                        };
                        warn!(phase = %phase.phase, error = %err, "skipping record");
                    }
                }
            }
            self.cache.mark_extracted(resource.id).await?;
            debug!(phase = %phase.phase, url = %request.url, extracted, "page extracted");

            match source.next_request(phase, &page, &request, extracted)? {
                Some(next) if next != request => request = next,
                _ => return Ok(seeds),
            }
        }
        bail!("phase '{}' exceeded {} pages", phase.phase, MAX_PAGES)
    }

    /// Fetch one follow-up resource per seed and merge its contribution.
    async fn enrich(
        &self,
        source: &Arc<dyn Source>,
        phase: &PhaseConfig,
        set_specification: &str,
        since: Option<DateTime<Utc>>,
        output: &mut SeedOutput,
    ) -> Result<()> {
        let since_text = format_since(since, &phase.retrieve_data);
        let semaphore = Arc::new(Semaphore::new(self.config.harvest.concurrency));
        let mut join_set = JoinSet::new();

        for (index, seed) in output.seeds.iter().enumerate() {
            if seed.is_deleted() {
                continue;
            }
            let properties = Value::Object(seed.properties.clone());
            let ctx = TemplateContext {
                set_specification,
                since: &since_text,
                identity: None,
                properties: Some(&properties),
            };
            let retrieve = &phase.retrieve_data;
            let rendered = (|| {
                anyhow::Ok(ResourceRequest {
                    kind: retrieve.resource.clone(),
                    method: retrieve.method.clone(),
                    uri: ctx.render(&retrieve.url)?,
                    params: ctx.render_params(&retrieve.params)?,
                    body: retrieve.body.as_ref().map(|b| ctx.render_value(b)).transpose()?,
                    args: ctx.render_args(&retrieve.args)?,
                })
            })();
            let request = match rendered {
                Ok(request) => request,
                Err(err) => {
                    warn!(
                        phase = %phase.phase,
                        error = %format!("{:#}", err),
                        "follow-up request not renderable; keeping seed as listed"
                    );
                    continue;
                }
            };
            let cache = self.cache.clone();
            let source = Arc::clone(source);
            let phase = phase.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                let outcome = async {
                    let (resource, _) = cache.refresh(&request).await?;
                    if !resource.is_success() {
                        bail!("{} answered status {}", resource.uri, resource.status);
                    }
                    let page = resource.payload()?;
                    let records = extract_seeds(&*source, &phase, &page)?;
                    cache.mark_extracted(resource.id).await?;
                    anyhow::Ok(records)
                }
                .await;
                match outcome {
                    Ok(records) => anyhow::Ok((index, Ok(records))),
                    Err(err) if HarvestError::is_cache_miss(&err) || HarvestError::is_fatal(&err) => {
                        Err(err)
                    }
                    Err(err) => anyhow::Ok((index, Err(format!("{:#}", err)))),
                }
            });
        }

        let mut contributions = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            let (index, result) = joined.context("delta fetch task failed")??;
            contributions.insert(index, result);
        }

        let mut dropped = HashSet::new();
        for (index, result) in contributions {
            match result {
                Ok(records) => match records.into_iter().next() {
                    Some(Ok(seed)) => output.seeds[index].merge(seed.properties),
                    Some(Err(err)) => {
                        warn!(phase = %phase.phase, error = %err, "skipping record");
                        dropped.insert(index);
                    }
                    None => {}
                },
                Err(reason) => {
                    warn!(phase = %phase.phase, error = %reason, "follow-up fetch failed; keeping seed as listed");
                }
            }
        }
        if !dropped.is_empty() {
            output.skipped += dropped.len();
            let mut index = 0;
            output.seeds.retain(|_| {
                let keep = !dropped.contains(&index);
                index += 1;
                keep
            });
        }
        Ok(())
    }

    // ─── Reconciliation ──────────────────────────────────────────────

    /// Upsert seeds into `set`, inheriting from `historic`.
    pub async fn reconcile(
        &self,
        set: &Set,
        historic: Option<&Set>,
        output: &SeedOutput,
        unseen: Unseen,
    ) -> Result<SeedReport> {
        let tasks = self.config.entity(&set.entity)?.tasks.clone();
        let provider = self.provider(set.source());
        let now = db::now();
        let mut report = SeedReport {
            skipped: output.skipped,
            ..Default::default()
        };

        let mut working: HashMap<String, Document> = self
            .store
            .list_documents(set.id, DocumentFilter::All)
            .await?
            .into_iter()
            .map(|d| (d.identity.clone(), d))
            .collect();
        let mut historic_docs: HashMap<String, Document> = match historic {
            Some(historic) => self
                .store
                .list_documents(historic.id, DocumentFilter::All)
                .await?
                .into_iter()
                .map(|d| (d.identity.clone(), d))
                .collect(),
            None => HashMap::new(),
        };
        let mut order: Vec<String> = Vec::new();
        let mut touched: HashSet<String> = HashSet::new();

        for seed in &output.seeds {
            let Some(identity) = seed.identity(&set.identifier) else {
                report.skipped += 1;
                warn!(set = %set.name, identifier = %set.identifier, "seed without identity skipped");
                continue;
            };
            if let Some(doc) = working.get_mut(&identity) {
                // Delete records carry little more than the identity; keep
                // the stored properties and only change the state.
                let changed = if seed.is_deleted() {
                    doc.set_state(DocumentState::Deleted, now)
                } else {
                    !doc.update_from_seed(seed, now).is_noop()
                };
                match (changed, seed.is_deleted()) {
                    (false, _) => report.unchanged += 1,
                    (true, true) => report.deleted += 1,
                    (true, false) => report.updated += 1,
                }
            } else if let Some(previous) = historic_docs.remove(&identity) {
                let doc = if seed.is_deleted() {
                    let mut doc = previous.copy_to_set(set.id);
                    if doc.set_state(DocumentState::Deleted, now) {
                        report.deleted += 1;
                    } else {
                        report.unchanged += 1;
                    }
                    doc
                } else {
                    let mut doc =
                        Document::from_seed(set.id, &set.entity, &identity, seed, &tasks, now);
                    doc.metadata.provider = provider.clone();
                    let outcome = doc.inherit_from(&previous, now);
                    if outcome.hash_changed || previous.state != doc.state {
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                    doc
                };
                working.insert(identity.clone(), doc);
            } else if seed.is_deleted() {
                // Deleting something never harvested is a no-op.
                report.skipped += 1;
                continue;
            } else {
                let mut doc =
                    Document::from_seed(set.id, &set.entity, &identity, seed, &tasks, now);
                doc.metadata.provider = provider.clone();
                working.insert(identity.clone(), doc);
                report.created += 1;
            }
            if touched.insert(identity.clone()) {
                order.push(identity);
            }
        }

        for change in &output.state_changes {
            let Some(identity) = change.identity(&set.identifier) else {
                report.skipped += 1;
                continue;
            };
            if !working.contains_key(&identity) {
                match historic_docs.remove(&identity) {
                    Some(previous) => {
                        working.insert(identity.clone(), previous.copy_to_set(set.id));
                    }
                    None => continue,
                }
            }
            let state = change.state();
            if let Some(doc) = working.get_mut(&identity) {
                if doc.set_state(state, now) && state != DocumentState::Active {
                    report.deleted += 1;
                }
            }
            if touched.insert(identity.clone()) {
                order.push(identity);
            }
        }

        if unseen != Unseen::Ignore {
            let mut leftovers: Vec<Document> = historic_docs
                .into_values()
                .filter(|d| !working.contains_key(&d.identity))
                .collect();
            leftovers.sort_by_key(|d| d.id);
            for previous in leftovers {
                match unseen {
                    Unseen::Keep => {
                        order.push(previous.identity.clone());
                        working.insert(previous.identity.clone(), previous.copy_to_set(set.id));
                        report.copied += 1;
                    }
                    Unseen::MarkDeleted => {
                        let mut doc = previous.copy_to_set(set.id);
                        if doc.set_state(DocumentState::Deleted, now) {
                            report.deleted += 1;
                        }
                        order.push(previous.identity.clone());
                        working.insert(previous.identity.clone(), doc);
                        report.copied += 1;
                    }
                    Unseen::Drop | Unseen::Ignore => {}
                }
            }
        }

        // Persist in seed order; documents untouched in this set are
        // already stored as they are.
        let mut changed: Vec<Document> = order
            .iter()
            .filter_map(|identity| working.remove(identity))
            .collect();
        for chunk in changed.chunks_mut(self.config.harvest.default_batch_size.max(1)) {
            self.store.save_documents(chunk).await?;
        }

        info!(
            set = %set.name,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            deleted = report.deleted,
            copied = report.copied,
            skipped = report.skipped,
            "set reconciled"
        );
        Ok(report)
    }

    /// Upsert records pushed by a source into an existing set.
    pub async fn seed_payload(
        &self,
        source_name: &str,
        set: &Set,
        payload: Value,
    ) -> Result<SeedReport> {
        let source = self.source_for(source_name)?;
        let phase = self
            .phases(source_name, &set.entity)?
            .iter()
            .find(|p| p.strategy == Strategy::Initial)
            .with_context(|| format!("source '{}' has no initial phase", source_name))?;
        let allows_update = self
            .config
            .source_entity(source_name, &set.entity)
            .is_some_and(|entity| entity.allows_update);
        let page = source.transform_webhook(payload)?;
        let mut output = SeedOutput::default();
        for record in extract_seeds(&*source, phase, &page)? {
            match record {
                Ok(seed) => output.seeds.push(seed),
                Err(err) => {
                    output.skipped += 1;
                    warn!(source = source_name, error = %err, "skipping pushed record");
                }
            }
        }
        if !allows_update {
            let existing: HashSet<String> = self
                .store
                .list_documents(set.id, DocumentFilter::All)
                .await?
                .into_iter()
                .map(|d| d.identity)
                .collect();
            let before = output.seeds.len();
            output.seeds.retain(|seed| {
                seed.identity(&set.identifier)
                    .map_or(true, |identity| !existing.contains(&identity))
            });
            let refused = before - output.seeds.len();
            if refused > 0 {
                output.skipped += refused;
                warn!(
                    source = source_name,
                    set = %set.name,
                    refused,
                    "source does not allow updates; pushed records for existing documents skipped"
                );
            }
        }
        self.reconcile(set, None, &output, Unseen::Ignore).await
    }

    /// Provider recorded on new documents: the configured name, else the
    /// source name.
    fn provider(&self, source_name: &str) -> Option<String> {
        let source = self.config.sources.get(source_name)?;
        Some(
            source
                .provider
                .clone()
                .unwrap_or_else(|| source_name.to_string()),
        )
    }
}

/// Append seeds, letting a later seed for the same identity replace the
/// earlier one in place.
fn merge_seeds(target: &mut Vec<Seed>, seeds: Vec<Seed>, identifier: &str) {
    let mut positions: HashMap<String, usize> = target
        .iter()
        .enumerate()
        .filter_map(|(i, s)| Some((s.identity(identifier)?, i)))
        .collect();
    for seed in seeds {
        match seed.identity(identifier) {
            Some(identity) => match positions.get(&identity) {
                Some(&position) => target[position] = seed,
                None => {
                    positions.insert(identity, target.len());
                    target.push(seed);
                }
            },
            None => target.push(seed),
        }
    }
}
