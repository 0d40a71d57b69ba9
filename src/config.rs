//! TOML configuration.
//!
//! One file describes the whole harvester: database, search backend, blob
//! storage, resource kinds, sources with their entities and seeding phases,
//! per-entity document and set tasks, and the datasets built from them.
//! The parsed [`Config`] is passed explicitly to every component.
//!
//! ```toml
//! [db]
//! path = "./data/harvester.sqlite"
//!
//! [resources.http]
//! type = "http"
//! headers = { Authorization = "Bearer ${EDUREP_TOKEN}" }
//!
//! [sources.edurep]
//! extractor = "oai_pmh"
//!
//! [sources.edurep.entities.products]
//! set_specification = "edurep_delen"
//! delete_policy = "transient"
//!
//! [[sources.edurep.entities.products.phases]]
//! phase = "records"
//! strategy = "initial"
//! retrieve_data = { resource = "http", url = "https://example.org/oai?verb=ListRecords&set={set_specification}" }
//!
//! [entities.products]
//! identifier = "external_id"
//!
//! [datasets.edusources]
//! indexing = "index_and_promote"
//! harvest = [{ source = "edurep", entity = "products" }]
//! ```

use anyhow::{bail, Context, Result};
use globset::Glob;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use harvester_core::document::Document;
use harvester_core::models::{DeletePolicy, IndexingOption, Strategy};
use harvester_core::tasks::{self as task_graph, TaskConfig, TaskMap};

use crate::error::HarvestError;
use crate::kinds::GenericKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub blobs: BlobConfig,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceConfig>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub entities: BTreeMap<String, EntityConfig>,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

// ═══════════════════════════════════════════════════════════════════════
// [harvest]
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_secs: u64,
    #[serde(default = "default_dispatch_max_retries")]
    pub dispatch_max_retries: u32,
    #[serde(default = "default_dispatch_retry_delay")]
    pub dispatch_retry_delay_secs: u64,
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,
    /// Glob patterns of query keys dropped during URI normalization.
    #[serde(default = "default_volatile_query_keys")]
    pub volatile_query_keys: Vec<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            lock_attempts: default_lock_attempts(),
            lock_retry_delay_secs: default_lock_retry_delay(),
            dispatch_max_retries: default_dispatch_max_retries(),
            dispatch_retry_delay_secs: default_dispatch_retry_delay(),
            default_batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_fetch_attempts: default_max_fetch_attempts(),
            volatile_query_keys: default_volatile_query_keys(),
        }
    }
}

fn default_lock_attempts() -> u32 {
    3
}
fn default_lock_retry_delay() -> u64 {
    5
}
fn default_dispatch_max_retries() -> u32 {
    5
}
fn default_dispatch_retry_delay() -> u64 {
    300
}
fn default_batch_size() -> usize {
    100
}
fn default_concurrency() -> usize {
    4
}
fn default_max_fetch_attempts() -> u32 {
    3
}
fn default_volatile_query_keys() -> Vec<String> {
    ["utm_*", "fbclid", "gclid", "sessionid", "jsessionid", "_"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// [search] and [blobs]
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackendKind {
    #[default]
    OpenSearch,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default)]
    pub backend: SearchBackendKind,
    #[serde(default = "default_search_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_bulk_chunk_size")]
    pub bulk_chunk_size: usize,
    #[serde(default = "default_bulk_timeout")]
    pub bulk_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend: SearchBackendKind::default(),
            url: default_search_url(),
            username: None,
            password: None,
            bulk_chunk_size: default_bulk_chunk_size(),
            bulk_timeout_secs: default_bulk_timeout(),
        }
    }
}

fn default_search_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_bulk_chunk_size() -> usize {
    100
}
fn default_bulk_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    #[serde(default = "default_blob_path")]
    pub path: PathBuf,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            path: default_blob_path(),
        }
    }
}

fn default_blob_path() -> PathBuf {
    PathBuf::from("./data/blobs")
}

// ═══════════════════════════════════════════════════════════════════════
// [resources.<kind>]
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Http,
    Shell,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_resource_timeout")]
    pub timeout_secs: u64,
    /// Cached responses older than this are refetched and purgeable.
    #[serde(default)]
    pub purge_after_days: Option<i64>,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Executable for shell resources.
    #[serde(default)]
    pub program: Option<String>,
}

fn default_resource_timeout() -> u64 {
    30
}
fn default_max_redirects() -> usize {
    10
}

// ═══════════════════════════════════════════════════════════════════════
// [sources.<module>]
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Registered extractor implementation (`oai_pmh`, `json_api`, …).
    pub extractor: String,
    #[serde(default = "default_true")]
    pub is_available: bool,
    /// Recorded as `metadata.provider`; defaults to the source name.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub entities: BTreeMap<String, SourceEntityConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceEntityConfig {
    pub set_specification: String,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
    /// Force a full harvest once this many days passed since the last one.
    #[serde(default)]
    pub purge_interval_days: Option<i64>,
    #[serde(default = "default_true")]
    pub is_available: bool,
    #[serde(default)]
    pub is_manual: bool,
    /// Pushed records may change documents already in the set.
    #[serde(default)]
    pub allows_update: bool,
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PhaseConfig {
    pub phase: String,
    pub strategy: Strategy,
    #[serde(default)]
    pub batch_size: Option<usize>,
    pub retrieve_data: RetrieveConfig,
    #[serde(default)]
    pub contribute_data: ContributeConfig,
    #[serde(default)]
    pub is_post_initialization: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrieveConfig {
    pub resource: String,
    #[serde(default)]
    pub method: Option<String>,
    /// URL template; `{set_specification}`, `{since}` and `{$.path}` are
    /// substituted.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub pagination: Pagination,
    /// `chrono` format of `{since}`; RFC 3339 seconds when absent.
    #[serde(default)]
    pub since_format: Option<String>,
}

/// How the next page request is derived from the current page.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pagination {
    #[default]
    None,
    /// OAI-PMH `resumptionToken`.
    ResumptionToken,
    /// Next page URL found at a JSON path of the page.
    NextUrl { path: String },
    /// Incrementing page number query parameter; stops on an empty page.
    Page {
        param: String,
        #[serde(default = "default_first_page")]
        start: u64,
    },
}

fn default_first_page() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ContributeConfig {
    /// Field → path table; `@` is the record iterator, `#` marks
    /// post-processing.
    #[serde(default)]
    pub objective: BTreeMap<String, String>,
    /// Named callback registered by the source instead of (or on top of) an
    /// objective.
    #[serde(default)]
    pub callback: Option<String>,
    /// Path (relative to the page root) of the source-reported harvest time.
    #[serde(default)]
    pub harvested_at: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// [entities.<entity>]
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
pub struct EntityConfig {
    /// Property holding the external identity of each document.
    pub identifier: String,
    /// Registered entity-kind implementation.
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub tasks: TaskMap,
    #[serde(default)]
    pub set_tasks: TaskMap,
}

fn default_kind() -> String {
    "generic".to_string()
}

/// Processor settings of a document task, read from the task's extra keys.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TaskSettings {
    #[serde(default)]
    pub method: Option<String>,
    /// Request URL template; defaults to `{$.url}`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extraction of the contribution from the resource payload.
    #[serde(default)]
    pub objective: BTreeMap<String, String>,
    /// Write the contribution into `properties.<key>` instead of
    /// `derivatives.<task>`.
    #[serde(default)]
    pub to_property: Option<String>,
    #[serde(default = "default_true")]
    pub apply_resource: bool,
    #[serde(default)]
    pub store_blob: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Process batches concurrently instead of one after another.
    #[serde(default)]
    pub is_async: bool,
}

impl TaskSettings {
    pub fn from_task(task: &TaskConfig) -> Result<Self> {
        serde_json::from_value(Value::Object(task.extra.clone()))
            .context("invalid task settings")
    }

    pub fn url_template(&self) -> &str {
        self.url.as_deref().unwrap_or("{$.url}")
    }
}

pub const CHECK_SET_INTEGRITY: &str = "check_set_integrity";

/// Set-level integrity thresholds.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct IntegritySettings {
    #[serde(default = "default_integrity_threshold")]
    pub threshold: f64,
    #[serde(default = "default_integrity_min_documents")]
    pub min_documents: i64,
}

impl Default for IntegritySettings {
    fn default() -> Self {
        Self {
            threshold: default_integrity_threshold(),
            min_documents: default_integrity_min_documents(),
        }
    }
}

impl IntegritySettings {
    pub fn from_task(task: Option<&TaskConfig>) -> Result<Self> {
        match task {
            Some(task) => serde_json::from_value(Value::Object(task.extra.clone()))
                .context("invalid check_set_integrity settings"),
            None => Ok(Self::default()),
        }
    }
}

fn default_integrity_threshold() -> f64 {
    0.05
}
fn default_integrity_min_documents() -> i64 {
    50
}

// ═══════════════════════════════════════════════════════════════════════
// [datasets.<name>]
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    #[serde(default)]
    pub indexing: IndexingOption,
    #[serde(default = "default_true")]
    pub is_harvested: bool,
    /// Promotion is refused when indexing errors exceed this count.
    #[serde(default)]
    pub max_error_count: Option<u64>,
    /// Languages that get their own index besides the all-languages one.
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub harvest: Vec<HarvestEntry>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct HarvestEntry {
    pub source: String,
    pub entity: String,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn source_entity(&self, source: &str, entity: &str) -> Option<&SourceEntityConfig> {
        self.sources.get(source)?.entities.get(entity)
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig> {
        self.datasets
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown dataset: '{}'", name))
    }

    pub fn entity(&self, name: &str) -> Result<&EntityConfig> {
        self.entities
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown entity: '{}'", name))
    }

    pub fn resource(&self, kind: &str) -> Result<&ResourceConfig> {
        self.resources
            .get(kind)
            .ok_or_else(|| anyhow::anyhow!("Unknown resource kind: '{}'", kind))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════════════════

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse, expand `${VAR}` references and validate a configuration.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    expand_config_env(&mut config);
    validate(&config).map_err(|e| HarvestError::Config(format!("{:#}", e)))?;
    Ok(config)
}

fn expand_config_env(config: &mut Config) {
    config.search.url = expand_env_vars(&config.search.url);
    config.search.username = config.search.username.as_deref().map(expand_env_vars);
    config.search.password = config.search.password.as_deref().map(expand_env_vars);
    for resource in config.resources.values_mut() {
        for value in resource.headers.values_mut() {
            *value = expand_env_vars(value);
        }
    }
    for source in config.sources.values_mut() {
        for entity in source.entities.values_mut() {
            for phase in &mut entity.phases {
                phase.retrieve_data.url = expand_env_vars(&phase.retrieve_data.url);
                for value in phase.retrieve_data.params.values_mut() {
                    *value = expand_env_vars(value);
                }
            }
        }
    }
    for entity in config.entities.values_mut() {
        for task in entity.tasks.values_mut() {
            if let Some(Value::String(url)) = task.extra.get_mut("url") {
                *url = expand_env_vars(url);
            }
        }
    }
}

/// Expand `${VAR_NAME}` patterns from the process environment. Unset
/// variables expand to the empty string; substituted values are not
/// expanded again.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        result.push_str(&rest[..start]);
        let var_name = &rest[start + 2..start + len];
        result.push_str(&std::env::var(var_name).unwrap_or_default());
        rest = &rest[start + len + 1..];
    }
    result.push_str(rest);
    result
}

fn validate(config: &Config) -> Result<()> {
    let harvest = &config.harvest;
    if harvest.default_batch_size == 0 {
        bail!("harvest.default_batch_size must be > 0");
    }
    if harvest.concurrency == 0 {
        bail!("harvest.concurrency must be > 0");
    }
    if harvest.lock_attempts == 0 {
        bail!("harvest.lock_attempts must be > 0");
    }
    if harvest.max_fetch_attempts == 0 {
        bail!("harvest.max_fetch_attempts must be > 0");
    }
    for pattern in &harvest.volatile_query_keys {
        Glob::new(pattern)
            .with_context(|| format!("invalid volatile_query_keys pattern '{}'", pattern))?;
    }
    if config.search.bulk_chunk_size == 0 {
        bail!("search.bulk_chunk_size must be > 0");
    }

    for (kind, resource) in &config.resources {
        if resource.resource_type == ResourceType::Shell && resource.program.is_none() {
            bail!("resources.{}: shell resources need a 'program'", kind);
        }
    }

    for (name, source) in &config.sources {
        for (entity_name, entity) in &source.entities {
            let label = format!("sources.{}.entities.{}", name, entity_name);
            if !config.entities.contains_key(entity_name) {
                bail!("{}: no [entities.{}] section", label, entity_name);
            }
            if entity.phases.is_empty() {
                bail!("{}: at least one phase is required", label);
            }
            for phase in &entity.phases {
                if phase.batch_size == Some(0) {
                    bail!("{} phase '{}': batch_size must be > 0", label, phase.phase);
                }
                if !config.resources.contains_key(&phase.retrieve_data.resource) {
                    bail!(
                        "{} phase '{}': unknown resource '{}'",
                        label,
                        phase.phase,
                        phase.retrieve_data.resource
                    );
                }
            }
        }
    }

    for (name, entity) in &config.entities {
        if entity.identifier.trim().is_empty() {
            bail!("entities.{}.identifier must not be empty", name);
        }
        task_graph::validate(&entity.tasks).with_context(|| format!("entities.{}.tasks", name))?;
        for (task_name, task) in &entity.tasks {
            for resource in &task.resources {
                if !config.resources.contains_key(resource) {
                    bail!(
                        "entities.{}.tasks.{}: unknown resource '{}'",
                        name,
                        task_name,
                        resource
                    );
                }
            }
            if entity.kind == GenericKind::NAME {
                for check in &task.checks {
                    let (_, check_name) = task_graph::split_check(check);
                    if !Document::BUILTIN_CHECKS.contains(&check_name)
                        && !GenericKind::CHECKS.contains(&check_name)
                    {
                        bail!(
                            "entities.{}.tasks.{}: unknown check '{}'",
                            name,
                            task_name,
                            check_name
                        );
                    }
                }
            }
            let settings = TaskSettings::from_task(task)
                .with_context(|| format!("entities.{}.tasks.{}", name, task_name))?;
            if settings.batch_size == Some(0) {
                bail!("entities.{}.tasks.{}: batch_size must be > 0", name, task_name);
            }
        }
        for set_task in entity.set_tasks.keys() {
            if set_task != CHECK_SET_INTEGRITY {
                bail!("entities.{}.set_tasks: unknown set task '{}'", name, set_task);
            }
        }
        let integrity = IntegritySettings::from_task(entity.set_tasks.get(CHECK_SET_INTEGRITY))
            .with_context(|| format!("entities.{}.set_tasks", name))?;
        if !(0.0..=1.0).contains(&integrity.threshold) {
            bail!(
                "entities.{}.set_tasks.check_set_integrity.threshold must be in [0.0, 1.0]",
                name
            );
        }
    }

    for (name, dataset) in &config.datasets {
        for entry in &dataset.harvest {
            if config.source_entity(&entry.source, &entry.entity).is_none() {
                bail!(
                    "datasets.{}: unknown source entity '{}.{}'",
                    name,
                    entry.source,
                    entry.entity
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[db]
path = "/tmp/harvester.sqlite"

[resources.http]
type = "http"
headers = { Authorization = "Bearer ${HARVESTER_TEST_TOKEN}" }

[sources.edurep]
extractor = "oai_pmh"

[sources.edurep.entities.products]
set_specification = "edurep_delen"
delete_policy = "transient"

[[sources.edurep.entities.products.phases]]
phase = "records"
strategy = "initial"
retrieve_data = { resource = "http", url = "https://example.org/oai", pagination = { type = "resumption_token" } }

[entities.products]
identifier = "external_id"

[entities.products.tasks.check_url]
depends_on = ["$.url"]
resources = ["http"]
method = "HEAD"

[entities.products.tasks.tika]
depends_on = ["check_url"]
resources = ["http"]

[datasets.edusources]
harvest = [{ source = "edurep", entity = "products" }]
"#;

    #[test]
    fn parses_defaults() {
        let config = parse_config(BASE).unwrap();
        assert_eq!(config.harvest.lock_attempts, 3);
        assert_eq!(config.harvest.dispatch_max_retries, 5);
        assert_eq!(config.harvest.dispatch_retry_delay_secs, 300);
        assert_eq!(config.search.bulk_chunk_size, 100);
        assert_eq!(config.search.bulk_timeout_secs, 300);
        let dataset = config.dataset("edusources").unwrap();
        assert_eq!(dataset.indexing, IndexingOption::IndexAndPromote);
        assert!(dataset.max_error_count.is_none());
        let entity = config.source_entity("edurep", "products").unwrap();
        assert_eq!(entity.delete_policy, DeletePolicy::Transient);
        assert_eq!(
            entity.phases[0].retrieve_data.pagination,
            Pagination::ResumptionToken
        );
        let integrity = IntegritySettings::from_task(None).unwrap();
        assert_eq!(integrity.threshold, 0.05);
        assert_eq!(integrity.min_documents, 50);
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse_config(include_str!("../config/harvester.example.toml")).unwrap();
        assert_eq!(config.datasets["edusources"].harvest.len(), 2);
        assert_eq!(config.resources["pdf_thumbnail"].resource_type, ResourceType::Shell);
        let tika = TaskSettings::from_task(&config.entity("products").unwrap().tasks["tika"]).unwrap();
        assert!(tika.is_async);
    }

    #[test]
    fn task_settings_come_from_extra_keys() {
        let config = parse_config(BASE).unwrap();
        let task = &config.entity("products").unwrap().tasks["check_url"];
        let settings = TaskSettings::from_task(task).unwrap();
        assert_eq!(settings.method.as_deref(), Some("HEAD"));
        assert_eq!(settings.url_template(), "{$.url}");
        assert!(settings.apply_resource);
    }

    #[test]
    fn expands_env_vars_in_headers() {
        std::env::set_var("HARVESTER_TEST_TOKEN", "s3cret");
        let config = parse_config(BASE).unwrap();
        assert_eq!(
            config.resources["http"].headers["Authorization"],
            "Bearer s3cret"
        );
    }

    #[test]
    fn expand_env_vars_handles_unset_and_unterminated() {
        assert_eq!(expand_env_vars("a ${HARVESTER_SURELY_UNSET} b"), "a  b");
        assert_eq!(expand_env_vars("broken ${OPEN"), "broken ${OPEN");
    }

    #[test]
    fn rejects_unknown_task_resource() {
        let bad = BASE.replace("resources = [\"http\"]\nmethod", "resources = [\"nope\"]\nmethod");
        let err = parse_config(&bad).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown resource 'nope'"));
    }

    #[test]
    fn rejects_task_cycles() {
        let bad = BASE.replace("depends_on = [\"$.url\"]", "depends_on = [\"tika\"]");
        let err = parse_config(&bad).unwrap_err();
        assert!(format!("{:#}", err).contains("cycle"));
    }

    #[test]
    fn rejects_unknown_dataset_entity() {
        let bad = BASE.replace("entity = \"products\" }]", "entity = \"files\" }]");
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn rejects_misspelled_check() {
        let bad = BASE.replace("method = \"HEAD\"", "method = \"HEAD\"\nchecks = [\"!is_vidoe\"]");
        let err = parse_config(&bad).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown check 'is_vidoe'"));

        let good = BASE.replace(
            "method = \"HEAD\"",
            "method = \"HEAD\"\nchecks = [\"!is_video\", \"is_active\"]",
        );
        assert!(parse_config(&good).is_ok());
    }

    #[test]
    fn custom_kind_checks_are_left_to_the_registry() {
        let custom = BASE
            .replace(
                "identifier = \"external_id\"",
                "identifier = \"external_id\"\nkind = \"open_access\"",
            )
            .replace("method = \"HEAD\"", "method = \"HEAD\"\nchecks = [\"is_open\"]");
        assert!(parse_config(&custom).is_ok());
    }

    #[test]
    fn rejects_out_of_range_integrity_threshold() {
        let bad = format!(
            "{}\n[entities.products.set_tasks.check_set_integrity]\nthreshold = 1.5\n",
            BASE
        );
        assert!(parse_config(&bad).is_err());
    }
}
