//! Source extractors and their registry.
//!
//! A [`Source`] turns raw pages into [`Seed`]s and tells the seeder how to
//! reach the next page. Sources are pure: fetching goes through the
//! resource cache, persisting through the seeder.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             SourceRegistry               │
//! │  ┌─────────┐ ┌──────────┐ ┌───────────┐  │
//! │  │ oai_pmh │ │ json_api │ │  custom   │  │
//! │  └─────────┘ └──────────┘ └───────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!      Seeder: page → objective → seeds
//! ```
//!
//! Objectives come from the phase's `contribute_data.objective` table laid
//! over the source's default objective, so a source can ship a full mapping
//! and configurations only override what differs.

pub mod json_api;
pub mod oai_pmh;
pub mod xml;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use harvester_core::json_path::JsonPath;
use harvester_core::models::{DeletePolicy, Seed};
use harvester_core::objective::{ExtractError, Extractor, Objective};

use crate::config::{Config, ContributeConfig, Pagination, PhaseConfig};

/// The request for one page of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    pub params: BTreeMap<String, String>,
    /// Current page number under [`Pagination::Page`].
    pub page_number: Option<u64>,
}

impl PageRequest {
    /// The first request of a phase from its rendered URL and parameters.
    pub fn first(pagination: &Pagination, url: String, mut params: BTreeMap<String, String>) -> Self {
        let page_number = match pagination {
            Pagination::Page { param, start } => {
                params.insert(param.clone(), start.to_string());
                Some(*start)
            }
            _ => None,
        };
        Self {
            url,
            params,
            page_number,
        }
    }
}

/// A registered upstream extractor.
pub trait Source: Send + Sync {
    /// Registry name, referenced by `[sources.<module>].extractor`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Mapping used when the phase configures no (or a partial) objective.
    fn default_objective(&self) -> Objective {
        Objective::new()
    }

    /// Named per-seed callbacks referenced by `contribute_data.callback`.
    /// The callback receives the page and the extracted seed and returns an
    /// object merged over the seed.
    fn callback(&self, _name: &str) -> Option<Extractor> {
        None
    }

    /// Reject pages that carry an upstream error.
    fn check_page(&self, _page: &Value) -> Result<()> {
        Ok(())
    }

    /// The request for the page after `page`, or `None` when exhausted.
    fn next_request(
        &self,
        phase: &PhaseConfig,
        page: &Value,
        current: &PageRequest,
        extracted: usize,
    ) -> Result<Option<PageRequest>> {
        next_page(&phase.retrieve_data.pagination, page, current, extracted)
    }

    /// The harvest time the upstream reports for a page.
    fn harvested_at(&self, phase: &PhaseConfig, page: &Value) -> Result<Option<DateTime<Utc>>> {
        match &phase.contribute_data.harvested_at {
            Some(path) => {
                let value = JsonPath::parse(path)?.resolve(page);
                Ok(value.as_str().and_then(parse_timestamp))
            }
            None => Ok(None),
        }
    }

    /// Reshape a pushed payload into a page the phase objective can read.
    fn transform_webhook(&self, payload: Value) -> Result<Value> {
        Ok(payload)
    }
}

/// Build the objective of a phase: the configured paths laid over the
/// source's default objective.
pub fn phase_objective(source: &dyn Source, contribute: &ContributeConfig) -> Result<Objective> {
    let mut objective = source.default_objective();
    for (key, raw) in &contribute.objective {
        if key == "@" {
            objective = objective.with_iterator(
                JsonPath::parse(raw).with_context(|| format!("objective iterator '{}'", raw))?,
            );
        } else if let Some(name) = key.strip_prefix('#') {
            objective = objective.post(name, Extractor::parse(raw)?);
        } else {
            objective = objective.field(key, Extractor::parse(raw)?);
        }
    }
    Ok(objective)
}

/// Extract the seeds of one page in page order.
///
/// The outer error is a page-level failure (upstream error, bad objective);
/// inner errors belong to single records, which the caller skips.
pub fn extract_seeds(
    source: &dyn Source,
    phase: &PhaseConfig,
    page: &Value,
) -> Result<Vec<Result<Seed, ExtractError>>> {
    source.check_page(page)?;
    let objective = phase_objective(source, &phase.contribute_data)?;
    let callback = match &phase.contribute_data.callback {
        Some(name) => Some(source.callback(name).with_context(|| {
            format!("source '{}' has no callback '{}'", source.name(), name)
        })?),
        None => None,
    };
    Ok(objective
        .extract(page)
        .into_iter()
        .map(|record| {
            let mut properties = record?;
            if let Some(callback) = &callback {
                let output = callback.apply(page, &Value::Object(properties.clone()))?;
                merge_callback(&mut properties, output)?;
            }
            Ok(Seed::new(properties))
        })
        .collect())
}

fn merge_callback(properties: &mut Map<String, Value>, output: Value) -> Result<(), ExtractError> {
    match output {
        Value::Object(map) => {
            properties.extend(map);
            Ok(())
        }
        Value::Null => Ok(()),
        other => Err(ExtractError::msg(format!(
            "callback must return an object, got {}",
            other
        ))),
    }
}

/// Generic pagination shared by the built-in sources.
pub fn next_page(
    pagination: &Pagination,
    page: &Value,
    current: &PageRequest,
    extracted: usize,
) -> Result<Option<PageRequest>> {
    match pagination {
        Pagination::None => Ok(None),
        Pagination::ResumptionToken => {
            let Some(token) = oai_pmh::resumption_token(page) else {
                return Ok(None);
            };
            let mut url = Url::parse(&current.url)
                .with_context(|| format!("invalid page URL '{}'", current.url))?;
            let verb = url
                .query_pairs()
                .chain(current.params.iter().map(|(k, v)| (k.into(), v.into())))
                .find(|(k, _)| k == "verb")
                .map(|(_, v)| v.into_owned());
            url.set_query(None);
            let mut params = BTreeMap::new();
            if let Some(verb) = verb {
                params.insert("verb".to_string(), verb);
            }
            params.insert("resumptionToken".to_string(), token);
            Ok(Some(PageRequest {
                url: url.to_string(),
                params,
                page_number: None,
            }))
        }
        Pagination::NextUrl { path } => {
            let next = JsonPath::parse(path)?.resolve(page);
            match next.as_str().map(str::trim) {
                Some(url) if !url.is_empty() && url != current.url => {
                    let url = Url::parse(&current.url)
                        .and_then(|base| base.join(url))
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| url.to_string());
                    Ok(Some(PageRequest {
                        url,
                        params: BTreeMap::new(),
                        page_number: None,
                    }))
                }
                _ => Ok(None),
            }
        }
        Pagination::Page { param, start } => {
            if extracted == 0 {
                return Ok(None);
            }
            let number = current.page_number.unwrap_or(*start) + 1;
            let mut params = current.params.clone();
            params.insert(param.clone(), number.to_string());
            Ok(Some(PageRequest {
                url: current.url.clone(),
                params,
                page_number: Some(number),
            }))
        }
    }
}

/// Parse RFC 3339 timestamps and plain dates (taken as midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry of extractors by name.
///
/// Use [`SourceRegistry::with_builtins`] for `oai_pmh` and `json_api`, then
/// [`register`](SourceRegistry::register) custom ones.
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(oai_pmh::OaiPmhSource));
        registry.register(Arc::new(json_api::JsonApiSource));
        registry
    }

    /// Register a source, replacing any source with the same name.
    pub fn register(&mut self, source: Arc<dyn Source>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Source>> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown extractor: '{}'", name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Listing
// ═══════════════════════════════════════════════════════════════════════

/// One configured source entity, as shown by `harvest sources`.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: String,
    pub entity: String,
    pub extractor: String,
    /// The extractor is registered.
    pub registered: bool,
    pub is_available: bool,
    pub is_manual: bool,
    pub allows_update: bool,
    pub delete_policy: DeletePolicy,
    pub set_specification: String,
    pub phases: Vec<String>,
}

pub fn list_sources(config: &Config, registry: &SourceRegistry) -> Vec<SourceStatus> {
    let mut statuses = Vec::new();
    for (name, source) in &config.sources {
        for (entity_name, entity) in &source.entities {
            statuses.push(SourceStatus {
                source: name.clone(),
                entity: entity_name.clone(),
                extractor: source.extractor.clone(),
                registered: registry.get(&source.extractor).is_ok(),
                is_available: source.is_available && entity.is_available,
                is_manual: entity.is_manual,
                allows_update: entity.allows_update,
                delete_policy: entity.delete_policy,
                set_specification: entity.set_specification.clone(),
                phases: entity.phases.iter().map(|p| p.phase.clone()).collect(),
            });
        }
    }
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(url: &str) -> PageRequest {
        PageRequest {
            url: url.to_string(),
            params: BTreeMap::new(),
            page_number: None,
        }
    }

    #[test]
    fn resumption_token_keeps_only_verb() {
        let page = json!({"OAI-PMH": {"ListRecords": {"resumptionToken": {"@cursor": "0", "#text": "tok"}}}});
        let next = next_page(
            &Pagination::ResumptionToken,
            &page,
            &request("https://example.org/oai?verb=ListRecords&set=a&metadataPrefix=oai_dc"),
            10,
        )
        .unwrap()
        .unwrap();
        assert_eq!(next.url, "https://example.org/oai");
        assert_eq!(next.params["verb"], "ListRecords");
        assert_eq!(next.params["resumptionToken"], "tok");
        assert!(!next.params.contains_key("set"));
    }

    #[test]
    fn empty_resumption_token_ends_paging() {
        let page = json!({"OAI-PMH": {"ListRecords": {"resumptionToken": {"@cursor": "10"}}}});
        assert!(next_page(&Pagination::ResumptionToken, &page, &request("https://x.org/oai"), 1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn page_numbers_stop_on_empty_page() {
        let pagination = Pagination::Page {
            param: "page".into(),
            start: 1,
        };
        let first = PageRequest::first(&pagination, "https://x.org/api".into(), BTreeMap::new());
        assert_eq!(first.params["page"], "1");
        let second = next_page(&pagination, &Value::Null, &first, 5).unwrap().unwrap();
        assert_eq!(second.params["page"], "2");
        assert!(next_page(&pagination, &Value::Null, &second, 0).unwrap().is_none());
    }

    #[test]
    fn next_url_resolves_relative_links() {
        let pagination = Pagination::NextUrl {
            path: "$.links.next".into(),
        };
        let page = json!({"links": {"next": "/api?page=2"}});
        let next = next_page(&pagination, &page, &request("https://x.org/api"), 3)
            .unwrap()
            .unwrap();
        assert_eq!(next.url, "https://x.org/api?page=2");
        let last = json!({"links": {"next": null}});
        assert!(next_page(&pagination, &last, &next, 3).unwrap().is_none());
    }

    #[test]
    fn parses_timestamps_and_dates() {
        assert_eq!(
            parse_timestamp("2024-02-01T10:00:00Z").unwrap().to_rfc3339(),
            "2024-02-01T10:00:00+00:00"
        );
        assert_eq!(
            parse_timestamp("2024-02-01").unwrap().to_rfc3339(),
            "2024-02-01T00:00:00+00:00"
        );
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn registry_has_builtins() {
        let registry = SourceRegistry::with_builtins();
        assert!(registry.get("oai_pmh").is_ok());
        assert!(registry.get("json_api").is_ok());
        assert!(registry.get("nope").is_err());
        assert_eq!(registry.len(), 2);
    }
}
