//! Cached resource store.
//!
//! Every outbound call (HTTP request or shell invocation) goes through
//! [`ResourceCache::fetch`]. Calls are keyed by resource kind, normalized
//! URI and the hash of the canonical request body, so semantically equal
//! requests collapse onto one cached record.
//!
//! | Status | Meaning for callers |
//! |--------|---------------------|
//! | 2xx    | success; 204 carries an empty payload |
//! | 404    | permanent: the owning document is not found |
//! | 5xx    | transient: cached, but refetched on the next call |
//!
//! Transport failures (timeouts, refused connections) are not cached; they
//! surface as [`HarvestError::TransientFetch`].

pub mod http;
pub mod shell;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use harvester_core::hashing::data_hash;

use crate::config::{Config, ResourceConfig, ResourceType};
use crate::db;
use crate::error::HarvestError;
use crate::models::Resource;
use crate::sources::xml::xml_to_value;
use crate::store::Store;

use self::http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient};
use self::shell::{ProcessRunner, ShellOutput, ShellRunner};

/// One outbound call, after templating.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    /// Configured resource kind (`[resources.<kind>]`).
    pub kind: String,
    /// Overrides the kind's configured method.
    pub method: Option<String>,
    /// URL for HTTP kinds; ignored by shell kinds.
    pub uri: String,
    /// Query parameters appended to `uri`.
    pub params: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Arguments for shell kinds.
    pub args: Vec<String>,
}

impl ResourceRequest {
    pub fn new(kind: &str, uri: &str) -> Self {
        Self {
            kind: kind.to_string(),
            uri: uri.to_string(),
            ..Default::default()
        }
    }
}

impl Resource {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// 5xx responses (and failed shell runs) may succeed when retried.
    pub fn is_transient_failure(&self) -> bool {
        self.status >= 500
    }

    pub fn content_type(&self) -> Option<&str> {
        self.head.get("content_type").and_then(Value::as_str)
    }

    pub fn final_url(&self) -> &str {
        self.head
            .get("final_url")
            .and_then(Value::as_str)
            .unwrap_or(&self.uri)
    }

    pub fn redirect_statuses(&self) -> Vec<u16> {
        self.head
            .get("redirects")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|r| r.get("status").and_then(Value::as_u64))
                    .map(|s| s as u16)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `permanent` when any hop was a 301/308, `temporary` for other
    /// redirects, `None` when the request was answered directly.
    pub fn redirect_class(&self) -> Option<&'static str> {
        let statuses = self.redirect_statuses();
        if statuses.is_empty() {
            None
        } else if statuses.iter().any(|s| *s == 301 || *s == 308) {
            Some("permanent")
        } else {
            Some("temporary")
        }
    }

    fn is_base64(&self) -> bool {
        self.head
            .get("is_base64")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Raw body bytes.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        if self.is_base64() {
            base64::engine::general_purpose::STANDARD
                .decode(&self.body)
                .context("Failed to decode base64 resource body")
        } else {
            Ok(self.body.as_bytes().to_vec())
        }
    }

    /// The body decoded for extraction: JSON and XML become JSON values,
    /// other text stays a string and empty bodies are `null`.
    pub fn payload(&self) -> Result<Value> {
        if self.status == 204 || self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        if self.is_base64() {
            return Ok(Value::Null);
        }
        let content_type = self.content_type().unwrap_or("").to_ascii_lowercase();
        let trimmed = self.body.trim_start();
        if content_type.contains("json") {
            return serde_json::from_str(&self.body)
                .with_context(|| format!("invalid JSON from {}", self.uri));
        }
        if content_type.contains("xml") || trimmed.starts_with("<?xml") {
            return xml_to_value(&self.body).with_context(|| format!("invalid XML from {}", self.uri));
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str(&self.body) {
                return Ok(value);
            }
        }
        Ok(Value::String(self.body.clone()))
    }
}

/// Normalize a URI for cache keys: drop the fragment and volatile query
/// keys, and sort the remaining query pairs.
pub fn normalize_uri(raw: &str, volatile: &GlobSet) -> Result<String> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid URI '{}'", raw))?;
    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !volatile.is_match(key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    Ok(url.to_string())
}

pub fn volatile_keys(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .with_context(|| format!("invalid volatile query key pattern '{}'", pattern))?,
        );
    }
    builder.build().context("Failed to build volatile query key set")
}

fn with_params(uri: &str, params: &BTreeMap<String, String>) -> Result<String> {
    if params.is_empty() {
        return Ok(uri.to_string());
    }
    let mut url = Url::parse(uri).with_context(|| format!("invalid URI '{}'", uri))?;
    url.query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    Ok(url.to_string())
}

/// Deduplicating front for the HTTP and shell collaborators.
#[derive(Clone)]
pub struct ResourceCache {
    store: Store,
    resources: Arc<BTreeMap<String, ResourceConfig>>,
    volatile: Arc<GlobSet>,
    http: Arc<dyn HttpClient>,
    shell: Arc<dyn ShellRunner>,
    cache_only: bool,
}

impl ResourceCache {
    pub fn new(
        store: Store,
        config: &Config,
        http: Arc<dyn HttpClient>,
        shell: Arc<dyn ShellRunner>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            resources: Arc::new(config.resources.clone()),
            volatile: Arc::new(volatile_keys(&config.harvest.volatile_query_keys)?),
            http,
            shell,
            cache_only: false,
        })
    }

    /// Cache with the production collaborators.
    pub fn from_config(store: Store, config: &Config) -> Result<Self> {
        Self::new(
            store,
            config,
            Arc::new(ReqwestHttpClient::new()?),
            Arc::new(ProcessRunner),
        )
    }

    /// Forbid outbound calls; misses raise [`HarvestError::CacheMiss`].
    pub fn with_cache_only(mut self, cache_only: bool) -> Self {
        self.cache_only = cache_only;
        self
    }

    pub fn is_cache_only(&self) -> bool {
        self.cache_only
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn config(&self, kind: &str) -> Result<&ResourceConfig> {
        self.resources
            .get(kind)
            .ok_or_else(|| anyhow::anyhow!("Unknown resource kind: '{}'", kind))
    }

    /// The cache key of a request: `(normalized uri, data hash)`.
    pub fn key(&self, request: &ResourceRequest) -> Result<(String, String)> {
        let config = self.config(&request.kind)?;
        let uri = match config.resource_type {
            ResourceType::Http => {
                normalize_uri(&with_params(&request.uri, &request.params)?, &self.volatile)?
            }
            ResourceType::Shell => {
                let program = config.program.as_deref().unwrap_or_default();
                std::iter::once(program)
                    .chain(request.args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
        };
        let hash = data_hash(request.body.as_ref().unwrap_or(&Value::Null));
        Ok((uri, hash))
    }

    /// Return the cached resource for `request` when it is still valid,
    /// otherwise perform the call and store the result. The flag tells
    /// whether the call was performed.
    pub async fn fetch(&self, request: &ResourceRequest) -> Result<(Resource, bool)> {
        self.fetch_with(request, false).await
    }

    /// Perform the call even when a valid cached copy exists, replacing it.
    /// Upstream listings change between harvests under the same key, so
    /// seeding goes through here. Under `cache_only` the cached copy is
    /// still served.
    pub async fn refresh(&self, request: &ResourceRequest) -> Result<(Resource, bool)> {
        self.fetch_with(request, true).await
    }

    async fn fetch_with(&self, request: &ResourceRequest, refresh: bool) -> Result<(Resource, bool)> {
        let config = self.config(&request.kind)?;
        let (uri, hash) = self.key(request)?;
        let existing = self.store.find_resource(&request.kind, &uri, &hash).await?;

        if self.cache_only {
            return match existing {
                Some(resource) => Ok((resource, false)),
                None => Err(HarvestError::CacheMiss {
                    kind: request.kind.clone(),
                    uri,
                }
                .into()),
            };
        }

        let now = db::now();
        if let Some(resource) = existing.filter(|_| !refresh) {
            let expired = resource.purge_at.is_some_and(|at| at <= now);
            if !expired && !resource.is_transient_failure() {
                debug!(resource = %request.kind, uri = %uri, "resource cache hit");
                return Ok((resource, false));
            }
        }

        let method = request
            .method
            .clone()
            .or_else(|| config.method.clone())
            .unwrap_or_else(|| "GET".to_string())
            .to_uppercase();
        let timeout = Duration::from_secs(config.timeout_secs);

        let (status, head, body) = match config.resource_type {
            ResourceType::Http => {
                let target = with_params(&request.uri, &request.params)?;
                let response = self
                    .http
                    .send(&HttpRequest {
                        method: method.clone(),
                        url: target,
                        headers: config.headers.clone(),
                        body: request.body.as_ref().map(Value::to_string),
                        timeout,
                        max_redirects: config.max_redirects,
                    })
                    .await?;
                http_record(response)
            }
            ResourceType::Shell => {
                let program = config
                    .program
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("resource '{}' has no program", request.kind))?;
                let output = self.shell.run(program, &request.args, timeout).await?;
                shell_record(output)
            }
        };

        let resource = Resource {
            id: 0,
            kind: request.kind.clone(),
            uri: uri.clone(),
            data_hash: hash,
            method,
            request: json!({
                "params": request.params,
                "body": request.body,
                "args": request.args,
            }),
            head,
            body,
            status,
            is_extracted: false,
            since: now,
            purge_at: purge_at(config, now),
            created_at: now,
            modified_at: now,
        };
        debug!(resource = %request.kind, uri = %uri, status, "resource fetched");
        let stored = self.store.upsert_resource(&resource).await?;
        Ok((stored, true))
    }

    pub async fn get(&self, id: i64) -> Result<Resource> {
        self.store.get_resource(id).await
    }

    pub async fn mark_extracted(&self, id: i64) -> Result<()> {
        self.store.mark_resource_extracted(id).await
    }

    /// Mark resources extractable again.
    pub async fn invalidate(&self, kind: &str, uri_prefix: Option<&str>) -> Result<u64> {
        self.store.invalidate_resources(kind, uri_prefix).await
    }

    /// Delete resources past their retention, or fetched more than
    /// `older_than` ago.
    pub async fn purge(&self, kind: Option<&str>, older_than: Option<chrono::Duration>) -> Result<u64> {
        let now = db::now();
        self.store
            .purge_resources(kind, now, older_than.map(|age| now - age))
            .await
    }
}

fn purge_at(config: &ResourceConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    config
        .purge_after_days
        .map(|days| now + chrono::Duration::days(days))
}

fn http_record(response: HttpResponse) -> (u16, Value, String) {
    let head = json!({
        "final_url": response.final_url,
        "redirects": response.redirects,
        "content_type": response.content_type,
        "headers": response.headers,
        "is_base64": response.is_base64,
    });
    (response.status, head, response.body)
}

fn shell_record(output: ShellOutput) -> (u16, Value, String) {
    let status = if output.success() { 200 } else { 500 };
    let head = json!({
        "exit_code": output.status,
        "stderr": output.stderr,
        "is_base64": output.is_base64,
    });
    (status, head, output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volatile() -> GlobSet {
        volatile_keys(&["utm_*".to_string(), "sessionid".to_string()]).unwrap()
    }

    #[test]
    fn normalize_drops_volatile_keys_and_sorts() {
        let uri = normalize_uri(
            "https://Example.org/oai?verb=ListRecords&utm_source=x&set=a&sessionid=1#top",
            &volatile(),
        )
        .unwrap();
        assert_eq!(uri, "https://example.org/oai?set=a&verb=ListRecords");
    }

    #[test]
    fn normalize_removes_empty_query() {
        let uri = normalize_uri("https://example.org/a?utm_medium=mail", &volatile()).unwrap();
        assert_eq!(uri, "https://example.org/a");
    }

    #[test]
    fn redirect_class_prefers_permanent() {
        let mut resource = sample(200, "");
        assert_eq!(resource.redirect_class(), None);
        resource.head = json!({"redirects": [{"status": 302, "location": "a"}]});
        assert_eq!(resource.redirect_class(), Some("temporary"));
        resource.head = json!({"redirects": [{"status": 302, "location": "a"}, {"status": 301, "location": "b"}]});
        assert_eq!(resource.redirect_class(), Some("permanent"));
    }

    #[test]
    fn payload_decodes_by_content_type() {
        let mut resource = sample(200, r#"{"a": 1}"#);
        resource.head = json!({"content_type": "application/json"});
        assert_eq!(resource.payload().unwrap(), json!({"a": 1}));

        let mut resource = sample(200, "<r><a>1</a></r>");
        resource.head = json!({"content_type": "text/xml; charset=utf-8"});
        assert_eq!(resource.payload().unwrap(), json!({"r": {"a": "1"}}));

        let resource = sample(204, "");
        assert_eq!(resource.payload().unwrap(), Value::Null);

        let resource = sample(200, "plain text");
        assert_eq!(resource.payload().unwrap(), json!("plain text"));
    }

    #[test]
    fn binary_shell_output_survives_storage() {
        let png = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
        let mut output = ShellOutput::default();
        output.set_stdout(png.clone());
        let (status, head, body) = shell_record(output);
        let mut resource = sample(status, &body);
        resource.head = head;
        assert_eq!(resource.status, 200);
        assert_eq!(resource.bytes().unwrap(), png);
        assert_eq!(resource.payload().unwrap(), Value::Null);
    }

    fn sample(status: u16, body: &str) -> Resource {
        let now = db::now();
        Resource {
            id: 1,
            kind: "http".into(),
            uri: "https://example.org".into(),
            data_hash: String::new(),
            method: "GET".into(),
            request: json!({}),
            head: json!({}),
            body: body.into(),
            status,
            is_extracted: false,
            since: now,
            purge_at: None,
            created_at: now,
            modified_at: now,
        }
    }
}
