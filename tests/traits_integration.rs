//! Integration tests for the extension traits.
//!
//! These tests prove that custom extractors and entity kinds (implemented
//! via the `Source` and `EntityKind` traits) work end-to-end through an
//! actual harvest run: seeding, document tasks, indexing and promotion.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use harvester::config::{parse_config, Config};
use harvester::core::document::Document;
use harvester::core::json_path::JsonPath;
use harvester::core::models::VersionState;
use harvester::core::objective::{ExtractError, Extractor, Objective};
use harvester::harvest::{Harvester, RunOptions};
use harvester::index::{IndexManager, InMemoryBackend, SearchBackend};
use harvester::kinds::{EntityKind, GenericKind, KindRegistry};
use harvester::models::Overwrite;
use harvester::resources::http::{HttpClient, HttpRequest, HttpResponse};
use harvester::resources::shell::ProcessRunner;
use harvester::resources::ResourceCache;
use harvester::sources::{list_sources, Source, SourceRegistry};
use harvester::store::Store;

// ─── Test Source ────────────────────────────────────────────────────

/// A feed extractor that ships its own objective and a channel callback.
struct FeedSource;

impl Source for FeedSource {
    fn name(&self) -> &str {
        "feed"
    }

    fn description(&self) -> &str {
        "Test feed extractor"
    }

    fn default_objective(&self) -> Objective {
        Objective::new()
            .with_iterator(JsonPath::parse("$.entries").unwrap())
            .field("external_id", Extractor::parse("$.guid").unwrap())
            .field("title", Extractor::parse("$.title").unwrap())
            .field("url", Extractor::parse("$.link").unwrap())
            .field(
                "license",
                Extractor::func(|_, element| {
                    Ok(element
                        .get("rights")
                        .and_then(Value::as_str)
                        .map(|r| json!(r.to_ascii_lowercase()))
                        .unwrap_or(Value::Null))
                }),
            )
    }

    fn callback(&self, name: &str) -> Option<Extractor> {
        match name {
            "channel" => Some(Extractor::func(|page, _| {
                let channel = page
                    .get("channel")
                    .cloned()
                    .ok_or_else(|| ExtractError::msg("page has no channel"))?;
                Ok(json!({ "channel": channel }))
            })),
            _ => None,
        }
    }

    fn check_page(&self, page: &Value) -> Result<()> {
        if let Some(error) = page.get("error").and_then(Value::as_str) {
            bail!("feed error: {}", error);
        }
        Ok(())
    }
}

// ─── Test Kind ──────────────────────────────────────────────────────

/// Open-access aware kind: adds an `is_open` check and search flag.
struct OpenAccessKind;

fn is_open(doc: &Document) -> bool {
    doc.properties
        .get("license")
        .and_then(Value::as_str)
        .map(|l| l.starts_with("cc"))
        .unwrap_or(false)
}

impl EntityKind for OpenAccessKind {
    fn name(&self) -> &str {
        "open_access"
    }

    fn check(&self, doc: &Document, name: &str) -> Option<bool> {
        match name {
            "is_open" => Some(is_open(doc)),
            _ => GenericKind.check(doc, name),
        }
    }

    fn to_search_data(&self, doc: &Document, overwrite: Option<&Overwrite>) -> Value {
        let mut data = GenericKind.to_search_data(doc, overwrite);
        data["is_open"] = json!(is_open(doc));
        data
    }
}

// ─── Stub HTTP ──────────────────────────────────────────────────────

#[derive(Default)]
struct FeedHttp {
    feed: Mutex<Value>,
    heads: Mutex<Vec<String>>,
}

#[async_trait]
impl HttpClient for FeedHttp {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let body = if request.url.starts_with(FEED) {
            self.feed.lock().unwrap().to_string()
        } else {
            self.heads.lock().unwrap().push(request.url.clone());
            String::new()
        };
        Ok(HttpResponse {
            status: 200,
            final_url: request.url.clone(),
            content_type: Some("application/json".to_string()),
            body,
            ..Default::default()
        })
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

const FEED: &str = "https://feeds.example.org/latest";

fn config_text(dir: &TempDir) -> String {
    format!(
        r#"
[db]
path = "{db}"

[harvest]
dispatch_retry_delay_secs = 0
lock_retry_delay_secs = 0

[search]
backend = "memory"

[blobs]
path = "{blobs}"

[resources.http]
type = "http"

[sources.news]
extractor = "feed"

[sources.news.entities.products]
set_specification = "latest"

[[sources.news.entities.products.phases]]
phase = "entries"
strategy = "initial"
retrieve_data = {{ resource = "http", url = "{feed}" }}
contribute_data = {{ callback = "channel" }}

[entities.products]
identifier = "external_id"
kind = "open_access"

[entities.products.tasks.check_url]
depends_on = ["$.url"]
checks = ["is_open", "is_http_url"]
resources = ["http"]
method = "HEAD"

[datasets.news]
harvest = [{{ source = "news", entity = "products" }}]
"#,
        db = dir.path().join("harvester.sqlite").display(),
        blobs = dir.path().join("blobs").display(),
        feed = FEED,
    )
}

fn entry(guid: &str, rights: &str) -> Value {
    json!({
        "guid": guid,
        "title": format!("Entry {}", guid),
        "link": format!("https://example.com/{}", guid),
        "rights": rights,
    })
}

struct Harness {
    _dir: TempDir,
    config: Config,
    store: Store,
    http: Arc<FeedHttp>,
    backend: Arc<InMemoryBackend>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = parse_config(&config_text(&dir)).unwrap();
        let store = Store::open(&config).await.unwrap();
        Self {
            _dir: dir,
            config,
            store,
            http: Arc::new(FeedHttp::default()),
            backend: Arc::new(InMemoryBackend::new()),
        }
    }

    fn harvester(&self) -> Harvester {
        let cache = ResourceCache::new(
            self.store.clone(),
            &self.config,
            self.http.clone(),
            Arc::new(ProcessRunner),
        )
        .unwrap();
        let index = IndexManager::new(self.backend.clone(), &self.config.search);

        let mut sources = SourceRegistry::with_builtins();
        sources.register(Arc::new(FeedSource));
        let mut kinds = KindRegistry::with_builtins();
        kinds.register(Arc::new(OpenAccessKind));

        Harvester::new(self.config.clone(), self.store.clone(), cache, index)
            .with_sources(sources)
            .with_kinds(kinds)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_custom_source_and_kind_end_to_end() {
    let h = Harness::new().await;
    *h.http.feed.lock().unwrap() = json!({
        "channel": "research",
        "entries": [entry("a", "CC-BY-4.0"), entry("b", "Copyright"), entry("c", "cc0")],
    });

    let summary = h
        .harvester()
        .run(
            "news",
            &RunOptions {
                version: Some("v1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(summary.state, VersionState::Promoted);
    assert_eq!(summary.documents, 3);
    assert!(summary.failed_sets.is_empty());

    // Only open documents pass the kind check of the URL task.
    let mut heads = h.http.heads.lock().unwrap().clone();
    heads.sort();
    assert_eq!(heads, vec!["https://example.com/a", "https://example.com/c"]);

    let dataset = h.store.get_dataset("news").await.unwrap().unwrap();
    let version = h.store.find_version(dataset.id, "v1").await.unwrap().unwrap();
    let index = h.store.get_index(version.index_id.unwrap()).await.unwrap();
    assert_eq!(h.backend.count("news").await.unwrap(), 3);

    let a = h.backend.document(&index.name, "a").unwrap();
    assert_eq!(a["is_open"], json!(true));
    assert_eq!(a["license"], json!("cc-by-4.0"));
    assert_eq!(a["channel"], json!("research"));
    let b = h.backend.document(&index.name, "b").unwrap();
    assert_eq!(b["is_open"], json!(false));
}

#[tokio::test]
async fn test_page_rejected_by_source_keeps_run_going() {
    let h = Harness::new().await;
    *h.http.feed.lock().unwrap() = json!({"error": "feed offline"});

    let summary = h.harvester().run("news", &RunOptions::default()).await.unwrap();
    assert_eq!(summary.failed_sets, vec!["news:latest".to_string()]);

    let dataset = h.store.get_dataset("news").await.unwrap().unwrap();
    let versions = h.store.list_versions(dataset.id).await.unwrap();
    let sets = h.store.list_sets(versions[0].id).await.unwrap();
    let seeding = &sets[0].pipeline["seeding"];
    assert!(!seeding.success);
    assert!(seeding.extra["error"]
        .as_str()
        .unwrap()
        .contains("feed offline"));
}

#[test]
fn test_source_listing_reflects_registry() {
    let dir = TempDir::new().unwrap();
    let config = parse_config(&config_text(&dir)).unwrap();

    let builtins = SourceRegistry::with_builtins();
    let listed = list_sources(&config, &builtins);
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].registered);

    let mut custom = SourceRegistry::with_builtins();
    custom.register(Arc::new(FeedSource));
    let listed = list_sources(&config, &custom);
    assert!(listed[0].registered);
    assert_eq!(listed[0].phases, vec!["entries".to_string()]);
    assert_eq!(custom.names().collect::<Vec<_>>(), vec!["feed", "json_api", "oai_pmh"]);
}

#[test]
fn test_unknown_kind_is_an_error() {
    let kinds = KindRegistry::with_builtins();
    assert!(kinds.get("generic").is_ok());
    assert!(kinds.get("open_access").is_err());
}
