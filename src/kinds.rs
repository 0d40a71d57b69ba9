//! Entity kinds.
//!
//! Documents of every entity share one table; behaviour that differs per
//! entity (extra check predicates, how a fetched resource changes the
//! document, what goes into the search index) lives behind [`EntityKind`],
//! looked up by the `kind` of `[entities.<entity>]`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use harvester_core::document::Document;
use harvester_core::tasks::CheckContext;

use crate::models::{Overwrite, Resource};

pub trait EntityKind: Send + Sync {
    fn name(&self) -> &str;

    /// Kind-specific predicates for task `checks`; `None` when unknown.
    fn check(&self, _doc: &Document, _name: &str) -> Option<bool> {
        None
    }

    /// Record what a fetched resource says about the document itself.
    fn apply_resource(&self, doc: &mut Document, resource: &Resource, now: DateTime<Utc>) {
        doc.status_code = Some(resource.status);
        doc.redirects = resource.redirect_class().map(str::to_string);
        if resource.is_not_found() {
            doc.apply_not_found(now);
        }
    }

    /// The indexed representation of an active document, with the user
    /// overwrite (if any) laid over its properties.
    fn to_search_data(&self, doc: &Document, overwrite: Option<&Overwrite>) -> Value {
        let mut data: Map<String, Value> = doc.properties.clone();
        if let Some(overwrite) = overwrite {
            for (key, value) in &overwrite.properties {
                data.insert(key.clone(), value.clone());
            }
        }
        data.insert("id".to_string(), json!(doc.identity));
        data.insert("entity".to_string(), json!(doc.entity));
        data.insert("state".to_string(), json!(doc.state));
        data.insert("language".to_string(), json!(doc.metadata.language));
        data.insert("created_at".to_string(), json!(doc.metadata.created_at));
        data.insert("modified_at".to_string(), json!(doc.metadata.modified_at));
        if !doc.derivatives.is_empty() {
            data.insert(
                "derivatives".to_string(),
                Value::Object(doc.derivatives.clone()),
            );
        }
        Value::Object(data)
    }
}

/// Predicates of a document: the built-in ones first, then its kind's.
pub struct KindChecks<'a> {
    pub kind: &'a dyn EntityKind,
    pub doc: &'a Document,
}

impl CheckContext for KindChecks<'_> {
    fn check(&self, name: &str) -> Option<bool> {
        self.doc
            .builtin_check(name)
            .or_else(|| self.kind.check(self.doc, name))
    }
}

fn property_str<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    doc.properties
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Learning material and research products described by a URL.
pub struct GenericKind;

impl GenericKind {
    pub const NAME: &'static str = "generic";

    /// Names answered by the generic kind on top of the builtin checks.
    pub const CHECKS: &'static [&'static str] = &[
        "has_url",
        "is_http_url",
        "is_pdf",
        "is_youtube",
        "is_vimeo",
        "is_video",
    ];
}

impl EntityKind for GenericKind {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check(&self, doc: &Document, name: &str) -> Option<bool> {
        let url = property_str(doc, "url").unwrap_or("").to_ascii_lowercase();
        let mime = property_str(doc, "mime_type")
            .or_else(|| property_str(doc, "format"))
            .unwrap_or("")
            .to_ascii_lowercase();
        let host = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        match name {
            "has_url" => Some(!url.is_empty()),
            "is_http_url" => Some(url.starts_with("http://") || url.starts_with("https://")),
            "is_pdf" => {
                let path = url.split(['?', '#']).next().unwrap_or("");
                Some(mime.contains("pdf") || path.ends_with(".pdf"))
            }
            "is_youtube" => Some(
                host == "youtu.be" || host == "youtube.com" || host.ends_with(".youtube.com"),
            ),
            "is_vimeo" => Some(host == "vimeo.com" || host.ends_with(".vimeo.com")),
            "is_video" => Some(
                mime.starts_with("video/")
                    || self.check(doc, "is_youtube") == Some(true)
                    || self.check(doc, "is_vimeo") == Some(true),
            ),
            _ => None,
        }
    }
}

/// Entity kinds by name.
pub struct KindRegistry {
    kinds: BTreeMap<String, Arc<dyn EntityKind>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GenericKind));
        registry
    }

    pub fn register(&mut self, kind: Arc<dyn EntityKind>) {
        self.kinds.insert(kind.name().to_string(), kind);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn EntityKind>> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown entity kind: '{}'", name))
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_core::models::Seed;
    use harvester_core::tasks::{evaluate_checks, TaskMap};
    use serde_json::json;

    fn doc(properties: Value) -> Document {
        let Value::Object(map) = properties else {
            panic!("object expected")
        };
        Document::from_seed(1, "products", "x", &Seed::new(map), &TaskMap::new(), Utc::now())
    }

    #[test]
    fn generic_checks() {
        let pdf = doc(json!({"url": "https://example.com/file.PDF?x=1"}));
        let checks = KindChecks {
            kind: &GenericKind,
            doc: &pdf,
        };
        assert!(evaluate_checks(&["is_pdf".into(), "has_url".into()], &checks).unwrap());
        assert!(evaluate_checks(&["!is_video".into(), "is_active".into()], &checks).unwrap());

        let video = doc(json!({"url": "https://www.youtube.com/watch?v=1"}));
        let checks = KindChecks {
            kind: &GenericKind,
            doc: &video,
        };
        assert!(evaluate_checks(&["is_video".into()], &checks).unwrap());
        assert!(evaluate_checks(&["nonsense".into()], &checks).is_err());
    }

    #[test]
    fn listed_check_names_are_answered() {
        let d = doc(json!({"url": "https://example.com"}));
        let checks = KindChecks {
            kind: &GenericKind,
            doc: &d,
        };
        for name in Document::BUILTIN_CHECKS.iter().chain(GenericKind::CHECKS) {
            assert!(checks.check(name).is_some(), "{} unanswered", name);
        }
    }

    #[test]
    fn search_data_applies_overwrites() {
        let mut d = doc(json!({"url": "https://example.com", "title": "Old"}));
        d.record_derivative("tika", json!({"texts": ["hello"]}));
        let overwrite = Overwrite {
            entity: "products".into(),
            identity: "x".into(),
            properties: json!({"title": "New"}).as_object().cloned().unwrap_or_default(),
        };
        let data = GenericKind.to_search_data(&d, Some(&overwrite));
        assert_eq!(data["title"], json!("New"));
        assert_eq!(data["id"], json!("x"));
        assert_eq!(data["derivatives"]["tika"]["texts"], json!(["hello"]));
    }
}
