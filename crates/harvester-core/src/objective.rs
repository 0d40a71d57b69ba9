//! Field-level extraction rules.
//!
//! An [`Objective`] maps output field names to [`Extractor`]s. Applying it to
//! a parsed page yields one seed per record:
//!
//! 1. The iterator (the `@` key in configuration) selects the record
//!    elements inside the page. Without an iterator the page itself is the
//!    element, or each of its items when the page is an array.
//! 2. Every field extractor runs against `(page, element)`.
//! 3. Post-processing extractors (keys prefixed with `#`) run afterwards
//!    against `(page, partial seed)` and may overwrite or add fields.
//!
//! Path extractors written as `$.a.b` are relative to the element, paths
//! written as `~.a.b` are relative to the page root. Callables receive both.
//!
//! Extraction is pure: the same page always yields the same seeds.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::json_path::{JsonPath, PathError};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    #[error("{0}")]
    Message(String),
    #[error("field '{field}': {message}")]
    Field { field: String, message: String },
    #[error(transparent)]
    Path(#[from] PathError),
}

impl ExtractError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// A callable extractor: `(page, element) -> value`.
pub type ExtractFn = Arc<dyn Fn(&Value, &Value) -> Result<Value, ExtractError> + Send + Sync>;

/// How one output field is produced.
#[derive(Clone)]
pub enum Extractor {
    /// JSON path relative to the current element.
    Path(JsonPath),
    /// JSON path relative to the page root.
    RootPath(JsonPath),
    Fn(ExtractFn),
}

impl Extractor {
    /// Parse a configured path. A leading `~` selects the page root.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let raw = raw.trim();
        match raw.strip_prefix('~') {
            Some(rest) => {
                let rest = if rest.is_empty() { "$" } else { rest };
                let rest = if rest.starts_with('.') || rest.starts_with('[') {
                    format!("${}", rest)
                } else {
                    rest.to_string()
                };
                Ok(Self::RootPath(JsonPath::parse(&rest)?))
            }
            None => Ok(Self::Path(JsonPath::parse(raw)?)),
        }
    }

    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Result<Value, ExtractError> + Send + Sync + 'static,
    {
        Self::Fn(Arc::new(f))
    }

    pub fn apply(&self, root: &Value, element: &Value) -> Result<Value, ExtractError> {
        match self {
            Self::Path(path) => Ok(path.resolve(element)),
            Self::RootPath(path) => Ok(path.resolve(root)),
            Self::Fn(f) => f(root, element),
        }
    }
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "Path({})", path),
            Self::RootPath(path) => write!(f, "RootPath({})", path),
            Self::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// The field-by-field mapping used to turn raw payloads into seeds.
#[derive(Debug, Clone, Default)]
pub struct Objective {
    iterator: Option<JsonPath>,
    fields: Vec<(String, Extractor)>,
    post: Vec<(String, Extractor)>,
}

impl Objective {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an objective from a configured `field → path` table.
    ///
    /// `@` sets the record iterator; `#name` registers a post-processing
    /// path evaluated against the partial seed.
    pub fn from_paths(paths: &BTreeMap<String, String>) -> Result<Self, ExtractError> {
        let mut objective = Self::new();
        for (key, raw) in paths {
            if key == "@" {
                objective.iterator = Some(JsonPath::parse(raw)?);
            } else if let Some(name) = key.strip_prefix('#') {
                objective.post.push((name.to_string(), Extractor::parse(raw)?));
            } else {
                objective.fields.push((key.clone(), Extractor::parse(raw)?));
            }
        }
        Ok(objective)
    }

    pub fn with_iterator(mut self, path: JsonPath) -> Self {
        self.iterator = Some(path);
        self
    }

    pub fn field(mut self, name: &str, extractor: Extractor) -> Self {
        self.fields.retain(|(existing, _)| existing != name);
        self.fields.push((name.to_string(), extractor));
        self
    }

    pub fn post(mut self, name: &str, extractor: Extractor) -> Self {
        self.post.retain(|(existing, _)| existing != name);
        self.post.push((name.to_string(), extractor));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.post.is_empty()
    }

    /// The record elements of a page.
    pub fn elements<'a>(&self, page: &'a Value) -> Vec<&'a Value> {
        let selected = match &self.iterator {
            Some(path) => path.select(page),
            None => vec![page],
        };
        let expand = self.iterator.as_ref().map_or(true, |p| !p.has_wildcard());
        let mut elements = Vec::new();
        for value in selected {
            match value {
                Value::Array(items) if expand => elements.extend(items.iter()),
                Value::Null => {}
                other => elements.push(other),
            }
        }
        elements
    }

    /// Extract one result per record element, in page order.
    ///
    /// A failing extractor fails only its own record so the caller can log
    /// and skip it while the rest of the page proceeds.
    pub fn extract(&self, page: &Value) -> Vec<Result<Map<String, Value>, ExtractError>> {
        self.elements(page)
            .into_iter()
            .map(|element| self.extract_element(page, element))
            .collect()
    }

    pub fn extract_element(
        &self,
        page: &Value,
        element: &Value,
    ) -> Result<Map<String, Value>, ExtractError> {
        let mut seed = Map::new();
        for (name, extractor) in &self.fields {
            let value = extractor
                .apply(page, element)
                .map_err(|e| field_error(name, e))?;
            seed.insert(name.clone(), value);
        }
        if !self.post.is_empty() {
            let partial = Value::Object(seed.clone());
            for (name, extractor) in &self.post {
                let value = extractor
                    .apply(page, &partial)
                    .map_err(|e| field_error(name, e))?;
                seed.insert(name.clone(), value);
            }
        }
        Ok(seed)
    }
}

fn field_error(field: &str, err: ExtractError) -> ExtractError {
    match err {
        ExtractError::Field { .. } => err,
        other => ExtractError::Field {
            field: field.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page() -> Value {
        json!({
            "meta": {"generated": "2024-01-01T00:00:00Z"},
            "results": [
                {"id": 1, "title": "Algebra", "tags": ["math", "school"]},
                {"id": 2, "title": "Biology", "tags": []}
            ]
        })
    }

    #[test]
    fn extracts_configured_paths() {
        let mut paths = BTreeMap::new();
        paths.insert("@".to_string(), "$.results".to_string());
        paths.insert("external_id".to_string(), "$.id".to_string());
        paths.insert("title".to_string(), "$.title".to_string());
        paths.insert("generated".to_string(), "~.meta.generated".to_string());
        let objective = Objective::from_paths(&paths).unwrap();

        let seeds: Vec<_> = objective
            .extract(&page())
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0]["external_id"], json!(1));
        assert_eq!(seeds[1]["title"], json!("Biology"));
        assert_eq!(seeds[1]["generated"], json!("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn callables_and_post_processing() {
        let objective = Objective::new()
            .with_iterator(JsonPath::parse("$.results").unwrap())
            .field("title", Extractor::parse("$.title").unwrap())
            .field(
                "keywords",
                Extractor::func(|_root, el| {
                    let tags = el["tags"].as_array().cloned().unwrap_or_default();
                    Ok(Value::from(tags.len()))
                }),
            )
            .post(
                "title",
                Extractor::func(|_root, partial| {
                    let title = partial["title"].as_str().unwrap_or_default();
                    Ok(Value::from(title.to_uppercase()))
                }),
            );

        let seeds = objective.extract(&page());
        let first = seeds[0].as_ref().unwrap();
        assert_eq!(first["title"], json!("ALGEBRA"));
        assert_eq!(first["keywords"], json!(2));
    }

    #[test]
    fn failing_callable_fails_only_its_record() {
        let objective = Objective::new()
            .with_iterator(JsonPath::parse("$.results").unwrap())
            .field(
                "id",
                Extractor::func(|_root, el| match el["id"].as_i64() {
                    Some(2) => Err(ExtractError::msg("bad record")),
                    Some(id) => Ok(Value::from(id)),
                    None => Ok(Value::Null),
                }),
            );
        let seeds = objective.extract(&page());
        assert!(seeds[0].is_ok());
        match &seeds[1] {
            Err(ExtractError::Field { field, message }) => {
                assert_eq!(field, "id");
                assert_eq!(message, "bad record");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn page_without_iterator() {
        let objective = Objective::new().field("id", Extractor::parse("$.id").unwrap());
        assert_eq!(objective.extract(&json!({"id": 3})).len(), 1);
        assert_eq!(objective.extract(&json!([{"id": 1}, {"id": 2}])).len(), 2);
    }

    #[test]
    fn missing_iterator_target_yields_nothing() {
        let objective = Objective::new()
            .with_iterator(JsonPath::parse("$.absent").unwrap())
            .field("id", Extractor::parse("$.id").unwrap());
        assert!(objective.extract(&page()).is_empty());
    }
}
