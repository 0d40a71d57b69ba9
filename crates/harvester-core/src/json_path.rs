//! A small JSON-path selector.
//!
//! Supports the subset the harvester needs for objectives and task
//! dependencies:
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `$` | the value itself |
//! | `$.key` / `key` | object member |
//! | `$['a.b']` | object member whose name contains dots |
//! | `$[0]` | array element |
//! | `$.items[*]` / `$.items.*` | every element (or member value) |
//!
//! Keys may contain any character other than `.` and `[`, which keeps XML
//! derived names such as `dc:title`, `@status` and `#text` addressable.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty JSON path")]
    Empty,
    #[error("invalid JSON path '{path}': {reason}")]
    Invalid { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// A parsed JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        let invalid = |reason: &str| PathError::Invalid {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let body = trimmed.strip_prefix('$').unwrap_or(trimmed);
        let chars: Vec<char> = body.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        // A path without `$` starts directly with a key.
        if !trimmed.starts_with('$') && !chars.is_empty() && chars[0] != '[' {
            let (key, next) = read_key(&chars, 0);
            segments.push(key_or_wildcard(key));
            i = next;
        }

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    let (key, next) = read_key(&chars, i + 1);
                    if key.is_empty() {
                        return Err(invalid("empty key after '.'"));
                    }
                    segments.push(key_or_wildcard(key));
                    i = next;
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|pos| i + pos)
                        .ok_or_else(|| invalid("unclosed '['"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    if inner == "*" {
                        segments.push(Segment::Wildcard);
                    } else if let Ok(index) = inner.parse::<usize>() {
                        segments.push(Segment::Index(index));
                    } else if (inner.starts_with('\'') && inner.ends_with('\''))
                        || (inner.starts_with('"') && inner.ends_with('"'))
                    {
                        if inner.len() < 2 {
                            return Err(invalid("unterminated quoted key"));
                        }
                        segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                    } else {
                        return Err(invalid("expected index, '*' or quoted key inside []"));
                    }
                    i = close + 1;
                }
                _ => return Err(invalid("expected '.' or '['")),
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    /// The path as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcard(&self) -> bool {
        self.segments.iter().any(|s| *s == Segment::Wildcard)
    }

    /// All values matched by the path, in document order.
    pub fn select<'a>(&self, value: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![value];
        for segment in &self.segments {
            let mut next = Vec::new();
            for candidate in current {
                match (segment, candidate) {
                    (Segment::Key(key), Value::Object(map)) => {
                        if let Some(v) = map.get(key) {
                            next.push(v);
                        }
                    }
                    (Segment::Index(index), Value::Array(items)) => {
                        if let Some(v) = items.get(*index) {
                            next.push(v);
                        }
                    }
                    (Segment::Wildcard, Value::Array(items)) => next.extend(items.iter()),
                    (Segment::Wildcard, Value::Object(map)) => next.extend(map.values()),
                    _ => {}
                }
            }
            current = next;
        }
        current
    }

    pub fn first<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.select(value).into_iter().next()
    }

    /// Resolve to an owned value: wildcard paths produce an array of every
    /// match, plain paths the single match, and misses `null`.
    pub fn resolve(&self, value: &Value) -> Value {
        if self.has_wildcard() {
            Value::Array(self.select(value).into_iter().cloned().collect())
        } else {
            self.first(value).cloned().unwrap_or(Value::Null)
        }
    }
}

impl FromStr for JsonPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn read_key(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn key_or_wildcard(key: String) -> Segment {
    if key == "*" {
        Segment::Wildcard
    } else {
        Segment::Key(key)
    }
}

/// Returns `true` when a value counts as "present" for dependency purposes:
/// not null, not an empty string, not an empty array or object.
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "title": "Algebra",
            "files": [
                {"url": "https://example.com/a.pdf", "mime_type": "application/pdf"},
                {"url": "https://example.com/b.html", "mime_type": "text/html"}
            ],
            "dc:creator": {"#text": "Ada"},
            "a.b": 1
        })
    }

    #[test]
    fn selects_simple_members() {
        let path = JsonPath::parse("$.title").unwrap();
        assert_eq!(path.resolve(&sample()), json!("Algebra"));
        let bare = JsonPath::parse("title").unwrap();
        assert_eq!(bare.resolve(&sample()), json!("Algebra"));
    }

    #[test]
    fn selects_indexes_and_wildcards() {
        let first = JsonPath::parse("$.files[0].url").unwrap();
        assert_eq!(first.resolve(&sample()), json!("https://example.com/a.pdf"));

        let all = JsonPath::parse("$.files[*].mime_type").unwrap();
        assert_eq!(
            all.resolve(&sample()),
            json!(["application/pdf", "text/html"])
        );
        let dotted = JsonPath::parse("$.files.*.mime_type").unwrap();
        assert_eq!(dotted.resolve(&sample()), all.resolve(&sample()));
    }

    #[test]
    fn keys_with_xml_characters() {
        let path = JsonPath::parse("$.dc:creator.#text").unwrap();
        assert_eq!(path.resolve(&sample()), json!("Ada"));
        let quoted = JsonPath::parse("$['a.b']").unwrap();
        assert_eq!(quoted.resolve(&sample()), json!(1));
    }

    #[test]
    fn root_path_returns_value() {
        let path = JsonPath::parse("$").unwrap();
        assert_eq!(path.resolve(&json!(5)), json!(5));
    }

    #[test]
    fn missing_paths_resolve_to_null() {
        let path = JsonPath::parse("$.nope.deeper").unwrap();
        assert_eq!(path.resolve(&sample()), Value::Null);
        let wildcard = JsonPath::parse("$.nope[*]").unwrap();
        assert_eq!(wildcard.resolve(&sample()), json!([]));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(JsonPath::parse("  "), Err(PathError::Empty));
        assert!(JsonPath::parse("$.files[0").is_err());
        assert!(JsonPath::parse("$..title").is_err());
        assert!(JsonPath::parse("$[abc]").is_err());
    }

    #[test]
    fn presence_rules() {
        assert!(!is_present(&Value::Null));
        assert!(!is_present(&json!("  ")));
        assert!(!is_present(&json!([])));
        assert!(is_present(&json!(0)));
        assert!(is_present(&json!("x")));
    }
}
