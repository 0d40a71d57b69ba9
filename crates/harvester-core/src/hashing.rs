//! Canonical serialization and content hashing.
//!
//! Two hashes are used throughout the harvester:
//!
//! - [`properties_hash`]: SHA-1 over the key-sorted serialization of a
//!   document's properties. Stored as `metadata.hash` and used to decide
//!   whether `metadata.modified_at` advances.
//! - [`data_hash`]: SHA-256 over the key-sorted serialization of a request
//!   payload. Part of the resource cache key so that semantically equal
//!   requests collapse onto one cached record.

use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Serialize a JSON value with object keys sorted at every depth.
///
/// The output is compact (no whitespace) and independent of the insertion
/// order of the source maps.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// SHA-1 hex digest of the canonical serialization of `properties`.
pub fn properties_hash(properties: &Value) -> String {
    let mut hasher = Sha1::new();
    hasher.update(canonical_json(properties).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of a request payload.
///
/// `null` and empty objects hash to the empty string so that body-less
/// requests share a cache key regardless of how "no payload" was spelled.
pub fn data_hash(payload: &Value) -> String {
    let is_empty = match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if is_empty {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": 1, "x": 2}], "c": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":null,"z":[3,{"x":2,"y":1}]},"b":1}"#
        );
    }

    #[test]
    fn properties_hash_ignores_key_order() {
        let first = json!({"title": "Rust", "url": "https://example.com/1"});
        let second = json!({"url": "https://example.com/1", "title": "Rust"});
        assert_eq!(properties_hash(&first), properties_hash(&second));
        assert_eq!(properties_hash(&first).len(), 40);
    }

    #[test]
    fn properties_hash_detects_value_changes() {
        let first = json!({"title": "Rust"});
        let second = json!({"title": "Rust 2"});
        assert_ne!(properties_hash(&first), properties_hash(&second));
    }

    #[test]
    fn data_hash_collapses_empty_payloads() {
        assert_eq!(data_hash(&Value::Null), "");
        assert_eq!(data_hash(&json!({})), "");
        assert_eq!(data_hash(&json!([])), "");
    }

    #[test]
    fn data_hash_is_order_independent() {
        let first = json!({"query": "math", "page": 2});
        let second = json!({"page": 2, "query": "math"});
        assert_eq!(data_hash(&first), data_hash(&second));
        assert_eq!(data_hash(&first).len(), 64);
    }
}
