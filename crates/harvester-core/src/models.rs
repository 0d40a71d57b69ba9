//! Enumerations and small value types shared by every harvester layer.
//!
//! All enums serialize to the lowercase names used in configuration files
//! and in the database (`"active"`, `"transient"`, `"index_and_promote"` …).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => anyhow::bail!(
                        "unknown {} '{}'", stringify!($name), other
                    ),
                }
            }
        }
    };
}

/// Lifecycle state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    #[default]
    Active,
    Deleted,
    Inactive,
    Skipped,
}

string_enum!(DocumentState {
    Active => "active",
    Deleted => "deleted",
    Inactive => "inactive",
    Skipped => "skipped",
});

/// How a source communicates deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// The source never emits deletes.
    #[default]
    No,
    /// Deletes are emitted explicitly and honoured in place.
    Persistent,
    /// Deletes are re-derived every harvest from historic data.
    Transient,
}

string_enum!(DeletePolicy {
    No => "no",
    Persistent => "persistent",
    Transient => "transient",
});

/// What happens with a dataset version once all its sets are finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexingOption {
    None,
    IndexOnly,
    #[default]
    IndexAndPromote,
}

string_enum!(IndexingOption {
    None => "none",
    IndexOnly => "index_only",
    IndexAndPromote => "index_and_promote",
});

impl IndexingOption {
    pub fn creates_index(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// State of a dataset version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    Building,
    Indexing,
    Promoted,
    Indexed,
    Error,
}

string_enum!(VersionState {
    Building => "building",
    Indexing => "indexing",
    Promoted => "promoted",
    Indexed => "indexed",
    Error => "error",
});

impl VersionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Promoted | Self::Indexed | Self::Error)
    }
}

/// Seeder strategy of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Initial,
    Delta,
    BackFill,
}

string_enum!(Strategy {
    Initial => "initial",
    Delta => "delta",
    BackFill => "back_fill",
});

// ═══════════════════════════════════════════════════════════════════════
// Pipeline entries
// ═══════════════════════════════════════════════════════════════════════

/// The recorded outcome of one task on a document, set or version.
///
/// Stored as `{ success, resource?, id?, canceled?, is_auto_succeed?, retries? }`
/// plus arbitrary extra keys (for example `is_replaced` on integrity checks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineEntry {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_auto_succeed: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl PipelineEntry {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }

    /// A successful entry pointing at the resource that produced it.
    pub fn from_resource(kind: &str, id: i64, success: bool) -> Self {
        Self {
            success,
            resource: Some(kind.to_string()),
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn canceled() -> Self {
        Self {
            success: false,
            canceled: true,
            ..Default::default()
        }
    }

    /// Success recorded without doing the work, for tasks whose checks
    /// made them inapplicable.
    pub fn auto_succeed() -> Self {
        Self {
            success: true,
            is_auto_succeed: true,
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Task name → recorded outcome, ordered for stable serialization.
pub type Pipeline = BTreeMap<String, PipelineEntry>;

// ═══════════════════════════════════════════════════════════════════════
// Document metadata
// ═══════════════════════════════════════════════════════════════════════

/// The `metadata` column of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Seeds
// ═══════════════════════════════════════════════════════════════════════

/// A raw extracted record, before it is reconciled into a document.
///
/// Seeds are plain property maps. A handful of keys carry meaning for the
/// seeder and are stripped before the properties are stored:
///
/// - `state`: one of the [`DocumentState`] names, defaults to active
/// - `language`: copied into `metadata.language`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seed {
    pub properties: Map<String, Value>,
}

const STATE_KEY: &str = "state";
const LANGUAGE_KEY: &str = "language";

impl Seed {
    pub fn new(properties: Map<String, Value>) -> Self {
        Self { properties }
    }

    pub fn state(&self) -> DocumentState {
        self.properties
            .get(STATE_KEY)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == DocumentState::Deleted
    }

    /// The external identity of this seed, read from the identifier field.
    ///
    /// Strings are used as-is, numbers are rendered in decimal; anything
    /// else (including a missing field) yields `None`.
    pub fn identity(&self, identifier: &str) -> Option<String> {
        match self.properties.get(identifier)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn language(&self) -> Option<String> {
        self.properties
            .get(LANGUAGE_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Shallow merge of another seed's properties over this one.
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (key, value) in other {
            self.properties.insert(key, value);
        }
    }

    /// Properties as they are stored on a document (control keys removed).
    pub fn stored_properties(&self) -> Map<String, Value> {
        let mut properties = self.properties.clone();
        properties.remove(STATE_KEY);
        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enums_use_config_names() {
        assert_eq!(
            serde_json::to_value(IndexingOption::IndexAndPromote).unwrap(),
            json!("index_and_promote")
        );
        assert_eq!(
            "transient".parse::<DeletePolicy>().unwrap(),
            DeletePolicy::Transient
        );
        assert_eq!(Strategy::BackFill.to_string(), "back_fill");
        assert!("bogus".parse::<DocumentState>().is_err());
    }

    #[test]
    fn pipeline_entry_skips_default_flags() {
        let entry = PipelineEntry::from_resource("http", 7, true);
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"success": true, "resource": "http", "id": 7})
        );
        let canceled = serde_json::to_value(PipelineEntry::canceled()).unwrap();
        assert_eq!(canceled, json!({"success": false, "canceled": true}));
    }

    #[test]
    fn pipeline_entry_keeps_extra_keys() {
        let raw = json!({"success": true, "is_replaced": true});
        let entry: PipelineEntry = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(entry.extra.get("is_replaced"), Some(&json!(true)));
        assert_eq!(serde_json::to_value(&entry).unwrap(), raw);
    }

    #[test]
    fn seed_identity_and_state() {
        let seed = Seed::new(
            json!({"external_id": 42, "state": "deleted", "title": "x"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(seed.identity("external_id"), Some("42".to_string()));
        assert_eq!(seed.identity("missing"), None);
        assert!(seed.is_deleted());
        assert!(!seed.stored_properties().contains_key("state"));
    }

    #[test]
    fn version_terminal_states() {
        assert!(VersionState::Promoted.is_terminal());
        assert!(VersionState::Indexed.is_terminal());
        assert!(!VersionState::Indexing.is_terminal());
    }
}
