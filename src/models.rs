//! Persisted record types.
//!
//! Documents live in `harvester_core::document`; this module holds the
//! rows around them: datasets, versions, sets, harvest states, indices,
//! overwrites, cached resources and pipeline bookkeeping.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use harvester_core::models::{DeletePolicy, IndexingOption, Pipeline, VersionState};
use harvester_core::tasks::TaskMap;

#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    pub is_harvested: bool,
    pub indexing: IndexingOption,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A versioned snapshot of a dataset.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetVersion {
    pub id: i64,
    pub dataset_id: i64,
    pub version: String,
    pub state: VersionState,
    pub is_current: bool,
    pub is_index_promoted: bool,
    pub index_id: Option<i64>,
    pub pipeline: Pipeline,
    pub tasks: TaskMap,
    /// Sets of the previously current version, kept for fallback.
    pub historic_sets: Vec<i64>,
    pub retries: u32,
    pub pending_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl DatasetVersion {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// A named subset of documents within a dataset version.
#[derive(Debug, Clone, Serialize)]
pub struct Set {
    pub id: i64,
    pub dataset_version_id: i64,
    pub name: String,
    pub entity: String,
    pub identifier: String,
    pub delete_policy: DeletePolicy,
    pub pipeline: Pipeline,
    pub tasks: TaskMap,
    pub retries: u32,
    pub pending_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Set {
    pub fn is_pending(&self) -> bool {
        self.pending_at.is_some() && self.finished_at.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// The source part of the set name.
    pub fn source(&self) -> &str {
        self.name
            .split_once(':')
            .map_or(self.name.as_str(), |(source, _)| source)
    }

    /// Sets are named `<source>:<set_specification>`.
    pub fn name_for(source: &str, set_specification: &str) -> String {
        format!("{}:{}", source, set_specification)
    }
}

/// Binds a dataset and source entity to the set being populated.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestState {
    pub id: i64,
    pub dataset_id: i64,
    pub source: String,
    pub entity: String,
    pub set_specification: String,
    pub set_id: Option<i64>,
    /// Low-water mark reported by the source at the last promoted harvest.
    pub harvested_at: Option<DateTime<Utc>>,
    /// Reported by the running harvest; committed on promotion.
    pub pending_harvested_at: Option<DateTime<Utc>>,
    pub purge_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexRecord {
    pub id: i64,
    pub name: String,
    pub dataset_id: i64,
    pub languages: Vec<String>,
    pub error_count: i64,
    pub pushed_at: Option<DateTime<Utc>>,
}

/// User-supplied property overlay for one document identity.
#[derive(Debug, Clone, Serialize)]
pub struct Overwrite {
    pub entity: String,
    pub identity: String,
    pub properties: Map<String, Value>,
}

/// A cached outbound call: request envelope, response head and body.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub id: i64,
    pub kind: String,
    pub uri: String,
    pub data_hash: String,
    pub method: String,
    pub request: Value,
    /// Response metadata: final URL, redirect chain, content type,
    /// headers, and for shell resources the exit code and stderr.
    pub head: Value,
    pub body: String,
    pub status: u16,
    pub is_extracted: bool,
    pub since: DateTime<Utc>,
    pub purge_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A group of documents processed together for one task.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: i64,
    pub set_id: i64,
    pub task: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Ties one document to the resource fetched for it within a batch.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub id: i64,
    pub batch_id: i64,
    pub document_id: i64,
    pub resource_id: Option<i64>,
}
