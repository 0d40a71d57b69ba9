//! The document value and its lifecycle rules.
//!
//! A [`Document`] is created from a [`Seed`], may be updated in place by
//! later seeds, inherits work from its historic counterpart in the previous
//! dataset version, and advances through its task graph until no task is
//! pending. All methods are pure: callers pass the current time and persist
//! the result themselves.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hashing::properties_hash;
use crate::models::{DocumentMetadata, DocumentState, Pipeline, PipelineEntry, Seed};
use crate::tasks::{
    evaluate_checks, execution_order, invalidated_tasks, CheckContext, TaskError, TaskMap,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Database id; `None` until the document is first stored.
    pub id: Option<i64>,
    pub set_id: i64,
    pub entity: String,
    pub identity: String,
    pub state: DocumentState,
    pub properties: Map<String, Value>,
    pub metadata: DocumentMetadata,
    pub pipeline: Pipeline,
    pub derivatives: Map<String, Value>,
    pub tasks: TaskMap,
    pub is_not_found: bool,
    pub status_code: Option<u16>,
    pub redirects: Option<String>,
    pub pending_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// What changed when a seed or historic document was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub hash_changed: bool,
    pub state_changed: bool,
    pub invalidated: BTreeSet<String>,
}

impl UpdateOutcome {
    pub fn is_noop(&self) -> bool {
        !self.hash_changed && !self.state_changed
    }
}

/// Where a task stands on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    /// Failed with a transient error; `n` attempts so far.
    Retry(u32),
    Failed,
    Canceled,
}

impl Document {
    /// Build a new document from a seed.
    ///
    /// Active documents start pending with an empty pipeline; documents
    /// seeded as deleted start finished.
    pub fn from_seed(
        set_id: i64,
        entity: &str,
        identity: &str,
        seed: &Seed,
        tasks: &TaskMap,
        now: DateTime<Utc>,
    ) -> Self {
        let properties = seed.stored_properties();
        let hash = properties_hash(&Value::Object(properties.clone()));
        let mut doc = Self {
            id: None,
            set_id,
            entity: entity.to_string(),
            identity: identity.to_string(),
            state: DocumentState::Active,
            properties,
            metadata: DocumentMetadata {
                hash,
                created_at: Some(now),
                modified_at: Some(now),
                deleted_at: None,
                language: seed.language(),
                provider: None,
            },
            pipeline: Pipeline::new(),
            derivatives: Map::new(),
            tasks: tasks.clone(),
            is_not_found: false,
            status_code: None,
            redirects: None,
            pending_at: Some(now),
            finished_at: None,
            created_at: now,
            modified_at: now,
        };
        doc.set_state(seed.state(), now);
        doc
    }

    pub fn properties_value(&self) -> Value {
        Value::Object(self.properties.clone())
    }

    // ─── State ───────────────────────────────────────────────────────

    /// Change the lifecycle state, keeping `metadata.deleted_at` consistent.
    /// Returns whether the state changed.
    pub fn set_state(&mut self, state: DocumentState, now: DateTime<Utc>) -> bool {
        let changed = self.state != state;
        self.state = state;
        match state {
            DocumentState::Deleted | DocumentState::Inactive => {
                if self.metadata.deleted_at.is_none() {
                    self.metadata.deleted_at = Some(now);
                }
                self.pending_at = None;
                if self.finished_at.is_none() {
                    self.finished_at = Some(now);
                }
            }
            DocumentState::Active => {
                self.metadata.deleted_at = None;
                if changed {
                    self.mark_pending(now);
                }
            }
            DocumentState::Skipped => {
                self.pending_at = None;
                if self.finished_at.is_none() {
                    self.finished_at = Some(now);
                }
            }
        }
        if changed {
            self.modified_at = now;
        }
        changed
    }

    pub fn is_active(&self) -> bool {
        self.state == DocumentState::Active
    }

    pub fn is_pending(&self) -> bool {
        self.pending_at.is_some() && self.finished_at.is_none()
    }

    pub fn mark_pending(&mut self, now: DateTime<Utc>) {
        self.pending_at = Some(now);
        self.finished_at = None;
    }

    pub fn mark_finished(&mut self, now: DateTime<Utc>) {
        self.pending_at = None;
        self.finished_at = Some(now);
    }

    // ─── Seeds and history ───────────────────────────────────────────

    fn replace_properties(
        &mut self,
        properties: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> UpdateOutcome {
        let hash = properties_hash(&Value::Object(properties.clone()));
        if hash == self.metadata.hash {
            return UpdateOutcome::default();
        }
        let before = self.properties_value();
        let after = Value::Object(properties.clone());
        // Invalid watched paths were rejected when the config was loaded;
        // a document snapshot that still has one invalidates everything.
        let invalidated = invalidated_tasks(&self.tasks, &before, &after)
            .unwrap_or_else(|_| self.tasks.keys().cloned().collect());

        self.properties = properties;
        self.metadata.hash = hash;
        self.metadata.modified_at = Some(now);
        self.modified_at = now;
        self.forget_tasks(&invalidated);
        if self.is_active() {
            self.mark_pending(now);
        }
        UpdateOutcome {
            hash_changed: true,
            state_changed: false,
            invalidated,
        }
    }

    fn forget_tasks(&mut self, tasks: &BTreeSet<String>) {
        for task in tasks {
            self.pipeline.remove(task);
            self.derivatives.remove(task);
        }
        if !tasks.is_empty() && self.is_not_found {
            self.is_not_found = false;
            self.status_code = None;
            self.redirects = None;
        }
    }

    /// Apply a later seed for the same identity.
    ///
    /// `metadata.modified_at` advances only when the properties hash
    /// changes; tasks watching changed paths are invalidated together with
    /// their dependents.
    pub fn update_from_seed(&mut self, seed: &Seed, now: DateTime<Utc>) -> UpdateOutcome {
        let mut outcome = self.replace_properties(seed.stored_properties(), now);
        if let Some(language) = seed.language() {
            self.metadata.language = Some(language);
        }
        outcome.state_changed = self.set_state(seed.state(), now);
        outcome
    }

    /// Carry work over from the same identity in the previous version.
    ///
    /// `created_at` is always inherited. When the hash is unchanged the
    /// whole processing result is reused; otherwise only tasks unaffected
    /// by the changed watched paths keep their outcome.
    pub fn inherit_from(&mut self, historic: &Document, now: DateTime<Utc>) -> UpdateOutcome {
        self.metadata.created_at = historic.metadata.created_at.or(self.metadata.created_at);
        self.metadata.provider = self
            .metadata
            .provider
            .take()
            .or_else(|| historic.metadata.provider.clone());

        if historic.metadata.hash == self.metadata.hash {
            self.metadata.modified_at = historic.metadata.modified_at;
            self.pipeline = historic.pipeline.clone();
            self.derivatives = historic.derivatives.clone();
            self.is_not_found = historic.is_not_found;
            self.status_code = historic.status_code;
            self.redirects = historic.redirects.clone();
            if self.is_active() {
                self.pending_at = historic.pending_at;
                self.finished_at = historic.finished_at;
            }
            return UpdateOutcome::default();
        }

        let invalidated = invalidated_tasks(
            &self.tasks,
            &historic.properties_value(),
            &self.properties_value(),
        )
        .unwrap_or_else(|_| self.tasks.keys().cloned().collect());
        self.pipeline = historic.pipeline.clone();
        self.derivatives = historic.derivatives.clone();
        self.is_not_found = historic.is_not_found;
        self.status_code = historic.status_code;
        self.redirects = historic.redirects.clone();
        self.forget_tasks(&invalidated);
        if self.is_active() {
            self.mark_pending(now);
        }
        UpdateOutcome {
            hash_changed: true,
            state_changed: self.state != historic.state,
            invalidated,
        }
    }

    /// A copy of this document for another set, with a fresh row id.
    pub fn copy_to_set(&self, set_id: i64) -> Self {
        let mut copy = self.clone();
        copy.id = None;
        copy.set_id = set_id;
        copy
    }

    // ─── Tasks ───────────────────────────────────────────────────────

    pub fn task_status(&self, task: &str, max_attempts: u32) -> Option<TaskStatus> {
        let entry = self.pipeline.get(task)?;
        Some(if entry.success {
            TaskStatus::Done
        } else if entry.canceled {
            TaskStatus::Canceled
        } else if entry.retries > 0 && entry.retries < max_attempts {
            TaskStatus::Retry(entry.retries)
        } else {
            TaskStatus::Failed
        })
    }

    fn task_succeeded(&self, task: &str) -> bool {
        self.pipeline.get(task).is_some_and(|e| e.success)
    }

    /// Tasks that may run now, in dependency order.
    ///
    /// A task is pending when it has no terminal pipeline entry, every task
    /// it depends on succeeded, every watched path is present and every
    /// check holds. Inactive and not-found documents have no pending tasks.
    pub fn pending_tasks(
        &self,
        checks: &dyn CheckContext,
        max_attempts: u32,
    ) -> Result<Vec<String>, TaskError> {
        if !self.is_active() || self.is_not_found {
            return Ok(Vec::new());
        }
        let properties = self.properties_value();
        let mut pending = Vec::new();
        for name in execution_order(&self.tasks)? {
            match self.task_status(&name, max_attempts) {
                None | Some(TaskStatus::Retry(_)) => {}
                Some(_) => continue,
            }
            let Some(config) = self.tasks.get(&name) else {
                continue;
            };
            if !config.task_dependencies().all(|d| self.task_succeeded(d)) {
                continue;
            }
            let present = config
                .watched_paths_present(&properties)
                .map_err(|source| TaskError::Path {
                    task: name.clone(),
                    source,
                })?;
            if !present {
                continue;
            }
            if !evaluate_checks(&config.checks, checks)? {
                continue;
            }
            pending.push(name);
        }
        Ok(pending)
    }

    pub fn record_task(&mut self, task: &str, entry: PipelineEntry) {
        self.pipeline.insert(task.to_string(), entry);
    }

    /// Record a transient failure, counting attempts.
    pub fn record_retry(&mut self, task: &str, entry: PipelineEntry) {
        let previous = self.pipeline.get(task).map(|e| e.retries).unwrap_or(0);
        self.pipeline
            .insert(task.to_string(), entry.with_retries(previous + 1));
    }

    pub fn record_derivative(&mut self, task: &str, value: Value) {
        self.derivatives.insert(task.to_string(), value);
    }

    /// Mark every task without a terminal outcome as canceled and finish
    /// the document. Returns the canceled task names.
    pub fn cancel_pending(&mut self, max_attempts: u32, now: DateTime<Utc>) -> Vec<String> {
        let mut canceled = Vec::new();
        let names: Vec<String> = self.tasks.keys().cloned().collect();
        for name in names {
            match self.task_status(&name, max_attempts) {
                None | Some(TaskStatus::Retry(_)) => {
                    self.record_task(&name, PipelineEntry::canceled());
                    canceled.push(name);
                }
                Some(_) => {}
            }
        }
        self.mark_finished(now);
        canceled
    }

    /// The upstream reported the document gone: nothing further applies.
    pub fn apply_not_found(&mut self, now: DateTime<Utc>) {
        self.is_not_found = true;
        self.status_code = Some(404);
        self.mark_finished(now);
    }

    /// Names answered by [`Document::builtin_check`].
    pub const BUILTIN_CHECKS: &'static [&'static str] = &[
        "is_active",
        "is_deleted",
        "is_not_found",
        "is_redirected",
        "has_language",
    ];

    /// Predicates every document supports, independent of its entity kind.
    pub fn builtin_check(&self, name: &str) -> Option<bool> {
        match name {
            "is_active" => Some(self.is_active()),
            "is_deleted" => Some(self.state == DocumentState::Deleted),
            "is_not_found" => Some(self.is_not_found),
            "is_redirected" => Some(self.redirects.is_some()),
            "has_language" => Some(self.metadata.language.is_some()),
            _ => None,
        }
    }
}

impl CheckContext for Document {
    fn check(&self, name: &str) -> Option<bool> {
        self.builtin_check(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskConfig;
    use chrono::Duration;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn seed(value: Value) -> Seed {
        Seed::new(value.as_object().cloned().unwrap())
    }

    fn tasks() -> TaskMap {
        let mut tasks = TaskMap::new();
        tasks.insert(
            "check_url".into(),
            TaskConfig {
                depends_on: vec!["$.url".into()],
                ..Default::default()
            },
        );
        tasks.insert(
            "tika".into(),
            TaskConfig {
                depends_on: vec!["check_url".into()],
                ..Default::default()
            },
        );
        tasks.insert(
            "language".into(),
            TaskConfig {
                depends_on: vec!["$.title".into()],
                ..Default::default()
            },
        );
        tasks
    }

    fn doc() -> Document {
        Document::from_seed(
            1,
            "product",
            "abc",
            &seed(json!({"external_id": "abc", "url": "https://example.com/1", "title": "A"})),
            &tasks(),
            now(),
        )
    }

    #[test]
    fn hash_is_stable_across_builds() {
        let s = seed(json!({"b": 2, "a": 1}));
        let first = Document::from_seed(1, "product", "x", &s, &tasks(), now());
        let second = Document::from_seed(1, "product", "x", &s, &tasks(), now());
        assert_eq!(first.metadata.hash, second.metadata.hash);
        assert!(first.is_pending());
        assert!(first.pipeline.is_empty());
    }

    #[test]
    fn deleted_seeds_start_finished() {
        let d = Document::from_seed(
            1,
            "product",
            "x",
            &seed(json!({"external_id": "x", "state": "deleted"})),
            &tasks(),
            now(),
        );
        assert_eq!(d.state, DocumentState::Deleted);
        assert!(d.metadata.deleted_at.is_some());
        assert!(!d.is_pending());
    }

    #[test]
    fn modified_at_only_moves_on_hash_change() {
        let mut d = doc();
        let later = now() + Duration::hours(1);
        let same = d.update_from_seed(
            &seed(json!({"external_id": "abc", "url": "https://example.com/1", "title": "A"})),
            later,
        );
        assert!(same.is_noop());
        assert_eq!(d.metadata.modified_at, Some(now()));

        let changed = d.update_from_seed(
            &seed(json!({"external_id": "abc", "url": "https://example.com/1", "title": "B"})),
            later,
        );
        assert!(changed.hash_changed);
        assert_eq!(d.metadata.modified_at, Some(later));
    }

    #[test]
    fn update_invalidates_watching_tasks_and_dependents() {
        let mut d = doc();
        d.record_task("check_url", PipelineEntry::success());
        d.record_task("tika", PipelineEntry::success());
        d.record_derivative("tika", json!({"texts": ["x"]}));
        d.record_task("language", PipelineEntry::success());
        d.mark_finished(now());

        let outcome = d.update_from_seed(
            &seed(json!({"external_id": "abc", "url": "https://example.com/2", "title": "A"})),
            now() + Duration::minutes(5),
        );
        assert_eq!(
            outcome.invalidated.into_iter().collect::<Vec<_>>(),
            vec!["check_url", "tika"]
        );
        assert!(d.pipeline.contains_key("language"));
        assert!(!d.derivatives.contains_key("tika"));
        assert!(d.is_pending());
    }

    #[test]
    fn inherit_keeps_work_when_unchanged() {
        let mut historic = doc();
        historic.record_task("check_url", PipelineEntry::success());
        historic.mark_finished(now());
        let mut fresh = Document::from_seed(
            2,
            "product",
            "abc",
            &seed(json!({"external_id": "abc", "url": "https://example.com/1", "title": "A"})),
            &tasks(),
            now() + Duration::days(1),
        );
        let outcome = fresh.inherit_from(&historic, now() + Duration::days(1));
        assert!(outcome.is_noop());
        assert_eq!(fresh.pipeline, historic.pipeline);
        assert_eq!(fresh.finished_at, historic.finished_at);
        assert_eq!(fresh.metadata.created_at, Some(now()));
        assert_eq!(fresh.metadata.modified_at, Some(now()));
    }

    #[test]
    fn pending_tasks_follow_dependencies() {
        let mut d = doc();
        assert_eq!(
            d.pending_tasks(&d.clone(), 3).unwrap(),
            vec!["check_url", "language"]
        );
        d.record_task("check_url", PipelineEntry::success());
        assert_eq!(d.pending_tasks(&d.clone(), 3).unwrap(), vec!["language", "tika"]);
    }

    #[test]
    fn failed_dependency_blocks_dependents() {
        let mut d = doc();
        d.record_task("check_url", PipelineEntry::failure());
        d.record_task("language", PipelineEntry::success());
        assert!(d.pending_tasks(&d.clone(), 3).unwrap().is_empty());
    }

    #[test]
    fn transient_failures_retry_until_exhausted() {
        let mut d = doc();
        d.record_retry("check_url", PipelineEntry::failure());
        assert_eq!(d.task_status("check_url", 3), Some(TaskStatus::Retry(1)));
        d.record_retry("check_url", PipelineEntry::failure());
        d.record_retry("check_url", PipelineEntry::failure());
        assert_eq!(d.task_status("check_url", 3), Some(TaskStatus::Failed));
    }

    #[test]
    fn not_found_finishes_document() {
        let mut d = doc();
        d.apply_not_found(now());
        assert!(d.is_not_found);
        assert!(!d.is_pending());
        assert!(d.pending_at.is_none());
        assert!(d.pending_tasks(&d.clone(), 3).unwrap().is_empty());
    }

    #[test]
    fn cancel_marks_unfinished_tasks() {
        let mut d = doc();
        d.record_task("language", PipelineEntry::success());
        let canceled = d.cancel_pending(3, now());
        assert_eq!(canceled, vec!["check_url", "tika"]);
        assert!(d.pipeline["tika"].canceled);
        assert!(!d.pipeline["tika"].success);
        assert!(d.pipeline["language"].success);
        assert!(!d.is_pending());
    }
}
