//! Task configuration and the per-document task graph.
//!
//! A task config declares:
//!
//! - `depends_on`: entries starting with `$` are JSON paths on the
//!   document properties ("watched paths"); they must be present for the
//!   task to run and a change in their value invalidates the task. Every
//!   other entry names a task that must have succeeded first.
//! - `checks`: predicate names evaluated against the document. A `!`
//!   prefix negates the predicate.
//! - `resources`: resource kinds the task may call.
//!
//! Anything else in the table is kept verbatim in `extra` so processors can
//! read their own settings from the same snapshot.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::json_path::{is_present, JsonPath, PathError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },
    #[error("task graph contains a cycle through: {0}")]
    Cycle(String),
    #[error("unknown check '{0}'")]
    UnknownCheck(String),
    #[error("task '{task}': {source}")]
    Path {
        task: String,
        #[source]
        source: PathError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskConfig {
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub type TaskMap = BTreeMap<String, TaskConfig>;

impl TaskConfig {
    /// `$`-prefixed `depends_on` entries.
    pub fn watched_paths(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .map(String::as_str)
            .filter(|d| d.starts_with('$'))
    }

    /// `depends_on` entries that name other tasks.
    pub fn task_dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .map(String::as_str)
            .filter(|d| !d.starts_with('$'))
    }

    /// Whether every watched path resolves to a present value.
    pub fn watched_paths_present(&self, properties: &Value) -> Result<bool, PathError> {
        for raw in self.watched_paths() {
            let path = JsonPath::parse(raw)?;
            if !is_present(&path.resolve(properties)) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Source of predicate values for `checks`.
pub trait CheckContext {
    /// Evaluate the named predicate; `None` when the name is unknown.
    fn check(&self, name: &str) -> Option<bool>;
}

/// Split a check into its negation flag and predicate name.
pub fn split_check(raw: &str) -> (bool, &str) {
    match raw.strip_prefix('!') {
        Some(rest) => (true, rest.trim()),
        None => (false, raw.trim()),
    }
}

/// Evaluate a list of checks. All must hold.
pub fn evaluate_checks(checks: &[String], ctx: &dyn CheckContext) -> Result<bool, TaskError> {
    for raw in checks {
        let (negate, name) = split_check(raw);
        let value = ctx
            .check(name)
            .ok_or_else(|| TaskError::UnknownCheck(name.to_string()))?;
        if value == negate {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Tasks in dependency order. Ties are broken by name so the order is
/// stable across runs.
pub fn execution_order(tasks: &TaskMap) -> Result<Vec<String>, TaskError> {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (name, config) in tasks {
        indegree.entry(name.as_str()).or_insert(0);
        for dep in config.task_dependencies() {
            if !tasks.contains_key(dep) {
                return Err(TaskError::UnknownDependency {
                    task: name.clone(),
                    dependency: dep.to_string(),
                });
            }
            *indegree.entry(name.as_str()).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        if let Some(children) = dependents.get(name) {
            for child in children {
                if let Some(degree) = indegree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(child);
                    }
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(name, _)| *name)
            .collect();
        return Err(TaskError::Cycle(stuck.join(", ")));
    }
    Ok(order)
}

/// Every task that transitively depends on one of `roots` (roots included).
pub fn with_dependents(tasks: &TaskMap, roots: &BTreeSet<String>) -> BTreeSet<String> {
    let mut result: BTreeSet<String> = roots.clone();
    let mut queue: VecDeque<String> = roots.iter().cloned().collect();
    while let Some(current) = queue.pop_front() {
        for (name, config) in tasks {
            if result.contains(name) {
                continue;
            }
            if config.task_dependencies().any(|d| d == current) {
                result.insert(name.clone());
                queue.push_back(name.clone());
            }
        }
    }
    result
}

/// Tasks to invalidate after a properties change: those whose watched
/// paths resolve differently, plus everything depending on them.
pub fn invalidated_tasks(
    tasks: &TaskMap,
    before: &Value,
    after: &Value,
) -> Result<BTreeSet<String>, TaskError> {
    let mut changed = BTreeSet::new();
    for (name, config) in tasks {
        for raw in config.watched_paths() {
            let path = JsonPath::parse(raw).map_err(|source| TaskError::Path {
                task: name.clone(),
                source,
            })?;
            if path.resolve(before) != path.resolve(after) {
                changed.insert(name.clone());
                break;
            }
        }
    }
    Ok(with_dependents(tasks, &changed))
}

/// Validate a task map: known dependencies, parseable paths, no cycles.
pub fn validate(tasks: &TaskMap) -> Result<(), TaskError> {
    for (name, config) in tasks {
        for raw in config.watched_paths() {
            JsonPath::parse(raw).map_err(|source| TaskError::Path {
                task: name.clone(),
                source,
            })?;
        }
    }
    execution_order(tasks).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn task(depends_on: &[&str], checks: &[&str]) -> TaskConfig {
        TaskConfig {
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            checks: checks.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn graph() -> TaskMap {
        let mut tasks = TaskMap::new();
        tasks.insert("check_url".into(), task(&["$.url"], &[]));
        tasks.insert("tika".into(), task(&["check_url"], &["is_pdf"]));
        tasks.insert("pdf_preview".into(), task(&["tika"], &["is_pdf"]));
        tasks.insert("youtube_api".into(), task(&["$.video_id"], &["!is_pdf"]));
        tasks
    }

    struct Checks(HashMap<&'static str, bool>);

    impl CheckContext for Checks {
        fn check(&self, name: &str) -> Option<bool> {
            self.0.get(name).copied()
        }
    }

    #[test]
    fn order_respects_dependencies() {
        let order = execution_order(&graph()).unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("check_url") < pos("tika"));
        assert!(pos("tika") < pos("pdf_preview"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn cycles_and_unknown_dependencies_are_rejected() {
        let mut tasks = TaskMap::new();
        tasks.insert("a".into(), task(&["b"], &[]));
        tasks.insert("b".into(), task(&["a"], &[]));
        assert!(matches!(execution_order(&tasks), Err(TaskError::Cycle(_))));

        let mut tasks = TaskMap::new();
        tasks.insert("a".into(), task(&["missing"], &[]));
        assert!(matches!(
            execution_order(&tasks),
            Err(TaskError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn checks_support_negation() {
        let ctx = Checks(HashMap::from([("is_pdf", true)]));
        assert!(evaluate_checks(&["is_pdf".to_string()], &ctx).unwrap());
        assert!(!evaluate_checks(&["!is_pdf".to_string()], &ctx).unwrap());
        assert!(matches!(
            evaluate_checks(&["nope".to_string()], &ctx),
            Err(TaskError::UnknownCheck(_))
        ));
    }

    #[test]
    fn watched_path_changes_invalidate_dependents() {
        let before = json!({"url": "https://example.com/1", "video_id": "a"});
        let after = json!({"url": "https://example.com/2", "video_id": "a"});
        let invalid = invalidated_tasks(&graph(), &before, &after).unwrap();
        assert_eq!(
            invalid.into_iter().collect::<Vec<_>>(),
            vec!["check_url", "pdf_preview", "tika"]
        );

        let unchanged = invalidated_tasks(&graph(), &before, &before).unwrap();
        assert!(unchanged.is_empty());
    }

    #[test]
    fn watched_paths_must_be_present() {
        let config = task(&["$.url"], &[]);
        assert!(config
            .watched_paths_present(&json!({"url": "https://x"}))
            .unwrap());
        assert!(!config.watched_paths_present(&json!({"url": ""})).unwrap());
    }

    #[test]
    fn extra_settings_are_kept() {
        let config: TaskConfig = serde_json::from_value(json!({
            "depends_on": ["$.url"],
            "resource": "http_check",
            "to_property": "status"
        }))
        .unwrap();
        assert_eq!(config.extra["resource"], json!("http_check"));
        assert_eq!(config.watched_paths().collect::<Vec<_>>(), vec!["$.url"]);
    }
}
