//! In-process search backend for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{AliasAction, BulkOp, BulkOutcome, SearchBackend};

#[derive(Default)]
struct State {
    indices: BTreeMap<String, BTreeMap<String, Value>>,
    aliases: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory search state poisoned"))
    }

    /// A stored document, for assertions.
    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        let state = self.lock().ok()?;
        state.indices.get(index)?.get(id).cloned()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.indices.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchBackend for InMemoryBackend {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.lock()?.indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, _language: Option<&str>) -> Result<()> {
        self.lock()?.indices.entry(index.to_string()).or_default();
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.indices.remove(index);
        for targets in state.aliases.values_mut() {
            targets.remove(index);
        }
        state.aliases.retain(|_, targets| !targets.is_empty());
        Ok(())
    }

    async fn bulk(&self, index: &str, ops: &[BulkOp], _timeout: Duration) -> Result<BulkOutcome> {
        let mut state = self.lock()?;
        let Some(docs) = state.indices.get_mut(index) else {
            return Ok(BulkOutcome {
                succeeded: 0,
                errors: ops.len(),
            });
        };
        let mut outcome = BulkOutcome::default();
        for op in ops {
            match op {
                BulkOp::Index { id, source } => {
                    docs.insert(id.clone(), source.clone());
                }
                BulkOp::Delete { id } => {
                    docs.remove(id);
                }
            }
            outcome.succeeded += 1;
        }
        Ok(outcome)
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        if !self.index_exists(index).await? {
            bail!("no such index: {}", index);
        }
        Ok(())
    }

    async fn count(&self, index: &str) -> Result<u64> {
        let state = self.lock()?;
        let names: Vec<&String> = match state.aliases.get(index) {
            Some(targets) => targets.iter().collect(),
            None => state.indices.keys().filter(|k| k.as_str() == index).collect(),
        };
        if names.is_empty() {
            bail!("no such index: {}", index);
        }
        Ok(names
            .into_iter()
            .filter_map(|name| state.indices.get(name))
            .map(|docs| docs.len() as u64)
            .sum())
    }

    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .aliases
            .get(alias)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()> {
        let mut state = self.lock()?;
        // Validate first so a failing list changes nothing.
        for action in actions {
            if let AliasAction::Add { index, .. } = action {
                if !state.indices.contains_key(index) {
                    bail!("no such index: {}", index);
                }
            }
        }
        for action in actions {
            match action {
                AliasAction::Add { index, alias } => {
                    state
                        .aliases
                        .entry(alias.clone())
                        .or_default()
                        .insert(index.clone());
                }
                AliasAction::Remove { index, alias } => {
                    if let Some(targets) = state.aliases.get_mut(alias) {
                        targets.remove(index);
                    }
                }
            }
        }
        state.aliases.retain(|_, targets| !targets.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn failed_alias_update_changes_nothing() {
        let backend = InMemoryBackend::new();
        backend.create_index("a", None).await.unwrap();
        backend
            .update_aliases(&[AliasAction::Add {
                index: "a".into(),
                alias: "x".into(),
            }])
            .await
            .unwrap();
        let err = backend
            .update_aliases(&[
                AliasAction::Remove {
                    index: "a".into(),
                    alias: "x".into(),
                },
                AliasAction::Add {
                    index: "missing".into(),
                    alias: "x".into(),
                },
            ])
            .await;
        assert!(err.is_err());
        assert_eq!(backend.alias_targets("x").await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn bulk_into_missing_index_counts_errors() {
        let backend = InMemoryBackend::new();
        let ops = vec![BulkOp::Index {
            id: "1".into(),
            source: json!({}),
        }];
        let outcome = backend.bulk("nope", &ops, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.errors, 1);
    }
}
