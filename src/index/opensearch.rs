//! OpenSearch REST backend.
//!
//! Talks to the cluster with plain JSON over `reqwest`: index create and
//! delete, `_bulk` with NDJSON bodies, `_aliases` for atomic alias swaps,
//! `_alias/<name>` lookups and `_count`.
//!
//! Bulk requests retry on 429 and 5xx with exponential backoff. Any other
//! 4xx on the request as a whole is a [`HarvestError::Fatal`]; per-item
//! failures are counted into [`BulkOutcome::errors`].

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{AliasAction, BulkOp, BulkOutcome, SearchBackend};
use crate::config::{expand_env_vars, SearchConfig};
use crate::error::HarvestError;

const BULK_RETRIES: u32 = 3;

pub struct OpenSearchBackend {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

/// Built-in analyzer for a language code, when the cluster has one.
fn analyzer_for(language: &str) -> Option<&'static str> {
    Some(match language {
        "en" => "english",
        "nl" => "dutch",
        "de" => "german",
        "fr" => "french",
        "es" => "spanish",
        "it" => "italian",
        "pt" => "portuguese",
        "da" => "danish",
        "sv" => "swedish",
        "no" => "norwegian",
        "fi" => "finnish",
        _ => return None,
    })
}

pub(crate) fn index_body(language: Option<&str>) -> Value {
    let analyzer = language.and_then(analyzer_for).unwrap_or("standard");
    json!({
        "settings": {
            "analysis": {
                "analyzer": {
                    "default": { "type": analyzer }
                }
            }
        },
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "entity": { "type": "keyword" },
                "state": { "type": "keyword" },
                "language": { "type": "keyword" },
                "created_at": { "type": "date" },
                "modified_at": { "type": "date" }
            }
        }
    })
}

/// NDJSON body of a bulk request.
pub(crate) fn bulk_body(index: &str, ops: &[BulkOp]) -> Result<String> {
    let mut body = String::new();
    for op in ops {
        match op {
            BulkOp::Index { id, source } => {
                body.push_str(&serde_json::to_string(
                    &json!({"index": {"_index": index, "_id": id}}),
                )?);
                body.push('\n');
                body.push_str(&serde_json::to_string(source)?);
                body.push('\n');
            }
            BulkOp::Delete { id } => {
                body.push_str(&serde_json::to_string(
                    &json!({"delete": {"_index": index, "_id": id}}),
                )?);
                body.push('\n');
            }
        }
    }
    Ok(body)
}

/// Count successes and failures in a `_bulk` response. Deleting a missing
/// document is not a failure.
pub(crate) fn bulk_outcome(response: &Value) -> BulkOutcome {
    let mut outcome = BulkOutcome::default();
    let Some(items) = response.get("items").and_then(Value::as_array) else {
        return outcome;
    };
    for item in items {
        let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
        let is_missing_delete = item.get("delete").is_some() && status == 404;
        if (200..300).contains(&status) || is_missing_delete {
            outcome.succeeded += 1;
        } else {
            outcome.errors += 1;
            if let Some(error) = result.get("error") {
                debug!(status, %error, "bulk item failed");
            }
        }
    }
    outcome
}

impl OpenSearchBackend {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build search client")?;
        Ok(Self {
            client,
            base_url: expand_env_vars(&config.url).trim_end_matches('/').to_string(),
            username: config.username.as_deref().map(expand_env_vars),
            password: config.password.as_deref().map(expand_env_vars),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send_json(&self, builder: RequestBuilder, what: &str) -> Result<(StatusCode, Value)> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("search backend unreachable ({})", what))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, body))
    }
}

fn error_type(body: &Value) -> &str {
    body.get("error")
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

#[async_trait]
impl SearchBackend for OpenSearchBackend {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self
            .request(Method::HEAD, index)
            .send()
            .await
            .with_context(|| format!("search backend unreachable (exists {})", index))?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => bail!("index exists check for '{}' answered {}", index, s),
        }
    }

    async fn create_index(&self, index: &str, language: Option<&str>) -> Result<()> {
        let (status, body) = self
            .send_json(
                self.request(Method::PUT, index).json(&index_body(language)),
                "create index",
            )
            .await?;
        if status.is_success() || error_type(&body) == "resource_already_exists_exception" {
            return Ok(());
        }
        bail!("creating index '{}' failed with {}: {}", index, status, body)
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let (status, body) = self
            .send_json(self.request(Method::DELETE, index), "delete index")
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        bail!("deleting index '{}' failed with {}: {}", index, status, body)
    }

    async fn bulk(&self, index: &str, ops: &[BulkOp], timeout: Duration) -> Result<BulkOutcome> {
        if ops.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let payload = bulk_body(index, ops)?;
        let mut last_err = None;
        for attempt in 0..=BULK_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            let response = self
                .request(Method::POST, "_bulk")
                .header("Content-Type", "application/x-ndjson")
                .timeout(timeout)
                .body(payload.clone())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: Value = response.json().await?;
                        return Ok(bulk_outcome(&body));
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        warn!(index, %status, attempt, "bulk request rejected; retrying");
                        last_err = Some(anyhow::anyhow!("bulk request failed with {}: {}", status, text));
                        continue;
                    }
                    return Err(HarvestError::Fatal(format!(
                        "bulk request to '{}' rejected with {}: {}",
                        index, status, text
                    ))
                    .into());
                }
                Err(err) => {
                    last_err = Some(err.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("bulk request failed")))
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let (status, body) = self
            .send_json(
                self.request(Method::POST, &format!("{}/_refresh", index)),
                "refresh",
            )
            .await?;
        if !status.is_success() {
            bail!("refreshing '{}' failed with {}: {}", index, status, body);
        }
        Ok(())
    }

    async fn count(&self, index: &str) -> Result<u64> {
        let (status, body) = self
            .send_json(self.request(Method::GET, &format!("{}/_count", index)), "count")
            .await?;
        if !status.is_success() {
            bail!("counting '{}' failed with {}: {}", index, status, body);
        }
        body.get("count")
            .and_then(Value::as_u64)
            .with_context(|| format!("count response without count: {}", body))
    }

    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>> {
        let (status, body) = self
            .send_json(self.request(Method::GET, &format!("_alias/{}", alias)), "alias")
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            bail!("alias lookup '{}' failed with {}: {}", alias, status, body);
        }
        let mut targets: Vec<String> = body
            .as_object()
            .map(|indices| indices.keys().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        Ok(targets)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let actions: Vec<Value> = actions
            .iter()
            .map(|action| match action {
                AliasAction::Add { index, alias } => {
                    json!({"add": {"index": index, "alias": alias}})
                }
                AliasAction::Remove { index, alias } => {
                    json!({"remove": {"index": index, "alias": alias}})
                }
            })
            .collect();
        let (status, body) = self
            .send_json(
                self.request(Method::POST, "_aliases")
                    .json(&json!({ "actions": actions })),
                "aliases",
            )
            .await?;
        if !status.is_success() {
            bail!("alias update failed with {}: {}", status, body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_body_is_ndjson() {
        let body = bulk_body(
            "idx",
            &[
                BulkOp::Index {
                    id: "a".into(),
                    source: json!({"title": "x"}),
                },
                BulkOp::Delete { id: "b".into() },
            ],
        )
        .unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            serde_json::from_str::<Value>(lines[0]).unwrap(),
            json!({"index": {"_index": "idx", "_id": "a"}})
        );
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn bulk_outcome_counts_item_errors() {
        let response = json!({
            "errors": true,
            "items": [
                {"index": {"_id": "a", "status": 201}},
                {"index": {"_id": "b", "status": 400, "error": {"type": "mapper_parsing_exception"}}},
                {"delete": {"_id": "c", "status": 404}}
            ]
        });
        assert_eq!(
            bulk_outcome(&response),
            BulkOutcome {
                succeeded: 2,
                errors: 1
            }
        );
    }

    #[test]
    fn language_analyzers() {
        assert_eq!(
            index_body(Some("nl"))["settings"]["analysis"]["analyzer"]["default"]["type"],
            "dutch"
        );
        assert_eq!(
            index_body(None)["settings"]["analysis"]["analyzer"]["default"]["type"],
            "standard"
        );
    }
}
