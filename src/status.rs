//! Dataset status overview.
//!
//! Summarises what a dataset holds: its versions and their states, the
//! sets of the newest version with document counts per state, the index
//! behind each version, harvest low-water marks and the resource cache.
//! Used by `harvest status`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{DatasetVersion, HarvestState, IndexRecord, Set};
use crate::store::{SetCounts, Store};

#[derive(Debug, Serialize)]
pub struct SetStatus {
    pub name: String,
    pub entity: String,
    pub finished: bool,
    pub retries: u32,
    pub replaced: bool,
    pub active: i64,
    pub deleted: i64,
    pub inactive: i64,
    pub skipped: i64,
    pub pending: i64,
}

impl SetStatus {
    fn new(set: &Set, counts: SetCounts) -> Self {
        let replaced = set
            .pipeline
            .get(crate::config::CHECK_SET_INTEGRITY)
            .and_then(|e| e.extra.get("is_replaced"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Self {
            name: set.name.clone(),
            entity: set.entity.clone(),
            finished: set.is_finished(),
            retries: set.retries,
            replaced,
            active: counts.active,
            deleted: counts.deleted,
            inactive: counts.inactive,
            skipped: counts.skipped,
            pending: counts.pending,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DatasetStatus {
    pub dataset: String,
    pub indexing: String,
    pub versions: Vec<DatasetVersion>,
    /// Sets of the newest version.
    pub sets: Vec<SetStatus>,
    pub indices: Vec<IndexRecord>,
    pub harvest_states: Vec<HarvestState>,
    pub resources: Vec<(String, i64)>,
}

/// Collect the status of a dataset.
pub async fn dataset_status(store: &Store, name: &str) -> Result<DatasetStatus> {
    let dataset = store
        .get_dataset(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown dataset: '{}' (run `harvest init`)", name))?;
    let versions = store.list_versions(dataset.id).await?;

    let mut sets = Vec::new();
    if let Some(newest) = versions.last() {
        for set in store.list_sets(newest.id).await? {
            let counts = store.set_counts(set.id).await?;
            sets.push(SetStatus::new(&set, counts));
        }
    }

    let mut indices: Vec<IndexRecord> = Vec::new();
    for version in &versions {
        if let Some(id) = version.index_id {
            if indices.iter().all(|i| i.id != id) {
                indices.push(store.get_index(id).await?);
            }
        }
    }

    Ok(DatasetStatus {
        dataset: dataset.name,
        indexing: dataset.indexing.to_string(),
        versions,
        sets,
        indices,
        harvest_states: store.list_harvest_states(dataset.id).await?,
        resources: store.resource_counts().await?,
    })
}

/// Print a status report for humans.
pub fn print_status(status: &DatasetStatus) {
    let now = Utc::now();
    let title = format!("Harvester: {}", status.dataset);
    println!("{}", title);
    println!("{}", "=".repeat(title.chars().count()));
    println!();
    println!("  Indexing:    {}", status.indexing);
    println!("  Versions:    {}", status.versions.len());
    if let Some(current) = status.versions.iter().find(|v| v.is_current) {
        println!("  Current:     {}", current.version);
    }

    if !status.versions.is_empty() {
        println!();
        println!(
            "  {:<20} {:<10} {:>7} {:>8} {:>16} {:>16}",
            "VERSION", "STATE", "CURRENT", "RETRIES", "CREATED", "FINISHED"
        );
        println!("  {}", "-".repeat(82));
        for v in &status.versions {
            println!(
                "  {:<20} {:<10} {:>7} {:>8} {:>16} {:>16}",
                v.version,
                v.state.to_string(),
                if v.is_current { "yes" } else { "" },
                v.retries,
                format_relative(Some(v.created_at), now),
                format_relative(v.finished_at, now)
            );
        }
    }

    if !status.sets.is_empty() {
        println!();
        println!(
            "  {:<28} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
            "SET", "ACTIVE", "DELETED", "INACTIVE", "SKIPPED", "PENDING", "STATE"
        );
        println!("  {}", "-".repeat(90));
        for s in &status.sets {
            let state = match (s.finished, s.replaced) {
                (true, true) => "replaced".to_string(),
                (true, false) => "finished".to_string(),
                (false, _) => format!("pending (retry {})", s.retries),
            };
            println!(
                "  {:<28} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
                s.name, s.active, s.deleted, s.inactive, s.skipped, s.pending, state
            );
        }
    }

    if !status.indices.is_empty() {
        println!();
        println!("  {:<44} {:>8} {:>16}  {}", "INDEX", "ERRORS", "PUSHED", "LANGUAGES");
        println!("  {}", "-".repeat(82));
        for index in &status.indices {
            println!(
                "  {:<44} {:>8} {:>16}  {}",
                index.name,
                index.error_count,
                format_relative(index.pushed_at, now),
                index.languages.join(",")
            );
        }
    }

    if !status.harvest_states.is_empty() {
        println!();
        println!("  {:<36} {:>16} {:>16}", "HARVEST", "HARVESTED", "PURGE AFTER");
        println!("  {}", "-".repeat(70));
        for h in &status.harvest_states {
            println!(
                "  {:<36} {:>16} {:>16}",
                format!("{}.{}:{}", h.source, h.entity, h.set_specification),
                format_relative(h.harvested_at, now),
                h.purge_after
                    .map(|at| at.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    if !status.resources.is_empty() {
        println!();
        println!("  {:<24} {:>10}", "RESOURCES", "CACHED");
        println!("  {}", "-".repeat(36));
        for (kind, count) in &status.resources {
            println!("  {:<24} {:>10}", kind, count);
        }
    }
    println!();
}

/// "just now", "5m ago", "3h ago", "2d ago", or a date for older instants.
fn format_relative(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = at else {
        return "-".to_string();
    };
    let diff = (now - at).num_seconds();
    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{}m ago", diff / 60)
    } else if diff < 86400 {
        format!("{}h ago", diff / 3600)
    } else if diff < 86400 * 30 {
        format!("{}d ago", diff / 86400)
    } else {
        at.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn relative_times() {
        let now = Utc::now();
        assert_eq!(format_relative(None, now), "-");
        assert_eq!(format_relative(Some(now), now), "just now");
        assert_eq!(format_relative(Some(now - Duration::minutes(5)), now), "5m ago");
        assert_eq!(format_relative(Some(now - Duration::hours(3)), now), "3h ago");
        assert_eq!(format_relative(Some(now - Duration::days(2)), now), "2d ago");
        let old = now - Duration::days(90);
        assert_eq!(
            format_relative(Some(old), now),
            old.format("%Y-%m-%d").to_string()
        );
    }
}
