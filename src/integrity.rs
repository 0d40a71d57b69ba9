//! Set integrity: fall back to historic data when a harvest shrinks.
//!
//! A new set is replaced by a copy of its historic counterpart when the
//! historic set holds at least `min_documents` active documents and the new
//! set has no active documents, or has shrunk by at least `threshold`
//! relative to its own size.

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use harvester_core::models::PipelineEntry;

use crate::config::IntegritySettings;
use crate::error::HarvestError;
use crate::models::Set;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityOutcome {
    pub historic: i64,
    pub current: i64,
    pub is_replaced: bool,
}

impl IntegrityOutcome {
    /// The pipeline entry recorded on the set.
    pub fn entry(&self) -> PipelineEntry {
        PipelineEntry::success()
            .with_extra("is_replaced", json!(self.is_replaced))
            .with_extra("historic", json!(self.historic))
            .with_extra("current", json!(self.current))
    }
}

/// Whether a set with `current` active documents should be replaced by a
/// historic set with `historic` active documents.
pub fn should_replace(historic: i64, current: i64, settings: &IntegritySettings) -> bool {
    if historic < settings.min_documents {
        return false;
    }
    if current <= 0 {
        return true;
    }
    let shrink = (historic - current) as f64 / current as f64;
    shrink >= settings.threshold
}

/// Compare `set` with `historic` and replace its documents when it shrank
/// too much. Without a historic set there is nothing to compare.
pub async fn check_set_integrity(
    store: &Store,
    set: &Set,
    historic: Option<&Set>,
    settings: &IntegritySettings,
) -> Result<IntegrityOutcome> {
    let current = store.set_counts(set.id).await?.active;
    let Some(historic) = historic else {
        return Ok(IntegrityOutcome {
            historic: 0,
            current,
            is_replaced: false,
        });
    };
    let historic_count = store.set_counts(historic.id).await?.active;
    let mut outcome = IntegrityOutcome {
        historic: historic_count,
        current,
        is_replaced: false,
    };
    if should_replace(historic_count, current, settings) {
        let copied = store.replace_set_documents(set.id, historic.id).await?;
        outcome.is_replaced = true;
        warn!(
            set = %set.name,
            copied,
            error = %HarvestError::IntegrityReplaced {
                set: set.name.clone(),
                historic: historic_count,
                current,
            },
            "set replaced by historic documents"
        );
    } else {
        info!(set = %set.name, historic = historic_count, current, "set integrity ok");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_thresholds() {
        let settings = IntegritySettings::default();
        assert!(should_replace(100, 50, &settings));
        assert!(should_replace(50, 0, &settings));
        assert!(!should_replace(49, 0, &settings));
        // 104 vs 100 is a 4% shrink.
        assert!(!should_replace(104, 100, &settings));
        assert!(should_replace(105, 100, &settings));
        assert!(!should_replace(100, 120, &settings));

        let strict = IntegritySettings {
            threshold: 0.5,
            min_documents: 10,
        };
        assert!(!should_replace(100, 80, &strict));
        assert!(!should_replace(100, 70, &strict));
        assert!(should_replace(100, 50, &strict));
    }

    #[test]
    fn entry_records_replacement() {
        let entry = IntegrityOutcome {
            historic: 100,
            current: 50,
            is_replaced: true,
        }
        .entry();
        assert!(entry.success);
        assert_eq!(entry.extra["is_replaced"], json!(true));
    }
}
