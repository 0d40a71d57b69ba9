//! Harvest error taxonomy.
//!
//! Plumbing code returns `anyhow::Result`. The variants below are raised
//! where a caller has to branch on the kind of failure; they travel inside
//! `anyhow::Error` and are recovered with [`HarvestError::find`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// Upstream failed in a way a retry may fix (5xx, timeout, transport).
    #[error("transient fetch failure for {uri}: {reason}")]
    TransientFetch { uri: String, reason: String },

    /// Upstream answered 404.
    #[error("not found: {uri}")]
    NotFound { uri: String },

    /// Row locks could not be acquired within the attempt budget.
    #[error("lock contention on {count} document(s) after {attempts} attempt(s)")]
    Contention { count: usize, attempts: u32 },

    /// An objective callable rejected a record.
    #[error("extraction failed in source '{source_name}': {message}")]
    Extraction {
        source_name: String,
        message: String,
    },

    /// The integrity check replaced a set with its historic counterpart.
    #[error("set '{set}' replaced by historic data ({historic} historic vs {current} current)")]
    IntegrityReplaced {
        set: String,
        historic: i64,
        current: i64,
    },

    /// `cache_only` mode and the request has no cached resource.
    #[error("no cached {kind} resource for {uri} (cache-only mode)")]
    CacheMiss { kind: String, uri: String },

    /// Non-retryable failure; aborts the current dispatch level.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl HarvestError {
    /// Find a `HarvestError` anywhere in an error chain.
    pub fn find(err: &anyhow::Error) -> Option<&HarvestError> {
        err.chain().find_map(|cause| cause.downcast_ref::<HarvestError>())
    }

    pub fn is_cache_miss(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(HarvestError::CacheMiss { .. }))
    }

    pub fn is_contention(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(HarvestError::Contention { .. }))
    }

    pub fn is_fatal(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(HarvestError::Fatal(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn finds_error_through_context() {
        let err: anyhow::Result<()> = Err(HarvestError::CacheMiss {
            kind: "http".into(),
            uri: "https://example.com".into(),
        }
        .into());
        let err = err.context("seeding set edurep:all").unwrap_err();
        assert!(HarvestError::is_cache_miss(&err));
        assert!(!HarvestError::is_contention(&err));
    }
}
