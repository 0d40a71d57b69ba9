//! Advisory no-wait document locks.
//!
//! Acquiring inserts one `document_locks` row per document inside a
//! transaction; any existing row aborts the whole acquisition at once.

use std::time::Duration;

use anyhow::Result;
use tracing::debug;
use uuid::Uuid;

use super::Store;
use crate::db::{self, to_ts};
use crate::error::HarvestError;

/// Locks held by one processor. Release with [`Store::release_locks`].
#[derive(Debug)]
pub struct LockGuard {
    owner: String,
    count: usize,
}

impl LockGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Store {
    /// Lock every id or none. Never waits on a held lock.
    pub async fn try_lock_documents(&self, ids: &[i64]) -> Result<LockGuard> {
        let owner = Uuid::new_v4().to_string();
        let now = to_ts(db::now());
        let mut tx = self.pool.begin().await?;
        let mut conflicts = 0usize;
        for id in ids {
            let inserted = sqlx::query(
                r#"
                INSERT INTO document_locks (document_id, owner, acquired_at)
                VALUES (?, ?, ?)
                ON CONFLICT(document_id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(&owner)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                conflicts += 1;
            }
        }
        if conflicts > 0 {
            tx.rollback().await?;
            return Err(HarvestError::Contention {
                count: conflicts,
                attempts: 1,
            }
            .into());
        }
        tx.commit().await?;
        Ok(LockGuard {
            owner,
            count: ids.len(),
        })
    }

    /// Lock with retries: up to `attempts` tries, sleeping `delay` between
    /// them.
    pub async fn lock_documents(
        &self,
        ids: &[i64],
        attempts: u32,
        delay: Duration,
    ) -> Result<LockGuard> {
        let attempts = attempts.max(1);
        let mut conflicts = 0;
        for attempt in 1..=attempts {
            match self.try_lock_documents(ids).await {
                Ok(guard) => return Ok(guard),
                Err(err) => match HarvestError::find(&err) {
                    Some(HarvestError::Contention { count, .. }) => {
                        conflicts = *count;
                        debug!(attempt, conflicts, "document locks contended");
                        if attempt < attempts {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    _ => return Err(err),
                },
            }
        }
        Err(HarvestError::Contention {
            count: conflicts,
            attempts,
        }
        .into())
    }

    pub async fn release_locks(&self, guard: LockGuard) -> Result<()> {
        sqlx::query("DELETE FROM document_locks WHERE owner = ?")
            .bind(&guard.owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop locks left behind by processes that died while holding them.
    pub async fn clear_stale_locks(&self, max_age: Duration) -> Result<u64> {
        let cutoff = to_ts(db::now()) - max_age.as_secs() as i64;
        let result = sqlx::query("DELETE FROM document_locks WHERE acquired_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
