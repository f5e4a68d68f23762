//! Workspace lease: advisory mutual exclusion for automation runs.
//!
//! A lease is a row keyed by workspace with an expiry. Acquisition is a single
//! upsert that only overwrites an expired row, so it never waits. This is
//! cooperative locking, not a strict distributed lock: a run that outlives
//! its TTL can overlap with the next one, which at worst duplicates work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

/// Proof of holding a workspace lease. Needed to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub workspace_id: String,
    pub holder: String,
}

/// Lease manager over the shared store.
#[derive(Clone)]
pub struct WorkspaceLock {
    db: Arc<dyn Database>,
}

impl WorkspaceLock {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Try to take the lease for `ttl`. Returns `None` if another unexpired
    /// lease exists.
    pub async fn acquire(
        &self,
        workspace_id: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, DatabaseError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        let holder = Uuid::new_v4().to_string();

        let acquired = self
            .db
            .try_acquire_lease(workspace_id, &holder, now, now + ttl)
            .await?;

        if acquired {
            debug!(workspace = %workspace_id, holder = %holder, "Workspace lease acquired");
            Ok(Some(LeaseToken {
                workspace_id: workspace_id.to_string(),
                holder,
            }))
        } else {
            debug!(workspace = %workspace_id, "Workspace lease busy");
            Ok(None)
        }
    }

    /// Release a lease. Best-effort: failures are logged, never returned;
    /// the lease expires on its own.
    pub async fn release(&self, token: &LeaseToken) {
        if let Err(e) = self
            .db
            .release_lease(&token.workspace_id, &token.holder)
            .await
        {
            warn!(
                workspace = %token.workspace_id,
                error = %e,
                "Failed to release workspace lease; it will expire"
            );
        }
    }
}
