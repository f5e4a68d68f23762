//! Audit log writer. Writes are best-effort: a failed insert is logged and
//! never fails the caller.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::automation::model::AuditEntry;
use crate::error::DatabaseError;
use crate::store::Database;

pub const PHASE_APPLIED: &str = "phase_applied";
pub const PHASE_SHADOWED: &str = "phase_shadowed";
pub const SKIPPED_MANUAL_LOCK: &str = "skipped_manual_lock";
pub const SKIPPED_LOW_CONFIDENCE: &str = "skipped_low_confidence";
pub const SKIPPED_NO_TARGET: &str = "skipped_no_target";
pub const CLASSIFICATION_ERROR: &str = "classification_error";
pub const MANUAL_LOCK_RELEASED: &str = "manual_lock_released";
pub const RETAG_STARTED: &str = "retag_started";
pub const RETAG_APPLIED: &str = "retag_applied";
pub const RETAG_SKIPPED_MANUAL: &str = "retag_skipped_manual";
pub const RETAG_LOW_CONFIDENCE: &str = "retag_low_confidence";
pub const RETAG_FAILED: &str = "retag_failed";

/// Append-only audit trail for automation decisions.
#[derive(Clone)]
pub struct AuditLog {
    db: Arc<dyn Database>,
}

impl AuditLog {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Append an entry, swallowing failures.
    pub async fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.db.append_audit(&entry).await {
            warn!(
                workspace = %entry.workspace_id,
                conversation = ?entry.conversation_id,
                action = %entry.action,
                error = %e,
                "Failed to write audit entry"
            );
        }
    }

    /// Shorthand for a conversation-scoped entry.
    pub async fn conversation(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        action: &str,
        actor_user_id: Option<&str>,
        details: Value,
    ) {
        self.record(
            AuditEntry::new(workspace_id, Some(conversation_id), action, details)
                .with_actor(actor_user_id),
        )
        .await;
    }

    /// Most recent entries, optionally for one conversation.
    pub async fn recent(
        &self,
        workspace_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, DatabaseError> {
        self.db.list_audit(workspace_id, conversation_id, limit).await
    }
}
