//! Unified `Database` trait: single async interface for all persistence.
//!
//! Settings, leases, audit, run records and retag jobs are owned by the
//! engine. Threads, messages and tag definitions belong to the inbox; the
//! engine reads them and writes only automation bookkeeping, lead status and
//! managed tag links. The seeding methods exist for the sync layer and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::automation::model::{
    AuditEntry, ClassificationMetadata, ConversationThread, LinkSource, RunSummary, TagDefinition,
    TagLink, TagReplacement, ThreadMessage,
};
use crate::automation::settings::AutomationSettings;
use crate::error::DatabaseError;
use crate::retag::model::RetagJob;

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_automation_settings(
        &self,
        workspace_id: &str,
    ) -> Result<Option<AutomationSettings>, DatabaseError>;

    /// Insert if absent. Returns `false` when a row already existed.
    async fn insert_automation_settings(
        &self,
        settings: &AutomationSettings,
    ) -> Result<bool, DatabaseError>;

    async fn update_automation_settings(
        &self,
        settings: &AutomationSettings,
    ) -> Result<(), DatabaseError>;

    async fn list_enabled_workspaces(&self) -> Result<Vec<String>, DatabaseError>;

    // ── Leases ──────────────────────────────────────────────────────

    /// Atomically take the lease if absent or expired at `now`.
    async fn try_acquire_lease(
        &self,
        workspace_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Drop the lease only if `holder` still owns it.
    async fn release_lease(&self, workspace_id: &str, holder: &str) -> Result<(), DatabaseError>;

    // ── Tags ────────────────────────────────────────────────────────

    async fn list_tags(&self, workspace_id: &str) -> Result<Vec<TagDefinition>, DatabaseError>;

    async fn upsert_tag(
        &self,
        workspace_id: &str,
        tag: &TagDefinition,
    ) -> Result<(), DatabaseError>;

    // ── Threads ─────────────────────────────────────────────────────

    async fn upsert_thread(&self, thread: &ConversationThread) -> Result<(), DatabaseError>;

    async fn get_thread(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationThread>, DatabaseError>;

    /// Non-removed, non-spam threads, most recent activity first.
    async fn list_active_threads(
        &self,
        workspace_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ConversationThread>, DatabaseError>;

    /// Count of retag-eligible threads (active, optional activity floor).
    async fn count_retag_threads(
        &self,
        workspace_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, DatabaseError>;

    /// One page of retag-eligible threads, most recent activity first.
    async fn list_retag_threads(
        &self,
        workspace_id: &str,
        since: Option<DateTime<Utc>>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ConversationThread>, DatabaseError>;

    async fn record_classification(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        metadata: &ClassificationMetadata,
    ) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(
        &self,
        workspace_id: &str,
        message: &ThreadMessage,
    ) -> Result<(), DatabaseError>;

    /// The latest `limit` messages, returned oldest first.
    async fn list_recent_messages(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ThreadMessage>, DatabaseError>;

    // ── Tag links ───────────────────────────────────────────────────

    async fn list_tag_links(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<TagLink>, DatabaseError>;

    /// Upsert keyed by `(workspace, conversation, tag)`.
    async fn upsert_tag_link(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        tag_id: &str,
        source: &LinkSource,
    ) -> Result<(), DatabaseError>;

    /// Delete scoped links, upsert new ones and write lead status in one transaction.
    async fn replace_tag_links(&self, replacement: &TagReplacement) -> Result<(), DatabaseError>;

    /// Re-source the given links to `ai`. Returns the number changed.
    async fn mark_links_automated(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        tag_ids: &[String],
    ) -> Result<u64, DatabaseError>;

    // ── Audit ───────────────────────────────────────────────────────

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError>;

    /// Most recent first.
    async fn list_audit(
        &self,
        workspace_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, DatabaseError>;

    // ── Run records ─────────────────────────────────────────────────

    async fn insert_run_record(&self, summary: &RunSummary) -> Result<(), DatabaseError>;

    /// Most recent first.
    async fn list_run_records(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<RunSummary>, DatabaseError>;

    // ── Knowledge ───────────────────────────────────────────────────

    async fn get_knowledge_context(
        &self,
        workspace_id: &str,
    ) -> Result<Option<String>, DatabaseError>;

    async fn set_knowledge_context(
        &self,
        workspace_id: &str,
        content: &str,
    ) -> Result<(), DatabaseError>;

    // ── Retag jobs ──────────────────────────────────────────────────

    async fn insert_retag_job(&self, job: &RetagJob) -> Result<(), DatabaseError>;

    async fn get_retag_job(&self, id: &str) -> Result<Option<RetagJob>, DatabaseError>;

    async fn update_retag_job(&self, job: &RetagJob) -> Result<(), DatabaseError>;

    /// Most recently created job of any kind.
    async fn latest_retag_job(&self, workspace_id: &str)
    -> Result<Option<RetagJob>, DatabaseError>;

    /// Most recently created full-scope job that did not fail.
    async fn latest_full_scope_job(
        &self,
        workspace_id: &str,
    ) -> Result<Option<RetagJob>, DatabaseError>;

    /// Queued or running jobs, oldest first.
    async fn list_active_retag_jobs(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<RetagJob>, DatabaseError>;
}
