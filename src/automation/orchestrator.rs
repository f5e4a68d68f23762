//! Run orchestrator: one automation run for one workspace.
//!
//! ```text
//! request ─► pre-checks ─► lease ─► catalog ─► candidates ─► per conversation:
//!                                                 links → transcript → classify
//!                                                 → decide → enforce? → bookkeeping → audit
//!         ◄─ summary ◄─ run record ◄─ settings bookkeeping ◄─ release lease
//! ```
//!
//! Contention and misconfiguration are normal outcomes reported through
//! `RunSummary::skipped_reason`; only store failures outside the per
//! conversation loop surface as errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::automation::applier::{self, Enforcement};
use crate::automation::audit::{self, AuditLog};
use crate::automation::candidates;
use crate::automation::catalog::TagCatalog;
use crate::automation::classifier::{AnswerSpace, Classifier, build_transcript};
use crate::automation::lock::WorkspaceLock;
use crate::automation::model::{
    ActorRole, ClassificationMetadata, ConversationThread, LinkSource, RunSource, RunSummary,
};
use crate::automation::policy::{self, DecisionInput};
use crate::automation::settings::{
    AutomationMode, AutomationSettings, BackfillState, SettingsStore,
};
use crate::config::EngineConfig;
use crate::error::{AutomationError, DatabaseError};
use crate::llm::LlmProvider;
use crate::store::Database;

pub const SKIP_DISABLED: &str = "automation disabled";
pub const SKIP_SETTER: &str = "setter trigger not allowed";
pub const SKIP_LOCK_BUSY: &str = "lock busy";
pub const SKIP_NO_PHASE_TAGS: &str = "no phase tags configured";

/// A request to run automation for one workspace.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workspace_id: String,
    pub source: RunSource,
    pub actor_role: ActorRole,
    pub actor_user_id: Option<String>,
    /// Classify exactly these conversations, bypassing staleness rules.
    pub explicit_conversation_ids: Option<Vec<String>>,
    /// Run even when automation is disabled.
    pub force: bool,
    /// Overrides the per-source cap from settings.
    pub max_conversations: Option<usize>,
}

impl RunRequest {
    pub fn new(workspace_id: impl Into<String>, source: RunSource) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            source,
            actor_role: ActorRole::System,
            actor_user_id: None,
            explicit_conversation_ids: None,
            force: false,
            max_conversations: None,
        }
    }

    pub fn by(mut self, role: ActorRole, user_id: Option<&str>) -> Self {
        self.actor_role = role;
        self.actor_user_id = user_id.map(str::to_string);
        self
    }

    pub fn with_conversations(mut self, ids: Vec<String>) -> Self {
        self.explicit_conversation_ids = Some(ids);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max_conversations = Some(max);
        self
    }
}

/// How one candidate ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied,
    Shadowed,
    SkippedManual,
    SkippedLowConfidence,
    SkippedOther,
}

impl Outcome {
    fn audit_action(&self) -> &'static str {
        match self {
            Self::Applied => audit::PHASE_APPLIED,
            Self::Shadowed => audit::PHASE_SHADOWED,
            Self::SkippedManual => audit::SKIPPED_MANUAL_LOCK,
            Self::SkippedLowConfidence => audit::SKIPPED_LOW_CONFIDENCE,
            Self::SkippedOther => audit::SKIPPED_NO_TARGET,
        }
    }

    fn tally(&self, summary: &mut RunSummary) {
        match self {
            Self::Applied => summary.applied += 1,
            Self::Shadowed => summary.shadowed += 1,
            Self::SkippedManual => summary.skipped_manual += 1,
            Self::SkippedLowConfidence => summary.skipped_low_confidence += 1,
            Self::SkippedOther => summary.skipped_other += 1,
        }
    }
}

/// Per-run context shared by every candidate.
struct RunContext<'a> {
    run_id: &'a str,
    source: RunSource,
    settings: &'a AutomationSettings,
    catalog: &'a TagCatalog,
    knowledge: Option<&'a str>,
    now: DateTime<Utc>,
}

/// Drives automation runs over the shared store.
pub struct Orchestrator {
    db: Arc<dyn Database>,
    settings: SettingsStore,
    lock: WorkspaceLock,
    audit: AuditLog,
    classifier: Classifier,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(db: Arc<dyn Database>, llm: Arc<dyn LlmProvider>, config: EngineConfig) -> Self {
        Self {
            settings: SettingsStore::new(Arc::clone(&db)),
            lock: WorkspaceLock::new(Arc::clone(&db)),
            audit: AuditLog::new(Arc::clone(&db)),
            classifier: Classifier::new(llm, config.retry.clone()),
            db,
            config,
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute one run. Always returns a summary unless the store fails
    /// before the lease is taken.
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary, AutomationError> {
        let workspace_id = request.workspace_id.as_str();
        let settings = self.settings.get(workspace_id).await?;
        let mut summary = RunSummary::new(workspace_id, request.source, settings.mode.as_str());

        if !settings.enabled && !request.force {
            return Ok(self.finish_skipped(summary, SKIP_DISABLED).await);
        }
        if request.actor_role == ActorRole::Setter && !settings.allow_setter_trigger {
            return Ok(self.finish_skipped(summary, SKIP_SETTER).await);
        }

        let Some(token) = self.lock.acquire(workspace_id, self.config.lock_ttl).await? else {
            return Ok(self.finish_skipped(summary, SKIP_LOCK_BUSY).await);
        };
        summary.lock_acquired = true;

        let result = self.run_locked(&request, &settings, &mut summary).await;
        self.lock.release(&token).await;

        match result {
            Ok(()) => {}
            Err(AutomationError::NoPhaseTags { .. }) => {
                summary.skipped_reason = Some(SKIP_NO_PHASE_TAGS.to_string());
                summary.error = Some(SKIP_NO_PHASE_TAGS.to_string());
            }
            Err(e) => {
                warn!(workspace = %workspace_id, source = request.source.as_str(), error = %e, "Automation run failed");
                summary.error = Some(e.to_string());
            }
        }

        let finished_at = Utc::now();
        summary.finished_at = Some(finished_at);
        if let Err(e) = self
            .settings
            .record_run_outcome(workspace_id, request.source, finished_at, summary.error.as_deref())
            .await
        {
            warn!(workspace = %workspace_id, error = %e, "Failed to record run outcome");
        }
        self.persist(&summary).await;

        info!(
            workspace = %workspace_id,
            source = request.source.as_str(),
            mode = %summary.mode,
            candidates = summary.candidates,
            applied = summary.applied,
            shadowed = summary.shadowed,
            skipped_manual = summary.skipped_manual,
            skipped_low_confidence = summary.skipped_low_confidence,
            errors = summary.errors,
            "Automation run finished"
        );
        Ok(summary)
    }

    async fn run_locked(
        &self,
        request: &RunRequest,
        settings: &AutomationSettings,
        summary: &mut RunSummary,
    ) -> Result<(), AutomationError> {
        let workspace_id = request.workspace_id.as_str();
        let catalog = TagCatalog::load(self.db.as_ref(), workspace_id).await?;
        if catalog.phase_tags.is_empty() {
            return Err(AutomationError::NoPhaseTags {
                workspace_id: workspace_id.to_string(),
            });
        }

        let max_count = request
            .max_conversations
            .unwrap_or_else(|| candidates::default_max_for(request.source, settings));
        let selected = candidates::select(
            self.db.as_ref(),
            settings,
            request.source,
            max_count,
            request.explicit_conversation_ids.as_deref(),
        )
        .await?;
        summary.candidates = selected.len() as u32;

        if request.source == RunSource::Backfill {
            let state = if selected.is_empty() {
                BackfillState::Completed
            } else {
                BackfillState::Running
            };
            self.settings.set_backfill_state(workspace_id, state).await?;
        }
        if selected.is_empty() {
            debug!(workspace = %workspace_id, source = request.source.as_str(), "No candidates");
            return Ok(());
        }

        let knowledge = match self.db.get_knowledge_context(workspace_id).await {
            Ok(knowledge) => knowledge,
            Err(e) => {
                warn!(workspace = %workspace_id, error = %e, "Knowledge context unavailable");
                None
            }
        };

        let run_id = summary.run_id.clone();
        let ctx = RunContext {
            run_id: &run_id,
            source: request.source,
            settings,
            catalog: &catalog,
            knowledge: knowledge.as_deref(),
            now: Utc::now(),
        };

        for thread in &selected {
            match self.process_one(&ctx, thread).await {
                Ok(outcome) => outcome.tally(summary),
                Err(e) => {
                    warn!(
                        workspace = %workspace_id,
                        conversation = %thread.id,
                        error = %e,
                        "Failed to process conversation"
                    );
                    self.audit
                        .conversation(
                            workspace_id,
                            &thread.id,
                            audit::CLASSIFICATION_ERROR,
                            request.actor_user_id.as_deref(),
                            json!({
                                "run_id": ctx.run_id,
                                "run_source": ctx.source.as_str(),
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                    summary.push_error(&thread.id, e);
                }
            }
        }
        Ok(())
    }

    async fn process_one(
        &self,
        ctx: &RunContext<'_>,
        thread: &ConversationThread,
    ) -> Result<Outcome, DatabaseError> {
        let workspace_id = ctx.settings.workspace_id.as_str();
        let mode = ctx.settings.mode;
        let links = self.db.list_tag_links(workspace_id, &thread.id).await?;

        if policy::is_manually_locked(ctx.settings, ctx.catalog, &links) {
            self.db
                .record_classification(
                    workspace_id,
                    &thread.id,
                    &ClassificationMetadata {
                        classified_at: ctx.now,
                        phase_confidence: None,
                        temperature_confidence: None,
                        reason: "manual lock".into(),
                        mode: mode.as_str().into(),
                        run_source: ctx.source.as_str().into(),
                    },
                )
                .await?;
            let current = ctx.catalog.current_tags(&links);
            self.audit
                .conversation(
                    workspace_id,
                    &thread.id,
                    audit::SKIPPED_MANUAL_LOCK,
                    None,
                    json!({
                        "run_id": ctx.run_id,
                        "run_source": ctx.source.as_str(),
                        "current_phase_tag_id": current.phase_tag_id,
                        "current_temperature_tag_id": current.temperature_tag_id,
                    }),
                )
                .await;
            return Ok(Outcome::SkippedManual);
        }

        let messages = self
            .db
            .list_recent_messages(workspace_id, &thread.id, self.config.transcript_max_messages)
            .await?;
        let transcript = build_transcript(
            &messages,
            self.config.transcript_max_messages,
            self.config.transcript_max_chars,
        );
        let output = self
            .classifier
            .classify(
                &transcript,
                ctx.catalog,
                &AnswerSpace::full(ctx.catalog),
                ctx.knowledge,
            )
            .await;

        let decision = policy::decide(DecisionInput {
            settings: ctx.settings,
            catalog: ctx.catalog,
            links: &links,
            output: &output,
            last_activity_at: thread.last_activity_at(),
            now: ctx.now,
        });

        let outcome = if decision.target_phase_tag_id.is_none() {
            Outcome::SkippedOther
        } else if decision.low_confidence && !decision.changes_anything() {
            Outcome::SkippedLowConfidence
        } else if mode == AutomationMode::Shadow {
            Outcome::Shadowed
        } else {
            Outcome::Applied
        };

        if outcome == Outcome::Applied {
            applier::apply(
                self.db.as_ref(),
                &Enforcement {
                    workspace_id,
                    conversation_id: &thread.id,
                    settings: ctx.settings,
                    catalog: ctx.catalog,
                    decision: &decision,
                    source: &LinkSource::Ai,
                    only_automated: ctx.settings.manual_lock_enabled,
                },
            )
            .await?;
        }

        self.db
            .record_classification(
                workspace_id,
                &thread.id,
                &ClassificationMetadata {
                    classified_at: ctx.now,
                    phase_confidence: Some(output.phase_confidence),
                    temperature_confidence: ctx
                        .settings
                        .apply_temperature
                        .then_some(output.temperature_confidence),
                    reason: output.reason.clone(),
                    mode: mode.as_str().into(),
                    run_source: ctx.source.as_str().into(),
                },
            )
            .await?;

        self.audit
            .conversation(
                workspace_id,
                &thread.id,
                outcome.audit_action(),
                None,
                json!({
                    "run_id": ctx.run_id,
                    "run_source": ctx.source.as_str(),
                    "mode": mode.as_str(),
                    "classification": &output,
                    "decision": &decision,
                }),
            )
            .await;

        debug!(
            workspace = %workspace_id,
            conversation = %thread.id,
            outcome = ?outcome,
            phase = ?decision.target_phase_tag_id,
            confidence = output.phase_confidence,
            "Conversation processed"
        );
        Ok(outcome)
    }

    /// Release a conversation's manual lock and rephase it immediately.
    ///
    /// Human-applied managed links are re-sourced to `ai` so automation owns
    /// them from now on; unmanaged links are left alone.
    pub async fn unlock_conversation(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        actor_user_id: Option<&str>,
    ) -> Result<RunSummary, AutomationError> {
        if self.db.get_thread(workspace_id, conversation_id).await?.is_none() {
            return Err(AutomationError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            });
        }

        let catalog = TagCatalog::load(self.db.as_ref(), workspace_id).await?;
        let links = self.db.list_tag_links(workspace_id, conversation_id).await?;
        let manual: Vec<String> = links
            .iter()
            .filter(|l| catalog.is_managed(&l.tag_id) && !l.source.is_automated())
            .map(|l| l.tag_id.clone())
            .collect();

        let changed = if manual.is_empty() {
            0
        } else {
            self.db
                .mark_links_automated(workspace_id, conversation_id, &manual)
                .await?
        };
        self.audit
            .conversation(
                workspace_id,
                conversation_id,
                audit::MANUAL_LOCK_RELEASED,
                actor_user_id,
                json!({ "tag_ids": manual, "changed": changed }),
            )
            .await;
        info!(
            workspace = %workspace_id,
            conversation = %conversation_id,
            changed,
            "Manual lock released"
        );

        let request = RunRequest::new(workspace_id, RunSource::ManualRephase)
            .by(ActorRole::System, actor_user_id)
            .with_conversations(vec![conversation_id.to_string()])
            .forced();
        self.run(request).await
    }

    /// Most recent run summaries.
    pub async fn recent_runs(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<RunSummary>, DatabaseError> {
        self.db.list_run_records(workspace_id, limit).await
    }

    async fn finish_skipped(&self, summary: RunSummary, reason: &str) -> RunSummary {
        let summary = summary.skip(reason);
        debug!(
            workspace = %summary.workspace_id,
            source = summary.source.as_str(),
            reason,
            "Automation run skipped"
        );
        self.persist(&summary).await;
        summary
    }

    async fn persist(&self, summary: &RunSummary) {
        if let Err(e) = self.db.insert_run_record(summary).await {
            warn!(workspace = %summary.workspace_id, run = %summary.run_id, error = %e, "Failed to persist run record");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::automation::model::{Direction, LeadStatus, TagDefinition, TagLink, ThreadMessage};
    use crate::automation::settings::SettingsPatch;
    use crate::llm::RetryPolicy;
    use crate::llm::testing::StubLlm;
    use crate::store::LibSqlBackend;

    const BOOKED_85: &str = r#"{"phase_tag_id":"booked","phase_confidence":85,"temperature_tag_id":"hot","temperature_confidence":80,"reason":"call scheduled"}"#;
    const BOOKED_40: &str = r#"{"phase_tag_id":"booked","phase_confidence":40,"temperature_tag_id":null,"temperature_confidence":0,"reason":"unclear"}"#;

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::no_retry(),
            ..EngineConfig::default()
        }
    }

    async fn seeded_db() -> Arc<LibSqlBackend> {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for (id, name) in [
            ("new", "New Lead"),
            ("contact", "In Contact"),
            ("qual", "Qualified"),
            ("booked", "Call Booked"),
            ("hot", "Hot"),
            ("cold", "Cold"),
        ] {
            db.upsert_tag("ws", &TagDefinition::new(id, name)).await.unwrap();
        }
        db
    }

    async fn seed_conversation(db: &dyn Database, id: &str) {
        let now = Utc::now();
        db.upsert_thread(
            &ConversationThread::new("ws", id, now - Duration::days(2))
                .with_last_message(now - Duration::hours(1), Direction::Inbound),
        )
        .await
        .unwrap();
        for (i, (direction, text)) in [
            (Direction::Outbound, "Want to hop on a call?"),
            (Direction::Inbound, "Yes, booked for tomorrow at 3pm"),
        ]
        .into_iter()
        .enumerate()
        {
            db.insert_message(
                "ws",
                &ThreadMessage {
                    id: format!("{id}-m{i}"),
                    conversation_id: id.to_string(),
                    direction,
                    text: text.to_string(),
                    sent_at: now - Duration::hours(2) + Duration::minutes(i as i64),
                },
            )
            .await
            .unwrap();
        }
    }

    async fn orchestrator(db: Arc<LibSqlBackend>, reply: &str) -> (Orchestrator, Arc<StubLlm>) {
        let llm = Arc::new(StubLlm::replying(reply));
        let orch = Orchestrator::new(db, llm.clone(), config());
        (orch, llm)
    }

    async fn enable(orch: &Orchestrator, mode: &str) {
        orch.settings()
            .set("ws", &SettingsPatch::from_json(&json!({"enabled": true, "mode": mode})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_workspace_is_skipped() {
        let db = seeded_db().await;
        seed_conversation(db.as_ref(), "c1").await;
        let (orch, llm) = orchestrator(db, BOOKED_85).await;

        let summary = orch.run(RunRequest::new("ws", RunSource::Incremental)).await.unwrap();
        assert_eq!(summary.skipped_reason.as_deref(), Some(SKIP_DISABLED));
        assert!(!summary.lock_acquired);
        assert_eq!(llm.calls(), 0);
        assert_eq!(orch.recent_runs("ws", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn setter_needs_permission() {
        let db = seeded_db().await;
        let (orch, _) = orchestrator(db, BOOKED_85).await;
        enable(&orch, "enforce").await;

        let request = RunRequest::new("ws", RunSource::ManualRephase).by(ActorRole::Setter, Some("u1"));
        let summary = orch.run(request.clone()).await.unwrap();
        assert_eq!(summary.skipped_reason.as_deref(), Some(SKIP_SETTER));

        orch.settings()
            .set("ws", &SettingsPatch::from_json(&json!({"allowSetterTrigger": true})))
            .await
            .unwrap();
        let summary = orch.run(request).await.unwrap();
        assert_eq!(summary.skipped_reason, None);
        assert!(summary.lock_acquired);
    }

    #[tokio::test]
    async fn busy_lease_skips_run() {
        let db = seeded_db().await;
        let (orch, llm) = orchestrator(db.clone(), BOOKED_85).await;
        enable(&orch, "enforce").await;
        seed_conversation(db.as_ref(), "c1").await;

        let held = WorkspaceLock::new(db)
            .acquire("ws", std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert!(held.is_some());

        let summary = orch.run(RunRequest::new("ws", RunSource::Incremental)).await.unwrap();
        assert_eq!(summary.skipped_reason.as_deref(), Some(SKIP_LOCK_BUSY));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn missing_phase_tags_recorded_as_error() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.upsert_tag("ws", &TagDefinition::new("hot", "Hot")).await.unwrap();
        let (orch, _) = orchestrator(db, BOOKED_85).await;
        enable(&orch, "enforce").await;

        let summary = orch.run(RunRequest::new("ws", RunSource::Catchup)).await.unwrap();
        assert!(summary.lock_acquired);
        assert_eq!(summary.skipped_reason.as_deref(), Some(SKIP_NO_PHASE_TAGS));
        let settings = orch.settings().get("ws").await.unwrap();
        assert_eq!(settings.last_error.as_deref(), Some(SKIP_NO_PHASE_TAGS));
        assert!(settings.last_catchup_run_at.is_some());
    }

    #[tokio::test]
    async fn enforce_applies_confident_phase() {
        let db = seeded_db().await;
        seed_conversation(db.as_ref(), "c1").await;
        db.upsert_tag_link("ws", "c1", "contact", &LinkSource::Ai).await.unwrap();
        let (orch, llm) = orchestrator(db.clone(), BOOKED_85).await;
        enable(&orch, "enforce").await;

        let summary = orch.run(RunRequest::new("ws", RunSource::Incremental)).await.unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.applied, 1);
        assert_eq!(llm.calls(), 1);

        let links = db.list_tag_links("ws", "c1").await.unwrap();
        assert_eq!(
            links,
            vec![TagLink::new("booked", LinkSource::Ai), TagLink::new("hot", LinkSource::Ai)]
        );
        let thread = db.get_thread("ws", "c1").await.unwrap().unwrap();
        assert_eq!(thread.lead_status, LeadStatus::Open);
        assert_eq!(thread.ai_phase_confidence, Some(85));
        assert_eq!(thread.ai_phase_mode.as_deref(), Some("enforce"));
        assert_eq!(thread.ai_phase_last_run_source.as_deref(), Some("incremental"));

        let audit = orch.audit().recent("ws", Some("c1"), 10).await.unwrap();
        assert_eq!(audit[0].action, audit::PHASE_APPLIED);

        // Classified now, so a second incremental run finds nothing
        let again = orch.run(RunRequest::new("ws", RunSource::Incremental)).await.unwrap();
        assert_eq!(again.candidates, 0);
        assert!(orch.settings().get("ws").await.unwrap().last_incremental_run_at.is_some());
    }

    #[tokio::test]
    async fn shadow_mode_never_mutates_links() {
        let db = seeded_db().await;
        seed_conversation(db.as_ref(), "c1").await;
        db.upsert_tag_link("ws", "c1", "contact", &LinkSource::Ai).await.unwrap();
        let (orch, _) = orchestrator(db.clone(), BOOKED_85).await;
        enable(&orch, "shadow").await;

        let summary = orch.run(RunRequest::new("ws", RunSource::Incremental)).await.unwrap();
        assert_eq!(summary.shadowed, 1);
        assert_eq!(summary.applied, 0);

        let links = db.list_tag_links("ws", "c1").await.unwrap();
        assert_eq!(links, vec![TagLink::new("contact", LinkSource::Ai)]);
        let thread = db.get_thread("ws", "c1").await.unwrap().unwrap();
        assert!(thread.ai_phase_updated_at.is_some());
        assert_eq!(thread.ai_phase_mode.as_deref(), Some("shadow"));

        let audit = orch.audit().recent("ws", Some("c1"), 10).await.unwrap();
        assert_eq!(audit[0].action, audit::PHASE_SHADOWED);
    }

    #[tokio::test]
    async fn manual_lock_is_idempotent() {
        let db = seeded_db().await;
        seed_conversation(db.as_ref(), "c1").await;
        db.upsert_tag_link("ws", "c1", "qual", &LinkSource::Manual).await.unwrap();
        let (orch, llm) = orchestrator(db.clone(), BOOKED_85).await;
        enable(&orch, "enforce").await;

        let request = RunRequest::new("ws", RunSource::ManualRephase).with_conversations(vec!["c1".into()]);
        for _ in 0..2 {
            let summary = orch.run(request.clone()).await.unwrap();
            assert_eq!(summary.skipped_manual, 1);
            assert_eq!(summary.applied, 0);
        }
        assert_eq!(llm.calls(), 0);
        assert_eq!(
            db.list_tag_links("ws", "c1").await.unwrap(),
            vec![TagLink::new("qual", LinkSource::Manual)]
        );
        assert_eq!(
            db.get_thread("ws", "c1").await.unwrap().unwrap().lead_status,
            LeadStatus::Open
        );
    }

    #[tokio::test]
    async fn low_confidence_keeps_existing_phase() {
        let db = seeded_db().await;
        seed_conversation(db.as_ref(), "c1").await;
        db.upsert_tag_link("ws", "c1", "qual", &LinkSource::Ai).await.unwrap();
        let (orch, _) = orchestrator(db.clone(), BOOKED_40).await;
        enable(&orch, "enforce").await;

        let summary = orch.run(RunRequest::new("ws", RunSource::Incremental)).await.unwrap();
        assert_eq!(summary.skipped_low_confidence, 1);
        assert_eq!(
            db.list_tag_links("ws", "c1").await.unwrap(),
            vec![TagLink::new("qual", LinkSource::Ai)]
        );
    }

    #[tokio::test]
    async fn backfill_state_transitions() {
        let db = seeded_db().await;
        seed_conversation(db.as_ref(), "c1").await;
        let (orch, _) = orchestrator(db, BOOKED_85).await;
        orch.settings()
            .set(
                "ws",
                &SettingsPatch::from_json(&json!({
                    "enabled": true,
                    "mode": "enforce",
                    "historicalPolicy": "auto_catchup",
                })),
            )
            .await
            .unwrap();

        let first = orch.run(RunRequest::new("ws", RunSource::Backfill)).await.unwrap();
        assert_eq!(first.candidates, 1);
        assert_eq!(
            orch.settings().get("ws").await.unwrap().backfill_state,
            BackfillState::Running
        );

        let second = orch.run(RunRequest::new("ws", RunSource::Backfill)).await.unwrap();
        assert_eq!(second.candidates, 0);
        let settings = orch.settings().get("ws").await.unwrap();
        assert_eq!(settings.backfill_state, BackfillState::Completed);
        assert!(settings.backfill_completed_at.is_some());
    }

    #[tokio::test]
    async fn per_conversation_errors_are_counted() {
        let db = seeded_db().await;
        seed_conversation(db.as_ref(), "c1").await;
        db.execute_raw("DROP TABLE thread_messages").await.unwrap();
        let (orch, _) = orchestrator(db, BOOKED_85).await;
        enable(&orch, "enforce").await;

        let summary = orch.run(RunRequest::new("ws", RunSource::Incremental)).await.unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.errors, 1);
        assert!(summary.error_messages[0].starts_with("c1: "));
        assert_eq!(summary.error, None);
    }

    #[tokio::test]
    async fn unlock_resources_links_and_rephases() {
        let db = seeded_db().await;
        seed_conversation(db.as_ref(), "c1").await;
        db.upsert_tag_link("ws", "c1", "qual", &LinkSource::Manual).await.unwrap();
        let (orch, llm) = orchestrator(db.clone(), BOOKED_85).await;
        enable(&orch, "enforce").await;

        let summary = orch.unlock_conversation("ws", "c1", Some("u1")).await.unwrap();
        assert_eq!(summary.source, RunSource::ManualRephase);
        assert_eq!(summary.applied, 1);
        assert_eq!(llm.calls(), 1);
        assert_eq!(
            db.list_tag_links("ws", "c1").await.unwrap(),
            vec![TagLink::new("booked", LinkSource::Ai), TagLink::new("hot", LinkSource::Ai)]
        );

        let audit = orch.audit().recent("ws", Some("c1"), 10).await.unwrap();
        assert!(audit.iter().any(|e| e.action == audit::MANUAL_LOCK_RELEASED
            && e.actor_user_id.as_deref() == Some("u1")));
    }

    #[tokio::test]
    async fn unlock_unknown_conversation() {
        let db = seeded_db().await;
        let (orch, _) = orchestrator(db, BOOKED_85).await;
        let err = orch.unlock_conversation("ws", "nope", None).await.unwrap_err();
        assert!(matches!(err, AutomationError::ConversationNotFound { .. }));
    }
}
