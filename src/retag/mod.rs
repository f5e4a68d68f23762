//! Retag: resumable bulk reclassification of a workspace's conversations.
//!
//! A job is a persisted cursor (`progress_done`) over the retag-eligible
//! threads ordered by recent activity. Each `step` consumes one page,
//! classifies it with bounded concurrency and advances the cursor, so a job
//! survives restarts and can be driven by any process. Full-scope jobs are
//! limited to one at a time and one per week.
//!
//! Retag only answers with phase tags that carry prompt text, and it always
//! applies confident results (shadow mode does not apply to retag).

pub mod model;

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::automation::applier::{self, Enforcement};
use crate::automation::audit::{self, AuditLog};
use crate::automation::catalog::TagCatalog;
use crate::automation::classifier::{AnswerSpace, Classifier, build_transcript};
use crate::automation::model::{
    AuditEntry, ClassificationMetadata, ConversationThread, LinkSource,
};
use crate::automation::policy::{self, DecisionInput};
use crate::automation::settings::{AutomationMode, AutomationSettings, SettingsStore};
use crate::config::EngineConfig;
use crate::error::{DatabaseError, RetagError};
use crate::llm::LlmProvider;
use crate::store::Database;

pub use model::{RetagJob, RetagRequest, RetagStatus};

/// Minimum spacing between full-scope jobs.
pub const FULL_SCOPE_COOLDOWN_DAYS: i64 = 7;

/// Activity window for `only_last_30_days` jobs.
pub const RECENT_WINDOW_DAYS: i64 = 30;

/// Run source recorded in bookkeeping for retag writes.
pub const RETAG_RUN_SOURCE: &str = "retag";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetagOutcome {
    Applied,
    SkippedManual,
    LowConfidence,
}

/// Per-step context shared by the concurrent classifications.
struct StepContext<'a> {
    job: &'a RetagJob,
    settings: &'a AutomationSettings,
    catalog: &'a TagCatalog,
    answers: &'a AnswerSpace,
    knowledge: Option<&'a str>,
}

/// Starts and drives retag jobs.
pub struct RetagService {
    db: Arc<dyn Database>,
    settings: SettingsStore,
    audit: AuditLog,
    classifier: Classifier,
    config: EngineConfig,
}

impl RetagService {
    pub fn new(db: Arc<dyn Database>, llm: Arc<dyn LlmProvider>, config: EngineConfig) -> Self {
        Self {
            settings: SettingsStore::new(Arc::clone(&db)),
            audit: AuditLog::new(Arc::clone(&db)),
            classifier: Classifier::new(llm, config.retry.clone()),
            db,
            config,
        }
    }

    /// Create a job after checking the full-scope limits.
    pub async fn start(
        &self,
        workspace_id: &str,
        request: RetagRequest,
    ) -> Result<RetagJob, RetagError> {
        let now = Utc::now();
        let full_scope = request.tag_id.is_none() && !request.only_last_30_days;

        if full_scope {
            let active = self.db.list_active_retag_jobs(workspace_id).await?;
            if active.iter().any(RetagJob::is_full_scope) {
                return Err(RetagError::AlreadyRunning {
                    workspace_id: workspace_id.to_string(),
                });
            }
            if let Some(last) = self.db.latest_full_scope_job(workspace_id).await? {
                let next_allowed_at = last.created_at + Duration::days(FULL_SCOPE_COOLDOWN_DAYS);
                if now < next_allowed_at {
                    return Err(RetagError::WeeklyLimit { next_allowed_at });
                }
            }
        }

        if let Some(ref tag_id) = request.tag_id {
            let catalog = TagCatalog::load(self.db.as_ref(), workspace_id).await?;
            if !catalog.is_phase(tag_id) {
                return Err(RetagError::UnknownTag {
                    workspace_id: workspace_id.to_string(),
                    tag_id: tag_id.clone(),
                });
            }
        }

        let since = request
            .only_last_30_days
            .then(|| now - Duration::days(RECENT_WINDOW_DAYS));
        let total = self.db.count_retag_threads(workspace_id, since).await?;

        let job = RetagJob::new(
            workspace_id,
            request.tag_id,
            request.only_last_30_days,
            total,
            request.actor_user_id,
            now,
        );
        match self.db.insert_retag_job(&job).await {
            Ok(()) => {}
            // Another process created the full-scope job between check and insert
            Err(DatabaseError::Constraint(_)) if full_scope => {
                return Err(RetagError::AlreadyRunning {
                    workspace_id: workspace_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.audit
            .record(
                AuditEntry::new(
                    workspace_id,
                    None,
                    audit::RETAG_STARTED,
                    json!({
                        "job_id": job.id,
                        "tag_id": job.tag_id,
                        "only_last_30_days": job.only_last_30_days,
                        "progress_total": job.progress_total,
                    }),
                )
                .with_actor(job.created_by.as_deref()),
            )
            .await;
        info!(
            workspace = %workspace_id,
            job = %job.id,
            total = job.progress_total,
            full_scope,
            "Retag job created"
        );
        Ok(job)
    }

    /// Consume one page. Terminal jobs are returned unchanged.
    pub async fn step(&self, job_id: &str) -> Result<RetagJob, RetagError> {
        let mut job = self.get(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let workspace_id = job.workspace_id.clone();
        let now = Utc::now();

        let settings = self.settings.get(&workspace_id).await?;
        let catalog = TagCatalog::load(self.db.as_ref(), &workspace_id).await?;
        let answers = AnswerSpace::prompted(&catalog, job.tag_id.as_deref());
        if answers.phase_tags.is_empty() {
            job.fail("no phase tags with prompt text configured", now);
            self.db.update_retag_job(&job).await?;
            self.audit
                .record(AuditEntry::new(
                    &workspace_id,
                    None,
                    audit::RETAG_FAILED,
                    json!({ "job_id": job.id, "error": job.error }),
                ))
                .await;
            warn!(workspace = %workspace_id, job = %job.id, "Retag job failed: no prompted phase tags");
            return Ok(job);
        }

        if job.status == RetagStatus::Queued {
            job.status = RetagStatus::Running;
            job.started_at = Some(now);
        }

        let since = job
            .only_last_30_days
            .then(|| job.created_at - Duration::days(RECENT_WINDOW_DAYS));
        let page = self
            .db
            .list_retag_threads(
                &workspace_id,
                since,
                job.progress_done,
                self.config.retag_batch_size as u64,
            )
            .await?;

        if page.is_empty() {
            job.complete(now);
            self.db.update_retag_job(&job).await?;
            info!(workspace = %workspace_id, job = %job.id, "Retag job completed");
            return Ok(job);
        }

        let knowledge = match self.db.get_knowledge_context(&workspace_id).await {
            Ok(knowledge) => knowledge,
            Err(e) => {
                warn!(workspace = %workspace_id, error = %e, "Knowledge context unavailable");
                None
            }
        };
        let ctx = StepContext {
            job: &job,
            settings: &settings,
            catalog: &catalog,
            answers: &answers,
            knowledge: knowledge.as_deref(),
        };

        let mut pending: Vec<BoxFuture<'_, (String, Result<RetagOutcome, DatabaseError>)>> =
            Vec::with_capacity(page.len());
        for thread in &page {
            let ctx = &ctx;
            pending.push(
                async move { (thread.id.clone(), self.retag_one(ctx, thread).await) }.boxed(),
            );
        }
        let results: Vec<_> = stream::iter(pending)
            .buffer_unordered(self.config.retag_concurrency.max(1))
            .collect()
            .await;

        let (mut applied, mut skipped, mut errors) = (0u32, 0u32, 0u32);
        for (conversation_id, result) in results {
            match result {
                Ok(RetagOutcome::Applied) => applied += 1,
                Ok(RetagOutcome::SkippedManual | RetagOutcome::LowConfidence) => skipped += 1,
                Err(e) => {
                    errors += 1;
                    warn!(
                        workspace = %workspace_id,
                        job = %job_id,
                        conversation = %conversation_id,
                        error = %e,
                        "Retag failed for conversation"
                    );
                }
            }
        }

        let now = Utc::now();
        job.advance(page.len() as u64);
        if job.progress_done >= job.progress_total {
            job.complete(now);
        } else {
            job.updated_at = now;
        }
        job.message = Some(format!(
            "{} of {} conversations processed",
            job.progress_done, job.progress_total
        ));
        self.db.update_retag_job(&job).await?;

        debug!(
            workspace = %workspace_id,
            job = %job.id,
            done = job.progress_done,
            total = job.progress_total,
            applied,
            skipped,
            errors,
            "Retag step finished"
        );
        Ok(job)
    }

    async fn retag_one(
        &self,
        ctx: &StepContext<'_>,
        thread: &ConversationThread,
    ) -> Result<RetagOutcome, DatabaseError> {
        let workspace_id = ctx.job.workspace_id.as_str();
        let links = self.db.list_tag_links(workspace_id, &thread.id).await?;

        if policy::is_manually_locked(ctx.settings, ctx.catalog, &links) {
            self.audit
                .conversation(
                    workspace_id,
                    &thread.id,
                    audit::RETAG_SKIPPED_MANUAL,
                    None,
                    json!({ "job_id": ctx.job.id }),
                )
                .await;
            return Ok(RetagOutcome::SkippedManual);
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
            .classify(&transcript, ctx.catalog, ctx.answers, ctx.knowledge)
            .await;

        if output.phase_tag_id.is_none() || output.phase_confidence < ctx.settings.min_confidence {
            self.audit
                .conversation(
                    workspace_id,
                    &thread.id,
                    audit::RETAG_LOW_CONFIDENCE,
                    None,
                    json!({ "job_id": ctx.job.id, "classification": &output }),
                )
                .await;
            return Ok(RetagOutcome::LowConfidence);
        }

        let now = Utc::now();
        let decision = policy::decide(DecisionInput {
            settings: ctx.settings,
            catalog: ctx.catalog,
            links: &links,
            output: &output,
            last_activity_at: thread.last_activity_at(),
            now,
        });

        applier::apply(
            self.db.as_ref(),
            &Enforcement {
                workspace_id,
                conversation_id: &thread.id,
                settings: ctx.settings,
                catalog: ctx.catalog,
                decision: &decision,
                source: &LinkSource::Retag,
                only_automated: true,
            },
        )
        .await?;

        self.db
            .record_classification(
                workspace_id,
                &thread.id,
                &ClassificationMetadata {
                    classified_at: now,
                    phase_confidence: Some(output.phase_confidence),
                    temperature_confidence: ctx
                        .settings
                        .apply_temperature
                        .then_some(output.temperature_confidence),
                    reason: output.reason.clone(),
                    mode: AutomationMode::Enforce.as_str().into(),
                    run_source: RETAG_RUN_SOURCE.into(),
                },
            )
            .await?;

        self.audit
            .conversation(
                workspace_id,
                &thread.id,
                audit::RETAG_APPLIED,
                None,
                json!({
                    "job_id": ctx.job.id,
                    "classification": &output,
                    "decision": &decision,
                }),
            )
            .await;
        Ok(RetagOutcome::Applied)
    }

    /// Step until the job is terminal or the iteration ceiling is hit.
    pub async fn run_to_completion(&self, job_id: &str) -> Result<RetagJob, RetagError> {
        let mut job = self.get(job_id).await?;
        for _ in 0..self.config.retag_max_iterations {
            if job.status.is_terminal() {
                return Ok(job);
            }
            job = self.step(job_id).await?;
        }
        if !job.status.is_terminal() {
            warn!(
                workspace = %job.workspace_id,
                job = %job.id,
                iterations = self.config.retag_max_iterations,
                "Retag job hit the iteration ceiling"
            );
        }
        Ok(job)
    }

    /// Advance every queued or running job in a workspace by one step.
    pub async fn step_active(&self, workspace_id: &str) -> Result<Vec<RetagJob>, RetagError> {
        let active = self.db.list_active_retag_jobs(workspace_id).await?;
        let mut stepped = Vec::with_capacity(active.len());
        for job in active {
            stepped.push(self.step(&job.id).await?);
        }
        Ok(stepped)
    }

    pub async fn get(&self, job_id: &str) -> Result<RetagJob, RetagError> {
        self.db
            .get_retag_job(job_id)
            .await?
            .ok_or_else(|| RetagError::NotFound {
                id: job_id.to_string(),
            })
    }

    /// Most recently created job for a workspace.
    pub async fn latest(&self, workspace_id: &str) -> Result<Option<RetagJob>, RetagError> {
        Ok(self.db.latest_retag_job(workspace_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::automation::model::{Direction, LeadStatus, TagDefinition, TagLink, ThreadMessage};
    use crate::llm::RetryPolicy;
    use crate::llm::testing::StubLlm;
    use crate::store::LibSqlBackend;

    const QUALIFIED_90: &str = r#"{"phase_tag_id":"qual","phase_confidence":90,"temperature_tag_id":"hot","temperature_confidence":88,"reason":"asked for pricing"}"#;
    const QUALIFIED_30: &str = r#"{"phase_tag_id":"qual","phase_confidence":30,"temperature_tag_id":null,"temperature_confidence":0,"reason":"unsure"}"#;

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::no_retry(),
            retag_batch_size: 2,
            retag_concurrency: 2,
            ..EngineConfig::default()
        }
    }

    async fn seeded_db(with_prompts: bool) -> Arc<LibSqlBackend> {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut tags = vec![
            TagDefinition::new("new", "New Lead"),
            TagDefinition::new("qual", "Qualified"),
            TagDefinition::new("hot", "Hot"),
        ];
        if with_prompts {
            tags[1] = tags[1].clone().with_prompt("Lead asked about pricing or plans");
        }
        for tag in &tags {
            db.upsert_tag("ws", tag).await.unwrap();
        }
        db
    }

    async fn seed_thread(db: &dyn Database, id: &str, last_at: DateTime<Utc>) {
        db.upsert_thread(
            &ConversationThread::new("ws", id, last_at - Duration::days(1))
                .with_last_message(last_at, Direction::Inbound),
        )
        .await
        .unwrap();
        db.insert_message(
            "ws",
            &ThreadMessage {
                id: format!("{id}-m"),
                conversation_id: id.to_string(),
                direction: Direction::Inbound,
                text: "How much is the yearly plan?".into(),
                sent_at: last_at,
            },
        )
        .await
        .unwrap();
    }

    fn service(db: Arc<LibSqlBackend>, reply: &str) -> (RetagService, Arc<StubLlm>) {
        let llm = Arc::new(StubLlm::replying(reply));
        (RetagService::new(db, llm.clone(), config()), llm)
    }

    #[tokio::test]
    async fn second_full_scope_job_is_rejected_while_running() {
        let db = seeded_db(true).await;
        let (svc, _) = service(db, QUALIFIED_90);

        svc.start("ws", RetagRequest::default()).await.unwrap();
        let err = svc.start("ws", RetagRequest::default()).await.unwrap_err();
        assert!(matches!(err, RetagError::AlreadyRunning { .. }));

        // Scoped jobs are not limited
        let scoped = RetagRequest {
            only_last_30_days: true,
            ..Default::default()
        };
        assert!(svc.start("ws", scoped).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_full_scope_starts_create_one_job() {
        let db = seeded_db(true).await;
        let (svc, _) = service(db.clone(), QUALIFIED_90);

        let (a, b) = tokio::join!(
            svc.start("ws", RetagRequest::default()),
            svc.start("ws", RetagRequest::default()),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let rejected = if a.is_ok() { b } else { a };
        assert!(matches!(rejected, Err(RetagError::AlreadyRunning { .. })));

        let active = db.list_active_retag_jobs("ws").await.unwrap();
        assert_eq!(active.iter().filter(|j| j.is_full_scope()).count(), 1);
    }

    #[tokio::test]
    async fn weekly_limit_after_completion() {
        let db = seeded_db(true).await;
        let (svc, _) = service(db, QUALIFIED_90);

        let job = svc.start("ws", RetagRequest::default()).await.unwrap();
        let done = svc.run_to_completion(&job.id).await.unwrap();
        assert_eq!(done.status, RetagStatus::Completed);

        match svc.start("ws", RetagRequest::default()).await.unwrap_err() {
            RetagError::WeeklyLimit { next_allowed_at } => {
                let stored = svc.get(&job.id).await.unwrap();
                assert_eq!(next_allowed_at, stored.created_at + Duration::days(7));
            }
            other => panic!("expected WeeklyLimit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn job_runs_on_a_spawned_task() {
        let db = seeded_db(true).await;
        for i in 0..5 {
            seed_thread(db.as_ref(), &format!("c{i}"), Utc::now() - Duration::hours(i)).await;
        }
        let (svc, llm) = service(db, QUALIFIED_90);
        let svc = Arc::new(svc);

        let job = svc.start("ws", RetagRequest::default()).await.unwrap();
        let handle = tokio::spawn({
            let svc = Arc::clone(&svc);
            let job_id = job.id.clone();
            async move { svc.run_to_completion(&job_id).await }
        });
        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, RetagStatus::Completed);
        assert_eq!(done.progress_done, 5);
        assert_eq!(llm.calls(), 5);
    }

    #[tokio::test]
    async fn failed_job_does_not_count_toward_weekly_limit() {
        let db = seeded_db(false).await;
        let (svc, llm) = service(db, QUALIFIED_90);

        let job = svc.start("ws", RetagRequest::default()).await.unwrap();
        let failed = svc.step(&job.id).await.unwrap();
        assert_eq!(failed.status, RetagStatus::Failed);
        assert!(failed.error.is_some());
        assert_eq!(llm.calls(), 0);

        assert!(svc.start("ws", RetagRequest::default()).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let db = seeded_db(true).await;
        let (svc, _) = service(db, QUALIFIED_90);
        let request = RetagRequest {
            tag_id: Some("hot".into()),
            ..Default::default()
        };
        assert!(matches!(
            svc.start("ws", request).await.unwrap_err(),
            RetagError::UnknownTag { .. }
        ));
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_bounded() {
        let db = seeded_db(true).await;
        let now = Utc::now();
        for i in 0..5 {
            seed_thread(db.as_ref(), &format!("c{i}"), now - Duration::hours(i + 1)).await;
        }
        let (svc, llm) = service(db.clone(), QUALIFIED_90);

        let job = svc.start("ws", RetagRequest::default()).await.unwrap();
        assert_eq!(job.progress_total, 5);

        let mut seen = vec![];
        let mut current = job.clone();
        while !current.status.is_terminal() {
            current = svc.step(&job.id).await.unwrap();
            seen.push(current.progress_done);
        }
        assert_eq!(seen, vec![2, 4, 5]);
        assert_eq!(current.status, RetagStatus::Completed);
        assert!(current.finished_at.is_some());
        assert_eq!(llm.calls(), 5);

        // No-op once terminal
        let again = svc.step(&job.id).await.unwrap();
        assert_eq!(again.status, RetagStatus::Completed);
        assert_eq!(again.progress_done, current.progress_done);
        assert_eq!(llm.calls(), 5);

        let links = db.list_tag_links("ws", "c0").await.unwrap();
        assert_eq!(
            links,
            vec![
                TagLink::new("hot", LinkSource::Retag),
                TagLink::new("qual", LinkSource::Retag),
            ]
        );
        let thread = db.get_thread("ws", "c0").await.unwrap().unwrap();
        assert_eq!(thread.lead_status, LeadStatus::Qualified);
        assert_eq!(thread.ai_phase_last_run_source.as_deref(), Some(RETAG_RUN_SOURCE));
        assert_eq!(svc.latest("ws").await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn manual_and_low_confidence_are_left_alone() {
        let db = seeded_db(true).await;
        let now = Utc::now();
        seed_thread(db.as_ref(), "locked", now - Duration::hours(1)).await;
        seed_thread(db.as_ref(), "unsure", now - Duration::hours(2)).await;
        db.upsert_tag_link("ws", "locked", "new", &LinkSource::Manual).await.unwrap();
        db.upsert_tag_link("ws", "unsure", "new", &LinkSource::Ai).await.unwrap();
        let (svc, llm) = service(db.clone(), QUALIFIED_30);

        let job = svc.start("ws", RetagRequest::default()).await.unwrap();
        let done = svc.run_to_completion(&job.id).await.unwrap();
        assert_eq!(done.status, RetagStatus::Completed);
        assert_eq!(llm.calls(), 1);

        assert_eq!(
            db.list_tag_links("ws", "locked").await.unwrap(),
            vec![TagLink::new("new", LinkSource::Manual)]
        );
        assert_eq!(
            db.list_tag_links("ws", "unsure").await.unwrap(),
            vec![TagLink::new("new", LinkSource::Ai)]
        );

        let audit = db.list_audit("ws", Some("locked"), 10).await.unwrap();
        assert_eq!(audit[0].action, audit::RETAG_SKIPPED_MANUAL);
        let audit = db.list_audit("ws", Some("unsure"), 10).await.unwrap();
        assert_eq!(audit[0].action, audit::RETAG_LOW_CONFIDENCE);
    }

    #[tokio::test]
    async fn recent_scope_counts_only_recent_threads() {
        let db = seeded_db(true).await;
        let now = Utc::now();
        seed_thread(db.as_ref(), "fresh", now - Duration::days(2)).await;
        seed_thread(db.as_ref(), "stale", now - Duration::days(60)).await;
        let (svc, _) = service(db, QUALIFIED_90);

        let job = svc
            .start(
                "ws",
                RetagRequest {
                    only_last_30_days: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.progress_total, 1);
        let done = svc.run_to_completion(&job.id).await.unwrap();
        assert_eq!(done.progress_done, 1);
        assert_eq!(done.status, RetagStatus::Completed);
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let db = seeded_db(true).await;
        let (svc, _) = service(db, QUALIFIED_90);
        assert!(matches!(
            svc.step("missing").await.unwrap_err(),
            RetagError::NotFound { .. }
        ));
    }
}
