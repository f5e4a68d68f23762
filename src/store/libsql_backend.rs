//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as RFC 3339 UTC with millisecond precision so text comparison orders them.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::automation::model::{
    AuditEntry, ClassificationMetadata, ConversationThread, Direction, LeadStatus, LinkSource,
    RunSummary, TagDefinition, TagLink, TagReplacement, ThreadMessage,
};
use crate::automation::settings::{
    AutomationMode, AutomationSettings, BackfillState, HistoricalPolicy, UncertainExistingPhase,
};
use crate::error::DatabaseError;
use crate::retag::model::{RetagJob, RetagStatus};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Serializes explicit transactions on the shared connection.
    tx_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            tx_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run arbitrary SQL; lets tests break or inspect the schema.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute_batch(sql)
            .await
            .map_err(query_err("execute_raw"))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn text_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn int_col(row: &libsql::Row, idx: i32) -> Option<i64> {
    row.get::<i64>(idx).ok()
}

fn confidence_col(row: &libsql::Row, idx: i32) -> Option<u8> {
    int_col(row, idx).map(|v| v.clamp(0, 100) as u8)
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const SETTINGS_COLUMNS: &str = "workspace_id, enabled, mode, historical_policy, enabled_at, \
    min_confidence, incremental_max_conversations, catchup_max_conversations, \
    classify_on_any_message, apply_temperature, manual_lock_enabled, \
    uncertain_new_lead_window_hours, uncertain_existing_phase, allow_setter_trigger, \
    backfill_state, backfill_completed_at, last_incremental_run_at, last_catchup_run_at, \
    last_error, created_at, updated_at";

fn row_to_settings(row: &libsql::Row) -> Result<AutomationSettings, libsql::Error> {
    let workspace_id: String = row.get(0)?;
    let created_str: String = row.get(19)?;
    let updated_str: String = row.get(20)?;

    Ok(AutomationSettings {
        workspace_id,
        enabled: row.get::<i64>(1)? != 0,
        mode: AutomationMode::parse_lenient(&row.get::<String>(2)?),
        historical_policy: HistoricalPolicy::parse_lenient(&row.get::<String>(3)?),
        enabled_at: parse_optional_datetime(&text_col(row, 4)),
        min_confidence: row.get::<i64>(5)?.clamp(0, 100) as u8,
        incremental_max_conversations: row.get::<i64>(6)?.max(1) as u32,
        catchup_max_conversations: row.get::<i64>(7)?.max(1) as u32,
        classify_on_any_message: row.get::<i64>(8)? != 0,
        apply_temperature: row.get::<i64>(9)? != 0,
        manual_lock_enabled: row.get::<i64>(10)? != 0,
        uncertain_new_lead_window_hours: row.get::<i64>(11)?.max(1) as u32,
        uncertain_existing_phase: UncertainExistingPhase::parse_lenient(&row.get::<String>(12)?),
        allow_setter_trigger: row.get::<i64>(13)? != 0,
        backfill_state: BackfillState::parse_lenient(&row.get::<String>(14)?),
        backfill_completed_at: parse_optional_datetime(&text_col(row, 15)),
        last_incremental_run_at: parse_optional_datetime(&text_col(row, 16)),
        last_catchup_run_at: parse_optional_datetime(&text_col(row, 17)),
        last_error: text_col(row, 18),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const THREAD_COLUMNS: &str = "id, workspace_id, contact_name, last_message_at, \
    last_message_direction, lead_status, is_spam, created_at, ai_phase_updated_at, \
    ai_phase_confidence, ai_temperature_confidence, ai_phase_reason, ai_phase_mode, \
    ai_phase_last_run_source";

/// Threads that automation may ever look at.
const ACTIVE_THREAD_FILTER: &str = "lead_status != 'removed' AND is_spam = 0";

/// Most recent activity first, stable on ties.
const THREAD_ORDER: &str = "COALESCE(last_message_at, created_at) DESC, id ASC";

fn row_to_thread(row: &libsql::Row) -> Result<ConversationThread, libsql::Error> {
    let id: String = row.get(0)?;
    let workspace_id: String = row.get(1)?;
    let lead_status: String = row.get(5)?;
    let created_str: String = row.get(7)?;

    Ok(ConversationThread {
        id,
        workspace_id,
        contact_name: text_col(row, 2),
        last_message_at: parse_optional_datetime(&text_col(row, 3)),
        last_message_direction: text_col(row, 4).and_then(|d| Direction::parse(&d)),
        lead_status: LeadStatus::parse(&lead_status),
        is_spam: row.get::<i64>(6)? != 0,
        created_at: parse_datetime(&created_str),
        ai_phase_updated_at: parse_optional_datetime(&text_col(row, 8)),
        ai_phase_confidence: confidence_col(row, 9),
        ai_temperature_confidence: confidence_col(row, 10),
        ai_phase_reason: text_col(row, 11),
        ai_phase_mode: text_col(row, 12),
        ai_phase_last_run_source: text_col(row, 13),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<ThreadMessage, libsql::Error> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let direction: String = row.get(2)?;
    let text: String = row.get(3)?;
    let sent_str: String = row.get(4)?;

    Ok(ThreadMessage {
        id,
        conversation_id,
        direction: Direction::parse(&direction).unwrap_or(Direction::Inbound),
        text,
        sent_at: parse_datetime(&sent_str),
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<AuditEntry, libsql::Error> {
    let id: String = row.get(0)?;
    let workspace_id: String = row.get(1)?;
    let action: String = row.get(3)?;
    let details_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    Ok(AuditEntry {
        id,
        workspace_id,
        conversation_id: text_col(row, 2),
        action,
        actor_user_id: text_col(row, 4),
        details: serde_json::from_str(&details_str).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created_str),
    })
}

const RETAG_COLUMNS: &str = "id, workspace_id, tag_id, only_last_30_days, status, \
    progress_total, progress_done, message, error, created_by, created_at, updated_at, \
    started_at, finished_at";

fn row_to_retag_job(row: &libsql::Row) -> Result<RetagJob, libsql::Error> {
    let id: String = row.get(0)?;
    let workspace_id: String = row.get(1)?;
    let status: String = row.get(4)?;
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;

    Ok(RetagJob {
        id,
        workspace_id,
        tag_id: text_col(row, 2),
        only_last_30_days: row.get::<i64>(3)? != 0,
        status: RetagStatus::parse(&status),
        progress_total: row.get::<i64>(5)?.max(0) as u64,
        progress_done: row.get::<i64>(6)?.max(0) as u64,
        message: text_col(row, 7),
        error: text_col(row, 8),
        created_by: text_col(row, 9),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        started_at: parse_optional_datetime(&text_col(row, 12)),
        finished_at: parse_optional_datetime(&text_col(row, 13)),
    })
}

impl LibSqlBackend {
    async fn query_settings(
        &self,
        sql: &str,
        workspace_id: &str,
    ) -> Result<Option<AutomationSettings>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![workspace_id])
            .await
            .map_err(query_err("get_automation_settings"))?;
        match rows.next().await.map_err(query_err("get_automation_settings"))? {
            Some(row) => Ok(Some(row_to_settings(&row).map_err(query_err(
                "get_automation_settings row parse",
            ))?)),
            None => Ok(None),
        }
    }

    async fn query_threads(
        &self,
        op: &'static str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ConversationThread>, DatabaseError> {
        let mut rows = self.conn().query(sql, params).await.map_err(query_err(op))?;
        let mut threads = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err(op))? {
            threads.push(row_to_thread(&row).map_err(query_err(op))?);
        }
        Ok(threads)
    }

    async fn query_retag_jobs(
        &self,
        op: &'static str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<RetagJob>, DatabaseError> {
        let mut rows = self.conn().query(sql, params).await.map_err(query_err(op))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err(op))? {
            jobs.push(row_to_retag_job(&row).map_err(query_err(op))?);
        }
        Ok(jobs)
    }

    async fn replace_links_in(
        conn: &Connection,
        replacement: &TagReplacement,
        now: &str,
    ) -> Result<(), DatabaseError> {
        let ws = replacement.workspace_id.as_str();
        let conv = replacement.conversation_id.as_str();

        let delete_sql = if replacement.only_automated {
            "DELETE FROM conversation_tags
             WHERE workspace_id = ?1 AND conversation_id = ?2 AND tag_id = ?3
               AND source IN ('ai', 'retag')"
        } else {
            "DELETE FROM conversation_tags
             WHERE workspace_id = ?1 AND conversation_id = ?2 AND tag_id = ?3"
        };
        for tag_id in &replacement.scope {
            conn.execute(delete_sql, params![ws, conv, tag_id.as_str()])
                .await
                .map_err(query_err("replace_tag_links delete"))?;
        }

        for tag_id in &replacement.insert {
            conn.execute(
                "INSERT INTO conversation_tags (workspace_id, conversation_id, tag_id, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(workspace_id, conversation_id, tag_id)
                 DO UPDATE SET source = excluded.source",
                params![ws, conv, tag_id.as_str(), replacement.source.as_str(), now],
            )
            .await
            .map_err(query_err("replace_tag_links insert"))?;
        }

        if let Some(status) = replacement.lead_status {
            conn.execute(
                "UPDATE conversation_threads SET lead_status = ?3
                 WHERE workspace_id = ?1 AND id = ?2 AND lead_status != 'removed'",
                params![ws, conv, status.as_str()],
            )
            .await
            .map_err(query_err("replace_tag_links lead_status"))?;
        }
        Ok(())
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_automation_settings(
        &self,
        workspace_id: &str,
    ) -> Result<Option<AutomationSettings>, DatabaseError> {
        self.query_settings(
            &format!("SELECT {SETTINGS_COLUMNS} FROM automation_settings WHERE workspace_id = ?1"),
            workspace_id,
        )
        .await
    }

    async fn insert_automation_settings(
        &self,
        s: &AutomationSettings,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO automation_settings ({SETTINGS_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
                     ON CONFLICT(workspace_id) DO NOTHING"
                ),
                params![
                    s.workspace_id.as_str(),
                    s.enabled as i64,
                    s.mode.as_str(),
                    s.historical_policy.as_str(),
                    opt_ts(s.enabled_at.as_ref()),
                    s.min_confidence as i64,
                    s.incremental_max_conversations as i64,
                    s.catchup_max_conversations as i64,
                    s.classify_on_any_message as i64,
                    s.apply_temperature as i64,
                    s.manual_lock_enabled as i64,
                    s.uncertain_new_lead_window_hours as i64,
                    s.uncertain_existing_phase.as_str(),
                    s.allow_setter_trigger as i64,
                    s.backfill_state.as_str(),
                    opt_ts(s.backfill_completed_at.as_ref()),
                    opt_ts(s.last_incremental_run_at.as_ref()),
                    opt_ts(s.last_catchup_run_at.as_ref()),
                    opt_text(s.last_error.as_deref()),
                    ts(&s.created_at),
                    ts(&s.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_automation_settings"))?;
        Ok(changed > 0)
    }

    async fn update_automation_settings(
        &self,
        s: &AutomationSettings,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE automation_settings SET
                    enabled = ?2, mode = ?3, historical_policy = ?4, enabled_at = ?5,
                    min_confidence = ?6, incremental_max_conversations = ?7,
                    catchup_max_conversations = ?8, classify_on_any_message = ?9,
                    apply_temperature = ?10, manual_lock_enabled = ?11,
                    uncertain_new_lead_window_hours = ?12, uncertain_existing_phase = ?13,
                    allow_setter_trigger = ?14, backfill_state = ?15,
                    backfill_completed_at = ?16, last_incremental_run_at = ?17,
                    last_catchup_run_at = ?18, last_error = ?19, updated_at = ?20
                 WHERE workspace_id = ?1",
                params![
                    s.workspace_id.as_str(),
                    s.enabled as i64,
                    s.mode.as_str(),
                    s.historical_policy.as_str(),
                    opt_ts(s.enabled_at.as_ref()),
                    s.min_confidence as i64,
                    s.incremental_max_conversations as i64,
                    s.catchup_max_conversations as i64,
                    s.classify_on_any_message as i64,
                    s.apply_temperature as i64,
                    s.manual_lock_enabled as i64,
                    s.uncertain_new_lead_window_hours as i64,
                    s.uncertain_existing_phase.as_str(),
                    s.allow_setter_trigger as i64,
                    s.backfill_state.as_str(),
                    opt_ts(s.backfill_completed_at.as_ref()),
                    opt_ts(s.last_incremental_run_at.as_ref()),
                    opt_ts(s.last_catchup_run_at.as_ref()),
                    opt_text(s.last_error.as_deref()),
                    ts(&s.updated_at),
                ],
            )
            .await
            .map_err(query_err("update_automation_settings"))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "automation_settings".into(),
                id: s.workspace_id.clone(),
            });
        }
        Ok(())
    }

    async fn list_enabled_workspaces(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT workspace_id FROM automation_settings WHERE enabled = 1 ORDER BY workspace_id",
                (),
            )
            .await
            .map_err(query_err("list_enabled_workspaces"))?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_enabled_workspaces"))? {
            ids.push(row.get::<String>(0).map_err(query_err("list_enabled_workspaces"))?);
        }
        Ok(ids)
    }

    // ── Leases ──────────────────────────────────────────────────────

    async fn try_acquire_lease(
        &self,
        workspace_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO workspace_locks (workspace_id, holder, acquired_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at_ms = excluded.acquired_at_ms,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE workspace_locks.expires_at_ms <= ?3",
                params![
                    workspace_id,
                    holder,
                    now.timestamp_millis(),
                    expires_at.timestamp_millis()
                ],
            )
            .await
            .map_err(query_err("try_acquire_lease"))?;
        Ok(changed == 1)
    }

    async fn release_lease(&self, workspace_id: &str, holder: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM workspace_locks WHERE workspace_id = ?1 AND holder = ?2",
                params![workspace_id, holder],
            )
            .await
            .map_err(query_err("release_lease"))?;
        Ok(())
    }

    // ── Tags ────────────────────────────────────────────────────────

    async fn list_tags(&self, workspace_id: &str) -> Result<Vec<TagDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, prompt_text FROM tags WHERE workspace_id = ?1 ORDER BY id",
                params![workspace_id],
            )
            .await
            .map_err(query_err("list_tags"))?;
        let mut tags = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_tags"))? {
            tags.push(TagDefinition {
                id: row.get(0).map_err(query_err("list_tags"))?,
                name: row.get(1).map_err(query_err("list_tags"))?,
                prompt_text: text_col(&row, 2),
            });
        }
        Ok(tags)
    }

    async fn upsert_tag(
        &self,
        workspace_id: &str,
        tag: &TagDefinition,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tags (workspace_id, id, name, prompt_text) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id, id) DO UPDATE SET
                    name = excluded.name, prompt_text = excluded.prompt_text",
                params![
                    workspace_id,
                    tag.id.as_str(),
                    tag.name.as_str(),
                    opt_text(tag.prompt_text.as_deref())
                ],
            )
            .await
            .map_err(query_err("upsert_tag"))?;
        Ok(())
    }

    // ── Threads ─────────────────────────────────────────────────────

    async fn upsert_thread(&self, t: &ConversationThread) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO conversation_threads ({THREAD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT(workspace_id, id) DO UPDATE SET
                        contact_name = excluded.contact_name,
                        last_message_at = excluded.last_message_at,
                        last_message_direction = excluded.last_message_direction,
                        lead_status = excluded.lead_status,
                        is_spam = excluded.is_spam,
                        ai_phase_updated_at = excluded.ai_phase_updated_at,
                        ai_phase_confidence = excluded.ai_phase_confidence,
                        ai_temperature_confidence = excluded.ai_temperature_confidence,
                        ai_phase_reason = excluded.ai_phase_reason,
                        ai_phase_mode = excluded.ai_phase_mode,
                        ai_phase_last_run_source = excluded.ai_phase_last_run_source"
                ),
                params![
                    t.id.as_str(),
                    t.workspace_id.as_str(),
                    opt_text(t.contact_name.as_deref()),
                    opt_ts(t.last_message_at.as_ref()),
                    opt_text(t.last_message_direction.map(|d| d.as_str())),
                    t.lead_status.as_str(),
                    t.is_spam as i64,
                    ts(&t.created_at),
                    opt_ts(t.ai_phase_updated_at.as_ref()),
                    opt_int(t.ai_phase_confidence.map(i64::from)),
                    opt_int(t.ai_temperature_confidence.map(i64::from)),
                    opt_text(t.ai_phase_reason.as_deref()),
                    opt_text(t.ai_phase_mode.as_deref()),
                    opt_text(t.ai_phase_last_run_source.as_deref()),
                ],
            )
            .await
            .map_err(query_err("upsert_thread"))?;
        Ok(())
    }

    async fn get_thread(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationThread>, DatabaseError> {
        let mut threads = self
            .query_threads(
                "get_thread",
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM conversation_threads
                     WHERE workspace_id = ?1 AND id = ?2"
                ),
                params![workspace_id, conversation_id],
            )
            .await?;
        Ok(threads.pop())
    }

    async fn list_active_threads(
        &self,
        workspace_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ConversationThread>, DatabaseError> {
        self.query_threads(
            "list_active_threads",
            &format!(
                "SELECT {THREAD_COLUMNS} FROM conversation_threads
                 WHERE workspace_id = ?1 AND {ACTIVE_THREAD_FILTER}
                 ORDER BY {THREAD_ORDER}
                 LIMIT ?2 OFFSET ?3"
            ),
            params![workspace_id, limit as i64, offset as i64],
        )
        .await
    }

    async fn count_retag_threads(
        &self,
        workspace_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT COUNT(*) FROM conversation_threads
                     WHERE workspace_id = ?1 AND {ACTIVE_THREAD_FILTER}
                       AND (?2 IS NULL OR COALESCE(last_message_at, created_at) >= ?2)"
                ),
                params![workspace_id, opt_ts(since.as_ref())],
            )
            .await
            .map_err(query_err("count_retag_threads"))?;
        match rows.next().await.map_err(query_err("count_retag_threads"))? {
            Some(row) => {
                let count: i64 = row.get(0).map_err(query_err("count_retag_threads"))?;
                Ok(count.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    async fn list_retag_threads(
        &self,
        workspace_id: &str,
        since: Option<DateTime<Utc>>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ConversationThread>, DatabaseError> {
        self.query_threads(
            "list_retag_threads",
            &format!(
                "SELECT {THREAD_COLUMNS} FROM conversation_threads
                 WHERE workspace_id = ?1 AND {ACTIVE_THREAD_FILTER}
                   AND (?2 IS NULL OR COALESCE(last_message_at, created_at) >= ?2)
                 ORDER BY {THREAD_ORDER}
                 LIMIT ?3 OFFSET ?4"
            ),
            params![
                workspace_id,
                opt_ts(since.as_ref()),
                limit as i64,
                offset as i64
            ],
        )
        .await
    }

    async fn record_classification(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        m: &ClassificationMetadata,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE conversation_threads SET
                    ai_phase_updated_at = ?3,
                    ai_phase_confidence = COALESCE(?4, ai_phase_confidence),
                    ai_temperature_confidence = COALESCE(?5, ai_temperature_confidence),
                    ai_phase_reason = ?6,
                    ai_phase_mode = ?7,
                    ai_phase_last_run_source = ?8
                 WHERE workspace_id = ?1 AND id = ?2",
                params![
                    workspace_id,
                    conversation_id,
                    ts(&m.classified_at),
                    opt_int(m.phase_confidence.map(i64::from)),
                    opt_int(m.temperature_confidence.map(i64::from)),
                    m.reason.as_str(),
                    m.mode.as_str(),
                    m.run_source.as_str(),
                ],
            )
            .await
            .map_err(query_err("record_classification"))?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(
        &self,
        workspace_id: &str,
        m: &ThreadMessage,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO thread_messages (id, workspace_id, conversation_id, direction, text, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    m.id.as_str(),
                    workspace_id,
                    m.conversation_id.as_str(),
                    m.direction.as_str(),
                    m.text.as_str(),
                    ts(&m.sent_at),
                ],
            )
            .await
            .map_err(query_err("insert_message"))?;
        Ok(())
    }

    async fn list_recent_messages(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ThreadMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, conversation_id, direction, text, sent_at FROM thread_messages
                 WHERE workspace_id = ?1 AND conversation_id = ?2
                 ORDER BY sent_at DESC, rowid DESC
                 LIMIT ?3",
                params![workspace_id, conversation_id, limit as i64],
            )
            .await
            .map_err(query_err("list_recent_messages"))?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_recent_messages"))? {
            messages.push(row_to_message(&row).map_err(query_err("list_recent_messages"))?);
        }
        messages.reverse();
        Ok(messages)
    }

    // ── Tag links ───────────────────────────────────────────────────

    async fn list_tag_links(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<TagLink>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tag_id, source FROM conversation_tags
                 WHERE workspace_id = ?1 AND conversation_id = ?2
                 ORDER BY tag_id",
                params![workspace_id, conversation_id],
            )
            .await
            .map_err(query_err("list_tag_links"))?;
        let mut links = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_tag_links"))? {
            let tag_id: String = row.get(0).map_err(query_err("list_tag_links"))?;
            let source: String = row.get(1).map_err(query_err("list_tag_links"))?;
            links.push(TagLink::new(tag_id, LinkSource::parse(&source)));
        }
        Ok(links)
    }

    async fn upsert_tag_link(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        tag_id: &str,
        source: &LinkSource,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO conversation_tags (workspace_id, conversation_id, tag_id, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(workspace_id, conversation_id, tag_id)
                 DO UPDATE SET source = excluded.source",
                params![
                    workspace_id,
                    conversation_id,
                    tag_id,
                    source.as_str(),
                    ts(&Utc::now())
                ],
            )
            .await
            .map_err(query_err("upsert_tag_link"))?;
        Ok(())
    }

    async fn replace_tag_links(&self, replacement: &TagReplacement) -> Result<(), DatabaseError> {
        let _guard = self.tx_lock.lock().await;
        let now = ts(&Utc::now());

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("replace_tag_links begin"))?;

        match Self::replace_links_in(&tx, replacement, &now).await {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(query_err("replace_tag_links commit"))?;
                debug!(
                    workspace = %replacement.workspace_id,
                    conversation = %replacement.conversation_id,
                    inserted = replacement.insert.len(),
                    "Tag links replaced"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "replace_tag_links rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn mark_links_automated(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        tag_ids: &[String],
    ) -> Result<u64, DatabaseError> {
        let mut changed = 0;
        for tag_id in tag_ids {
            changed += self
                .conn()
                .execute(
                    "UPDATE conversation_tags SET source = 'ai'
                     WHERE workspace_id = ?1 AND conversation_id = ?2 AND tag_id = ?3
                       AND source NOT IN ('ai', 'retag')",
                    params![workspace_id, conversation_id, tag_id.as_str()],
                )
                .await
                .map_err(query_err("mark_links_automated"))?;
        }
        Ok(changed)
    }

    // ── Audit ───────────────────────────────────────────────────────

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        let details = serde_json::to_string(&entry.details)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO automation_audit (id, workspace_id, conversation_id, action, actor_user_id, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.as_str(),
                    entry.workspace_id.as_str(),
                    opt_text(entry.conversation_id.as_deref()),
                    entry.action.as_str(),
                    opt_text(entry.actor_user_id.as_deref()),
                    details,
                    ts(&entry.created_at),
                ],
            )
            .await
            .map_err(query_err("append_audit"))?;
        Ok(())
    }

    async fn list_audit(
        &self,
        workspace_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, workspace_id, conversation_id, action, actor_user_id, details, created_at
                 FROM automation_audit
                 WHERE workspace_id = ?1 AND (?2 IS NULL OR conversation_id = ?2)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3",
                params![workspace_id, opt_text(conversation_id), limit as i64],
            )
            .await
            .map_err(query_err("list_audit"))?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_audit"))? {
            entries.push(row_to_audit(&row).map_err(query_err("list_audit"))?);
        }
        Ok(entries)
    }

    // ── Run records ─────────────────────────────────────────────────

    async fn insert_run_record(&self, summary: &RunSummary) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(summary)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO automation_runs (id, workspace_id, source, summary, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    summary.run_id.as_str(),
                    summary.workspace_id.as_str(),
                    summary.source.as_str(),
                    json,
                    ts(&summary.started_at),
                    opt_ts(summary.finished_at.as_ref()),
                ],
            )
            .await
            .map_err(query_err("insert_run_record"))?;
        Ok(())
    }

    async fn list_run_records(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<RunSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT summary FROM automation_runs WHERE workspace_id = ?1
                 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
                params![workspace_id, limit as i64],
            )
            .await
            .map_err(query_err("list_run_records"))?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_run_records"))? {
            let json: String = row.get(0).map_err(query_err("list_run_records"))?;
            let summary = serde_json::from_str(&json)
                .map_err(|e| DatabaseError::Serialization(format!("run summary: {e}")))?;
            runs.push(summary);
        }
        Ok(runs)
    }

    // ── Knowledge ───────────────────────────────────────────────────

    async fn get_knowledge_context(
        &self,
        workspace_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT content FROM workspace_knowledge WHERE workspace_id = ?1",
                params![workspace_id],
            )
            .await
            .map_err(query_err("get_knowledge_context"))?;
        match rows.next().await.map_err(query_err("get_knowledge_context"))? {
            Some(row) => Ok(text_col(&row, 0).filter(|c| !c.trim().is_empty())),
            None => Ok(None),
        }
    }

    async fn set_knowledge_context(
        &self,
        workspace_id: &str,
        content: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO workspace_knowledge (workspace_id, content, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(workspace_id) DO UPDATE SET
                    content = excluded.content, updated_at = excluded.updated_at",
                params![workspace_id, content, ts(&Utc::now())],
            )
            .await
            .map_err(query_err("set_knowledge_context"))?;
        Ok(())
    }

    // ── Retag jobs ──────────────────────────────────────────────────

    async fn insert_retag_job(&self, job: &RetagJob) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO retag_jobs ({RETAG_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    job.id.as_str(),
                    job.workspace_id.as_str(),
                    opt_text(job.tag_id.as_deref()),
                    job.only_last_30_days as i64,
                    job.status.as_str(),
                    job.progress_total as i64,
                    job.progress_done as i64,
                    opt_text(job.message.as_deref()),
                    opt_text(job.error.as_deref()),
                    opt_text(job.created_by.as_deref()),
                    ts(&job.created_at),
                    ts(&job.updated_at),
                    opt_ts(job.started_at.as_ref()),
                    opt_ts(job.finished_at.as_ref()),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint failed") {
                    DatabaseError::Constraint(format!("insert_retag_job: {msg}"))
                } else {
                    DatabaseError::Query(format!("insert_retag_job: {msg}"))
                }
            })?;
        debug!(job_id = %job.id, workspace = %job.workspace_id, "Retag job inserted");
        Ok(())
    }

    async fn get_retag_job(&self, id: &str) -> Result<Option<RetagJob>, DatabaseError> {
        let mut jobs = self
            .query_retag_jobs(
                "get_retag_job",
                &format!("SELECT {RETAG_COLUMNS} FROM retag_jobs WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn update_retag_job(&self, job: &RetagJob) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE retag_jobs SET
                    status = ?2, progress_total = ?3, progress_done = ?4, message = ?5,
                    error = ?6, updated_at = ?7, started_at = ?8, finished_at = ?9
                 WHERE id = ?1",
                params![
                    job.id.as_str(),
                    job.status.as_str(),
                    job.progress_total as i64,
                    job.progress_done as i64,
                    opt_text(job.message.as_deref()),
                    opt_text(job.error.as_deref()),
                    ts(&job.updated_at),
                    opt_ts(job.started_at.as_ref()),
                    opt_ts(job.finished_at.as_ref()),
                ],
            )
            .await
            .map_err(query_err("update_retag_job"))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "retag_job".into(),
                id: job.id.clone(),
            });
        }
        Ok(())
    }

    async fn latest_retag_job(
        &self,
        workspace_id: &str,
    ) -> Result<Option<RetagJob>, DatabaseError> {
        let mut jobs = self
            .query_retag_jobs(
                "latest_retag_job",
                &format!(
                    "SELECT {RETAG_COLUMNS} FROM retag_jobs WHERE workspace_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![workspace_id],
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn latest_full_scope_job(
        &self,
        workspace_id: &str,
    ) -> Result<Option<RetagJob>, DatabaseError> {
        let mut jobs = self
            .query_retag_jobs(
                "latest_full_scope_job",
                &format!(
                    "SELECT {RETAG_COLUMNS} FROM retag_jobs
                     WHERE workspace_id = ?1 AND tag_id IS NULL AND only_last_30_days = 0
                       AND status != 'failed'
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![workspace_id],
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn list_active_retag_jobs(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<RetagJob>, DatabaseError> {
        self.query_retag_jobs(
            "list_active_retag_jobs",
            &format!(
                "SELECT {RETAG_COLUMNS} FROM retag_jobs
                 WHERE workspace_id = ?1 AND status IN ('queued', 'running')
                 ORDER BY created_at ASC, rowid ASC"
            ),
            params![workspace_id],
        )
        .await
    }
}
