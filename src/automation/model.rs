//! Conversation, tag and audit records consumed and produced by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Conversations ───────────────────────────────────────────────────

/// Direction of a message relative to the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the lead.
    Inbound,
    /// Sent by the workspace (agent, setter, closer).
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" | "in" | "incoming" => Some(Self::Inbound),
            "outbound" | "out" | "outgoing" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Lead status derived from the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    Open,
    Qualified,
    Disqualified,
    /// Hidden from the inbox; never a candidate for automation.
    Removed,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Qualified => "qualified",
            Self::Disqualified => "disqualified",
            Self::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "qualified" => Self::Qualified,
            "disqualified" => Self::Disqualified,
            "removed" => Self::Removed,
            _ => Self::Open,
        }
    }
}

/// A lead conversation with its automation bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: String,
    pub workspace_id: String,
    pub contact_name: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_direction: Option<Direction>,
    pub lead_status: LeadStatus,
    pub is_spam: bool,
    pub created_at: DateTime<Utc>,
    pub ai_phase_updated_at: Option<DateTime<Utc>>,
    pub ai_phase_confidence: Option<u8>,
    pub ai_temperature_confidence: Option<u8>,
    pub ai_phase_reason: Option<String>,
    pub ai_phase_mode: Option<String>,
    pub ai_phase_last_run_source: Option<String>,
}

impl ConversationThread {
    /// New open thread with no automation history.
    pub fn new(workspace_id: impl Into<String>, id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            contact_name: None,
            last_message_at: None,
            last_message_direction: None,
            lead_status: LeadStatus::Open,
            is_spam: false,
            created_at,
            ai_phase_updated_at: None,
            ai_phase_confidence: None,
            ai_temperature_confidence: None,
            ai_phase_reason: None,
            ai_phase_mode: None,
            ai_phase_last_run_source: None,
        }
    }

    /// Builder: set last activity.
    pub fn with_last_message(mut self, at: DateTime<Utc>, direction: Direction) -> Self {
        self.last_message_at = Some(at);
        self.last_message_direction = Some(direction);
        self
    }

    /// Last activity, falling back to creation time.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }

    /// Never classified, or new activity since the last classification.
    pub fn is_stale(&self) -> bool {
        match (self.ai_phase_updated_at, self.last_message_at) {
            (None, _) => true,
            (Some(classified), Some(last)) => last > classified,
            (Some(_), None) => false,
        }
    }
}

/// A single message in a conversation. Read-only for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

// ── Tags ────────────────────────────────────────────────────────────

/// A workspace tag definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub id: String,
    pub name: String,
    /// Operator-written description used as the classification prompt.
    pub prompt_text: Option<String>,
}

impl TagDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prompt_text: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt_text = Some(prompt.into());
        self
    }

    /// True when a non-blank prompt is configured.
    pub fn has_prompt(&self) -> bool {
        self.prompt_text
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
    }
}

/// Who created a conversation-tag link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkSource {
    Manual,
    Bulk,
    Ai,
    Retag,
    Import,
    Other(String),
}

impl LinkSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Manual => "manual",
            Self::Bulk => "bulk",
            Self::Ai => "ai",
            Self::Retag => "retag",
            Self::Import => "import",
            Self::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            "bulk" => Self::Bulk,
            "ai" => Self::Ai,
            "retag" => Self::Retag,
            "import" => Self::Import,
            other => Self::Other(other.to_string()),
        }
    }

    /// Links the engine itself created and may replace.
    pub fn is_automated(&self) -> bool {
        matches!(self, Self::Ai | Self::Retag)
    }
}

/// A tag currently attached to a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagLink {
    pub tag_id: String,
    pub source: LinkSource,
}

impl TagLink {
    pub fn new(tag_id: impl Into<String>, source: LinkSource) -> Self {
        Self {
            tag_id: tag_id.into(),
            source,
        }
    }
}

/// Transactional replacement of managed tag links on one conversation.
#[derive(Debug, Clone)]
pub struct TagReplacement {
    pub workspace_id: String,
    pub conversation_id: String,
    /// Tag ids eligible for deletion.
    pub scope: Vec<String>,
    /// Only delete links whose source is `ai`/`retag`.
    pub only_automated: bool,
    /// Tag ids to upsert.
    pub insert: Vec<String>,
    /// Source stamped on inserted links.
    pub source: LinkSource,
    /// Lead status to write alongside the tags.
    pub lead_status: Option<LeadStatus>,
}

/// Bookkeeping written after every classification (both modes).
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationMetadata {
    pub classified_at: DateTime<Utc>,
    /// `None` leaves the stored confidence untouched.
    pub phase_confidence: Option<u8>,
    pub temperature_confidence: Option<u8>,
    pub reason: String,
    pub mode: String,
    pub run_source: String,
}

// ── Runs ────────────────────────────────────────────────────────────

/// What triggered a run; decides candidate-selection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    /// New activity from a message sync.
    Incremental,
    /// Scheduled sweep for anything missed.
    Catchup,
    /// One-time historical classification.
    Backfill,
    /// User-initiated re-run.
    ManualRephase,
}

impl RunSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Catchup => "catchup",
            Self::Backfill => "backfill",
            Self::ManualRephase => "manual_rephase",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incremental" => Some(Self::Incremental),
            "catchup" => Some(Self::Catchup),
            "backfill" => Some(Self::Backfill),
            "manual_rephase" | "manual" => Some(Self::ManualRephase),
            _ => None,
        }
    }
}

/// Role of whoever triggered a run, already authorised by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Owner,
    Admin,
    Member,
    Setter,
    /// Webhooks and scheduled sweeps.
    #[default]
    System,
}

/// Maximum per-candidate error messages kept on a summary.
pub const MAX_ERROR_MESSAGES: usize = 20;

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub workspace_id: String,
    pub source: RunSource,
    pub mode: String,
    pub candidates: u32,
    pub applied: u32,
    pub shadowed: u32,
    pub skipped_manual: u32,
    pub skipped_low_confidence: u32,
    pub skipped_other: u32,
    pub errors: u32,
    pub error_messages: Vec<String>,
    pub lock_acquired: bool,
    pub skipped_reason: Option<String>,
    /// Top-level failure, also written to `last_error`.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn new(workspace_id: impl Into<String>, source: RunSource, mode: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            source,
            mode: mode.to_string(),
            candidates: 0,
            applied: 0,
            shadowed: 0,
            skipped_manual: 0,
            skipped_low_confidence: 0,
            skipped_other: 0,
            errors: 0,
            error_messages: Vec::new(),
            lock_acquired: false,
            skipped_reason: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record a per-candidate failure.
    pub fn push_error(&mut self, conversation_id: &str, message: impl std::fmt::Display) {
        self.errors += 1;
        if self.error_messages.len() < MAX_ERROR_MESSAGES {
            self.error_messages.push(format!("{conversation_id}: {message}"));
        }
    }

    /// Mark as skipped and finished.
    pub fn skip(mut self, reason: &str) -> Self {
        self.skipped_reason = Some(reason.to_string());
        self.finished_at = Some(Utc::now());
        self
    }
}

// ── Audit ───────────────────────────────────────────────────────────

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub workspace_id: String,
    pub conversation_id: Option<String>,
    pub action: String,
    pub actor_user_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        workspace_id: impl Into<String>,
        conversation_id: Option<&str>,
        action: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            conversation_id: conversation_id.map(str::to_string),
            action: action.into(),
            actor_user_id: None,
            details,
            created_at: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor_user_id: Option<&str>) -> Self {
        self.actor_user_id = actor_user_id.map(str::to_string);
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn staleness_rules() {
        let now = Utc::now();
        let mut thread = ConversationThread::new("ws", "c1", now - Duration::days(3));
        assert!(thread.is_stale(), "never classified");

        thread.ai_phase_updated_at = Some(now - Duration::hours(2));
        assert!(!thread.is_stale(), "classified, no messages");

        thread.last_message_at = Some(now - Duration::hours(1));
        assert!(thread.is_stale(), "new message after classification");

        thread.last_message_at = Some(now - Duration::hours(3));
        assert!(!thread.is_stale());
    }

    #[test]
    fn link_source_parsing_preserves_unknown() {
        assert_eq!(LinkSource::parse("ai"), LinkSource::Ai);
        assert!(LinkSource::parse("retag").is_automated());
        assert!(!LinkSource::parse("manual").is_automated());
        let other = LinkSource::parse("zapier");
        assert_eq!(other.as_str(), "zapier");
        assert!(!other.is_automated());
    }

    #[test]
    fn blank_prompt_is_not_a_prompt() {
        assert!(!TagDefinition::new("t", "Won").with_prompt("   ").has_prompt());
        assert!(TagDefinition::new("t", "Won").with_prompt("Paid").has_prompt());
    }
}
