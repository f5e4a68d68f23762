//! Retag job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a retag job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetagStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RetagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A persisted, resumable bulk reclassification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetagJob {
    pub id: String,
    pub workspace_id: String,
    /// `None` retags against every prompted phase tag.
    pub tag_id: Option<String>,
    pub only_last_30_days: bool,
    pub status: RetagStatus,
    pub progress_total: u64,
    pub progress_done: u64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RetagJob {
    pub fn new(
        workspace_id: impl Into<String>,
        tag_id: Option<String>,
        only_last_30_days: bool,
        progress_total: u64,
        created_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            tag_id,
            only_last_30_days,
            status: RetagStatus::Queued,
            progress_total,
            progress_done: 0,
            message: None,
            error: None,
            created_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// No tag filter and no activity window; the weekly-limited kind.
    pub fn is_full_scope(&self) -> bool {
        self.tag_id.is_none() && !self.only_last_30_days
    }

    /// Advance the cursor, never past the total and never backwards.
    pub fn advance(&mut self, processed: u64) {
        self.progress_done = self
            .progress_done
            .saturating_add(processed)
            .min(self.progress_total);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = RetagStatus::Completed;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        self.status = RetagStatus::Failed;
        self.message = Some(reason.clone());
        self.error = Some(reason);
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}

/// Parameters for starting a retag job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetagRequest {
    pub tag_id: Option<String>,
    pub only_last_30_days: bool,
    pub actor_user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_bounded_and_monotonic() {
        let mut job = RetagJob::new("ws", None, false, 10, None, Utc::now());
        job.advance(4);
        assert_eq!(job.progress_done, 4);
        job.advance(25);
        assert_eq!(job.progress_done, 10);
        job.advance(0);
        assert_eq!(job.progress_done, 10);
    }

    #[test]
    fn scope_detection() {
        let now = Utc::now();
        assert!(RetagJob::new("ws", None, false, 0, None, now).is_full_scope());
        assert!(!RetagJob::new("ws", None, true, 0, None, now).is_full_scope());
        assert!(!RetagJob::new("ws", Some("t".into()), false, 0, None, now).is_full_scope());
    }
}
