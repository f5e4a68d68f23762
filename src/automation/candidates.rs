//! Candidate selection: which conversations a run should classify.

use std::collections::HashSet;

use tracing::debug;

use crate::automation::model::{ConversationThread, Direction, LeadStatus, RunSource};
use crate::automation::settings::{AutomationSettings, HistoricalPolicy};
use crate::error::DatabaseError;
use crate::store::Database;

/// Threads fetched per page while scanning.
pub const PAGE_SIZE: u64 = 200;

/// Default candidate cap for a run source.
pub fn default_max_for(source: RunSource, settings: &AutomationSettings) -> usize {
    settings.max_conversations_for(source)
}

/// Whether a thread qualifies for a non-explicit run of `source`.
pub fn is_eligible(
    thread: &ConversationThread,
    settings: &AutomationSettings,
    source: RunSource,
) -> bool {
    if thread.lead_status == LeadStatus::Removed || thread.is_spam {
        return false;
    }

    match source {
        RunSource::Backfill => {
            settings.historical_policy == HistoricalPolicy::AutoCatchup
                && thread.ai_phase_updated_at.is_none()
        }
        RunSource::Catchup => {
            if !thread.is_stale() {
                return false;
            }
            if thread.ai_phase_updated_at.is_none()
                && settings.historical_policy == HistoricalPolicy::ManualBacklogOnly
            {
                // Backlog from before automation was switched on stays manual
                return settings
                    .enabled_at
                    .is_some_and(|enabled_at| thread.created_at >= enabled_at);
            }
            true
        }
        RunSource::Incremental | RunSource::ManualRephase => {
            thread.is_stale()
                && (settings.classify_on_any_message
                    || thread.last_message_direction == Some(Direction::Inbound))
        }
    }
}

/// Select up to `max_count` candidates for a run.
///
/// Explicit ids bypass the staleness rules but still drop removed threads
/// and unknown ids. Otherwise active threads are scanned most recent first.
pub async fn select(
    db: &dyn Database,
    settings: &AutomationSettings,
    source: RunSource,
    max_count: usize,
    explicit_ids: Option<&[String]>,
) -> Result<Vec<ConversationThread>, DatabaseError> {
    let workspace_id = settings.workspace_id.as_str();
    if max_count == 0 {
        return Ok(Vec::new());
    }

    if let Some(ids) = explicit_ids {
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for id in ids {
            if selected.len() >= max_count {
                break;
            }
            if !seen.insert(id.as_str()) {
                continue;
            }
            match db.get_thread(workspace_id, id).await? {
                Some(thread) if thread.lead_status != LeadStatus::Removed => selected.push(thread),
                Some(_) => debug!(workspace = %workspace_id, conversation = %id, "Skipping removed conversation"),
                None => debug!(workspace = %workspace_id, conversation = %id, "Explicit conversation not found"),
            }
        }
        return Ok(selected);
    }

    if source == RunSource::Backfill
        && settings.historical_policy == HistoricalPolicy::ManualBacklogOnly
    {
        return Ok(Vec::new());
    }

    let mut selected = Vec::new();
    let mut offset = 0;
    loop {
        let page = db
            .list_active_threads(workspace_id, offset, PAGE_SIZE)
            .await?;
        let page_len = page.len() as u64;

        for thread in page {
            if is_eligible(&thread, settings, source) {
                selected.push(thread);
                if selected.len() >= max_count {
                    return Ok(selected);
                }
            }
        }

        if page_len < PAGE_SIZE {
            break;
        }
        offset += page_len;
    }

    debug!(
        workspace = %workspace_id,
        source = source.as_str(),
        selected = selected.len(),
        "Candidate scan exhausted"
    );
    Ok(selected)
}
