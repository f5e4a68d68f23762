//! Enforcement applier: writes a decision's tags and lead status.

use tracing::debug;

use crate::automation::catalog::TagCatalog;
use crate::automation::model::{LeadStatus, LinkSource, TagReplacement};
use crate::automation::policy::Decision;
use crate::automation::settings::AutomationSettings;
use crate::error::DatabaseError;
use crate::store::Database;

/// One enforcement write.
#[derive(Debug, Clone, Copy)]
pub struct Enforcement<'a> {
    pub workspace_id: &'a str,
    pub conversation_id: &'a str,
    pub settings: &'a AutomationSettings,
    pub catalog: &'a TagCatalog,
    pub decision: &'a Decision,
    /// Stamped on inserted links.
    pub source: &'a LinkSource,
    /// Leave human-applied links in place.
    pub only_automated: bool,
}

impl Enforcement<'_> {
    /// The link replacement this enforcement performs.
    pub fn replacement(&self) -> TagReplacement {
        let with_temperature = self.settings.apply_temperature;

        let mut insert = Vec::new();
        if let Some(ref phase) = self.decision.target_phase_tag_id {
            insert.push(phase.clone());
        }
        if with_temperature && let Some(ref temperature) = self.decision.target_temperature_tag_id {
            insert.push(temperature.clone());
        }

        let lead_status = self.decision.target_phase_tag_id.as_deref().map(|id| {
            self.catalog
                .stage_key(id)
                .map(|key| key.lead_status())
                .unwrap_or(LeadStatus::Open)
        });

        TagReplacement {
            workspace_id: self.workspace_id.to_string(),
            conversation_id: self.conversation_id.to_string(),
            scope: self.catalog.managed_scope(with_temperature),
            only_automated: self.only_automated,
            insert,
            source: self.source.clone(),
            lead_status,
        }
    }
}

/// Replace managed links and lead status in one transaction.
///
/// Removed threads keep their status; the store enforces that.
pub async fn apply(db: &dyn Database, enforcement: &Enforcement<'_>) -> Result<(), DatabaseError> {
    let replacement = enforcement.replacement();
    db.replace_tag_links(&replacement).await?;
    debug!(
        workspace = %enforcement.workspace_id,
        conversation = %enforcement.conversation_id,
        phase = ?enforcement.decision.target_phase_tag_id,
        temperature = ?enforcement.decision.target_temperature_tag_id,
        "Decision enforced"
    );
    Ok(())
}
