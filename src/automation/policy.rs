//! Decision policy: turns a classification into target tags.
//!
//! Pure functions only; nothing here touches the store.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::automation::catalog::TagCatalog;
use crate::automation::classifier::ClassificationOutput;
use crate::automation::model::TagLink;
use crate::automation::settings::AutomationSettings;

/// Everything `decide` looks at.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub settings: &'a AutomationSettings,
    pub catalog: &'a TagCatalog,
    pub links: &'a [TagLink],
    pub output: &'a ClassificationOutput,
    /// Last message time, or creation time for silent threads.
    pub last_activity_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// What should be true of a conversation after this classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub current_phase_tag_id: Option<String>,
    pub current_temperature_tag_id: Option<String>,
    pub target_phase_tag_id: Option<String>,
    pub target_temperature_tag_id: Option<String>,
    pub low_confidence: bool,
    pub temperature_low_confidence: bool,
    pub locked: bool,
    pub phase_changed: bool,
    pub temperature_changed: bool,
}

impl Decision {
    pub fn changes_anything(&self) -> bool {
        self.phase_changed || self.temperature_changed
    }
}

/// A managed tag applied by a human (or import) pins the conversation.
pub fn is_manually_locked(
    settings: &AutomationSettings,
    catalog: &TagCatalog,
    links: &[TagLink],
) -> bool {
    settings.manual_lock_enabled
        && links
            .iter()
            .any(|link| catalog.is_managed(&link.tag_id) && !link.source.is_automated())
}

/// Decide target phase and temperature.
pub fn decide(input: DecisionInput<'_>) -> Decision {
    let DecisionInput {
        settings,
        catalog,
        links,
        output,
        last_activity_at,
        now,
    } = input;
    let current = catalog.current_tags(links);

    if is_manually_locked(settings, catalog, links) {
        return Decision {
            target_phase_tag_id: current.phase_tag_id.clone(),
            target_temperature_tag_id: current.temperature_tag_id.clone(),
            current_phase_tag_id: current.phase_tag_id,
            current_temperature_tag_id: current.temperature_tag_id,
            locked: true,
            ..Decision::default()
        };
    }

    let threshold = settings.min_confidence;

    // Phase
    let proposed_phase = output
        .phase_tag_id
        .as_deref()
        .filter(|id| catalog.is_phase(id));
    let low_confidence = output.phase_confidence < threshold;
    let target_phase_tag_id = match proposed_phase {
        Some(id) if !low_confidence => Some(id.to_string()),
        _ => current
            .phase_tag_id
            .clone()
            .or_else(|| uncertain_default(settings, catalog, last_activity_at, now)),
    };

    // Temperature
    let (target_temperature_tag_id, temperature_low_confidence) = if settings.apply_temperature {
        let proposed = output
            .temperature_tag_id
            .as_deref()
            .filter(|id| catalog.is_temperature(id));
        let low = output.temperature_confidence < threshold;
        match proposed {
            Some(id) if !low => (Some(id.to_string()), false),
            _ => (current.temperature_tag_id.clone(), low),
        }
    } else {
        (current.temperature_tag_id.clone(), false)
    };

    Decision {
        phase_changed: target_phase_tag_id.is_some()
            && target_phase_tag_id != current.phase_tag_id,
        temperature_changed: target_temperature_tag_id.is_some()
            && target_temperature_tag_id != current.temperature_tag_id,
        current_phase_tag_id: current.phase_tag_id,
        current_temperature_tag_id: current.temperature_tag_id,
        target_phase_tag_id,
        target_temperature_tag_id,
        low_confidence,
        temperature_low_confidence,
        locked: false,
    }
}

/// Phase for a conversation with no phase and no confident proposal.
fn uncertain_default(
    settings: &AutomationSettings,
    catalog: &TagCatalog,
    last_activity_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<String> {
    let window = Duration::hours(i64::from(settings.uncertain_new_lead_window_hours));
    let new_lead = catalog.new_lead_tag_id.clone();
    let in_contact = catalog.in_contact_tag_id.clone();

    if now - last_activity_at <= window {
        new_lead.or(in_contact)
    } else {
        in_contact.or(new_lead)
    }
}
