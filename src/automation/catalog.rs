//! Tag catalog: partitions a workspace's tags into phase, temperature and
//! excluded categories and projects phase tags onto funnel stage keys.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::automation::model::{LeadStatus, TagDefinition, TagLink};
use crate::error::DatabaseError;
use crate::store::Database;

/// Funnel stages the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKey {
    NewLead,
    InContact,
    Qualified,
    Unqualified,
    CallBooked,
    Won,
    NoShow,
}

/// Pipeline order; a later entry outranks an earlier one.
pub const STAGE_PRIORITY: [StageKey; 7] = [
    StageKey::NewLead,
    StageKey::InContact,
    StageKey::Qualified,
    StageKey::Unqualified,
    StageKey::CallBooked,
    StageKey::Won,
    StageKey::NoShow,
];

impl StageKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewLead => "new_lead",
            Self::InContact => "in_contact",
            Self::Qualified => "qualified",
            Self::Unqualified => "unqualified",
            Self::CallBooked => "call_booked",
            Self::Won => "won",
            Self::NoShow => "no_show",
        }
    }

    /// Position in `STAGE_PRIORITY`.
    pub fn rank(&self) -> usize {
        STAGE_PRIORITY
            .iter()
            .position(|k| k == self)
            .unwrap_or_default()
    }

    /// Map a normalized tag name to a stage.
    pub fn from_normalized(name: &str) -> Option<Self> {
        let key = match name {
            "new lead" | "new leads" | "new" | "lead" | "fresh lead" => Self::NewLead,
            "in contact" | "contacted" | "engaged" | "in conversation" | "responded"
            | "replied" | "talking" => Self::InContact,
            "qualified" | "qualified lead" | "sql" | "mql" => Self::Qualified,
            "unqualified" | "disqualified" | "not qualified" | "not a fit" | "lost"
            | "closed lost" => Self::Unqualified,
            "call booked" | "booked" | "booked call" | "meeting booked" | "appointment booked"
            | "call scheduled" | "meeting scheduled" | "appointment set" => Self::CallBooked,
            "won" | "closed won" | "closed" | "customer" | "client" | "deal won" => Self::Won,
            "no show" | "noshow" | "no showed" | "missed call" => Self::NoShow,
            _ => return None,
        };
        Some(key)
    }

    /// Lead status implied by this stage.
    pub fn lead_status(&self) -> LeadStatus {
        match self {
            Self::Qualified => LeadStatus::Qualified,
            Self::Unqualified => LeadStatus::Disqualified,
            _ => LeadStatus::Open,
        }
    }
}

/// Temperature levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureKey {
    Cold,
    Warm,
    Hot,
}

impl TemperatureKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Hot => "hot",
        }
    }

    pub fn from_normalized(name: &str) -> Option<Self> {
        let base = name.strip_suffix(" lead").unwrap_or(name);
        match base {
            "hot" => Some(Self::Hot),
            "warm" => Some(Self::Warm),
            "cold" => Some(Self::Cold),
            _ => None,
        }
    }
}

/// Which bucket a tag falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagCategory {
    Phase,
    Temperature,
    /// Administrative labels never assigned by automation.
    Excluded,
}

const EXCLUDED_NAMES: &[&str] = &[
    "spam",
    "vip",
    "follow up",
    "followup",
    "do not contact",
    "dnc",
    "archived",
    "important",
    "blocked",
];

/// Lowercase, map separators to spaces, drop punctuation/emoji, collapse whitespace.
pub fn normalize_tag_name(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| match c {
            '_' | '-' | '.' | '/' => ' ',
            c if c.is_alphanumeric() || c.is_whitespace() => c,
            _ => ' ',
        })
        .collect::<String>()
        .to_lowercase();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Categorize a raw tag name.
pub fn categorize(name: &str) -> TagCategory {
    let normalized = normalize_tag_name(name);
    if TemperatureKey::from_normalized(&normalized).is_some() {
        return TagCategory::Temperature;
    }
    if normalized.contains("priority") || EXCLUDED_NAMES.contains(&normalized.as_str()) {
        return TagCategory::Excluded;
    }
    TagCategory::Phase
}

/// A workspace's tag taxonomy, projected for the engine.
#[derive(Debug, Clone, Default)]
pub struct TagCatalog {
    tags: BTreeMap<String, TagDefinition>,
    pub phase_tags: Vec<TagDefinition>,
    pub temperature_tags: Vec<TagDefinition>,
    pub phase_key_by_tag_id: HashMap<String, StageKey>,
    pub temperature_key_by_tag_id: HashMap<String, TemperatureKey>,
    pub new_lead_tag_id: Option<String>,
    pub in_contact_tag_id: Option<String>,
    /// Phase + temperature tag ids: the set automation may add or remove.
    pub managed_tag_ids: BTreeSet<String>,
}

impl TagCatalog {
    /// Load and project a workspace's tags.
    pub async fn load(db: &dyn Database, workspace_id: &str) -> Result<Self, DatabaseError> {
        let tags = db.list_tags(workspace_id).await?;
        Ok(Self::from_tags(tags))
    }

    /// Build a catalog from tag definitions. Input order does not matter.
    pub fn from_tags(mut tags: Vec<TagDefinition>) -> Self {
        tags.sort_by(|a, b| a.id.cmp(&b.id));
        tags.dedup_by(|a, b| a.id == b.id);

        let mut catalog = Self::default();
        for tag in tags {
            let normalized = normalize_tag_name(&tag.name);
            match categorize(&tag.name) {
                TagCategory::Excluded => {}
                TagCategory::Temperature => {
                    if let Some(key) = TemperatureKey::from_normalized(&normalized) {
                        catalog.temperature_key_by_tag_id.insert(tag.id.clone(), key);
                    }
                    catalog.managed_tag_ids.insert(tag.id.clone());
                    catalog.temperature_tags.push(tag.clone());
                }
                TagCategory::Phase => {
                    if let Some(key) = StageKey::from_normalized(&normalized) {
                        catalog.phase_key_by_tag_id.insert(tag.id.clone(), key);
                        // First (lowest id) wins
                        match key {
                            StageKey::NewLead if catalog.new_lead_tag_id.is_none() => {
                                catalog.new_lead_tag_id = Some(tag.id.clone());
                            }
                            StageKey::InContact if catalog.in_contact_tag_id.is_none() => {
                                catalog.in_contact_tag_id = Some(tag.id.clone());
                            }
                            _ => {}
                        }
                    }
                    catalog.managed_tag_ids.insert(tag.id.clone());
                    catalog.phase_tags.push(tag.clone());
                }
            }
            catalog.tags.insert(tag.id.clone(), tag);
        }
        catalog
    }

    pub fn tag(&self, tag_id: &str) -> Option<&TagDefinition> {
        self.tags.get(tag_id)
    }

    pub fn is_phase(&self, tag_id: &str) -> bool {
        self.phase_tags.iter().any(|t| t.id == tag_id)
    }

    pub fn is_temperature(&self, tag_id: &str) -> bool {
        self.temperature_tags.iter().any(|t| t.id == tag_id)
    }

    pub fn is_managed(&self, tag_id: &str) -> bool {
        self.managed_tag_ids.contains(tag_id)
    }

    pub fn stage_key(&self, tag_id: &str) -> Option<StageKey> {
        self.phase_key_by_tag_id.get(tag_id).copied()
    }

    /// First phase tag (by id) mapped to `key`.
    pub fn phase_tag_for(&self, key: StageKey) -> Option<&str> {
        self.phase_tags
            .iter()
            .find(|t| self.stage_key(&t.id) == Some(key))
            .map(|t| t.id.as_str())
    }

    /// First temperature tag (by id) mapped to `key`.
    pub fn temperature_tag_for(&self, key: TemperatureKey) -> Option<&str> {
        self.temperature_tags
            .iter()
            .find(|t| self.temperature_key_by_tag_id.get(&t.id) == Some(&key))
            .map(|t| t.id.as_str())
    }

    /// Phase ids, plus temperature ids when `with_temperature`.
    pub fn managed_scope(&self, with_temperature: bool) -> Vec<String> {
        let mut scope: Vec<String> = self.phase_tags.iter().map(|t| t.id.clone()).collect();
        if with_temperature {
            scope.extend(self.temperature_tags.iter().map(|t| t.id.clone()));
        }
        scope
    }

    /// Current phase and temperature from a conversation's links.
    pub fn current_tags(&self, links: &[TagLink]) -> CurrentTags {
        let ids: Vec<&str> = links.iter().map(|l| l.tag_id.as_str()).collect();
        CurrentTags {
            phase_tag_id: pick_highest_priority_phase_id(ids.iter().copied(), self),
            temperature_tag_id: pick_temperature_id(ids.iter().copied(), self),
        }
    }
}

/// The resolved current phase/temperature of a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentTags {
    pub phase_tag_id: Option<String>,
    pub temperature_tag_id: Option<String>,
}

/// Resolve one current phase from possibly several linked phase tags.
///
/// The furthest pipeline stage wins; ties between tags of the same stage go
/// to the smallest id. When no linked phase tag has a stage key, the smallest
/// linked phase id is returned, so the result is never `None` while phase
/// links exist.
pub fn pick_highest_priority_phase_id<'a>(
    tag_ids: impl IntoIterator<Item = &'a str>,
    catalog: &TagCatalog,
) -> Option<String> {
    let mut phase_ids: Vec<&str> = tag_ids
        .into_iter()
        .filter(|id| catalog.is_phase(id))
        .collect();
    phase_ids.sort_unstable();
    phase_ids.dedup();

    let mut best: Option<(usize, &str)> = None;
    for &id in &phase_ids {
        if let Some(key) = catalog.stage_key(id) {
            let rank = key.rank();
            if best.is_none_or(|(r, _)| rank > r) {
                best = Some((rank, id));
            }
        }
    }

    best.map(|(_, id)| id)
        .or_else(|| phase_ids.first().copied())
        .map(str::to_string)
}

/// Resolve one current temperature: hot > warm > cold, then smallest id.
pub fn pick_temperature_id<'a>(
    tag_ids: impl IntoIterator<Item = &'a str>,
    catalog: &TagCatalog,
) -> Option<String> {
    let mut temp_ids: Vec<&str> = tag_ids
        .into_iter()
        .filter(|id| catalog.is_temperature(id))
        .collect();
    temp_ids.sort_unstable();
    temp_ids.dedup();

    temp_ids
        .iter()
        .copied()
        .max_by(|a, b| {
            let ka = catalog.temperature_key_by_tag_id.get(*a);
            let kb = catalog.temperature_key_by_tag_id.get(*b);
            // Reverse id order so the smallest id wins among equals
            ka.cmp(&kb).then_with(|| b.cmp(a))
        })
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::model::LinkSource;

    fn sample_tags() -> Vec<TagDefinition> {
        vec![
            TagDefinition::new("t-won", "Closed Won"),
            TagDefinition::new("t-new", "New Lead"),
            TagDefinition::new("t-contact", "in_contact"),
            TagDefinition::new("t-booked", "📞 Call-Booked"),
            TagDefinition::new("t-qual", "Qualified"),
            TagDefinition::new("t-hot", "🔥 Hot"),
            TagDefinition::new("t-cold", "Cold Lead"),
            TagDefinition::new("t-prio", "High Priority"),
            TagDefinition::new("t-spam", "SPAM"),
            TagDefinition::new("t-custom", "Waiting on Docs"),
        ]
    }

    #[test]
    fn normalization_is_separator_insensitive() {
        assert_eq!(normalize_tag_name("  Call_Booked "), "call booked");
        assert_eq!(normalize_tag_name("No-Show"), "no show");
        assert_eq!(normalize_tag_name("🔥 HOT"), "hot");
        assert_eq!(normalize_tag_name("new.lead"), "new lead");
    }

    #[test]
    fn categories_are_disjoint() {
        let catalog = TagCatalog::from_tags(sample_tags());
        assert!(catalog.is_temperature("t-hot"));
        assert!(catalog.is_temperature("t-cold"));
        assert!(!catalog.is_managed("t-prio"));
        assert!(!catalog.is_managed("t-spam"));
        assert!(catalog.is_phase("t-custom"));
        assert_eq!(catalog.stage_key("t-custom"), None);
        assert_eq!(catalog.stage_key("t-booked"), Some(StageKey::CallBooked));
        assert_eq!(catalog.stage_key("t-won"), Some(StageKey::Won));
        assert_eq!(catalog.managed_tag_ids.len(), 8);
    }

    #[test]
    fn special_ids_resolved() {
        let catalog = TagCatalog::from_tags(sample_tags());
        assert_eq!(catalog.new_lead_tag_id.as_deref(), Some("t-new"));
        assert_eq!(catalog.in_contact_tag_id.as_deref(), Some("t-contact"));
    }

    #[test]
    fn catalog_is_deterministic_regardless_of_order() {
        let mut reversed = sample_tags();
        reversed.reverse();
        let a = TagCatalog::from_tags(sample_tags());
        let b = TagCatalog::from_tags(reversed);
        assert_eq!(a.phase_tags, b.phase_tags);
        assert_eq!(a.managed_tag_ids, b.managed_tag_ids);
        assert_eq!(a.new_lead_tag_id, b.new_lead_tag_id);
    }

    #[test]
    fn later_stage_wins() {
        let catalog = TagCatalog::from_tags(sample_tags());
        let picked = pick_highest_priority_phase_id(["t-new", "t-booked", "t-contact"], &catalog);
        assert_eq!(picked.as_deref(), Some("t-booked"));
    }

    #[test]
    fn unmapped_phase_is_stable_fallback() {
        let catalog = TagCatalog::from_tags(sample_tags());
        let picked = pick_highest_priority_phase_id(["t-custom", "t-hot"], &catalog);
        assert_eq!(picked.as_deref(), Some("t-custom"));
        assert_eq!(pick_highest_priority_phase_id(["t-hot"], &catalog), None);
    }

    #[test]
    fn temperature_pick_prefers_hot() {
        let catalog = TagCatalog::from_tags(sample_tags());
        assert_eq!(
            pick_temperature_id(["t-cold", "t-hot"], &catalog).as_deref(),
            Some("t-hot")
        );
    }

    #[test]
    fn current_tags_from_links() {
        let catalog = TagCatalog::from_tags(sample_tags());
        let links = vec![
            TagLink::new("t-qual", LinkSource::Ai),
            TagLink::new("t-new", LinkSource::Manual),
            TagLink::new("t-cold", LinkSource::Ai),
            TagLink::new("t-prio", LinkSource::Manual),
        ];
        let current = catalog.current_tags(&links);
        assert_eq!(current.phase_tag_id.as_deref(), Some("t-qual"));
        assert_eq!(current.temperature_tag_id.as_deref(), Some("t-cold"));
    }
}
