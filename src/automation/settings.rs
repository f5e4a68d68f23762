//! Per-workspace automation settings with lenient, clamped patching.
//!
//! Every workspace gets a settings row on first read. Patches only touch the
//! keys they carry; out-of-range numbers are clamped and unknown enum strings
//! fall back to the safe default, so one bad field never rejects a patch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::automation::model::RunSource;
use crate::error::DatabaseError;
use crate::store::Database;

pub const MIN_CONFIDENCE_RANGE: (i64, i64) = (0, 100);
pub const INCREMENTAL_MAX_RANGE: (i64, i64) = (1, 200);
pub const CATCHUP_MAX_RANGE: (i64, i64) = (1, 1000);
pub const NEW_LEAD_WINDOW_RANGE: (i64, i64) = (1, 720);

/// Whether decisions are applied or only recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    #[default]
    Shadow,
    Enforce,
}

impl AutomationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shadow => "shadow",
            Self::Enforce => "enforce",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "enforce" => Self::Enforce,
            _ => Self::Shadow,
        }
    }
}

/// How conversations that predate automation are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoricalPolicy {
    /// Old conversations are only classified on an explicit manual run.
    #[default]
    ManualBacklogOnly,
    /// Backfill and catchup sweep the whole history.
    AutoCatchup,
}

impl HistoricalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualBacklogOnly => "manual_backlog_only",
            Self::AutoCatchup => "auto_catchup",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto_catchup" => Self::AutoCatchup,
            _ => Self::ManualBacklogOnly,
        }
    }
}

/// Preference for low-confidence results on conversations that already have a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertainExistingPhase {
    InContact,
    #[default]
    KeepCurrent,
}

impl UncertainExistingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InContact => "in_contact",
            Self::KeepCurrent => "keep_current",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_contact" => Self::InContact,
            _ => Self::KeepCurrent,
        }
    }
}

/// Progress of the one-time historical backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    #[default]
    Pending,
    Running,
    Completed,
}

impl BackfillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Pending,
        }
    }
}

/// Automation configuration for one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationSettings {
    pub workspace_id: String,
    pub enabled: bool,
    pub mode: AutomationMode,
    pub historical_policy: HistoricalPolicy,
    /// Stamped the first time automation is enabled; never reset.
    pub enabled_at: Option<DateTime<Utc>>,
    pub min_confidence: u8,
    pub incremental_max_conversations: u32,
    pub catchup_max_conversations: u32,
    pub classify_on_any_message: bool,
    pub apply_temperature: bool,
    pub manual_lock_enabled: bool,
    pub uncertain_new_lead_window_hours: u32,
    pub uncertain_existing_phase: UncertainExistingPhase,
    pub allow_setter_trigger: bool,
    pub backfill_state: BackfillState,
    pub backfill_completed_at: Option<DateTime<Utc>>,
    pub last_incremental_run_at: Option<DateTime<Utc>>,
    pub last_catchup_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationSettings {
    /// Documented defaults for a workspace that has never been configured.
    pub fn defaults(workspace_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            enabled: false,
            mode: AutomationMode::Shadow,
            historical_policy: HistoricalPolicy::ManualBacklogOnly,
            enabled_at: None,
            min_confidence: 70,
            incremental_max_conversations: 25,
            catchup_max_conversations: 200,
            classify_on_any_message: false,
            apply_temperature: true,
            manual_lock_enabled: true,
            uncertain_new_lead_window_hours: 24,
            uncertain_existing_phase: UncertainExistingPhase::KeepCurrent,
            allow_setter_trigger: false,
            backfill_state: BackfillState::Pending,
            backfill_completed_at: None,
            last_incremental_run_at: None,
            last_catchup_run_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply only the keys present in `patch`.
    pub fn apply_patch(&mut self, patch: &SettingsPatch, now: DateTime<Utc>) {
        if let Some(enabled) = patch.enabled {
            if enabled && !self.enabled && self.enabled_at.is_none() {
                self.enabled_at = Some(now);
            }
            self.enabled = enabled;
        }
        if let Some(ref mode) = patch.mode {
            self.mode = AutomationMode::parse_lenient(mode);
        }
        if let Some(ref policy) = patch.historical_policy {
            self.historical_policy = HistoricalPolicy::parse_lenient(policy);
        }
        if let Some(v) = patch.min_confidence {
            self.min_confidence = clamp(v, MIN_CONFIDENCE_RANGE) as u8;
        }
        if let Some(v) = patch.incremental_max_conversations {
            self.incremental_max_conversations = clamp(v, INCREMENTAL_MAX_RANGE) as u32;
        }
        if let Some(v) = patch.catchup_max_conversations {
            self.catchup_max_conversations = clamp(v, CATCHUP_MAX_RANGE) as u32;
        }
        if let Some(v) = patch.classify_on_any_message {
            self.classify_on_any_message = v;
        }
        if let Some(v) = patch.apply_temperature {
            self.apply_temperature = v;
        }
        if let Some(v) = patch.manual_lock_enabled {
            self.manual_lock_enabled = v;
        }
        if let Some(v) = patch.uncertain_new_lead_window_hours {
            self.uncertain_new_lead_window_hours = clamp(v, NEW_LEAD_WINDOW_RANGE) as u32;
        }
        if let Some(ref v) = patch.uncertain_existing_phase {
            self.uncertain_existing_phase = UncertainExistingPhase::parse_lenient(v);
        }
        if let Some(v) = patch.allow_setter_trigger {
            self.allow_setter_trigger = v;
        }
        if let Some(ref v) = patch.backfill_state {
            self.backfill_state = BackfillState::parse_lenient(v);
        }
        self.updated_at = now;
    }

    /// Default candidate cap for a run source.
    pub fn max_conversations_for(&self, source: RunSource) -> usize {
        match source {
            RunSource::Incremental | RunSource::ManualRephase => {
                self.incremental_max_conversations as usize
            }
            RunSource::Catchup | RunSource::Backfill => self.catchup_max_conversations as usize,
        }
    }
}

fn clamp(value: i64, (lo, hi): (i64, i64)) -> i64 {
    value.clamp(lo, hi)
}

/// A partial settings update. Absent keys are left unchanged.
///
/// Enum fields stay raw strings so unknown values degrade to defaults at
/// apply time instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub enabled: Option<bool>,
    pub mode: Option<String>,
    pub historical_policy: Option<String>,
    pub min_confidence: Option<i64>,
    pub incremental_max_conversations: Option<i64>,
    pub catchup_max_conversations: Option<i64>,
    pub classify_on_any_message: Option<bool>,
    pub apply_temperature: Option<bool>,
    pub manual_lock_enabled: Option<bool>,
    pub uncertain_new_lead_window_hours: Option<i64>,
    pub uncertain_existing_phase: Option<String>,
    pub allow_setter_trigger: Option<bool>,
    pub backfill_state: Option<String>,
}

impl SettingsPatch {
    /// Read a patch from a loosely typed JSON object.
    ///
    /// Accepts camelCase or snake_case keys. Values of the wrong type are
    /// treated as absent rather than failing the whole patch.
    pub fn from_json(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        let field = |snake: &str, camel: &str| obj.get(snake).or_else(|| obj.get(camel));

        Self {
            enabled: field("enabled", "enabled").and_then(lenient_bool),
            mode: field("mode", "mode").and_then(lenient_string),
            historical_policy: field("historical_policy", "historicalPolicy")
                .and_then(lenient_string),
            min_confidence: field("min_confidence", "minConfidence").and_then(lenient_int),
            incremental_max_conversations: field(
                "incremental_max_conversations",
                "incrementalMaxConversations",
            )
            .and_then(lenient_int),
            catchup_max_conversations: field(
                "catchup_max_conversations",
                "catchupMaxConversations",
            )
            .and_then(lenient_int),
            classify_on_any_message: field("classify_on_any_message", "classifyOnAnyMessage")
                .and_then(lenient_bool),
            apply_temperature: field("apply_temperature", "applyTemperature")
                .and_then(lenient_bool),
            manual_lock_enabled: field("manual_lock_enabled", "manualLockEnabled")
                .and_then(lenient_bool),
            uncertain_new_lead_window_hours: field(
                "uncertain_new_lead_window_hours",
                "uncertainNewLeadWindowHours",
            )
            .and_then(lenient_int),
            uncertain_existing_phase: field("uncertain_existing_phase", "uncertainExistingPhase")
                .and_then(lenient_string),
            allow_setter_trigger: field("allow_setter_trigger", "allowSetterTrigger")
                .and_then(lenient_bool),
            backfill_state: field("backfill_state", "backfillState").and_then(lenient_string),
        }
    }
}

fn lenient_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn lenient_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f.round() as i64)),
        _ => None,
    }
}

fn lenient_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// Settings access for one store, injected into every component that needs it.
#[derive(Clone)]
pub struct SettingsStore {
    db: Arc<dyn Database>,
}

impl SettingsStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Load settings, creating the default row on first access.
    pub async fn get(&self, workspace_id: &str) -> Result<AutomationSettings, DatabaseError> {
        if let Some(settings) = self.db.get_automation_settings(workspace_id).await? {
            return Ok(settings);
        }

        let defaults = AutomationSettings::defaults(workspace_id, Utc::now());
        let inserted = self.db.insert_automation_settings(&defaults).await?;
        if inserted {
            debug!(workspace = %workspace_id, "Created default automation settings");
        }

        // A concurrent insert may have won; the stored row is authoritative
        self.db
            .get_automation_settings(workspace_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "automation_settings".into(),
                id: workspace_id.to_string(),
            })
    }

    /// Apply a patch and persist.
    pub async fn set(
        &self,
        workspace_id: &str,
        patch: &SettingsPatch,
    ) -> Result<AutomationSettings, DatabaseError> {
        let mut settings = self.get(workspace_id).await?;
        let was_enabled = settings.enabled;
        settings.apply_patch(patch, Utc::now());
        self.db.update_automation_settings(&settings).await?;

        if settings.enabled != was_enabled {
            info!(
                workspace = %workspace_id,
                enabled = settings.enabled,
                mode = settings.mode.as_str(),
                "Automation toggled"
            );
        }
        Ok(settings)
    }

    /// Persist run bookkeeping. `error = None` clears `last_error`.
    pub async fn record_run_outcome(
        &self,
        workspace_id: &str,
        source: RunSource,
        finished_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut settings = self.get(workspace_id).await?;
        match source {
            RunSource::Incremental | RunSource::ManualRephase => {
                settings.last_incremental_run_at = Some(finished_at);
            }
            RunSource::Catchup | RunSource::Backfill => {
                settings.last_catchup_run_at = Some(finished_at);
            }
        }
        settings.last_error = error.map(str::to_string);
        settings.updated_at = finished_at;
        self.db.update_automation_settings(&settings).await
    }

    /// Move the backfill state machine; completion is stamped once.
    pub async fn set_backfill_state(
        &self,
        workspace_id: &str,
        state: BackfillState,
    ) -> Result<(), DatabaseError> {
        let mut settings = self.get(workspace_id).await?;
        if settings.backfill_state == state {
            return Ok(());
        }
        let now = Utc::now();
        settings.backfill_state = state;
        if state == BackfillState::Completed && settings.backfill_completed_at.is_none() {
            settings.backfill_completed_at = Some(now);
        }
        settings.updated_at = now;
        self.db.update_automation_settings(&settings).await
    }

    /// Workspaces with automation turned on.
    pub async fn enabled_workspaces(&self) -> Result<Vec<String>, DatabaseError> {
        self.db.list_enabled_workspaces().await
    }
}
