//! Phase automation: settings, catalog projection, candidate selection,
//! classification, decision policy and the run orchestrator that ties them
//! together.

pub mod applier;
pub mod audit;
pub mod candidates;
pub mod catalog;
pub mod classifier;
pub mod heuristic;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod settings;

pub use catalog::{StageKey, TagCatalog, TemperatureKey};
pub use classifier::{AnswerSpace, ClassificationOutput, Classifier};
pub use lock::{LeaseToken, WorkspaceLock};
pub use model::{ActorRole, RunSource, RunSummary};
pub use orchestrator::{Orchestrator, RunRequest};
pub use policy::{Decision, DecisionInput, decide};
pub use settings::{AutomationMode, AutomationSettings, SettingsPatch, SettingsStore};
