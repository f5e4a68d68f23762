//! Lead Phase: automated funnel-phase tagging for lead conversations.

pub mod automation;
pub mod config;
pub mod error;
pub mod llm;
pub mod retag;
pub mod store;
pub mod sweep;
