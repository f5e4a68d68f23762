//! Error types for Lead Phase.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),

    #[error("Retag error: {0}")]
    Retag(#[from] RetagError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Classification service errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} returned server error {status}")]
    ServerError { provider: String, status: u16 },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether another attempt may succeed (rate limits, 5xx, timeouts).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::Timeout { .. }
        )
    }
}

/// Run orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("No phase tags configured for workspace {workspace_id}")]
    NoPhaseTags { workspace_id: String },

    #[error("Conversation {conversation_id} not found")]
    ConversationNotFound { conversation_id: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Retag batch job errors.
#[derive(Debug, thiserror::Error)]
pub enum RetagError {
    #[error("A full retag is already running for workspace {workspace_id}")]
    AlreadyRunning { workspace_id: String },

    #[error("Full retag is limited to once per week; next allowed at {next_allowed_at}")]
    WeeklyLimit { next_allowed_at: DateTime<Utc> },

    #[error("Tag {tag_id} is not a phase tag in workspace {workspace_id}")]
    UnknownTag {
        workspace_id: String,
        tag_id: String,
    },

    #[error("Retag job {id} not found")]
    NotFound { id: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let rate = LlmError::RateLimited {
            provider: "anthropic".into(),
            retry_after: None,
        };
        let server = LlmError::ServerError {
            provider: "anthropic".into(),
            status: 503,
        };
        let auth = LlmError::AuthFailed {
            provider: "anthropic".into(),
        };
        assert!(rate.is_retryable());
        assert!(server.is_retryable());
        assert!(!auth.is_retryable());
    }

    #[test]
    fn retag_errors_render() {
        let err = RetagError::AlreadyRunning {
            workspace_id: "ws-1".into(),
        };
        assert!(err.to_string().contains("already running"));
    }
}
