//! Classification service integration.
//!
//! The engine talks to the classifier through the `LlmProvider` trait so the
//! transport can be swapped (or mocked in tests). The shipped backend is
//! `AnthropicProvider`, a thin `reqwest` client for the Messages API.

mod anthropic;
pub mod provider;
pub mod retry;
#[cfg(test)]
pub(crate) mod testing;

pub use anthropic::AnthropicProvider;
pub use provider::*;
pub use retry::{RetryPolicy, complete_with_retry};

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Override for the API base URL (proxies, tests).
    pub base_url: Option<String>,
    /// Per-request transport timeout.
    pub request_timeout: Duration,
}

impl LlmConfig {
    /// Anthropic config with the default timeout.
    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend: LlmBackend::Anthropic,
            api_key: secrecy::SecretString::from(api_key.into()),
            model: model.into(),
            base_url: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => {
            let provider = AnthropicProvider::new(config)?;
            tracing::info!("Using Anthropic (model: {})", config.model);
            Ok(Arc::new(provider))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_provider_constructs_without_network() {
        let config = LlmConfig::anthropic("test-key", "claude-3-5-haiku-latest");
        let provider = create_provider(&config);
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().model_name(), "claude-3-5-haiku-latest");
    }
}
