//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::RetryPolicy;

/// Engine configuration shared by the orchestrator, retag jobs and the sweep loop.
///
/// Per-workspace behaviour lives in `AutomationSettings`; this struct only
/// carries process-level limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a workspace lease stays valid before another run may take it.
    pub lock_ttl: Duration,
    /// Retry policy for classification calls.
    pub retry: RetryPolicy,
    /// Most recent messages included in a transcript.
    pub transcript_max_messages: usize,
    /// Per-message character cap inside a transcript.
    pub transcript_max_chars: usize,
    /// Conversations consumed per retag step.
    pub retag_batch_size: usize,
    /// Concurrent classification calls inside one retag step.
    pub retag_concurrency: usize,
    /// Hard ceiling on steps for `run_to_completion`.
    pub retag_max_iterations: usize,
    /// Interval between scheduled sweeps.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(300), // 5 minutes
            retry: RetryPolicy::default(),
            transcript_max_messages: 30,
            transcript_max_chars: 500,
            retag_batch_size: 25,
            retag_concurrency: 4,
            retag_max_iterations: 500,
            sweep_interval: Duration::from_secs(600), // 10 minutes
        }
    }
}

impl EngineConfig {
    /// Build a config from `LEAD_PHASE_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, "LEAD_PHASE_RETRY_ATTEMPTS", defaults.retry.max_attempts)?
                .max(1),
            base_delay: Duration::from_millis(parse_or(
                &lookup,
                "LEAD_PHASE_RETRY_BASE_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
        };

        Ok(Self {
            lock_ttl: Duration::from_secs(parse_or(
                &lookup,
                "LEAD_PHASE_LOCK_TTL_SECS",
                defaults.lock_ttl.as_secs(),
            )?),
            retry,
            transcript_max_messages: parse_or(
                &lookup,
                "LEAD_PHASE_TRANSCRIPT_MESSAGES",
                defaults.transcript_max_messages,
            )?,
            transcript_max_chars: parse_or(
                &lookup,
                "LEAD_PHASE_TRANSCRIPT_CHARS",
                defaults.transcript_max_chars,
            )?,
            retag_batch_size: parse_or(
                &lookup,
                "LEAD_PHASE_RETAG_BATCH_SIZE",
                defaults.retag_batch_size,
            )?
            .max(1),
            retag_concurrency: parse_or(
                &lookup,
                "LEAD_PHASE_RETAG_CONCURRENCY",
                defaults.retag_concurrency,
            )?
            .max(1),
            retag_max_iterations: parse_or(
                &lookup,
                "LEAD_PHASE_RETAG_MAX_ITERATIONS",
                defaults.retag_max_iterations,
            )?,
            sweep_interval: Duration::from_secs(parse_or(
                &lookup,
                "LEAD_PHASE_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.lock_ttl, Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retag_concurrency, 4);
    }

    #[test]
    fn overrides_are_applied() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("LEAD_PHASE_LOCK_TTL_SECS", "60"),
            ("LEAD_PHASE_RETAG_BATCH_SIZE", "10"),
            ("LEAD_PHASE_RETRY_ATTEMPTS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.lock_ttl, Duration::from_secs(60));
        assert_eq!(config.retag_batch_size, 10);
        // At least one attempt is always made
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn invalid_value_is_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[("LEAD_PHASE_LOCK_TTL_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LEAD_PHASE_LOCK_TTL_SECS"));
    }
}
