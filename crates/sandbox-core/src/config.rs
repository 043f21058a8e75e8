//! Runtime configuration.

use std::time::Duration;

use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Limits and timings shared by the registry, broker and coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Max characters kept per stdout/stderr before truncation.
    pub max_output_chars: usize,
    /// Absolute lifetime requested for each environment.
    pub max_lifetime: Duration,
    /// Time a session may sit unused before the sweep evicts it.
    pub idle_ttl: Duration,
    /// Interval between idle sweeps.
    pub sweep_interval: Duration,
    /// Files larger than this are not returned for preview.
    pub file_preview_limit: u64,
    /// How long a finished stream stays replayable.
    pub stream_grace: Duration,
    /// Upper bound for a single command (local provider only).
    pub command_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_output_chars: 50_000,
            max_lifetime: Duration::from_secs(300),
            idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            file_preview_limit: 100_000,
            stream_grace: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
        }
    }
}

impl SandboxConfig {
    /// Defaults overridden by `REMOTE_SANDBOX_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a variable is set but not a valid number.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`Self::from_env`] with an injectable lookup.
    ///
    /// # Errors
    /// Returns error if a value is present but not a valid number.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_u64(&lookup, "REMOTE_SANDBOX_MAX_OUTPUT_CHARS")? {
            config.max_output_chars = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = parse_u64(&lookup, "REMOTE_SANDBOX_MAX_LIFETIME_SECS")? {
            config.max_lifetime = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64(&lookup, "REMOTE_SANDBOX_IDLE_TTL_SECS")? {
            config.idle_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64(&lookup, "REMOTE_SANDBOX_SWEEP_INTERVAL_SECS")? {
            if v == 0 {
                return Err(ConfigError::InvalidValue {
                    var: "REMOTE_SANDBOX_SWEEP_INTERVAL_SECS",
                    value: v.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64(&lookup, "REMOTE_SANDBOX_FILE_PREVIEW_BYTES")? {
            config.file_preview_limit = v;
        }
        if let Some(v) = parse_u64(&lookup, "REMOTE_SANDBOX_STREAM_GRACE_SECS")? {
            config.stream_grace = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64(&lookup, "REMOTE_SANDBOX_COMMAND_TIMEOUT_SECS")? {
            config.command_timeout = Duration::from_secs(v);
        }

        Ok(config)
    }
}

fn parse_u64<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim().replace('_', "");
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            var,
            value: raw,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = assert_ok!(SandboxConfig::from_lookup(lookup(&[])));
        assert_eq!(config, SandboxConfig::default());
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.file_preview_limit, 100_000);
    }

    #[test]
    fn test_overrides() {
        let config = assert_ok!(SandboxConfig::from_lookup(lookup(&[
            ("REMOTE_SANDBOX_MAX_OUTPUT_CHARS", "10_000"),
            ("REMOTE_SANDBOX_IDLE_TTL_SECS", " 30 "),
        ])));
        assert_eq!(config.max_output_chars, 10_000);
        assert_eq!(config.idle_ttl, Duration::from_secs(30));
        assert_eq!(config.max_lifetime, Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_values() {
        let err = assert_err!(SandboxConfig::from_lookup(lookup(&[("REMOTE_SANDBOX_MAX_LIFETIME_SECS", "five")])));
        assert!(err.to_string().contains("REMOTE_SANDBOX_MAX_LIFETIME_SECS"));

        assert_err!(SandboxConfig::from_lookup(lookup(&[("REMOTE_SANDBOX_SWEEP_INTERVAL_SECS", "0")])));
    }
}
