use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration, loadable from TOML or built in code.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Per-projection worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum events fetched per cycle.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Idle sleep between cycles when the projection is caught up.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl RunnerConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Bounded exponential backoff for transient store errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per batch before the worker parks itself as stalled.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Load engine configuration from a TOML file; defaults when absent.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

const fn default_batch_limit() -> usize {
    200
}

const fn default_poll_interval_ms() -> u64 {
    250
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    50
}

const fn default_max_delay_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.runner.batch_limit, 200);
        assert_eq!(cfg.runner.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.runner.retry.max_attempts, 5);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r"
[runner]
batch_limit = 64

[runner.retry]
max_attempts = 2
",
        )
        .expect("parse");
        assert_eq!(cfg.runner.batch_limit, 64);
        assert_eq!(cfg.runner.poll_interval_ms, 250);
        assert_eq!(cfg.runner.retry.max_attempts, 2);
        assert_eq!(cfg.runner.retry.base_delay_ms, 50);
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = load_config(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(cfg.runner.batch_limit, 200);
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "runner = 3").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(0), Duration::from_millis(50));
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(20), Duration::from_millis(5_000));
        // Shift overflow saturates instead of wrapping.
        assert_eq!(retry.delay_for(200), Duration::from_millis(5_000));
    }
}
