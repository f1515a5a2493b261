use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str) -> Option<T> {
    let raw = profiled_env_opt(profile, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable env override");
            None
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Task queue manager configuration, typically parsed from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of tasks run per host callback.
    #[serde(default = "default_work_batch_size")]
    pub work_batch_size: usize,
    /// Consecutive higher-tier selections a waiting lower tier tolerates
    /// before it is served once.
    #[serde(default = "default_starvation_threshold")]
    pub starvation_threshold: usize,
    /// Idle period tuning.
    #[serde(default)]
    pub idle: IdleConfig,
}

fn default_work_batch_size() -> usize { 1 }
fn default_starvation_threshold() -> usize { 5 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            work_batch_size: default_work_batch_size(),
            starvation_threshold: default_starvation_threshold(),
            idle: IdleConfig::default(),
        }
    }
}

// ── Idle ──────────────────────────────────────────────────────

/// Idle helper timing knobs, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Quiet time required before a long idle period may start. 0 disables the check.
    #[serde(default)]
    pub required_quiescence_ms: u64,
    /// Upper bound on a single long idle period.
    #[serde(default = "default_maximum_idle_period")]
    pub maximum_idle_period_ms: u64,
    /// Idle periods shorter than this are not started.
    #[serde(default = "default_minimum_idle_period")]
    pub minimum_idle_period_ms: u64,
    /// Retry delay when a long idle period could not start because a delayed task is imminent.
    #[serde(default = "default_retry_delay")]
    pub retry_enable_long_idle_period_delay_ms: u64,
}

fn default_maximum_idle_period() -> u64 { 50 }
fn default_minimum_idle_period() -> u64 { 1 }
fn default_retry_delay() -> u64 { 1 }

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            required_quiescence_ms: 0,
            maximum_idle_period_ms: default_maximum_idle_period(),
            minimum_idle_period_ms: default_minimum_idle_period(),
            retry_enable_long_idle_period_delay_ms: default_retry_delay(),
        }
    }
}

impl IdleConfig {
    pub fn required_quiescence(&self) -> Duration {
        Duration::from_millis(self.required_quiescence_ms)
    }

    pub fn maximum_idle_period(&self) -> Duration {
        Duration::from_millis(self.maximum_idle_period_ms)
    }

    pub fn minimum_idle_period(&self) -> Duration {
        Duration::from_millis(self.minimum_idle_period_ms)
    }

    pub fn retry_enable_long_idle_period_delay(&self) -> Duration {
        Duration::from_millis(self.retry_enable_long_idle_period_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.minimum_idle_period_ms == 0 {
            return Err(ConfigError::Invalid("idle.minimum_idle_period_ms must be at least 1".into()));
        }
        if self.maximum_idle_period_ms < self.minimum_idle_period_ms {
            return Err(ConfigError::Invalid(format!(
                "idle.maximum_idle_period_ms ({}) is below idle.minimum_idle_period_ms ({})",
                self.maximum_idle_period_ms, self.minimum_idle_period_ms
            )));
        }
        Ok(())
    }
}

// ── Loading ───────────────────────────────────────────────────

impl SchedulerConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Build config from defaults plus environment overrides (call `load_dotenv()` first).
    /// Profile is read from `LANESCHED_PROFILE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides(&current_profile());
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides(&current_profile());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `LANESCHED_KEY` overrides `key`, `LANESCHED_IDLE_KEY` overrides
    /// `idle.key`. With a non-empty profile, `{PROFILE}_LANESCHED_KEY` wins.
    pub fn apply_env_overrides(&mut self, profile: &str) {
        let p = profile;
        if let Some(v) = profiled_env_parse(p, "LANESCHED_WORK_BATCH_SIZE") {
            self.work_batch_size = v;
        }
        if let Some(v) = profiled_env_parse(p, "LANESCHED_STARVATION_THRESHOLD") {
            self.starvation_threshold = v;
        }
        if let Some(v) = profiled_env_parse(p, "LANESCHED_IDLE_REQUIRED_QUIESCENCE_MS") {
            self.idle.required_quiescence_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "LANESCHED_IDLE_MAXIMUM_IDLE_PERIOD_MS") {
            self.idle.maximum_idle_period_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "LANESCHED_IDLE_MINIMUM_IDLE_PERIOD_MS") {
            self.idle.minimum_idle_period_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "LANESCHED_IDLE_RETRY_DELAY_MS") {
            self.idle.retry_enable_long_idle_period_delay_ms = v;
        }
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_batch_size == 0 {
            return Err(ConfigError::Invalid("work_batch_size must be at least 1".into()));
        }
        if self.starvation_threshold == 0 {
            return Err(ConfigError::Invalid("starvation_threshold must be at least 1".into()));
        }
        self.idle.validate()
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config loaded (profile: {}):", profile_label(&current_profile()));
        tracing::info!("  work_batch_size:      {}", self.work_batch_size);
        tracing::info!("  starvation_threshold: {}", self.starvation_threshold);
        tracing::info!(
            "  idle:                 quiescence={}ms, max={}ms, min={}ms, retry={}ms",
            self.idle.required_quiescence_ms,
            self.idle.maximum_idle_period_ms,
            self.idle.minimum_idle_period_ms,
            self.idle.retry_enable_long_idle_period_delay_ms
        );
    }

    /// Config as JSON, for reports.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "work_batch_size": self.work_batch_size,
            "starvation_threshold": self.starvation_threshold,
            "idle": {
                "required_quiescence_ms": self.idle.required_quiescence_ms,
                "maximum_idle_period_ms": self.idle.maximum_idle_period_ms,
                "minimum_idle_period_ms": self.idle.minimum_idle_period_ms,
                "retry_enable_long_idle_period_delay_ms": self.idle.retry_enable_long_idle_period_delay_ms,
            },
        })
    }
}

fn current_profile() -> String {
    env_opt("LANESCHED_PROFILE").unwrap_or_default().to_uppercase()
}

fn profile_label(profile: &str) -> &str {
    if profile.is_empty() { "default" } else { profile }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.work_batch_size, 1);
        assert_eq!(config.starvation_threshold, 5);
        assert_eq!(config.idle.required_quiescence_ms, 0);
        assert_eq!(config.idle.maximum_idle_period(), Duration::from_millis(50));
        assert_eq!(config.idle.minimum_idle_period(), Duration::from_millis(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let config = SchedulerConfig::from_toml(
            r#"
            work_batch_size = 4

            [idle]
            required_quiescence_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.work_batch_size, 4);
        assert_eq!(config.starvation_threshold, 5);
        assert_eq!(config.idle.required_quiescence(), Duration::from_millis(100));
        assert_eq!(config.idle.maximum_idle_period_ms, 50);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let err = SchedulerConfig::from_toml("work_batch_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn max_below_min_rejected() {
        let err = SchedulerConfig::from_toml(
            "[idle]\nmaximum_idle_period_ms = 2\nminimum_idle_period_ms = 5",
        )
        .unwrap_err();
        assert!(err.to_string().contains("maximum_idle_period_ms"));
    }

    #[test]
    fn idle_section_validates_on_its_own() {
        let idle = IdleConfig {
            minimum_idle_period_ms: 0,
            ..IdleConfig::default()
        };
        let err = idle.validate().unwrap_err();
        assert!(err.to_string().contains("minimum_idle_period_ms"));
        assert!(IdleConfig::default().validate().is_ok());
    }

    #[test]
    fn summary_lists_every_idle_setting() {
        let mut config = SchedulerConfig::default();
        config.idle.retry_enable_long_idle_period_delay_ms = 7;
        let summary = config.summary();
        assert_eq!(summary["idle"]["retry_enable_long_idle_period_delay_ms"], 7);
        assert_eq!(summary["idle"]["maximum_idle_period_ms"], 50);
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = SchedulerConfig::from_toml("work_batch_size = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn profiled_env_overrides_win() {
        // Profile prefix keeps this test isolated from the unprefixed keys.
        env::set_var("CFGTEST_LANESCHED_WORK_BATCH_SIZE", "7");
        env::set_var("CFGTEST_LANESCHED_IDLE_MAXIMUM_IDLE_PERIOD_MS", "16");
        env::set_var("CFGTEST_LANESCHED_STARVATION_THRESHOLD", "not-a-number");

        let mut config = SchedulerConfig::default();
        config.apply_env_overrides("CFGTEST");
        assert_eq!(config.work_batch_size, 7);
        assert_eq!(config.idle.maximum_idle_period_ms, 16);
        assert_eq!(config.starvation_threshold, 5);

        env::remove_var("CFGTEST_LANESCHED_WORK_BATCH_SIZE");
        env::remove_var("CFGTEST_LANESCHED_IDLE_MAXIMUM_IDLE_PERIOD_MS");
        env::remove_var("CFGTEST_LANESCHED_STARVATION_THRESHOLD");
    }
}
