//! Configuration loading, validation, and management for Turnstile.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Every threshold the detector and gate use is a field here with a serde
//! default preserving the shipped constants, so deployments can tune them
//! without a rebuild.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Loop detector thresholds
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Concurrency gate settings
    #[serde(default)]
    pub gate: GateConfig,
}

/// Thresholds and scheduling knobs for the loop detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Consecutive identical tool calls before a loop is declared.
    #[serde(default = "default_tool_call_loop_threshold")]
    pub tool_call_loop_threshold: u32,

    /// Sliding-window size (chars) for content chunk analysis.
    #[serde(default = "default_content_chunk_size")]
    pub content_chunk_size: usize,

    /// Occurrences of one chunk before chanting is declared.
    #[serde(default = "default_content_loop_threshold")]
    pub content_loop_threshold: usize,

    /// Cap (chars) on the streamed-content history buffer.
    #[serde(default = "default_max_history_length")]
    pub max_history_length: usize,

    /// Turns within one prompt before the LLM-based check activates.
    #[serde(default = "default_llm_check_after_turns")]
    pub llm_check_after_turns: u32,

    /// Interval (turns) between LLM checks before any confidence signal exists.
    #[serde(default = "default_llm_check_interval")]
    pub default_llm_check_interval: u32,

    /// Smallest adaptive interval — used when confidence is high.
    #[serde(default = "default_min_llm_check_interval")]
    pub min_llm_check_interval: u32,

    /// Largest adaptive interval — used when confidence is near zero.
    #[serde(default = "default_max_llm_check_interval")]
    pub max_llm_check_interval: u32,

    /// Confidence above which the LLM check declares a loop.
    #[serde(default = "default_llm_confidence_threshold")]
    pub llm_confidence_threshold: f64,

    /// How many recent turns to hand the LLM check.
    #[serde(default = "default_recent_turns_for_llm_check")]
    pub recent_turns_for_llm_check: usize,

    /// Automatic recovery nudges per prompt before surfacing the loop.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    /// Quote-character density above which the degenerate-formatting fast path
    /// fires (together with `asterisk_density_threshold`). Heuristic, tunable.
    #[serde(default = "default_density_threshold")]
    pub quote_density_threshold: f64,

    /// Asterisk-character density for the same fast path. Heuristic, tunable.
    #[serde(default = "default_density_threshold")]
    pub asterisk_density_threshold: f64,
}

fn default_tool_call_loop_threshold() -> u32 {
    5
}
fn default_content_chunk_size() -> usize {
    20
}
fn default_content_loop_threshold() -> usize {
    4
}
fn default_max_history_length() -> usize {
    1000
}
fn default_llm_check_after_turns() -> u32 {
    30
}
fn default_llm_check_interval() -> u32 {
    3
}
fn default_min_llm_check_interval() -> u32 {
    5
}
fn default_max_llm_check_interval() -> u32 {
    15
}
fn default_llm_confidence_threshold() -> f64 {
    0.9
}
fn default_recent_turns_for_llm_check() -> usize {
    20
}
fn default_max_recovery_attempts() -> u32 {
    2
}
fn default_density_threshold() -> f64 {
    0.6
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tool_call_loop_threshold: default_tool_call_loop_threshold(),
            content_chunk_size: default_content_chunk_size(),
            content_loop_threshold: default_content_loop_threshold(),
            max_history_length: default_max_history_length(),
            llm_check_after_turns: default_llm_check_after_turns(),
            default_llm_check_interval: default_llm_check_interval(),
            min_llm_check_interval: default_min_llm_check_interval(),
            max_llm_check_interval: default_max_llm_check_interval(),
            llm_confidence_threshold: default_llm_confidence_threshold(),
            recent_turns_for_llm_check: default_recent_turns_for_llm_check(),
            max_recovery_attempts: default_max_recovery_attempts(),
            quote_density_threshold: default_density_threshold(),
            asterisk_density_threshold: default_density_threshold(),
        }
    }
}

/// Settings for the concurrency gate wrapping a local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Hard ceiling on in-flight requests.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Per-item wall-clock budget (ms) from enqueue to admission.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Whether the ceiling adapts to observed error rate and latency.
    #[serde(default = "default_adaptive_throttling")]
    pub adaptive_throttling: bool,
}

fn default_max_concurrent_requests() -> usize {
    2
}
fn default_queue_timeout_ms() -> u64 {
    30_000
}
fn default_adaptive_throttling() -> bool {
    true
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            queue_timeout_ms: default_queue_timeout_ms(),
            adaptive_throttling: default_adaptive_throttling(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist, then apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            debug!(path = %path.display(), "Loading config file");
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        } else {
            debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TURNSTILE_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("TURNSTILE_MAX_CONCURRENT_REQUESTS") {
            self.gate.max_concurrent_requests = v;
        }
        if let Some(v) = env_parse("TURNSTILE_QUEUE_TIMEOUT_MS") {
            self.gate.queue_timeout_ms = v;
        }
        if let Some(v) = env_parse("TURNSTILE_ADAPTIVE_THROTTLING") {
            self.gate.adaptive_throttling = v;
        }
        if let Some(v) = env_parse("TURNSTILE_TOOL_CALL_LOOP_THRESHOLD") {
            self.detector.tool_call_loop_threshold = v;
        }
        if let Some(v) = env_parse("TURNSTILE_MAX_RECOVERY_ATTEMPTS") {
            self.detector.max_recovery_attempts = v;
        }
    }

    /// Validate the configuration, rejecting values the detector or gate
    /// cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if d.tool_call_loop_threshold == 0 {
            return Err(ConfigError::Invalid(
                "detector.tool_call_loop_threshold must be at least 1".into(),
            ));
        }
        if d.content_chunk_size == 0 || d.content_loop_threshold == 0 {
            return Err(ConfigError::Invalid(
                "detector content chunk size and loop threshold must be at least 1".into(),
            ));
        }
        if d.max_history_length < d.content_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "detector.max_history_length ({}) must be >= content_chunk_size ({})",
                d.max_history_length, d.content_chunk_size
            )));
        }
        if d.min_llm_check_interval > d.max_llm_check_interval {
            return Err(ConfigError::Invalid(format!(
                "detector.min_llm_check_interval ({}) must be <= max_llm_check_interval ({})",
                d.min_llm_check_interval, d.max_llm_check_interval
            )));
        }
        if !(0.0..=1.0).contains(&d.llm_confidence_threshold) {
            return Err(ConfigError::Invalid(
                "detector.llm_confidence_threshold must be within [0.0, 1.0]".into(),
            ));
        }
        if self.gate.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "gate.max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.gate.queue_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "gate.queue_timeout_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
