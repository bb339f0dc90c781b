use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.loom/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoomConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub loop_detector: LoopDetectorConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl LoomConfig {
    /// Load config from `~/.loom/config.toml`, falling back to defaults when
    /// the file does not exist. Clamped tunables are normalized on load.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(LoomConfig::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut cfg: LoomConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.clamp();
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply the documented lower bounds to every clamped tunable.
    pub fn clamp(&mut self) {
        self.dispatcher.max_dispatch_hops = clamp_max_dispatch_hops(self.dispatcher.max_dispatch_hops);
        self.loop_detector.repeat_threshold = clamp_repeat_threshold(self.loop_detector.repeat_threshold);
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".loom")
            .join("config.toml")
    }
}

/// Out-of-range hop caps fall back to the default rather than clamping to
/// the floor; a zero or negative cap would stall every bead.
pub fn clamp_max_dispatch_hops(value: i64) -> i64 {
    if value < 1 {
        DEFAULT_MAX_DISPATCH_HOPS
    } else {
        value
    }
}

/// The repeat threshold floor is 2; a threshold of 1 would flag every
/// repeated read as a loop.
pub fn clamp_repeat_threshold(value: i64) -> i64 {
    value.max(2)
}

pub const DEFAULT_MAX_DISPATCH_HOPS: i64 = 20;
pub const DEFAULT_REPEAT_THRESHOLD: i64 = 3;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_project_id() -> String {
    "default".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.loom/loom.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Dispatcher scan period in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Max wall-clock for one dispatcher pass, in seconds.
    #[serde(default = "default_pass_deadline")]
    pub pass_deadline_secs: u64,
    /// Cap on per-bead lifetime dispatches before forced CEO escalation.
    #[serde(default = "default_max_hops")]
    pub max_dispatch_hops: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            pass_deadline_secs: default_pass_deadline(),
            max_dispatch_hops: default_max_hops(),
        }
    }
}

fn default_tick_interval() -> u64 {
    5
}
fn default_pass_deadline() -> u64 {
    30
}
fn default_max_hops() -> i64 {
    DEFAULT_MAX_DISPATCH_HOPS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectorConfig {
    /// Count of identical progress keys that qualifies as stuck.
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: i64,
    /// How long without a mutating action before stuck can fire, in seconds.
    #[serde(default = "default_stuck_idle_window")]
    pub stuck_idle_window_secs: u64,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            repeat_threshold: default_repeat_threshold(),
            stuck_idle_window_secs: default_stuck_idle_window(),
        }
    }
}

fn default_repeat_threshold() -> i64 {
    DEFAULT_REPEAT_THRESHOLD
}
fn default_stuck_idle_window() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    #[serde(default = "default_weight_size")]
    pub size: f64,
    #[serde(default = "default_weight_rtt")]
    pub rtt: f64,
    #[serde(default = "default_weight_request_latency")]
    pub request_latency: f64,
    #[serde(default = "default_weight_cost")]
    pub cost: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            size: default_weight_size(),
            rtt: default_weight_rtt(),
            request_latency: default_weight_request_latency(),
            cost: default_weight_cost(),
        }
    }
}

fn default_weight_size() -> f64 {
    0.4
}
fn default_weight_rtt() -> f64 {
    0.2
}
fn default_weight_request_latency() -> f64 {
    0.3
}
fn default_weight_cost() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Cycles (returns to the entry node) before escalation.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Default max_attempts when a node omits it.
    #[serde(default = "default_node_max_attempts")]
    pub node_default_max_attempts: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            node_default_max_attempts: default_node_max_attempts(),
        }
    }
}

fn default_max_cycles() -> u32 {
    3
}
fn default_node_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Self-audit cadence in minutes. Zero disables the audit loop.
    #[serde(default = "default_audit_interval")]
    pub interval_minutes: u64,
    /// Workspace directory the audit commands run in.
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default = "default_build_command")]
    pub build_command: String,
    #[serde(default = "default_test_command")]
    pub test_command: String,
    #[serde(default = "default_lint_command")]
    pub lint_command: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_audit_interval(),
            workspace: None,
            build_command: default_build_command(),
            test_command: default_test_command(),
            lint_command: default_lint_command(),
        }
    }
}

fn default_audit_interval() -> u64 {
    30
}
fn default_build_command() -> String {
    "cargo build --quiet".into()
}
fn default_test_command() -> String {
    "cargo test --quiet".into()
}
fn default_lint_command() -> String {
    "cargo clippy --quiet".into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = LoomConfig::default();
        assert_eq!(cfg.dispatcher.max_dispatch_hops, 20);
        assert_eq!(cfg.dispatcher.tick_interval_secs, 5);
        assert_eq!(cfg.loop_detector.repeat_threshold, 3);
        assert_eq!(cfg.loop_detector.stuck_idle_window_secs, 300);
        assert_eq!(cfg.workflow.max_cycles, 3);
        assert_eq!(cfg.workflow.node_default_max_attempts, 3);
        assert_eq!(cfg.audit.interval_minutes, 30);
        assert!((cfg.scorer.size - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn hop_clamp_falls_back_to_default() {
        assert_eq!(clamp_max_dispatch_hops(-5), 20);
        assert_eq!(clamp_max_dispatch_hops(0), 20);
        assert_eq!(clamp_max_dispatch_hops(1), 1);
        assert_eq!(clamp_max_dispatch_hops(50), 50);
    }

    #[test]
    fn repeat_threshold_clamps_to_two() {
        assert_eq!(clamp_repeat_threshold(0), 2);
        assert_eq!(clamp_repeat_threshold(1), 2);
        assert_eq!(clamp_repeat_threshold(100), 100);
    }

    #[test]
    fn parses_partial_toml() {
        let text = r#"
            [dispatcher]
            tick_interval_secs = 2
            max_dispatch_hops = 0

            [loop_detector]
            repeat_threshold = 1
        "#;
        let mut cfg: LoomConfig = toml::from_str(text).unwrap();
        cfg.clamp();
        assert_eq!(cfg.dispatcher.tick_interval_secs, 2);
        // Clamped values
        assert_eq!(cfg.dispatcher.max_dispatch_hops, 20);
        assert_eq!(cfg.loop_detector.repeat_threshold, 2);
        // Untouched sections keep defaults
        assert_eq!(cfg.workflow.max_cycles, 3);
    }

    #[test]
    fn toml_round_trip() {
        let cfg = LoomConfig::default();
        let text = cfg.to_toml().unwrap();
        let back: LoomConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.dispatcher.max_dispatch_hops, cfg.dispatcher.max_dispatch_hops);
        assert_eq!(back.audit.build_command, cfg.audit.build_command);
    }
}
