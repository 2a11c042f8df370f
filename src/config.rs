//! Configuration system using Figment
//!
//! This module provides strongly-typed configuration loading for the scan engine.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `SCANT_`, nested keys separated by `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SCANT_APPLICATION__LOG_LEVEL=debug
//! SCANT_APPLICATION__NAME="Turntable rig"
//! ```
//!
//! # Example file
//!
//! ```toml
//! [application]
//! name = "scant"
//! log_level = "info"
//!
//! [orchestrator]
//! motion_fault_policy = "abort"
//! capture_fault_policy = "continue"
//! settle_timeout = "30s"
//!
//! [[axes]]
//! name = "yaw"
//! min_position = 0
//! max_position = 1800
//! default_speed = 2000
//! max_speed = 4000
//! current_limit_ma = 174
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::fault::FaultAction;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    #[error("Configuration write error: {0}")]
    WriteError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Holding-current limits supported by the stepper controllers, in milliamps.
///
/// The index of each entry is the controller's current-limit code.
pub const CURRENT_LIMITS_MA: [u32; 33] = [
    0, 1, 174, 343, 495, 634, 762, 880, 990, 1092, 1189, 1281, 1368, 1452, 1532, 1611, 1687, 1762,
    1835, 1909, 1982, 2056, 2131, 2207, 2285, 2366, 2451, 2540, 2634, 2734, 2843, 2962, 3093,
];

/// Map a milliamp limit to the controller's current-limit code.
pub fn current_limit_code(milliamps: u32) -> Option<u8> {
    CURRENT_LIMITS_MA
        .iter()
        .position(|&ma| ma == milliamps)
        .and_then(|code| u8::try_from(code).ok())
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Run engine behaviour
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Axis definitions, one per physical stepper
    #[serde(default)]
    pub axes: Vec<AxisDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Scan orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// What to do when a move or settle fails during a run
    #[serde(default = "default_motion_policy")]
    pub motion_fault_policy: FaultAction,
    /// What to do when a capture fails during a run
    #[serde(default = "default_capture_policy")]
    pub capture_fault_policy: FaultAction,
    /// Upper bound on waiting for an axis to stop moving
    #[serde(default = "default_settle_timeout", with = "humantime_serde")]
    pub settle_timeout: Duration,
    /// Upper bound on a single capture request
    #[serde(default = "default_capture_timeout", with = "humantime_serde")]
    pub capture_timeout: Duration,
    /// How long `abort` waits for the run loop to acknowledge the stop
    #[serde(default = "default_abort_ack_timeout", with = "humantime_serde")]
    pub abort_ack_timeout: Duration,
    /// Overlap each capture with the next step's motion.
    ///
    /// Only safe on rigs where the camera exposure does not depend on the
    /// axes holding still once the shutter has been released.
    #[serde(default)]
    pub pipelined_capture: bool,
    /// Buffer size of each event subscriber channel
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            motion_fault_policy: default_motion_policy(),
            capture_fault_policy: default_capture_policy(),
            settle_timeout: default_settle_timeout(),
            capture_timeout: default_capture_timeout(),
            abort_ack_timeout: default_abort_ack_timeout(),
            pipelined_capture: false,
            event_channel_capacity: default_event_capacity(),
        }
    }
}

/// Axis definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AxisDefinition {
    /// Unique axis name (e.g. "yaw", "tilt", "forward")
    pub name: String,
    /// Serial number of the controller driving this axis
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Lower position bound in steps
    pub min_position: i32,
    /// Upper position bound in steps
    pub max_position: i32,
    /// Speed used when a move does not specify one (steps/s)
    #[serde(default = "default_speed")]
    pub default_speed: u32,
    /// Fastest speed this axis will be commanded at (steps/s)
    #[serde(default = "default_max_speed")]
    pub max_speed: u32,
    /// Holding current limit in milliamps, applied before energizing
    #[serde(default)]
    pub current_limit_ma: Option<u32>,
    /// Whether `zero()` may redefine the reference position
    #[serde(default)]
    pub zeroable: bool,
    /// Position assigned by `zero()`
    #[serde(default)]
    pub zero_position: i32,
    /// Bound on waiting for the controller to acknowledge energize
    #[serde(default = "default_energize_timeout", with = "humantime_serde")]
    pub energize_timeout: Duration,
    /// Interval between controller polls while waiting to settle
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Allowed distance between final position and target, in steps
    #[serde(default)]
    pub position_tolerance: u32,
}

impl AxisDefinition {
    /// Definition with the given bounds and defaults for everything else.
    pub fn new(name: impl Into<String>, min_position: i32, max_position: i32) -> Self {
        Self {
            name: name.into(),
            serial_number: None,
            min_position,
            max_position,
            default_speed: default_speed(),
            max_speed: default_max_speed(),
            current_limit_ma: None,
            zeroable: false,
            zero_position: 0,
            energize_timeout: default_energize_timeout(),
            poll_interval: default_poll_interval(),
            position_tolerance: 0,
        }
    }

    /// Allow `zero()` on this axis.
    pub fn zeroable(mut self) -> Self {
        self.zeroable = true;
        self
    }

    /// Set the default and maximum speeds.
    pub fn with_speeds(mut self, default_speed: u32, max_speed: u32) -> Self {
        self.default_speed = default_speed;
        self.max_speed = max_speed;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));
        if self.name.trim().is_empty() {
            return invalid("Axis name must not be empty".to_string());
        }
        if self.min_position >= self.max_position {
            return invalid(format!(
                "Axis '{}': min_position {} must be below max_position {}",
                self.name, self.min_position, self.max_position
            ));
        }
        if self.default_speed == 0 || self.default_speed > self.max_speed {
            return invalid(format!(
                "Axis '{}': default_speed {} must be in 1..={}",
                self.name, self.default_speed, self.max_speed
            ));
        }
        if let Some(ma) = self.current_limit_ma {
            if current_limit_code(ma).is_none() {
                return invalid(format!(
                    "Axis '{}': unsupported current_limit_ma {}",
                    self.name, ma
                ));
            }
        }
        if self.zeroable
            && !(self.min_position..=self.max_position).contains(&self.zero_position)
        {
            return invalid(format!(
                "Axis '{}': zero_position {} outside bounds",
                self.name, self.zero_position
            ));
        }
        if self.energize_timeout.is_zero() || self.poll_interval.is_zero() {
            return invalid(format!(
                "Axis '{}': energize_timeout and poll_interval must be non-zero",
                self.name
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "scant".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_motion_policy() -> FaultAction {
    FaultAction::Abort
}

fn default_capture_policy() -> FaultAction {
    FaultAction::Continue
}

fn default_settle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_capture_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_abort_ack_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_event_capacity() -> usize {
    256
}

fn default_speed() -> u32 {
    2000
}

fn default_max_speed() -> u32 {
    4000
}

fn default_energize_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(20)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ScanConfig {
    /// Load configuration from a TOML file and `SCANT_` environment variables.
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCANT_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration as TOML.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let text =
            toml::to_string_pretty(self).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        std::fs::write(path.as_ref(), text).map_err(|e| {
            ConfigError::WriteError(format!("{}: {}", path.as_ref().display(), e))
        })
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level and log format are recognised
    /// - Timeouts and channel capacity are non-zero
    /// - Axis names are unique and each axis definition is consistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let orchestrator = &self.orchestrator;
        if orchestrator.settle_timeout.is_zero()
            || orchestrator.capture_timeout.is_zero()
            || orchestrator.abort_ack_timeout.is_zero()
        {
            return Err(ConfigError::ValidationError(
                "Orchestrator timeouts must be non-zero".to_string(),
            ));
        }
        if orchestrator.event_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for axis in &self.axes {
            if !names.insert(axis.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate axis name: '{}'",
                    axis.name
                )));
            }
            axis.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        name = "turntable"
        log_level = "debug"

        [orchestrator]
        capture_fault_policy = "abort"
        settle_timeout = "5s"
        pipelined_capture = true

        [[axes]]
        name = "yaw"
        min_position = 0
        max_position = 1800
        current_limit_ma = 174

        [[axes]]
        name = "tilt"
        min_position = -400
        max_position = 400
        zeroable = true
        poll_interval = "5ms"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = ScanConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "turntable");
        assert_eq!(config.orchestrator.capture_fault_policy, FaultAction::Abort);
        assert_eq!(config.orchestrator.motion_fault_policy, FaultAction::Abort);
        assert_eq!(config.orchestrator.settle_timeout, Duration::from_secs(5));
        assert!(config.orchestrator.pipelined_capture);
        assert_eq!(config.axes.len(), 2);
        assert_eq!(config.axes[0].default_speed, 2000);
        assert_eq!(config.axes[1].poll_interval, Duration::from_millis(5));
        assert!(config.axes[1].zeroable);
    }

    #[test]
    fn test_defaults_without_sections() {
        let config = ScanConfig::from_toml_str("").unwrap();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.orchestrator.capture_fault_policy, FaultAction::Continue);
        assert!(!config.orchestrator.pipelined_capture);
        assert!(config.axes.is_empty());
    }

    #[test]
    fn test_rejects_duplicate_axis() {
        let toml = r#"
            [[axes]]
            name = "yaw"
            min_position = 0
            max_position = 10
            [[axes]]
            name = "yaw"
            min_position = 0
            max_position = 10
        "#;
        let err = ScanConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate axis name"));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let mut config = ScanConfig::default();
        config.axes.push(AxisDefinition::new("yaw", 100, 0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unsupported_current_limit() {
        let mut config = ScanConfig::default();
        let mut axis = AxisDefinition::new("yaw", 0, 100);
        axis.current_limit_ma = Some(175);
        config.axes.push(axis);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("current_limit_ma"));
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let mut config = ScanConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_current_limit_codes() {
        assert_eq!(current_limit_code(0), Some(0));
        assert_eq!(current_limit_code(174), Some(2));
        assert_eq!(current_limit_code(3093), Some(32));
        assert_eq!(current_limit_code(200), None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scant.toml");

        let mut config = ScanConfig::default();
        config.axes.push(AxisDefinition::new("yaw", 0, 1800).zeroable());
        config.orchestrator.settle_timeout = Duration::from_millis(1500);
        config.save_to(&path).unwrap();

        let reloaded = ScanConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.axes, config.axes);
        assert_eq!(reloaded.orchestrator.settle_timeout, Duration::from_millis(1500));
    }
}
