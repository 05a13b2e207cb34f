//! Harness configuration using Figment
//!
//! All constants the harness needs (state codes, detector counts, timeouts)
//! live in one immutable [`HarnessConfig`] value that is passed explicitly to
//! every component. Configuration is layered:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `DAQ_VERIFY_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQ_VERIFY_APPLICATION__LOG_LEVEL=debug
//! DAQ_VERIFY_TIMING__COMMAND_TIMEOUT=30s
//! DAQ_VERIFY_DEVICE__MAX_DETECTORS=4
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "DAQ_VERIFY_";

/// Top-level harness configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device state codes and sizes
    pub device: DeviceConfig,
    /// Timeouts and delays
    pub timing: TimingConfig,
    /// Layered run-control state machine, when the deployment has one
    pub run_control: Option<RunControlConfig>,
    /// How endpoints are reached
    pub transport: TransportConfig,
    /// Extra scenario definitions merged over the built-in catalog. A relative
    /// path given in a configuration file is resolved against that file's
    /// directory.
    pub scenarios_file: Option<PathBuf>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Device under test: state codes and counter layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Sentinel written to command endpoints
    pub command_value: i64,
    /// `DetectorState_RBV` code for Idle
    pub idle_state: i64,
    /// `DetectorState_RBV` code for Acquiring
    pub acquire_state: i64,
    /// Number of detectors (`Det1` .. `DetN`)
    pub max_detectors: u32,
    /// Number of TOF ROIs (`ROI:0` .. `ROI:N-1`)
    pub max_roi: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            command_value: 1,
            idle_state: 0,
            acquire_state: 1,
            max_detectors: 2,
            max_roi: 8,
        }
    }
}

/// Timeouts and delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Bound on acknowledged command writes
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Window in which detector rates must fall to zero after a stop
    #[serde(with = "humantime_serde")]
    pub settle_timeout: Duration,
    /// Poll interval inside the settle window
    #[serde(with = "humantime_serde")]
    pub settle_poll_interval: Duration,
    /// Delay before the diagnostic re-read that follows a state mismatch
    #[serde(with = "humantime_serde")]
    pub diagnostic_delay: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            settle_timeout: Duration::ZERO,
            settle_poll_interval: Duration::from_millis(100),
            diagnostic_delay: Duration::from_secs(1),
        }
    }
}

/// Layered run-control state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunControlConfig {
    /// Base name of the run-control endpoints (e.g. `BL1A:CS:RunControl`)
    pub base: String,
    /// `StateEnum` code for Ready
    #[serde(default = "default_ready_state")]
    pub ready_state: i64,
    /// `StateEnum` code for Running
    #[serde(default = "default_running_state")]
    pub running_state: i64,
}

/// Endpoint transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// EPICS command-line tools
    #[default]
    Catools,
    /// In-memory simulated detector
    Simulated,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport used by the binaries
    pub kind: TransportKind,
    /// Path or name of the `caget` executable
    pub caget: String,
    /// Path or name of the `caput` executable
    pub caput: String,
    /// Bound on a single read
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Catools,
            caget: "caget".to_string(),
            caput: "caput".to_string(),
            read_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_ready_state() -> i64 {
    1
}

fn default_running_state() -> i64 {
    3
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl HarnessConfig {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment, then validate it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigLoad` if a source cannot be parsed and `Config` if
    /// validation fails.
    pub fn load(path: Option<&Path>) -> HarnessResult<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(HarnessError::Config(format!(
                    "configuration file '{}' does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let mut config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        // A relative scenarios_file is relative to the file that names it.
        if let (Some(dir), Some(scenarios)) = (
            path.and_then(Path::parent),
            config.scenarios_file.as_mut(),
        ) {
            if scenarios.is_relative() {
                *scenarios = dir.join(&*scenarios);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text, without environment overrides.
    pub fn from_toml_str(text: &str) -> HarnessResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level and format are recognised
    /// - Idle and acquire codes differ (likewise Ready and Running)
    /// - At least one detector
    /// - Non-zero command timeout and settle poll interval
    /// - Transport executables are named
    pub fn validate(&self) -> HarnessResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(HarnessError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(HarnessError::Config(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.device.idle_state == self.device.acquire_state {
            return Err(HarnessError::Config(format!(
                "device.idle_state and device.acquire_state must differ (both {})",
                self.device.idle_state
            )));
        }

        if self.device.max_detectors == 0 {
            return Err(HarnessError::Config(
                "device.max_detectors must be > 0".to_string(),
            ));
        }

        if self.timing.command_timeout.is_zero() {
            return Err(HarnessError::Config(
                "timing.command_timeout must be > 0".to_string(),
            ));
        }

        if self.timing.settle_poll_interval.is_zero() {
            return Err(HarnessError::Config(
                "timing.settle_poll_interval must be > 0".to_string(),
            ));
        }

        if let Some(run_control) = &self.run_control {
            if run_control.base.is_empty() {
                return Err(HarnessError::Config(
                    "run_control.base cannot be empty".to_string(),
                ));
            }
            if run_control.ready_state == run_control.running_state {
                return Err(HarnessError::Config(format!(
                    "run_control.ready_state and run_control.running_state must differ (both {})",
                    run_control.ready_state
                )));
            }
        }

        if self.transport.caget.is_empty() || self.transport.caput.is_empty() {
            return Err(HarnessError::Config(
                "transport.caget and transport.caput cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
