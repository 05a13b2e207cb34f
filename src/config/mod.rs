//! Harness configuration
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `DAQ_VERIFY_`
//! 2. A TOML configuration file, when one is given
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```no_run
//! use daq_verify::config::HarnessConfig;
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarnessConfig::load(Some(Path::new("config/daq-verify.toml")))?;
//!     println!("Command timeout: {:?}", config.timing.command_timeout);
//!     println!("Detectors: {}", config.device.max_detectors);
//!     Ok(())
//! }
//! ```

pub mod harness_config;

pub use harness_config::{
    ApplicationConfig, DeviceConfig, HarnessConfig, RunControlConfig, TimingConfig,
    TransportConfig, TransportKind, ENV_PREFIX,
};
