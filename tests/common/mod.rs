//! Shared fixtures for integration tests.
#![allow(dead_code)]

use daq_verify::config::{HarnessConfig, RunControlConfig};
use daq_verify::endpoint::SimulatedDevice;
use daq_verify::scenario::{ScenarioCatalog, ScenarioDefinition};

/// Endpoint base served by the simulated device
pub const BASE: &str = "BL99:Det:N1";

/// Run-control base used when the layered state is configured
pub const RUN_CONTROL_BASE: &str = "BL99:CS:RunControl";

pub fn config() -> HarnessConfig {
    HarnessConfig::default()
}

pub fn run_control_config() -> HarnessConfig {
    HarnessConfig {
        run_control: Some(RunControlConfig {
            base: RUN_CONTROL_BASE.to_string(),
            ready_state: 1,
            running_state: 3,
        }),
        ..HarnessConfig::default()
    }
}

pub fn device(config: &HarnessConfig) -> SimulatedDevice {
    SimulatedDevice::new(BASE, config)
}

/// Copy of a built-in scenario.
pub fn builtin(id: &str) -> ScenarioDefinition {
    ScenarioCatalog::builtin()
        .get(id)
        .cloned()
        .unwrap_or_else(|| panic!("built-in scenario {id} missing"))
}
