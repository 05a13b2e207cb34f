//! Verification harness for remotely controlled data acquisition devices.
//!
//! The harness drives a detector through start/stop cycles over named
//! control-system endpoints and asserts that:
//!
//! - the externally visible state machine (`DetectorState_RBV`, optionally a
//!   layered run-control state) transitions promptly after each acknowledged
//!   command, and
//! - the detector's counters (event totals, pulse counter, integrated charge,
//!   ROI totals) increase while acquiring, reset on start and stop moving once
//!   acquisition ends.
//!
//! Components, leaves first:
//!
//! - [`endpoint`] - the `EndpointClient` read/write abstraction, the endpoint
//!   naming vocabulary, a simulated device and a `caget`/`caput` transport
//! - [`state`] - the state verifier (start, stop, check state)
//! - [`counters`] - counter snapshots and invariant checks
//! - [`scenario`] - declarative repeated-cycle test procedures and their runner
//! - [`orchestrator`] - manifest-driven, fail-fast execution of scenarios
//!
//! # Example
//!
//! ```no_run
//! use daq_verify::config::HarnessConfig;
//! use daq_verify::endpoint::SimulatedDevice;
//! use daq_verify::scenario::{ScenarioCatalog, ScenarioRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HarnessConfig::default();
//!     let device = SimulatedDevice::new("BL99:Det:N1", &config);
//!     let catalog = ScenarioCatalog::builtin();
//!     let scenario = catalog.get("start_stop").expect("built-in scenario");
//!
//!     let outcome = ScenarioRunner::new(&device, &config)
//!         .run(scenario, "BL99:Det:N1")
//!         .await;
//!     println!("{}: {:?}", outcome.scenario, outcome.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod counters;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod scenario;
pub mod state;

// Re-exports for convenience
pub use config::HarnessConfig;
pub use endpoint::{Acknowledge, EndpointClient, PvValue};
pub use error::{ErrorKind, HarnessError, HarnessResult};
pub use orchestrator::{Manifest, Orchestrator, RunReport};
pub use scenario::{ScenarioDefinition, ScenarioOutcome, ScenarioRunner, ScenarioStatus};
