//! State verifier
//!
//! Issues start/stop commands and asserts the device state that must follow.
//!
//! ## Contract
//! - `start`/`stop` write the command sentinel with acknowledgement, then
//!   check the state exactly once. An acknowledged command is required to be
//!   visible in the state readback immediately, so there is no sleep between
//!   the acknowledgement and the check.
//! - `check_state` performs a single read. It never retries or sleeps.
//! - `diagnose` is the only place that waits after a mismatch. It attaches a
//!   delayed re-read and the device status message to an error that has
//!   already been declared; it cannot turn a failure into a pass.
//!
//! ## Layouts
//! - `Detector`: commands go to `<base>:Start|Stop`, state is read from
//!   `<base>:DetectorState_RBV`.
//! - `RunControl`: commands go to the run-control base, whose `StateEnum` must
//!   reach Running/Ready, after which the detector state is checked as well.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::{DeviceConfig, HarnessConfig, RunControlConfig};
use crate::endpoint::names;
use crate::endpoint::{Acknowledge, EndpointClient, PvValue};
use crate::error::{HarnessError, HarnessResult};
use crate::retry::RetryPolicy;

/// Base detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Not acquiring
    Idle,
    /// Acquiring data
    Acquiring,
}

/// Layered run-control state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Waiting for a run to start
    Ready,
    /// A run is in progress
    Running,
}

/// Which state machine start/stop go through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateLayout {
    /// Detector state readback only
    #[default]
    Detector,
    /// Run-control state first, detector state under it
    RunControl,
}

/// Expected state: a numeric code plus the labels an enum readback may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCode {
    /// Numeric readback value
    pub code: i64,
    /// Labels an enum readback may show instead
    pub labels: &'static [&'static str],
}

impl StateCode {
    /// Device state code as configured for this deployment.
    pub fn device(state: DeviceState, device: &DeviceConfig) -> Self {
        match state {
            DeviceState::Idle => Self {
                code: device.idle_state,
                labels: &["Idle"],
            },
            DeviceState::Acquiring => Self {
                code: device.acquire_state,
                labels: &["Acquiring", "Acquire"],
            },
        }
    }

    /// Run-control state code as configured for this deployment.
    pub fn run_control(state: RunState, run_control: &RunControlConfig) -> Self {
        match state {
            RunState::Ready => Self {
                code: run_control.ready_state,
                labels: &["Ready"],
            },
            RunState::Running => Self {
                code: run_control.running_state,
                labels: &["Running", "Run"],
            },
        }
    }

    /// Whether an observed readback denotes this state.
    pub fn matches(&self, observed: &PvValue) -> bool {
        match observed {
            PvValue::Int(v) => *v == self.code,
            PvValue::Float(v) => *v == self.code as f64,
            PvValue::Text(label) => match label.trim().parse::<i64>() {
                Ok(v) => v == self.code,
                Err(_) => self
                    .labels
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(label.trim())),
            },
        }
    }
}

impl fmt::Display for StateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.labels[0], self.code)
    }
}

/// Context gathered after a state mismatch, for the failure report only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDiagnostics {
    /// How long after the mismatch the state was read again
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Detector state read after `delay`, if the read succeeded
    pub delayed_read: Option<PvValue>,
    /// Device status message at the time of the mismatch
    pub status_message: Option<String>,
}

impl fmt::Display for StateDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.delayed_read {
            Some(value) => write!(
                f,
                "delayed read after {}: {}",
                humantime_serde::re::humantime::format_duration(self.delay),
                value
            )?,
            None => write!(f, "delayed read failed")?,
        }
        if let Some(message) = &self.status_message {
            write!(f, ", status message: '{message}'")?;
        }
        Ok(())
    }
}

/// Start/stop/check driver for one device.
pub struct StateVerifier<'a, C: ?Sized> {
    client: &'a C,
    device: &'a DeviceConfig,
    run_control: Option<&'a RunControlConfig>,
    layout: StateLayout,
    command_timeout: Duration,
    retry: RetryPolicy,
}

impl<'a, C: EndpointClient + ?Sized> StateVerifier<'a, C> {
    /// Verifier using the detector layout and the configured command timeout.
    pub fn new(client: &'a C, config: &'a HarnessConfig) -> Self {
        Self {
            client,
            device: &config.device,
            run_control: config.run_control.as_ref(),
            layout: StateLayout::Detector,
            command_timeout: config.timing.command_timeout,
            retry: RetryPolicy::none(),
        }
    }

    /// Select the state layout.
    ///
    /// # Errors
    /// `Config` when the run-control layout is requested but not configured.
    pub fn with_layout(mut self, layout: StateLayout) -> HarnessResult<Self> {
        if layout == StateLayout::RunControl && self.run_control.is_none() {
            return Err(HarnessError::Config(
                "run-control state layout requested but [run_control] is not configured"
                    .to_string(),
            ));
        }
        self.layout = layout;
        Ok(self)
    }

    /// Override the acknowledgement bound for commands.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Retry command writes according to `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Start acquisition and check the resulting state.
    pub async fn start(&self, base: &str) -> HarnessResult<()> {
        match self.run_control_base() {
            Some(run_control) => {
                self.command(&names::derive(&run_control.base, names::START))
                    .await?;
                self.check_run_state(RunState::Running).await?;
            }
            None => self.command(&names::derive(base, names::START)).await?,
        }
        self.check_state(base, DeviceState::Acquiring).await
    }

    /// Stop acquisition and check the resulting state.
    pub async fn stop(&self, base: &str) -> HarnessResult<()> {
        match self.run_control_base() {
            Some(run_control) => {
                self.command(&names::derive(&run_control.base, names::STOP))
                    .await?;
                self.check_run_state(RunState::Ready).await?;
            }
            None => self.command(&names::derive(base, names::STOP)).await?,
        }
        self.check_state(base, DeviceState::Idle).await
    }

    /// Reset counters. Acknowledged command only, the state is not checked.
    pub async fn reset(&self, base: &str) -> HarnessResult<()> {
        self.command(&names::derive(base, names::RESET)).await
    }

    /// Single read of the detector state compared against `expected`.
    pub async fn check_state(&self, base: &str, expected: DeviceState) -> HarnessResult<()> {
        let endpoint = names::derive(base, names::DETECTOR_STATE);
        let code = StateCode::device(expected, self.device);
        self.compare(&endpoint, code).await
    }

    /// Single read of the run-control state compared against `expected`.
    pub async fn check_run_state(&self, expected: RunState) -> HarnessResult<()> {
        let run_control = self.run_control.ok_or_else(|| {
            HarnessError::Config("[run_control] is not configured".to_string())
        })?;
        let endpoint = names::derive(&run_control.base, names::RUN_CONTROL_STATE);
        let code = StateCode::run_control(expected, run_control);
        self.compare(&endpoint, code).await
    }

    /// Acknowledged write of the command sentinel.
    pub async fn command(&self, endpoint: &str) -> HarnessResult<()> {
        let value = PvValue::Int(self.device.command_value);
        let ack = Acknowledge::Wait(self.command_timeout);
        debug!(endpoint, timeout = ?self.command_timeout, "Sending command");
        self.retry
            .run(endpoint, || self.client.write(endpoint, value.clone(), ack))
            .await
            .inspect_err(|err| error!(endpoint, error = %err, "Command failed"))
    }

    /// Attach diagnostics to a state mismatch after waiting `delay`.
    ///
    /// Reads the status message immediately and the detector state again after
    /// `delay`. Errors other than `StateMismatch` are returned untouched.
    pub async fn diagnose(&self, base: &str, err: HarnessError, delay: Duration) -> HarnessError {
        if !matches!(err, HarnessError::StateMismatch { .. }) {
            return err;
        }

        let status_endpoint = names::derive(base, names::STATUS_MESSAGE);
        let status_message = self
            .client
            .read(&status_endpoint)
            .await
            .ok()
            .map(|value| value.to_string());

        sleep(delay).await;
        let state_endpoint = names::derive(base, names::DETECTOR_STATE);
        let delayed_read = match self.client.read(&state_endpoint).await {
            Ok(value) => Some(value),
            Err(read_err) => {
                warn!(endpoint = %state_endpoint, error = %read_err, "Delayed status read failed");
                None
            }
        };

        let diagnostics = StateDiagnostics {
            delay,
            delayed_read,
            status_message,
        };
        warn!(%diagnostics, "State mismatch diagnostics");
        err.with_diagnostics(diagnostics)
    }

    fn run_control_base(&self) -> Option<&'a RunControlConfig> {
        match self.layout {
            StateLayout::RunControl => self.run_control,
            StateLayout::Detector => None,
        }
    }

    async fn compare(&self, endpoint: &str, expected: StateCode) -> HarnessResult<()> {
        let observed = self.client.read(endpoint).await?;
        if expected.matches(&observed) {
            debug!(endpoint, %observed, "State confirmed");
            return Ok(());
        }

        error!(endpoint, %observed, expected = %expected, "State mismatch");
        Err(HarnessError::StateMismatch {
            endpoint: endpoint.to_string(),
            expected: expected.to_string(),
            observed,
            diagnostics: None,
        })
    }
}
