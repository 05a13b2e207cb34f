//! Scenarios
//!
//! A scenario is a declarative description of a repeated start/stop cycle:
//! optional setup steps, a cycle body executed `cycles` times, and optional
//! teardown steps. The same [`ScenarioRunner`] executes every definition, so
//! the built-in suite and user-supplied TOML definitions behave identically.
//!
//! ```toml
//! [[scenario]]
//! id = "quick_counters"
//! cycles = 3
//! setup = [{ step = "expect_idle" }]
//! cycle = [
//!     { step = "start" },
//!     { step = "snapshot", marker = "post_start" },
//!     { step = "poll", count = 2, interval = "5s" },
//!     { step = "stop" },
//!     { step = "assert_zero_rate" },
//! ]
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::HarnessConfig;
use crate::counters::{CounterId, CounterSelection, LifecycleMarker};
use crate::endpoint::PvValue;
use crate::error::{ErrorKind, HarnessError, HarnessResult};
use crate::state::StateLayout;

pub mod catalog;
pub mod runner;

pub use catalog::ScenarioCatalog;
pub use runner::ScenarioRunner;

/// One parameterised verification procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    /// Identifier used in manifests
    pub id: String,
    /// One line shown in listings
    #[serde(default)]
    pub description: String,
    /// Number of times the cycle body runs
    #[serde(default)]
    pub cycles: u64,
    /// Where the acquisition state is read from
    #[serde(default)]
    pub state_layout: StateLayout,
    /// Attach a delayed re-read and the status message to state mismatches
    #[serde(default)]
    pub diagnostics: bool,
    /// Overrides `timing.command_timeout` for this scenario
    #[serde(default, with = "humantime_serde")]
    pub command_timeout: Option<Duration>,
    /// Attempts per command write (1 = no retry)
    #[serde(default = "default_command_attempts")]
    pub command_attempts: u32,
    /// Delay between command attempts
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Counter families captured by snapshots
    #[serde(default)]
    pub counters: CounterSelection,
    /// Counters allowed to stay flat between two polls
    #[serde(default)]
    pub idle_sources: Vec<CounterId>,
    /// Steps run once before the first cycle
    #[serde(default)]
    pub setup: Vec<Step>,
    /// Steps run `cycles` times
    #[serde(default)]
    pub cycle: Vec<Step>,
    /// Steps run once after the last cycle, skipped after a failure
    #[serde(default)]
    pub teardown: Vec<Step>,
}

fn default_command_attempts() -> u32 {
    1
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

/// A single action inside a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Device must be idle before anything else happens
    ExpectIdle,
    /// Acknowledged start, then require the acquiring state
    Start,
    /// Acknowledged stop, then require the idle state
    Stop,
    /// Reset counters (acknowledged)
    Reset,
    /// Acknowledged write to `<base>:<endpoint>`
    Write {
        /// Suffix under the base name
        endpoint: String,
        /// Value to write
        value: PvValue,
    },
    /// Sleep for `min` or a uniformly random time in `min..=max`
    Dwell {
        /// Shortest sleep
        #[serde(with = "humantime_serde")]
        min: Duration,
        /// Longest sleep
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
    /// Capture the selected counters
    Snapshot {
        /// Lifecycle point the snapshot stands for
        marker: LifecycleMarker,
    },
    /// Latest snapshot must exceed the one before it
    AssertMonotonic,
    /// Log the two latest snapshots side by side at info level
    LogCounters,
    /// This cycle's restart snapshot must be below the previous cycle's final one
    AssertReset,
    /// `count` times: sleep `interval`, snapshot, check monotonic
    Poll {
        /// Number of polls
        count: u32,
        /// Sleep before each poll
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    /// Every event rate must read zero within the settle window
    AssertZeroRate,
    /// Nested sweep over `axes`, outermost first
    Sweep {
        /// Axes, outermost first
        axes: Vec<SweepAxis>,
        /// Sleep after each combination is written
        #[serde(with = "humantime_serde")]
        dwell: Duration,
    },
}

impl Step {
    /// Fixed-length dwell.
    pub fn dwell(duration: Duration) -> Self {
        Step::Dwell {
            min: duration,
            max: duration,
        }
    }

    /// Snapshot at `marker`.
    pub fn snapshot(marker: LifecycleMarker) -> Self {
        Step::Snapshot { marker }
    }
}

/// One axis of a sweep: writes `start, start + step, ...` while below `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepAxis {
    /// Suffix under the base name
    pub endpoint: String,
    /// First value written
    #[serde(default)]
    pub start: i64,
    /// Exclusive upper bound
    pub stop: i64,
    /// Increment, must be positive
    #[serde(default = "default_sweep_step")]
    pub step: i64,
}

fn default_sweep_step() -> i64 {
    1
}

impl SweepAxis {
    /// Axis over `start..stop` in increments of `step`.
    pub fn new(endpoint: &str, start: i64, stop: i64, step: i64) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            start,
            stop,
            step,
        }
    }

    /// Values visited along this axis.
    pub fn values(&self) -> Vec<i64> {
        if self.step <= 0 {
            return Vec::new();
        }
        let mut values = Vec::new();
        let mut value = self.start;
        while value < self.stop {
            values.push(value);
            value += self.step;
        }
        values
    }
}

impl ScenarioDefinition {
    /// Empty definition with default settings.
    pub fn new(id: &str, cycles: u64) -> Self {
        Self {
            id: id.to_string(),
            description: String::new(),
            cycles,
            state_layout: StateLayout::Detector,
            diagnostics: false,
            command_timeout: None,
            command_attempts: default_command_attempts(),
            retry_delay: default_retry_delay(),
            counters: CounterSelection::default(),
            idle_sources: Vec::new(),
            setup: Vec::new(),
            cycle: Vec::new(),
            teardown: Vec::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Replace the setup steps.
    pub fn with_setup(mut self, steps: Vec<Step>) -> Self {
        self.setup = steps;
        self
    }

    /// Replace the cycle body.
    pub fn with_cycle(mut self, steps: Vec<Step>) -> Self {
        self.cycle = steps;
        self
    }

    /// Replace the teardown steps.
    pub fn with_teardown(mut self, steps: Vec<Step>) -> Self {
        self.teardown = steps;
        self
    }

    /// Select the captured counter families.
    pub fn with_counters(mut self, counters: CounterSelection) -> Self {
        self.counters = counters;
        self
    }

    /// Choose where state is read from.
    pub fn with_state_layout(mut self, layout: StateLayout) -> Self {
        self.state_layout = layout;
        self
    }

    /// Attach diagnostics to state mismatches.
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    /// Override the command acknowledgement timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Check the definition is runnable against `config`.
    ///
    /// # Errors
    /// `Config` naming the scenario and the offending part.
    pub fn validate(&self, config: &HarnessConfig) -> HarnessResult<()> {
        let invalid = |reason: String| HarnessError::Config(format!("scenario '{}': {reason}", self.id));

        if self.id.is_empty() || self.id.chars().any(char::is_whitespace) {
            return Err(invalid("id must be non-empty and contain no whitespace".to_string()));
        }
        if self.cycles > 0 && self.cycle.is_empty() {
            return Err(invalid("cycle body is empty".to_string()));
        }
        if self.command_attempts == 0 {
            return Err(invalid("command_attempts must be at least 1".to_string()));
        }
        if self.command_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(invalid("command_timeout must be non-zero".to_string()));
        }
        if self.state_layout == StateLayout::RunControl && config.run_control.is_none() {
            return Err(invalid(
                "run_control state layout requires a [run_control] configuration".to_string(),
            ));
        }

        let counters = self.counters.counters(&config.device);
        if let Some(stray) = self.idle_sources.iter().find(|id| !counters.contains(*id)) {
            return Err(invalid(format!("idle source {stray} is not a selected counter")));
        }

        for (block, steps) in [
            ("setup", &self.setup),
            ("cycle", &self.cycle),
            ("teardown", &self.teardown),
        ] {
            validate_block(steps, !counters.is_empty())
                .map_err(|reason| invalid(format!("{block}: {reason}")))?;
        }
        Ok(())
    }
}

/// Every check must have the snapshots it compares taken earlier in the same block.
fn validate_block(steps: &[Step], has_counters: bool) -> Result<(), String> {
    let mut snapshots = 0usize;
    let mut restart = false;
    for (index, step) in steps.iter().enumerate() {
        let position = index + 1;
        match step {
            Step::Snapshot { marker } => {
                if !has_counters {
                    return Err(format!("step {position} takes a snapshot but no counters are selected"));
                }
                snapshots += 1;
                restart |= marker.is_restart();
            }
            Step::AssertMonotonic | Step::LogCounters if snapshots < 2 => {
                return Err(format!("step {position} needs two earlier snapshots"));
            }
            Step::AssertReset if !restart => {
                return Err(format!(
                    "step {position} needs an earlier post_start or post_reset snapshot"
                ));
            }
            Step::Poll { count, .. } => {
                if snapshots == 0 {
                    return Err(format!("step {position} needs an earlier snapshot"));
                }
                if *count == 0 {
                    return Err(format!("step {position} polls zero times"));
                }
                snapshots += 1;
            }
            Step::Dwell { min, max } if min > max => {
                return Err(format!("step {position} dwell min exceeds max"));
            }
            Step::Write { endpoint, .. } if endpoint.is_empty() => {
                return Err(format!("step {position} writes to an empty endpoint"));
            }
            Step::Sweep { axes, .. } => {
                if axes.is_empty() {
                    return Err(format!("step {position} sweeps no axes"));
                }
                if let Some(axis) = axes
                    .iter()
                    .find(|axis| axis.endpoint.is_empty() || axis.values().is_empty())
                {
                    return Err(format!(
                        "step {position} axis '{}' needs a positive step and start < stop",
                        axis.endpoint
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Scenario outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScenarioStatus {
    /// Every step passed
    Success,
    /// A step failed, or the scenario could not run
    Failure,
}

impl ScenarioStatus {
    /// Name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioStatus::Success => "SUCCESS",
            ScenarioStatus::Failure => "FAILURE",
        }
    }
}

/// Result of running one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    /// Scenario id
    pub scenario: String,
    /// Pass or fail
    pub status: ScenarioStatus,
    /// Failure reason, carrying the failed comparison
    pub reason: Option<String>,
    /// Classification of the failure, when it came from a harness error
    pub error_kind: Option<ErrorKind>,
    /// Cycle bodies that ran to completion
    pub cycles_completed: u64,
    /// Cycle index (from 0) the failure occurred in; `None` for setup and
    /// teardown failures
    pub failed_cycle: Option<u64>,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Wall-clock end
    pub ended_at: DateTime<Utc>,
    /// `ended_at - started_at`
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl ScenarioOutcome {
    /// Successful outcome starting now.
    pub fn new(scenario: &str) -> Self {
        let now = Utc::now();
        Self {
            scenario: scenario.to_string(),
            status: ScenarioStatus::Success,
            reason: None,
            error_kind: None,
            cycles_completed: 0,
            failed_cycle: None,
            started_at: now,
            ended_at: now,
            duration: Duration::ZERO,
        }
    }

    /// Record how many cycle bodies completed.
    pub fn with_cycles_completed(mut self, cycles: u64) -> Self {
        self.cycles_completed = cycles;
        self
    }

    /// Record `err` as the failure.
    pub fn with_failure(mut self, err: &HarnessError, failed_cycle: Option<u64>) -> Self {
        self.status = ScenarioStatus::Failure;
        self.reason = Some(err.to_string());
        self.error_kind = Some(err.kind());
        self.failed_cycle = failed_cycle;
        self
    }

    /// Failure with a free-text reason and no harness error (e.g. a
    /// subprocess exit status).
    pub fn with_reason(mut self, reason: String) -> Self {
        self.status = ScenarioStatus::Failure;
        self.reason = Some(reason);
        self
    }

    /// Mark the outcome as completed at `ended_at`.
    pub fn mark_completed(mut self, ended_at: DateTime<Utc>) -> Self {
        self.ended_at = ended_at;
        self.duration = ended_at
            .signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self
    }

    /// True when the status is success.
    pub fn is_success(&self) -> bool {
        self.status == ScenarioStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunControlConfig;

    fn counting() -> ScenarioDefinition {
        ScenarioDefinition::new("counting", 2).with_cycle(vec![
            Step::Start,
            Step::snapshot(LifecycleMarker::PostStart),
            Step::AssertReset,
            Step::Poll {
                count: 2,
                interval: Duration::from_secs(1),
            },
            Step::Stop,
        ])
    }

    #[test]
    fn test_parse_definition_from_toml() {
        let text = r#"
            id = "sweep_once"
            cycles = 1
            diagnostics = true
            command_timeout = "20s"
            idle_sources = ["Det2:EventTotal_RBV"]
            cycle = [
                { step = "write", endpoint = "Det1:PixelROIFilterEnable", value = 1 },
                { step = "start" },
                { step = "dwell", min = "1s", max = "5s" },
                { step = "sweep", dwell = "100ms", axes = [{ endpoint = "Det1:XY:ROI:1:MinX", stop = 4 }] },
                { step = "stop" },
            ]
        "#;
        let definition: ScenarioDefinition = toml::from_str(text).unwrap();
        assert_eq!(definition.command_timeout, Some(Duration::from_secs(20)));
        assert_eq!(definition.idle_sources, vec![CounterId::EventTotal(2)]);
        assert_eq!(
            definition.cycle[0],
            Step::Write {
                endpoint: "Det1:PixelROIFilterEnable".to_string(),
                value: PvValue::Int(1),
            }
        );
        assert_eq!(
            definition.cycle[2],
            Step::Dwell {
                min: Duration::from_secs(1),
                max: Duration::from_secs(5),
            }
        );
        match &definition.cycle[3] {
            Step::Sweep { axes, .. } => assert_eq!(axes[0].values(), vec![0, 1, 2, 3]),
            other => panic!("expected sweep, got {other:?}"),
        }
        definition.validate(&HarnessConfig::default()).unwrap();
    }

    #[test]
    fn test_valid_definition() {
        counting().validate(&HarnessConfig::default()).unwrap();
    }

    #[test]
    fn test_checks_need_earlier_snapshots() {
        let config = HarnessConfig::default();

        let reset_first = ScenarioDefinition::new("bad_reset", 1)
            .with_cycle(vec![Step::Start, Step::AssertReset]);
        let err = reset_first.validate(&config).unwrap_err();
        assert!(err.to_string().contains("cycle: step 2"), "{err}");

        let poll_first = ScenarioDefinition::new("bad_poll", 1).with_cycle(vec![Step::Poll {
            count: 1,
            interval: Duration::from_secs(1),
        }]);
        assert!(poll_first.validate(&config).is_err());

        let monotonic = ScenarioDefinition::new("bad_monotonic", 1).with_cycle(vec![
            Step::snapshot(LifecycleMarker::PostStart),
            Step::AssertMonotonic,
        ]);
        assert!(monotonic.validate(&config).is_err());

        let log_first = ScenarioDefinition::new("bad_log", 1).with_cycle(vec![
            Step::snapshot(LifecycleMarker::PostStop),
            Step::LogCounters,
        ]);
        assert!(log_first.validate(&config).is_err());
    }

    #[test]
    fn test_rejects_bad_settings() {
        let config = HarnessConfig::default();

        assert!(ScenarioDefinition::new("no_body", 3).validate(&config).is_err());
        assert!(ScenarioDefinition::new("has space", 0).validate(&config).is_err());

        let inverted = ScenarioDefinition::new("inverted", 1).with_cycle(vec![Step::Dwell {
            min: Duration::from_secs(5),
            max: Duration::from_secs(1),
        }]);
        assert!(inverted.validate(&config).is_err());

        let empty_axis = ScenarioDefinition::new("empty_axis", 1).with_cycle(vec![Step::Sweep {
            axes: vec![SweepAxis::new("Det1:XY:ROI:1:MinX", 4, 4, 1)],
            dwell: Duration::ZERO,
        }]);
        assert!(empty_axis.validate(&config).is_err());

        let mut stray = counting();
        stray.idle_sources = vec![CounterId::RoiTotal(0)];
        assert!(stray.validate(&config).is_err());
    }

    #[test]
    fn test_run_control_layout_needs_configuration() {
        let definition = counting().with_state_layout(StateLayout::RunControl);
        assert!(definition.validate(&HarnessConfig::default()).is_err());

        let config = HarnessConfig {
            run_control: Some(RunControlConfig {
                base: "BL99:CS:RunControl".to_string(),
                ready_state: 1,
                running_state: 3,
            }),
            ..HarnessConfig::default()
        };
        definition.validate(&config).unwrap();
    }

    #[test]
    fn test_outcome_records_failure() {
        let err = HarnessError::Timeout {
            endpoint: "BL99:Det:N1:Stop".to_string(),
            timeout: Duration::from_secs(10),
        };
        let outcome = ScenarioOutcome::new("start_stop")
            .with_cycles_completed(3)
            .with_failure(&err, Some(3))
            .mark_completed(Utc::now());

        assert!(!outcome.is_success());
        assert_eq!(outcome.status.as_str(), "FAILURE");
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(outcome.failed_cycle, Some(3));
        assert!(outcome.reason.unwrap().contains("BL99:Det:N1:Stop"));
    }
}
