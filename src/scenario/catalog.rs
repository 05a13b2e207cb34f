//! Scenario catalog
//!
//! The built-in verification suite plus any definitions loaded from a
//! `scenarios_file`. Loaded definitions replace built-ins with the same id.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::{ScenarioDefinition, Step, SweepAxis};
use crate::config::HarnessConfig;
use crate::counters::{CounterSelection, LifecycleMarker};
use crate::endpoint::PvValue;
use crate::error::{HarnessError, HarnessResult};
use crate::state::StateLayout;

/// Scenario definitions by id
#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    scenarios: BTreeMap<String, ScenarioDefinition>,
}

#[derive(Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    scenario: Vec<ScenarioDefinition>,
}

impl ScenarioCatalog {
    /// The built-in suite.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        for definition in [
            start_stop(),
            start_reset(),
            counters(),
            roi_reset(),
            rapid_cycle(),
            start_race(),
            run_control_cycle(),
            xy_roi_sweep(),
        ] {
            catalog.insert(definition);
        }
        catalog
    }

    /// Built-in suite merged with `config.scenarios_file`, every definition
    /// validated against `config`.
    ///
    /// Definitions that need configuration the deployment lacks (for example
    /// the run-control layout without `[run_control]`) fail when run, not here.
    pub fn for_config(config: &HarnessConfig) -> HarnessResult<Self> {
        let mut catalog = Self::builtin();
        if let Some(path) = &config.scenarios_file {
            let loaded = catalog.load_file(path)?;
            for id in &loaded {
                if let Some(definition) = catalog.get(id) {
                    definition.validate(config)?;
                }
            }
            info!(path = %path.display(), count = loaded.len(), "Loaded scenario definitions");
        }
        Ok(catalog)
    }

    /// Parse `[[scenario]]` tables from TOML text.
    pub fn parse_toml(text: &str) -> HarnessResult<Vec<ScenarioDefinition>> {
        let file: ScenarioFile = toml::from_str(text)
            .map_err(|err| HarnessError::Config(format!("invalid scenario definitions: {err}")))?;
        Ok(file.scenario)
    }

    /// Merge definitions from a TOML file. Returns the ids loaded.
    pub fn load_file(&mut self, path: &Path) -> HarnessResult<Vec<String>> {
        let text = std::fs::read_to_string(path)?;
        let definitions = Self::parse_toml(&text).map_err(|err| {
            HarnessError::Config(format!("{}: {err}", path.display()))
        })?;
        Ok(definitions
            .into_iter()
            .map(|definition| {
                let id = definition.id.clone();
                self.insert(definition);
                id
            })
            .collect())
    }

    /// Add or replace a definition, returning the one it replaced.
    pub fn insert(&mut self, definition: ScenarioDefinition) -> Option<ScenarioDefinition> {
        self.scenarios.insert(definition.id.clone(), definition)
    }

    /// Definition registered under `id`.
    pub fn get(&self, id: &str) -> Option<&ScenarioDefinition> {
        self.scenarios.get(id)
    }

    /// Look up `id`, failing with a configuration error naming it.
    pub fn require(&self, id: &str) -> HarnessResult<&ScenarioDefinition> {
        self.get(id).ok_or_else(|| {
            HarnessError::Config(format!(
                "unknown scenario '{id}' (known: {})",
                self.ids().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(String::as_str)
    }

    /// Number of registered scenarios.
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    /// True when no scenario is registered.
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

fn secs(seconds: u64) -> Duration {
    Duration::from_secs(seconds)
}

fn start_stop() -> ScenarioDefinition {
    ScenarioDefinition::new("start_stop", 100)
        .with_description("Start and stop repeatedly with a random 1-5 s acquisition")
        .with_setup(vec![Step::ExpectIdle])
        .with_cycle(vec![
            Step::Start,
            Step::Dwell {
                min: secs(1),
                max: secs(5),
            },
            Step::Stop,
        ])
}

fn start_reset() -> ScenarioDefinition {
    ScenarioDefinition::new("start_reset", 100)
        .with_description("Counters reset on every start and rates drop to zero on stop")
        .with_setup(vec![Step::ExpectIdle])
        .with_cycle(vec![
            Step::Start,
            Step::snapshot(LifecycleMarker::PostStart),
            Step::AssertReset,
            Step::dwell(secs(5)),
            Step::snapshot(LifecycleMarker::PreStop),
            Step::AssertMonotonic,
            Step::Stop,
            Step::AssertZeroRate,
        ])
}

fn counters() -> ScenarioDefinition {
    ScenarioDefinition::new("counters", 10)
        .with_description("Counters increase while acquiring")
        .with_setup(vec![Step::ExpectIdle])
        .with_cycle(vec![
            Step::Start,
            Step::snapshot(LifecycleMarker::PostStart),
            Step::Poll {
                count: 10,
                interval: secs(5),
            },
            Step::Stop,
            Step::AssertZeroRate,
        ])
}

fn roi_reset() -> ScenarioDefinition {
    ScenarioDefinition::new("roi_reset", 100)
        .with_description("TOF ROI totals reset on every reset while acquiring")
        .with_counters(CounterSelection::roi_only())
        .with_setup(vec![Step::ExpectIdle, Step::Start])
        .with_cycle(vec![
            Step::Reset,
            Step::snapshot(LifecycleMarker::PostReset),
            Step::AssertReset,
            Step::dwell(secs(5)),
            Step::snapshot(LifecycleMarker::PreStop),
        ])
        .with_teardown(vec![Step::Stop])
}

fn rapid_cycle() -> ScenarioDefinition {
    ScenarioDefinition::new("rapid_cycle", 1000)
        .with_description("Short acquisitions back to back")
        .with_setup(vec![Step::ExpectIdle])
        .with_cycle(vec![Step::Start, Step::dwell(secs(1)), Step::Stop])
}

fn start_race() -> ScenarioDefinition {
    ScenarioDefinition::new("start_race", 100)
        .with_description("State is visible as soon as a start or stop is acknowledged")
        .with_command_timeout(secs(5))
        .with_counters(CounterSelection {
            pulse_counter: false,
            proton_charge: false,
            seq_counter: false,
            ..CounterSelection::default()
        })
        .with_cycle(vec![
            Step::snapshot(LifecycleMarker::PostStop),
            Step::Start,
            Step::snapshot(LifecycleMarker::PostStart),
            Step::LogCounters,
            Step::dwell(secs(5)),
            Step::Stop,
        ])
}

fn run_control_cycle() -> ScenarioDefinition {
    ScenarioDefinition::new("run_control_cycle", 10_000)
        .with_description("Start and stop through the run-control state machine")
        .with_state_layout(StateLayout::RunControl)
        .with_diagnostics(true)
        .with_command_timeout(secs(20))
        .with_setup(vec![Step::ExpectIdle])
        .with_cycle(vec![
            Step::Start,
            Step::Dwell {
                min: secs(1),
                max: secs(10),
            },
            Step::Stop,
            Step::Dwell {
                min: secs(1),
                max: secs(10),
            },
        ])
}

fn xy_roi_sweep() -> ScenarioDefinition {
    let axis = |name: &str| SweepAxis::new(&format!("Det1:XY:ROI:1:{name}"), 0, 32, 1);
    ScenarioDefinition::new("xy_roi_sweep", 2)
        .with_description("Sweep the XY ROI position and size while acquiring")
        .with_command_timeout(secs(20))
        .with_cycle(vec![
            Step::Write {
                endpoint: "Det1:PixelROIFilterEnable".to_string(),
                value: PvValue::Int(1),
            },
            Step::Start,
            Step::Sweep {
                axes: vec![axis("MinX"), axis("MinY"), axis("SizeX"), axis("SizeY")],
                dwell: Duration::from_millis(100),
            },
            Step::Stop,
        ])
}
