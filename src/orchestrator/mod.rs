//! Orchestrator
//!
//! Runs the scenarios listed in a [`Manifest`] in order against one endpoint
//! base and stops at the first failure. Scenarios after a failure never run.

use chrono::Utc;
use tracing::{error, info};

use crate::scenario::ScenarioOutcome;

pub mod executor;
pub mod manifest;
pub mod report;

pub use executor::{InProcessExecutor, ScenarioExecutor, SubprocessExecutor};
pub use manifest::Manifest;
pub use report::RunReport;

/// Fail-fast manifest runner
pub struct Orchestrator {
    executor: Box<dyn ScenarioExecutor>,
}

impl Orchestrator {
    /// Orchestrator handing every entry to `executor`.
    pub fn new(executor: impl ScenarioExecutor + 'static) -> Self {
        Self {
            executor: Box::new(executor),
        }
    }

    /// Run every entry of `manifest` against `base` until one fails.
    ///
    /// An executor error (unknown scenario, missing executable) counts as a
    /// failed outcome for that entry.
    pub async fn run(&self, manifest: &Manifest, base: &str) -> RunReport {
        let mut report = RunReport::new(base);
        if manifest.is_empty() {
            info!(base, "Manifest is empty, nothing to run");
            return report;
        }

        let total = manifest.len();
        for (position, scenario) in manifest.entries().iter().enumerate() {
            info!(scenario = %scenario, "Scenario {}/{}", position + 1, total);
            let outcome = match self.executor.execute(scenario, base).await {
                Ok(outcome) => outcome,
                Err(err) => ScenarioOutcome::new(scenario)
                    .with_failure(&err, None)
                    .mark_completed(Utc::now()),
            };

            let passed = outcome.is_success();
            report.add_outcome(outcome);
            if !passed {
                error!(
                    scenario = %scenario,
                    skipped = total - position - 1,
                    "Scenario failed, stopping run"
                );
                return report;
            }
        }

        info!(base, scenarios = total, "All scenarios passed");
        report
    }
}
