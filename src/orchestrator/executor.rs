//! Scenario executors
//!
//! The orchestrator hands each manifest entry to a [`ScenarioExecutor`]:
//! - [`InProcessExecutor`] looks the id up in a [`ScenarioCatalog`] and runs
//!   it against a shared endpoint client.
//! - [`SubprocessExecutor`] runs `<dir>/<id> <base>` and maps the exit status
//!   to an outcome. Output is inherited so progress streams live.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::HarnessConfig;
use crate::endpoint::EndpointClient;
use crate::error::{HarnessError, HarnessResult};
use crate::scenario::{ScenarioCatalog, ScenarioOutcome, ScenarioRunner};

/// Runs one scenario by id.
#[async_trait]
pub trait ScenarioExecutor: Send + Sync {
    /// Execute `scenario` against `base`.
    ///
    /// # Errors
    /// Setup problems that prevent the scenario from running at all (unknown
    /// id, missing executable). Verification failures are reported in the
    /// outcome instead.
    async fn execute(&self, scenario: &str, base: &str) -> HarnessResult<ScenarioOutcome>;
}

/// Runs catalog scenarios in this process.
pub struct InProcessExecutor<C: ?Sized> {
    client: Arc<C>,
    config: Arc<HarnessConfig>,
    catalog: ScenarioCatalog,
}

impl<C: EndpointClient + ?Sized> InProcessExecutor<C> {
    /// Executor resolving ids in `catalog` and running them against `client`.
    pub fn new(client: Arc<C>, config: Arc<HarnessConfig>, catalog: ScenarioCatalog) -> Self {
        Self {
            client,
            config,
            catalog,
        }
    }

    /// Scenarios this executor can run.
    pub fn catalog(&self) -> &ScenarioCatalog {
        &self.catalog
    }
}

#[async_trait]
impl<C: EndpointClient + ?Sized + 'static> ScenarioExecutor for InProcessExecutor<C> {
    async fn execute(&self, scenario: &str, base: &str) -> HarnessResult<ScenarioOutcome> {
        let definition = self.catalog.require(scenario)?;
        let runner = ScenarioRunner::new(self.client.as_ref(), self.config.as_ref());
        Ok(runner.run(definition, base).await)
    }
}

/// Runs each scenario as an executable named after its id.
#[derive(Debug, Clone)]
pub struct SubprocessExecutor {
    dir: PathBuf,
}

impl SubprocessExecutor {
    /// Executor looking up scenario executables in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the scenario executables.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ScenarioExecutor for SubprocessExecutor {
    async fn execute(&self, scenario: &str, base: &str) -> HarnessResult<ScenarioOutcome> {
        let program = self.dir.join(scenario);
        if !program.is_file() {
            return Err(HarnessError::Config(format!(
                "no executable for scenario '{scenario}' at {}",
                program.display()
            )));
        }

        debug!(program = %program.display(), base, "Spawning scenario");
        let outcome = ScenarioOutcome::new(scenario);
        let status = Command::new(&program)
            .arg(base)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;

        let outcome = if status.success() {
            outcome
        } else {
            warn!(scenario, %status, "Scenario process failed");
            outcome.with_reason(format!("{} exited with {status}", program.display()))
        };
        Ok(outcome.mark_completed(Utc::now()))
    }
}
