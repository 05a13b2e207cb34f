//! Scenario execution
//!
//! Runs setup, `cycles` repetitions of the cycle body, then teardown, stopping
//! at the first error. The first error becomes the scenario's failure reason;
//! nothing after it runs, not even teardown.

use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{ScenarioDefinition, ScenarioOutcome, Step, SweepAxis};
use crate::config::HarnessConfig;
use crate::counters::{CounterEngine, CounterSnapshot, LifecycleMarker};
use crate::endpoint::names;
use crate::endpoint::{Acknowledge, EndpointClient, PvValue};
use crate::error::{HarnessError, HarnessResult};
use crate::retry::RetryPolicy;
use crate::state::{DeviceState, StateVerifier};

/// Executes scenario definitions against one endpoint client.
pub struct ScenarioRunner<'a, C: ?Sized> {
    client: &'a C,
    config: &'a HarnessConfig,
}

/// Where in the scenario a step failed
enum Phase {
    Setup,
    Cycle(u64),
    Teardown,
}

/// Snapshots kept for the reset and monotonic checks
#[derive(Default)]
struct Ledger {
    /// Final snapshot of the previous cycle
    previous_final: Option<CounterSnapshot>,
    /// This cycle's post-start or post-reset snapshot
    restart: Option<CounterSnapshot>,
    pre_stop: Option<CounterSnapshot>,
    earlier: Option<CounterSnapshot>,
    latest: Option<CounterSnapshot>,
}

impl Ledger {
    fn record(&mut self, snapshot: CounterSnapshot) {
        if snapshot.marker.is_restart() {
            self.restart = Some(snapshot.clone());
        }
        if snapshot.marker == LifecycleMarker::PreStop {
            self.pre_stop = Some(snapshot.clone());
        }
        self.earlier = self.latest.replace(snapshot);
    }

    /// Close the cycle: its pre-stop snapshot (or latest one) becomes the
    /// reference for the next cycle's reset check.
    fn end_cycle(&mut self) {
        let last = self.pre_stop.take().or_else(|| self.latest.take());
        if last.is_some() {
            self.previous_final = last;
        }
        self.restart = None;
        self.earlier = None;
        self.latest = None;
    }
}

struct Execution<'r, C: ?Sized> {
    client: &'r C,
    config: &'r HarnessConfig,
    definition: &'r ScenarioDefinition,
    base: &'r str,
    verifier: StateVerifier<'r, C>,
    engine: CounterEngine<'r, C>,
    command_timeout: Duration,
    ledger: Ledger,
}

impl<'a, C: EndpointClient + ?Sized> ScenarioRunner<'a, C> {
    /// Runner driving `client` with timing from `config`.
    pub fn new(client: &'a C, config: &'a HarnessConfig) -> Self {
        Self { client, config }
    }

    /// Run `definition` against the device at `base`.
    ///
    /// Never returns an error: every failure, including an invalid definition,
    /// is reported in the outcome.
    pub async fn run(&self, definition: &ScenarioDefinition, base: &str) -> ScenarioOutcome {
        let outcome = ScenarioOutcome::new(&definition.id);
        info!(
            scenario = %definition.id,
            base,
            cycles = definition.cycles,
            "Running scenario"
        );

        let mut execution = match self.prepare(definition, base) {
            Ok(execution) => execution,
            Err(err) => {
                error!(scenario = %definition.id, error = %err, "Scenario cannot run");
                return outcome.with_failure(&err, None).mark_completed(Utc::now());
            }
        };

        let mut completed = 0;
        let result = execution.run_all(&mut completed).await;
        let outcome = outcome.with_cycles_completed(completed);
        let outcome = match result {
            Ok(()) => {
                info!(scenario = %definition.id, cycles = completed, "Scenario passed");
                outcome
            }
            Err((phase, err)) => {
                let failed_cycle = match phase {
                    Phase::Cycle(cycle) => Some(cycle),
                    Phase::Setup | Phase::Teardown => None,
                };
                error!(
                    scenario = %definition.id,
                    cycle = ?failed_cycle,
                    error = %err,
                    "Scenario failed"
                );
                outcome.with_failure(&err, failed_cycle)
            }
        };
        outcome.mark_completed(Utc::now())
    }

    fn prepare<'r>(
        &'r self,
        definition: &'r ScenarioDefinition,
        base: &'r str,
    ) -> HarnessResult<Execution<'r, C>> {
        definition.validate(self.config)?;

        let command_timeout = definition
            .command_timeout
            .unwrap_or(self.config.timing.command_timeout);
        let retry = RetryPolicy::attempts(definition.command_attempts, definition.retry_delay);
        let verifier = StateVerifier::new(self.client, self.config)
            .with_layout(definition.state_layout)?
            .with_command_timeout(command_timeout)
            .with_retry(retry);

        let counters = definition.counters.counters(&self.config.device);
        let engine = CounterEngine::new(self.client, counters, self.config)
            .with_idle_sources(definition.idle_sources.iter().copied());

        Ok(Execution {
            client: self.client,
            config: self.config,
            definition,
            base,
            verifier,
            engine,
            command_timeout,
            ledger: Ledger::default(),
        })
    }
}

impl<C: EndpointClient + ?Sized> Execution<'_, C> {
    async fn run_all(&mut self, completed: &mut u64) -> Result<(), (Phase, HarnessError)> {
        let definition = self.definition;

        self.run_steps(&definition.setup, 0)
            .await
            .map_err(|err| (Phase::Setup, err))?;

        for cycle in 0..definition.cycles {
            info!(
                scenario = %definition.id,
                "Cycle {}/{}",
                cycle + 1,
                definition.cycles
            );
            self.run_steps(&definition.cycle, cycle)
                .await
                .map_err(|err| (Phase::Cycle(cycle), err))?;
            self.ledger.end_cycle();
            *completed += 1;
        }

        self.run_steps(&definition.teardown, definition.cycles)
            .await
            .map_err(|err| (Phase::Teardown, err))
    }

    async fn run_steps(&mut self, steps: &[Step], cycle: u64) -> HarnessResult<()> {
        for step in steps {
            self.run_step(step, cycle).await?;
        }
        Ok(())
    }

    async fn run_step(&mut self, step: &Step, cycle: u64) -> HarnessResult<()> {
        debug!(?step, cycle, "Step");
        match step {
            Step::ExpectIdle => {
                let checked = self.verifier.check_state(self.base, DeviceState::Idle).await;
                self.with_diagnostics(checked).await
            }
            Step::Start => {
                let started = self.verifier.start(self.base).await;
                self.with_diagnostics(started).await
            }
            Step::Stop => {
                let stopped = self.verifier.stop(self.base).await;
                self.with_diagnostics(stopped).await
            }
            Step::Reset => self.verifier.reset(self.base).await,
            Step::Write { endpoint, value } => self.write(endpoint, value.clone()).await,
            Step::Dwell { min, max } => {
                let pause = pick_dwell(*min, *max);
                debug!(?pause, "Dwell");
                sleep(pause).await;
                Ok(())
            }
            Step::Snapshot { marker } => {
                let snapshot = self.engine.snapshot(self.base, *marker, cycle).await?;
                self.ledger.record(snapshot);
                Ok(())
            }
            Step::AssertMonotonic => match (&self.ledger.earlier, &self.ledger.latest) {
                (Some(earlier), Some(latest)) => self.engine.assert_monotonic(earlier, latest),
                _ => Err(HarnessError::Config(
                    "assert_monotonic needs two snapshots in this cycle".to_string(),
                )),
            },
            Step::LogCounters => match (&self.ledger.earlier, &self.ledger.latest) {
                (Some(earlier), Some(latest)) => {
                    log_counters(&self.definition.id, earlier, latest);
                    Ok(())
                }
                _ => Err(HarnessError::Config(
                    "log_counters needs two snapshots in this cycle".to_string(),
                )),
            },
            Step::AssertReset => match (&self.ledger.previous_final, &self.ledger.restart) {
                (Some(previous), Some(restart)) => self.engine.assert_reset(previous, restart),
                // Nothing to compare against on the first cycle.
                (None, _) => Ok(()),
                (Some(_), None) => Err(HarnessError::Config(
                    "assert_reset needs a restart snapshot in this cycle".to_string(),
                )),
            },
            Step::Poll { count, interval } => {
                for poll in 0..*count {
                    sleep(*interval).await;
                    let snapshot = self
                        .engine
                        .snapshot(self.base, LifecycleMarker::MidRun, cycle)
                        .await?;
                    if let Some(previous) = &self.ledger.latest {
                        self.engine.assert_monotonic(previous, &snapshot)?;
                    }
                    info!(
                        scenario = %self.definition.id,
                        "Poll {} on cycle {} is OK",
                        poll,
                        cycle
                    );
                    self.ledger.record(snapshot);
                }
                Ok(())
            }
            Step::AssertZeroRate => self.engine.assert_zero_rate(self.base, cycle).await,
            Step::Sweep { axes, dwell } => self.sweep(axes, *dwell).await,
        }
    }

    async fn write(&self, suffix: &str, value: PvValue) -> HarnessResult<()> {
        let endpoint = names::derive(self.base, suffix);
        let ack = Acknowledge::Wait(self.command_timeout);
        self.client
            .write(&endpoint, value, ack)
            .await
            .inspect_err(|err| error!(endpoint = %endpoint, error = %err, "Write failed"))
    }

    /// Odometer walk over the axes: whenever an axis changes, it and every
    /// axis inside it are written, outermost first.
    async fn sweep(&self, axes: &[SweepAxis], dwell: Duration) -> HarnessResult<()> {
        let values: Vec<Vec<i64>> = axes.iter().map(SweepAxis::values).collect();
        if values.is_empty() || values.iter().any(Vec::is_empty) {
            return Ok(());
        }

        let mut position = vec![0usize; axes.len()];
        let mut changed_from = 0;
        loop {
            for axis in changed_from..axes.len() {
                let value = values[axis][position[axis]];
                self.write(&axes[axis].endpoint, PvValue::Int(value)).await?;
            }
            debug!(?position, "Sweep point");
            sleep(dwell).await;

            let mut axis = axes.len();
            loop {
                if axis == 0 {
                    return Ok(());
                }
                axis -= 1;
                position[axis] += 1;
                if position[axis] < values[axis].len() {
                    break;
                }
                position[axis] = 0;
            }
            changed_from = axis;
        }
    }

    /// Attach diagnostics to a state mismatch when the scenario asks for them.
    async fn with_diagnostics(&self, result: HarnessResult<()>) -> HarnessResult<()> {
        match result {
            Err(err @ HarnessError::StateMismatch { .. }) if self.definition.diagnostics => {
                let delay = self.config.timing.diagnostic_delay;
                warn!(
                    scenario = %self.definition.id,
                    ?delay,
                    "State mismatch, collecting diagnostics"
                );
                Err(self.verifier.diagnose(self.base, err, delay).await)
            }
            other => other,
        }
    }
}

fn log_counters(scenario: &str, earlier: &CounterSnapshot, latest: &CounterSnapshot) {
    for (counter, after) in &latest.values {
        info!(
            scenario,
            cycle = latest.cycle,
            counter = %counter,
            before = ?earlier.get(*counter),
            after = *after,
            "Counter {:?} -> {:?}",
            earlier.marker,
            latest.marker
        );
    }
}

/// `min` when fixed. Otherwise uniformly random in `min..=max`, in whole
/// seconds when both bounds are whole seconds.
fn pick_dwell(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    let mut rng = rand::thread_rng();
    if min.subsec_nanos() == 0 && max.subsec_nanos() == 0 {
        Duration::from_secs(rng.gen_range(min.as_secs()..=max.as_secs()))
    } else {
        let millis = rng.gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}
