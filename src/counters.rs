//! Counter invariant engine
//!
//! Captures counter snapshots at lifecycle points and checks the properties a
//! healthy acquisition must show:
//!
//! - **Monotonic**: while acquiring, every counter in a later snapshot is
//!   strictly greater than in an earlier one. Counters marked as idle sources
//!   (no guaranteed live input) only need to be non-decreasing.
//! - **Reset on start**: the first snapshot after a restart is strictly below
//!   the previous cycle's final snapshot. Zero is not required because events
//!   may already be accumulating by the time the counters are read.
//! - **Zero rate**: after a stop, every detector's instantaneous rate reads
//!   exactly zero within the settle window.
//!
//! A failed check reports every offending counter, not just the first one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::{DeviceConfig, HarnessConfig};
use crate::endpoint::names::{self, KnownEndpoint};
use crate::endpoint::EndpointClient;
use crate::error::{HarnessError, HarnessResult};

/// A monotonically increasing counter exposed by the device.
///
/// Serialised as its endpoint suffix, e.g. `"Det2:EventTotal_RBV"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CounterId {
    /// Per-detector event total (detectors numbered from 1)
    EventTotal(u32),
    /// Accelerator pulse count
    PulseCounter,
    /// Integrated proton charge
    ProtonCharge,
    /// Sequence counter of the incoming data stream
    SeqCounter,
    /// TOF region-of-interest total (ROIs numbered from 0)
    RoiTotal(u32),
}

impl CounterId {
    fn known(&self) -> KnownEndpoint {
        match self {
            CounterId::EventTotal(det) => KnownEndpoint::EventTotal(*det),
            CounterId::PulseCounter => KnownEndpoint::PulseCounter,
            CounterId::ProtonCharge => KnownEndpoint::ProtonCharge,
            CounterId::SeqCounter => KnownEndpoint::SeqCounter,
            CounterId::RoiTotal(roi) => KnownEndpoint::RoiTotal(*roi),
        }
    }

    /// Full endpoint name of this counter under `base`.
    pub fn endpoint(&self, base: &str) -> String {
        names::derive(base, &self.known().suffix())
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.known().suffix())
    }
}

impl FromStr for CounterId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match KnownEndpoint::parse(s) {
            Some(KnownEndpoint::EventTotal(det)) => Ok(CounterId::EventTotal(det)),
            Some(KnownEndpoint::PulseCounter) => Ok(CounterId::PulseCounter),
            Some(KnownEndpoint::ProtonCharge) => Ok(CounterId::ProtonCharge),
            Some(KnownEndpoint::SeqCounter) => Ok(CounterId::SeqCounter),
            Some(KnownEndpoint::RoiTotal(roi)) => Ok(CounterId::RoiTotal(roi)),
            _ => Err(format!("'{s}' is not a counter endpoint")),
        }
    }
}

impl TryFrom<String> for CounterId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CounterId> for String {
    fn from(id: CounterId) -> Self {
        id.to_string()
    }
}

/// Which counter families a scenario captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterSelection {
    /// One event total per configured detector
    pub event_totals: bool,
    /// The pulse counter
    pub pulse_counter: bool,
    /// The proton charge
    pub proton_charge: bool,
    /// The sequence counter
    pub seq_counter: bool,
    /// One total per configured ROI
    pub roi_totals: bool,
}

impl Default for CounterSelection {
    fn default() -> Self {
        Self {
            event_totals: true,
            pulse_counter: true,
            proton_charge: true,
            seq_counter: true,
            roi_totals: false,
        }
    }
}

impl CounterSelection {
    /// Only the TOF ROI totals.
    pub fn roi_only() -> Self {
        Self {
            event_totals: false,
            pulse_counter: false,
            proton_charge: false,
            seq_counter: false,
            roi_totals: true,
        }
    }

    /// Expand the selection into concrete counters for this device.
    pub fn counters(&self, device: &DeviceConfig) -> Vec<CounterId> {
        let mut counters = Vec::new();
        if self.event_totals {
            counters.extend((1..=device.max_detectors).map(CounterId::EventTotal));
        }
        if self.pulse_counter {
            counters.push(CounterId::PulseCounter);
        }
        if self.proton_charge {
            counters.push(CounterId::ProtonCharge);
        }
        if self.seq_counter {
            counters.push(CounterId::SeqCounter);
        }
        if self.roi_totals {
            counters.extend((0..device.max_roi).map(CounterId::RoiTotal));
        }
        counters
    }
}

/// Point in the acquisition lifecycle at which a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMarker {
    /// Right after an acknowledged start
    PostStart,
    /// Right after an acknowledged reset
    PostReset,
    /// While acquiring, between start and stop
    MidRun,
    /// Just before the stop command
    PreStop,
    /// Right after an acknowledged stop
    PostStop,
}

impl LifecycleMarker {
    /// Snapshot taken right after the counters were (re)zeroed.
    pub fn is_restart(&self) -> bool {
        matches!(self, LifecycleMarker::PostStart | LifecycleMarker::PostReset)
    }
}

/// Counter values captured at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSnapshot {
    /// When in the cycle it was taken.
    pub marker: LifecycleMarker,
    /// Cycle index, from 0.
    pub cycle: u64,
    /// Values in selection order.
    pub values: Vec<(CounterId, f64)>,
}

impl CounterSnapshot {
    /// Wrap values read at `marker` of `cycle`.
    pub fn new(marker: LifecycleMarker, cycle: u64, values: Vec<(CounterId, f64)>) -> Self {
        Self {
            marker,
            cycle,
            values,
        }
    }

    /// Value of `counter`, if it was captured.
    pub fn get(&self, counter: CounterId) -> Option<f64> {
        self.values
            .iter()
            .find(|(id, _)| *id == counter)
            .map(|(_, value)| *value)
    }
}

/// Counter invariant being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantCheck {
    /// Counters strictly increase while acquiring
    Monotonic,
    /// Counters restart below the previous cycle's final value
    Reset,
    /// Rates are zero once stopped
    ZeroRate,
}

impl fmt::Display for InvariantCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvariantCheck::Monotonic => "monotonic",
            InvariantCheck::Reset => "reset-on-start",
            InvariantCheck::ZeroRate => "zero-rate",
        })
    }
}

/// One counter that failed a check, with the values that were compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterViolation {
    /// Counter or rate endpoint suffix
    pub counter: String,
    /// Value the observation was compared against
    pub reference: f64,
    /// Value that failed the check
    pub observed: f64,
}

impl CounterViolation {
    /// Record one failed comparison.
    pub fn new(counter: impl Into<String>, reference: f64, observed: f64) -> Self {
        Self {
            counter: counter.into(),
            reference,
            observed,
        }
    }

    /// Human readable form of the failed comparison.
    pub fn describe(&self, check: InvariantCheck) -> String {
        match check {
            InvariantCheck::Monotonic => format!(
                "{} did not increase (earlier {}, later {})",
                self.counter, self.reference, self.observed
            ),
            InvariantCheck::Reset => format!(
                "{} was not reset (previous cycle final {}, after restart {})",
                self.counter, self.reference, self.observed
            ),
            InvariantCheck::ZeroRate => {
                format!("{} is {} after stop", self.counter, self.observed)
            }
        }
    }
}

/// Snapshot capture and invariant checks for one device.
pub struct CounterEngine<'a, C: ?Sized> {
    client: &'a C,
    counters: Vec<CounterId>,
    idle_sources: BTreeSet<CounterId>,
    detectors: u32,
    settle_timeout: Duration,
    settle_poll_interval: Duration,
}

impl<'a, C: EndpointClient + ?Sized> CounterEngine<'a, C> {
    /// Engine over `counters`, with settle timing and detector count from `config`.
    pub fn new(client: &'a C, counters: Vec<CounterId>, config: &HarnessConfig) -> Self {
        Self {
            client,
            counters,
            idle_sources: BTreeSet::new(),
            detectors: config.device.max_detectors,
            settle_timeout: config.timing.settle_timeout,
            settle_poll_interval: config.timing.settle_poll_interval,
        }
    }

    /// Counters that may legitimately stay flat between two polls.
    pub fn with_idle_sources(mut self, idle_sources: impl IntoIterator<Item = CounterId>) -> Self {
        self.idle_sources = idle_sources.into_iter().collect();
        self
    }

    /// Counters captured by every snapshot.
    pub fn counters(&self) -> &[CounterId] {
        &self.counters
    }

    /// Read every selected counter.
    pub async fn snapshot(
        &self,
        base: &str,
        marker: LifecycleMarker,
        cycle: u64,
    ) -> HarnessResult<CounterSnapshot> {
        let mut values = Vec::with_capacity(self.counters.len());
        for counter in &self.counters {
            let value = self.client.read_number(&counter.endpoint(base)).await?;
            values.push((*counter, value));
        }
        debug!(?marker, cycle, ?values, "Counter snapshot");
        Ok(CounterSnapshot::new(marker, cycle, values))
    }

    /// Every counter in `later` must exceed its value in `earlier`.
    pub fn assert_monotonic(
        &self,
        earlier: &CounterSnapshot,
        later: &CounterSnapshot,
    ) -> HarnessResult<()> {
        let violations = compare(earlier, later, |id, before, after| {
            if self.idle_sources.contains(&id) {
                after >= before
            } else {
                after > before
            }
        });
        verdict(InvariantCheck::Monotonic, later.cycle, violations)
    }

    /// Every counter in `current_initial` must be below `previous_final`.
    pub fn assert_reset(
        &self,
        previous_final: &CounterSnapshot,
        current_initial: &CounterSnapshot,
    ) -> HarnessResult<()> {
        let violations = compare(previous_final, current_initial, |_, before, after| {
            after < before
        });
        verdict(InvariantCheck::Reset, current_initial.cycle, violations)
    }

    /// Every detector rate must read zero before the settle window closes.
    pub async fn assert_zero_rate(&self, base: &str, cycle: u64) -> HarnessResult<()> {
        let deadline = Instant::now() + self.settle_timeout;
        loop {
            let mut violations = Vec::new();
            for detector in 1..=self.detectors {
                let endpoint = names::detector_event_rate(base, detector);
                let rate = self.client.read_number(&endpoint).await?;
                if rate != 0.0 {
                    violations.push(CounterViolation::new(
                        KnownEndpoint::EventRate(detector).suffix(),
                        0.0,
                        rate,
                    ));
                }
            }

            let now = Instant::now();
            if violations.is_empty() || now >= deadline {
                return verdict(InvariantCheck::ZeroRate, cycle, violations);
            }
            sleep(self.settle_poll_interval.min(deadline - now)).await;
        }
    }
}

fn compare<F>(earlier: &CounterSnapshot, later: &CounterSnapshot, holds: F) -> Vec<CounterViolation>
where
    F: Fn(CounterId, f64, f64) -> bool,
{
    later
        .values
        .iter()
        .filter_map(|(id, after)| {
            let before = earlier.get(*id)?;
            (!holds(*id, before, *after))
                .then(|| CounterViolation::new(id.to_string(), before, *after))
        })
        .collect()
}

fn verdict(check: InvariantCheck, cycle: u64, violations: Vec<CounterViolation>) -> HarnessResult<()> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::InvariantViolation {
            check,
            cycle,
            violations,
        })
    }
}
