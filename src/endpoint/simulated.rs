//! Simulated detector device
//!
//! In-memory stand-in for a real acquisition device. It serves the endpoint
//! vocabulary from [`super::names`] under one base name (plus the run-control
//! base when configured) and provides:
//! - Counters that integrate over tokio time, so paused-clock tests are exact
//! - Controllable fault injection (state lag, stalled acknowledgements,
//!   skipped counter resets, lingering rates, disconnects)
//! - Call logging for test verification
//!
//! Unknown suffixes under a served base behave like plain value stores: a
//! write creates the value, a read of a never-written value fails.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use super::names::KnownEndpoint;
use super::{acknowledged, Acknowledge, EndpointClient, PvValue};
use crate::config::{DeviceConfig, HarnessConfig, RunControlConfig};
use crate::error::{HarnessError, HarnessResult};

/// Default per-detector event rate in Hz
pub const DEFAULT_EVENT_RATE: f64 = 1000.0;
/// Accelerator pulse frequency in Hz
pub const PULSE_RATE: f64 = 60.0;
/// Integrated charge added per pulse
pub const CHARGE_PER_PULSE: f64 = 2.5e-6;
/// Share of detector 1 events falling into each TOF ROI
pub const ROI_FRACTION: f64 = 0.1;

/// Long enough to exceed any realistic acknowledgement bound.
const STALL: Duration = Duration::from_secs(24 * 60 * 60);

/// Simulated device for tests and dry runs
///
/// # Example
///
/// ```
/// use daq_verify::config::HarnessConfig;
/// use daq_verify::endpoint::{Acknowledge, EndpointClient, PvValue, SimulatedDevice};
///
/// # tokio_test::block_on(async {
/// let device = SimulatedDevice::new("BL99:Det:N1", &HarnessConfig::default());
/// device
///     .write("BL99:Det:N1:Start", PvValue::Int(1), Acknowledge::NoWait)
///     .await
///     .unwrap();
/// assert!(device.is_acquiring().await);
/// # });
/// ```
#[derive(Clone)]
pub struct SimulatedDevice {
    base: String,
    model: Arc<Mutex<DeviceModel>>,
}

struct DeviceModel {
    device: DeviceConfig,
    run_control: Option<RunControlConfig>,
    acquiring: bool,
    /// Instant the counters were last zeroed, shifted so that `now - epoch`
    /// is the accumulated counting time while acquiring
    epoch: Instant,
    /// Counting time frozen at the last stop
    frozen: Duration,
    stopped_at: Option<Instant>,
    /// Detector state shows the previous value until this instant
    state_lag_until: Option<Instant>,
    starts: u64,
    stops: u64,
    rates: Vec<f64>,
    status_message: Option<String>,
    ack_latency: Duration,
    values: HashMap<String, PvValue>,
    faults: Faults,
    call_log: Vec<String>,
}

#[derive(Default)]
struct Faults {
    lag_on_start: HashMap<u64, Duration>,
    lag_on_stop: HashMap<u64, Duration>,
    skip_reset_on_start: HashSet<u64>,
    stalled: HashMap<String, u32>,
    linger_rate: Duration,
    disconnected: bool,
}

/// Which served base a name belongs to
enum Scope<'n> {
    Device(&'n str),
    RunControl(&'n str),
}

impl SimulatedDevice {
    /// Idle device serving endpoints under `base`.
    pub fn new(base: &str, config: &HarnessConfig) -> Self {
        let model = DeviceModel {
            device: config.device.clone(),
            run_control: config.run_control.clone(),
            acquiring: false,
            epoch: Instant::now(),
            frozen: Duration::ZERO,
            stopped_at: None,
            state_lag_until: None,
            starts: 0,
            stops: 0,
            rates: vec![DEFAULT_EVENT_RATE; config.device.max_detectors as usize],
            status_message: None,
            ack_latency: Duration::ZERO,
            values: HashMap::new(),
            faults: Faults::default(),
            call_log: Vec::new(),
        };
        Self {
            base: base.to_string(),
            model: Arc::new(Mutex::new(model)),
        }
    }

    /// Base name the device answers under.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Whether acquisition is running (regardless of what the readback shows).
    pub async fn is_acquiring(&self) -> bool {
        self.model.lock().await.acquiring
    }

    /// All reads and writes so far, in order.
    pub async fn call_log(&self) -> Vec<String> {
        self.model.lock().await.call_log.clone()
    }

    /// Forget the calls logged so far.
    pub async fn clear_log(&self) {
        self.model.lock().await.call_log.clear();
    }

    /// Number of logged writes to endpoints ending in `suffix`.
    pub async fn write_count(&self, suffix: &str) -> usize {
        let model = self.model.lock().await;
        model
            .call_log
            .iter()
            .filter_map(|call| call.strip_prefix("write "))
            .filter_map(|call| call.split_once(" = "))
            .filter(|(name, _)| name.ends_with(suffix))
            .count()
    }

    /// Event rate of detector `detector` (numbered from 1). Zero models an
    /// idle source.
    pub async fn set_event_rate(&self, detector: u32, rate: f64) {
        let Some(index) = detector.checked_sub(1) else {
            return;
        };
        if let Some(slot) = self.model.lock().await.rates.get_mut(index as usize) {
            *slot = rate;
        }
    }

    /// Delay before an acknowledged write completes.
    pub async fn set_acknowledgement_latency(&self, latency: Duration) {
        self.model.lock().await.ack_latency = latency;
    }

    /// Override the status message readback.
    pub async fn set_status_message(&self, message: &str) {
        self.model.lock().await.status_message = Some(message.to_string());
    }

    /// Preset a plain value under the device base.
    pub async fn set_value(&self, suffix: &str, value: PvValue) {
        self.model
            .lock()
            .await
            .values
            .insert(suffix.to_string(), value);
    }

    /// Simulate loss of the transport.
    pub async fn set_connected(&self, connected: bool) {
        self.model.lock().await.faults.disconnected = !connected;
    }

    /// Keep showing the previous state for `lag` after start number `index`
    /// (counted from 0).
    pub async fn lag_state_on_start(&self, index: u64, lag: Duration) {
        self.model.lock().await.faults.lag_on_start.insert(index, lag);
    }

    /// Keep showing the previous state for `lag` after stop number `index`.
    pub async fn lag_state_on_stop(&self, index: u64, lag: Duration) {
        self.model.lock().await.faults.lag_on_stop.insert(index, lag);
    }

    /// Start number `index` continues counting instead of zeroing.
    pub async fn skip_reset_on_start(&self, index: u64) {
        self.model
            .lock()
            .await
            .faults
            .skip_reset_on_start
            .insert(index);
    }

    /// The next `count` acknowledged writes to `suffix` never acknowledge and
    /// are not applied. Writes without acknowledgement are applied at once and
    /// leave the count untouched.
    pub async fn stall_acknowledgements(&self, suffix: &str, count: u32) {
        self.model
            .lock()
            .await
            .faults
            .stalled
            .insert(suffix.to_string(), count);
    }

    /// Event rates keep reporting the live value for `linger` after a stop.
    pub async fn linger_rate_after_stop(&self, linger: Duration) {
        self.model.lock().await.faults.linger_rate = linger;
    }

    /// Start acquisition without going through the endpoint interface.
    pub async fn force_start(&self) {
        self.model.lock().await.start();
    }

    /// Stop acquisition without going through the endpoint interface.
    pub async fn force_stop(&self) {
        self.model.lock().await.stop();
    }

    fn scope<'n>(&self, model: &DeviceModel, name: &'n str) -> Option<Scope<'n>> {
        if let Some(suffix) = strip_base(name, &self.base) {
            return Some(Scope::Device(suffix));
        }
        let run_control = model.run_control.as_ref()?;
        strip_base(name, &run_control.base).map(Scope::RunControl)
    }

    async fn apply_write(&self, name: &str, value: PvValue) -> HarnessResult<()> {
        let mut model = self.model.lock().await;
        match self.scope(&model, name) {
            Some(Scope::Device(suffix)) | Some(Scope::RunControl(suffix)) => {
                model.apply(name, suffix, value)
            }
            None => Err(unknown(name)),
        }
    }
}

fn strip_base<'n>(name: &'n str, base: &str) -> Option<&'n str> {
    name.strip_prefix(base)?.strip_prefix(':')
}

fn unknown(name: &str) -> HarnessError {
    HarnessError::communication(name, "no such endpoint")
}

impl DeviceModel {
    fn start(&mut self) {
        let now = Instant::now();
        let index = self.starts;
        self.starts += 1;
        if self.faults.skip_reset_on_start.remove(&index) {
            debug!(index, "Simulated start keeps previous counters");
            self.epoch = now.checked_sub(self.frozen).unwrap_or(now);
        } else {
            self.epoch = now;
        }
        self.frozen = Duration::ZERO;
        self.acquiring = true;
        self.stopped_at = None;
        self.state_lag_until = self.faults.lag_on_start.remove(&index).map(|lag| now + lag);
    }

    fn stop(&mut self) {
        if !self.acquiring {
            return;
        }
        let now = Instant::now();
        let index = self.stops;
        self.stops += 1;
        self.frozen = now - self.epoch;
        self.acquiring = false;
        self.stopped_at = Some(now);
        self.state_lag_until = self.faults.lag_on_stop.remove(&index).map(|lag| now + lag);
    }

    fn reset(&mut self) {
        self.epoch = Instant::now();
        self.frozen = Duration::ZERO;
    }

    fn apply(&mut self, name: &str, suffix: &str, value: PvValue) -> HarnessResult<()> {
        match KnownEndpoint::parse(suffix) {
            Some(KnownEndpoint::Start) => self.start(),
            Some(KnownEndpoint::Stop) => self.stop(),
            Some(KnownEndpoint::Reset) => self.reset(),
            None => {
                self.values.insert(suffix.to_string(), value);
            }
            Some(_) => {
                return Err(HarnessError::communication(name, "endpoint is read-only"));
            }
        }
        Ok(())
    }

    fn counting_seconds(&self) -> f64 {
        if self.acquiring {
            (Instant::now() - self.epoch).as_secs_f64()
        } else {
            self.frozen.as_secs_f64()
        }
    }

    fn shown_acquiring(&self) -> bool {
        match self.state_lag_until {
            Some(until) if Instant::now() < until => !self.acquiring,
            _ => self.acquiring,
        }
    }

    fn rate(&self, detector: u32) -> Option<f64> {
        let rate = *self.rates.get(detector.checked_sub(1)? as usize)?;
        let lingering = self.stopped_at.is_some_and(|stopped| {
            Instant::now() < stopped + self.faults.linger_rate
        });
        Some(if self.acquiring || lingering { rate } else { 0.0 })
    }

    fn pulses(&self) -> i64 {
        (PULSE_RATE * self.counting_seconds()).floor() as i64
    }

    fn read_device(&self, name: &str, suffix: &str) -> HarnessResult<PvValue> {
        let seconds = self.counting_seconds();
        let value = match KnownEndpoint::parse(suffix) {
            Some(KnownEndpoint::DetectorState) => PvValue::Int(if self.shown_acquiring() {
                self.device.acquire_state
            } else {
                self.device.idle_state
            }),
            Some(KnownEndpoint::StatusMessage) => PvValue::Text(
                self.status_message.clone().unwrap_or_else(|| {
                    let label = if self.acquiring { "Acquiring" } else { "Idle" };
                    label.to_string()
                }),
            ),
            Some(KnownEndpoint::EventTotal(det)) => {
                let rate = self
                    .rates
                    .get(det.checked_sub(1).ok_or_else(|| unknown(name))? as usize)
                    .ok_or_else(|| unknown(name))?;
                PvValue::Int((rate * seconds).floor() as i64)
            }
            Some(KnownEndpoint::EventRate(det)) => {
                PvValue::Float(self.rate(det).ok_or_else(|| unknown(name))?)
            }
            Some(KnownEndpoint::RoiTotal(roi)) if roi < self.device.max_roi => {
                let rate = self.rates.first().copied().unwrap_or(0.0);
                PvValue::Int((rate * seconds * ROI_FRACTION).floor() as i64)
            }
            Some(KnownEndpoint::PulseCounter) | Some(KnownEndpoint::SeqCounter) => {
                PvValue::Int(self.pulses())
            }
            Some(KnownEndpoint::ProtonCharge) => {
                PvValue::Float(self.pulses() as f64 * CHARGE_PER_PULSE)
            }
            _ => self
                .values
                .get(suffix)
                .cloned()
                .ok_or_else(|| unknown(name))?,
        };
        Ok(value)
    }

    fn read_run_control(&self, name: &str, suffix: &str) -> HarnessResult<PvValue> {
        let run_control = self.run_control.as_ref().ok_or_else(|| unknown(name))?;
        match KnownEndpoint::parse(suffix) {
            Some(KnownEndpoint::RunControlState) => Ok(PvValue::Int(if self.shown_acquiring() {
                run_control.running_state
            } else {
                run_control.ready_state
            })),
            _ => Err(unknown(name)),
        }
    }
}

#[async_trait]
impl EndpointClient for SimulatedDevice {
    async fn read(&self, name: &str) -> HarnessResult<PvValue> {
        let mut model = self.model.lock().await;
        model.call_log.push(format!("read {name}"));
        if model.faults.disconnected {
            return Err(HarnessError::communication(name, "device disconnected"));
        }
        let value = match self.scope(&model, name) {
            Some(Scope::Device(suffix)) => model.read_device(name, suffix),
            Some(Scope::RunControl(suffix)) => model.read_run_control(name, suffix),
            None => Err(unknown(name)),
        }?;
        trace!(endpoint = name, %value, "Simulated read");
        Ok(value)
    }

    async fn write(&self, name: &str, value: PvValue, ack: Acknowledge) -> HarnessResult<()> {
        let delay = {
            let mut model = self.model.lock().await;
            model.call_log.push(format!("write {name} = {value}"));
            if model.faults.disconnected {
                return Err(HarnessError::communication(name, "device disconnected"));
            }
            let stalled = match self.scope(&model, name) {
                _ if ack == Acknowledge::NoWait => false,
                Some(Scope::Device(suffix)) | Some(Scope::RunControl(suffix)) => {
                    let suffix = suffix.to_string();
                    match model.faults.stalled.get_mut(&suffix) {
                        Some(remaining) if *remaining > 0 => {
                            *remaining -= 1;
                            true
                        }
                        _ => false,
                    }
                }
                None => false,
            };
            if stalled {
                debug!(endpoint = name, "Simulated acknowledgement stall");
                STALL
            } else {
                model.ack_latency
            }
        };

        match ack {
            Acknowledge::NoWait => self.apply_write(name, value).await,
            Acknowledge::Wait(_) => {
                acknowledged(name, ack, async {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    self.apply_write(name, value).await
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "BL99:Det:N1";

    async fn start(device: &SimulatedDevice) {
        device
            .write(&format!("{BASE}:Start"), PvValue::Int(1), Acknowledge::NoWait)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_integrate_over_time() {
        let device = SimulatedDevice::new(BASE, &HarnessConfig::default());
        start(&device).await;
        sleep(Duration::from_secs(2)).await;

        let total = device.read_number(&format!("{BASE}:Det1:EventTotal_RBV")).await.unwrap();
        let pulses = device.read_number(&format!("{BASE}:PulseCounter_RBV")).await.unwrap();
        let roi = device
            .read_number(&format!("{BASE}:Det1:TOF:ROI:0:Total_RBV"))
            .await
            .unwrap();
        assert_eq!(total, 2000.0);
        assert_eq!(pulses, 120.0);
        assert_eq!(roi, 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_and_start_zeroes() {
        let device = SimulatedDevice::new(BASE, &HarnessConfig::default());
        let total = format!("{BASE}:Det2:EventTotal_RBV");

        start(&device).await;
        sleep(Duration::from_secs(1)).await;
        device.force_stop().await;
        sleep(Duration::from_secs(5)).await;
        assert_eq!(device.read_number(&total).await.unwrap(), 1000.0);

        start(&device).await;
        assert_eq!(device.read_number(&total).await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_reset_keeps_counting() {
        let device = SimulatedDevice::new(BASE, &HarnessConfig::default());
        let total = format!("{BASE}:Det1:EventTotal_RBV");
        device.skip_reset_on_start(1).await;

        start(&device).await;
        sleep(Duration::from_secs(1)).await;
        device.force_stop().await;
        start(&device).await;
        assert_eq!(device.read_number(&total).await.unwrap(), 1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_lag_then_visible() {
        let device = SimulatedDevice::new(BASE, &HarnessConfig::default());
        let state = format!("{BASE}:DetectorState_RBV");
        device.lag_state_on_start(0, Duration::from_millis(500)).await;

        start(&device).await;
        assert_eq!(device.read(&state).await.unwrap(), PvValue::Int(0));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(device.read(&state).await.unwrap(), PvValue::Int(1));
    }

    #[tokio::test]
    async fn test_out_of_range_and_unknown_names() {
        let device = SimulatedDevice::new(BASE, &HarnessConfig::default());
        for name in [
            format!("{BASE}:Det3:EventTotal_RBV"),
            format!("{BASE}:Det0:EventRate_RBV"),
            format!("{BASE}:Det1:TOF:ROI:8:Total_RBV"),
            format!("{BASE}:Det1:XY:ROI:1:MinX"),
            "BL42:Det:N1:DetectorState_RBV".to_string(),
        ] {
            let err = device.read(&name).await.unwrap_err();
            assert!(matches!(err, HarnessError::Communication { .. }), "{name}");
        }
    }

    #[tokio::test]
    async fn test_plain_values_round_trip() {
        let device = SimulatedDevice::new(BASE, &HarnessConfig::default());
        let name = format!("{BASE}:Det1:XY:ROI:1:MinX");
        device
            .write(&name, PvValue::Int(64), Acknowledge::Wait(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(device.read(&name).await.unwrap(), PvValue::Int(64));
        assert_eq!(device.write_count("MinX").await, 1);
    }

    #[tokio::test]
    async fn test_counters_are_read_only() {
        let device = SimulatedDevice::new(BASE, &HarnessConfig::default());
        let err = device
            .write(
                &format!("{BASE}:PulseCounter_RBV"),
                PvValue::Int(0),
                Acknowledge::NoWait,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn test_disconnected_device() {
        let device = SimulatedDevice::new(BASE, &HarnessConfig::default());
        device.set_connected(false).await;
        assert!(device.read(&format!("{BASE}:DetectorState_RBV")).await.is_err());
        let fallback = device
            .read_or(&format!("{BASE}:StatusMessage_RBV"), PvValue::from("unknown"))
            .await;
        assert_eq!(fallback, PvValue::from("unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_only_affects_acknowledged_writes() {
        let device = SimulatedDevice::new(BASE, &HarnessConfig::default());
        device.stall_acknowledgements("Start", 1).await;

        start(&device).await;
        assert!(device.is_acquiring().await);
        device.force_stop().await;

        let err = device
            .write(
                &format!("{BASE}:Start"),
                PvValue::Int(1),
                Acknowledge::Wait(Duration::from_secs(2)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }), "{err}");
        assert!(!device.is_acquiring().await);
    }
}
