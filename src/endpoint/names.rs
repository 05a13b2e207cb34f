//! Endpoint naming vocabulary.
//!
//! Related endpoints are addressed by appending a suffix to the device base
//! name (`<base>:<suffix>`). Every suffix the harness uses lives here so the
//! wire-level vocabulary stays in one place.

/// Command: start acquisition
pub const START: &str = "Start";
/// Command: stop acquisition
pub const STOP: &str = "Stop";
/// Command: reset counters while acquiring
pub const RESET: &str = "Reset";
/// Readback: detector state enumeration
pub const DETECTOR_STATE: &str = "DetectorState_RBV";
/// Readback: human readable device status
pub const STATUS_MESSAGE: &str = "StatusMessage_RBV";
/// Readback: layered run-control state enumeration
pub const RUN_CONTROL_STATE: &str = "StateEnum";
/// Readback: pulse counter
pub const PULSE_COUNTER: &str = "PulseCounter_RBV";
/// Readback: integrated proton charge
pub const PROTON_CHARGE: &str = "PChargeIntegrated_RBV";
/// Readback: sequence counter of the first input channel
pub const SEQ_COUNTER: &str = "SeqCounter0_RBV";

const EVENT_TOTAL: &str = "EventTotal_RBV";
const EVENT_RATE: &str = "EventRate_RBV";
const ROI_PREFIX: &str = "Det1:TOF:ROI:";
const ROI_TOTAL: &str = "Total_RBV";

/// Build the full name of a related endpoint.
pub fn derive(base: &str, suffix: &str) -> String {
    format!("{base}:{suffix}")
}

/// `<base>:Det<N>:EventTotal_RBV` (detectors are numbered from 1)
pub fn detector_event_total(base: &str, detector: u32) -> String {
    derive(base, &KnownEndpoint::EventTotal(detector).suffix())
}

/// `<base>:Det<N>:EventRate_RBV` (detectors are numbered from 1)
pub fn detector_event_rate(base: &str, detector: u32) -> String {
    derive(base, &KnownEndpoint::EventRate(detector).suffix())
}

/// `<base>:Det1:TOF:ROI:<R>:Total_RBV` (ROIs are numbered from 0)
pub fn roi_total(base: &str, roi: u32) -> String {
    derive(base, &KnownEndpoint::RoiTotal(roi).suffix())
}

/// Endpoints with a fixed meaning, identified by suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownEndpoint {
    /// `Start` command
    Start,
    /// `Stop` command
    Stop,
    /// `Reset` command
    Reset,
    /// Detector state readback
    DetectorState,
    /// Free-text status message
    StatusMessage,
    /// Run-control state readback
    RunControlState,
    /// Event total of detector N
    EventTotal(u32),
    /// Event rate of detector N
    EventRate(u32),
    /// Total of TOF ROI N
    RoiTotal(u32),
    /// Pulse counter
    PulseCounter,
    /// Proton charge
    ProtonCharge,
    /// Sequence counter
    SeqCounter,
}

impl KnownEndpoint {
    /// Suffix appended to a base name.
    pub fn suffix(&self) -> String {
        match self {
            KnownEndpoint::Start => START.to_string(),
            KnownEndpoint::Stop => STOP.to_string(),
            KnownEndpoint::Reset => RESET.to_string(),
            KnownEndpoint::DetectorState => DETECTOR_STATE.to_string(),
            KnownEndpoint::StatusMessage => STATUS_MESSAGE.to_string(),
            KnownEndpoint::RunControlState => RUN_CONTROL_STATE.to_string(),
            KnownEndpoint::EventTotal(det) => format!("Det{det}:{EVENT_TOTAL}"),
            KnownEndpoint::EventRate(det) => format!("Det{det}:{EVENT_RATE}"),
            KnownEndpoint::RoiTotal(roi) => format!("{ROI_PREFIX}{roi}:{ROI_TOTAL}"),
            KnownEndpoint::PulseCounter => PULSE_COUNTER.to_string(),
            KnownEndpoint::ProtonCharge => PROTON_CHARGE.to_string(),
            KnownEndpoint::SeqCounter => SEQ_COUNTER.to_string(),
        }
    }

    /// Recognise a suffix. Returns `None` for anything outside the vocabulary.
    pub fn parse(suffix: &str) -> Option<Self> {
        let fixed = match suffix {
            START => Some(KnownEndpoint::Start),
            STOP => Some(KnownEndpoint::Stop),
            RESET => Some(KnownEndpoint::Reset),
            DETECTOR_STATE => Some(KnownEndpoint::DetectorState),
            STATUS_MESSAGE => Some(KnownEndpoint::StatusMessage),
            RUN_CONTROL_STATE => Some(KnownEndpoint::RunControlState),
            PULSE_COUNTER => Some(KnownEndpoint::PulseCounter),
            PROTON_CHARGE => Some(KnownEndpoint::ProtonCharge),
            SEQ_COUNTER => Some(KnownEndpoint::SeqCounter),
            _ => None,
        };
        if fixed.is_some() {
            return fixed;
        }

        if let Some(rest) = suffix.strip_prefix(ROI_PREFIX) {
            let (index, tail) = rest.split_once(':')?;
            return (tail == ROI_TOTAL)
                .then(|| index.parse().ok().map(KnownEndpoint::RoiTotal))
                .flatten();
        }

        let rest = suffix.strip_prefix("Det")?;
        let (index, tail) = rest.split_once(':')?;
        let detector: u32 = index.parse().ok()?;
        match tail {
            EVENT_TOTAL => Some(KnownEndpoint::EventTotal(detector)),
            EVENT_RATE => Some(KnownEndpoint::EventRate(detector)),
            _ => None,
        }
    }
}
