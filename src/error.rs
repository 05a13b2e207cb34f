//! Error types for the verification harness.
//!
//! `HarnessError` is the single error type returned by every component. It
//! separates transport failures from verdicts:
//!
//! - **`Communication`**: the endpoint is unreachable, unknown, or returned a
//!   value the harness cannot interpret. Never retried implicitly.
//! - **`Timeout`**: an acknowledged write was not confirmed within its bound.
//! - **`StateMismatch`**: the device state read back after a command differs
//!   from the state the device is required to be in. Optional diagnostics
//!   (a delayed re-read, the device status message) may be attached, but the
//!   variant stays a failure.
//! - **`InvariantViolation`**: a counter monotonicity, reset-on-start or
//!   zero-rate check failed. Carries every offending counter with both values
//!   and the cycle index.
//! - **`Config`**, **`ConfigLoad`**, **`Manifest`**, **`Io`**: setup problems
//!   outside the device under test.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::counters::{CounterViolation, InvariantCheck};
use crate::endpoint::PvValue;
use crate::state::StateDiagnostics;

/// Convenience alias for results using the harness error type.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Every failure the harness can report.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The endpoint could not be reached or answered with something unusable.
    #[error("Communication error on '{endpoint}': {reason}")]
    Communication {
        /// Full endpoint name.
        endpoint: String,
        /// What the transport reported.
        reason: String,
    },

    /// An acknowledged write was not confirmed in time.
    #[error("Timed out after {timeout:?} waiting for acknowledgement from '{endpoint}'")]
    Timeout {
        /// Full endpoint name.
        endpoint: String,
        /// The bound that expired.
        timeout: Duration,
    },

    /// The state read back after a command is not the required one.
    #[error(
        "State mismatch on '{endpoint}': expected {expected}, observed {observed}{}",
        describe_diagnostics(.diagnostics)
    )]
    StateMismatch {
        /// State endpoint that was read.
        endpoint: String,
        /// Label of the required state.
        expected: String,
        /// Raw value read back.
        observed: PvValue,
        /// Delayed re-read and status message, when requested.
        diagnostics: Option<StateDiagnostics>,
    },

    /// A counter check failed.
    #[error(
        "{check} invariant violated on cycle {cycle}: {}",
        describe_violations(.check, .violations)
    )]
    InvariantViolation {
        /// Which check failed.
        check: InvariantCheck,
        /// Cycle index, from 0.
        cycle: u64,
        /// Every offending counter.
        violations: Vec<CounterViolation>,
    },

    /// Configuration or scenario definition failed validation.
    #[error("Configuration validation error: {0}")]
    Config(String),

    /// Configuration could not be extracted from its sources.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// Malformed manifest line.
    #[error("Manifest error on line {line}: {reason}")]
    Manifest {
        /// 1-based line number.
        line: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// File system or process spawning failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`HarnessError`], recorded in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Transport or I/O failure.
    Communication,
    /// Unacknowledged write.
    Timeout,
    /// Wrong state after a command.
    StateMismatch,
    /// Failed counter check.
    InvariantViolation,
    /// Setup problem: config, manifest or unknown scenario.
    Configuration,
}

impl ErrorKind {
    /// Name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Communication => "COMMUNICATION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::StateMismatch => "STATE_MISMATCH",
            ErrorKind::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorKind::Configuration => "CONFIGURATION",
        }
    }
}

impl HarnessError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::Communication { .. } | HarnessError::Io(_) => ErrorKind::Communication,
            HarnessError::Timeout { .. } => ErrorKind::Timeout,
            HarnessError::StateMismatch { .. } => ErrorKind::StateMismatch,
            HarnessError::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            HarnessError::Config(_)
            | HarnessError::ConfigLoad(_)
            | HarnessError::Manifest { .. } => ErrorKind::Configuration,
        }
    }

    /// Transport-level failures that an explicit retry policy may re-attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HarnessError::Communication { .. } | HarnessError::Timeout { .. }
        )
    }

    /// Attach diagnostics to a state mismatch. Any other error is returned as is.
    pub fn with_diagnostics(self, attached: StateDiagnostics) -> Self {
        match self {
            HarnessError::StateMismatch {
                endpoint,
                expected,
                observed,
                ..
            } => HarnessError::StateMismatch {
                endpoint,
                expected,
                observed,
                diagnostics: Some(attached),
            },
            other => other,
        }
    }

    pub(crate) fn communication(endpoint: &str, reason: impl Into<String>) -> Self {
        HarnessError::Communication {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for HarnessError {
    fn from(err: figment::Error) -> Self {
        HarnessError::ConfigLoad(Box::new(err))
    }
}

fn describe_diagnostics(diagnostics: &Option<StateDiagnostics>) -> String {
    match diagnostics {
        Some(diag) => format!(" ({diag})"),
        None => String::new(),
    }
}

fn describe_violations(check: &InvariantCheck, violations: &[CounterViolation]) -> String {
    violations
        .iter()
        .map(|v| v.describe(*check))
        .collect::<Vec<_>>()
        .join("; ")
}
