//! Endpoint client abstraction
//!
//! Hardware-agnostic interface to named remote values ("process variables").
//! Implementations handle the transport; the harness only reads values and
//! issues writes, optionally waiting for the remote side to acknowledge them.
//!
//! ## Acknowledgement semantics
//! - `Acknowledge::Wait(timeout)` blocks until the remote system confirms it
//!   has processed the write, or fails with `HarnessError::Timeout`.
//! - An acknowledgement means "command accepted". It does not mean that
//!   dependent status endpoints already show the consequence of the command.
//!
//! ## Retries
//! - Clients never retry. Retry policy is an explicit caller decision
//!   (see [`crate::retry::RetryPolicy`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{HarnessConfig, TransportKind};
use crate::error::{HarnessError, HarnessResult};

pub mod catools;
pub mod names;
pub mod simulated;

pub use catools::CaToolsClient;
pub use simulated::SimulatedDevice;

/// Value held by a remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Integer or enumeration index
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String or enumeration label
    Text(String),
}

impl PvValue {
    /// Numeric view of the value. Text is parsed when it holds a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Float(v) => Some(*v),
            PvValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Interpret raw text as returned by a command-line tool.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(v) = trimmed.parse::<i64>() {
            PvValue::Int(v)
        } else if let Ok(v) = trimmed.parse::<f64>() {
            PvValue::Float(v)
        } else {
            PvValue::Text(trimmed.to_string())
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(v) => write!(f, "{v}"),
            PvValue::Float(v) => write!(f, "{v}"),
            PvValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Float(v)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Text(v.to_string())
    }
}

/// Whether a write waits for the remote side to confirm processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledge {
    /// Fire and forget
    NoWait,
    /// Block until acknowledged or until the timeout elapses
    Wait(Duration),
}

/// Named remote value access.
#[async_trait]
pub trait EndpointClient: Send + Sync {
    /// Read the most recent value of an endpoint.
    ///
    /// # Errors
    /// - `Communication` if the endpoint is unreachable or unknown
    async fn read(&self, name: &str) -> HarnessResult<PvValue>;

    /// Write a value, optionally waiting for acknowledgement.
    ///
    /// # Errors
    /// - `Timeout` if the acknowledgement does not arrive in time
    /// - `Communication` on transport failure
    async fn write(&self, name: &str, value: PvValue, ack: Acknowledge) -> HarnessResult<()>;

    /// Read with staleness tolerance: a failed read yields `default`.
    async fn read_or(&self, name: &str, default: PvValue) -> PvValue {
        match self.read(name).await {
            Ok(value) => value,
            Err(err) => {
                warn!(endpoint = name, error = %err, "Read failed, using default value");
                default
            }
        }
    }

    /// Read an endpoint that must hold a number.
    async fn read_number(&self, name: &str) -> HarnessResult<f64> {
        let value = self.read(name).await?;
        value.as_f64().ok_or_else(|| {
            HarnessError::communication(name, format!("expected a numeric value, got '{value}'"))
        })
    }
}

/// Client for the configured transport. The simulated device serves `base`.
pub fn client_for(config: &HarnessConfig, base: &str) -> Arc<dyn EndpointClient> {
    match config.transport.kind {
        TransportKind::Catools => Arc::new(CaToolsClient::new(&config.transport)),
        TransportKind::Simulated => Arc::new(SimulatedDevice::new(base, config)),
    }
}

/// Run a write operation under its acknowledgement bound.
pub async fn acknowledged<F, T>(endpoint: &str, ack: Acknowledge, operation: F) -> HarnessResult<T>
where
    F: Future<Output = HarnessResult<T>>,
{
    match ack {
        Acknowledge::NoWait => operation.await,
        Acknowledge::Wait(timeout) => tokio::time::timeout(timeout, operation)
            .await
            .map_err(|_| HarnessError::Timeout {
                endpoint: endpoint.to_string(),
                timeout,
            })?,
    }
}
