//! EPICS command-line transport
//!
//! Reaches endpoints by spawning `caget` and `caput`. An acknowledged write
//! uses `caput -c`, which waits for the put callback; the tool's own `-w`
//! bound and an outer tokio timeout both apply, and the child is killed when
//! the outer bound fires.
//!
//! A channel that never connects (`Channel connect timed out ... not found`)
//! is an unknown or unreachable endpoint and maps to `Communication`, whatever
//! the operation. `Timeout` is reserved for acknowledged writes whose callback
//! wait ran out.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{Acknowledge, EndpointClient, PvValue};
use crate::config::TransportConfig;
use crate::error::{HarnessError, HarnessResult};

/// Endpoint client backed by `caget`/`caput`
#[derive(Debug, Clone)]
pub struct CaToolsClient {
    caget: String,
    caput: String,
    read_timeout: Duration,
}

impl CaToolsClient {
    /// Client using the tool paths and read timeout from `config`.
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            caget: config.caget.clone(),
            caput: config.caput.clone(),
            read_timeout: config.read_timeout,
        }
    }

    /// Arguments for a terse read.
    fn read_args(&self, name: &str) -> Vec<String> {
        vec![
            "-t".to_string(),
            "-w".to_string(),
            seconds(self.read_timeout),
            name.to_string(),
        ]
    }

    /// Arguments for a write, with callback wait when acknowledged.
    fn write_args(name: &str, value: &PvValue, ack: Acknowledge) -> Vec<String> {
        let mut args = vec!["-t".to_string()];
        if let Acknowledge::Wait(timeout) = ack {
            args.push("-c".to_string());
            args.push("-w".to_string());
            args.push(seconds(timeout));
        }
        args.push(name.to_string());
        args.push(value.to_string());
        args
    }

    /// Run a tool and return its trimmed stdout.
    ///
    /// Only an acknowledged write can time out: a read or an unacknowledged
    /// write that gets no answer, and any failure to connect to the channel,
    /// is a communication error.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        name: &str,
        bound: Duration,
        acknowledged: bool,
    ) -> HarnessResult<String> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| {
            HarnessError::communication(name, format!("failed to spawn {program}: {err}"))
        })?;

        // Leave the tool's own timeout room to report first.
        let outer = bound + Duration::from_secs(1);
        let output = match tokio::time::timeout(outer, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) if acknowledged => {
                return Err(HarnessError::Timeout {
                    endpoint: name.to_string(),
                    timeout: bound,
                })
            }
            Err(_) => {
                return Err(HarnessError::communication(
                    name,
                    format!("no response from {program} within {bound:?}"),
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let reason = if stderr.is_empty() { stdout } else { stderr };
        match classify_failure(&reason) {
            ToolFailure::CallbackTimeout if acknowledged => Err(HarnessError::Timeout {
                endpoint: name.to_string(),
                timeout: bound,
            }),
            _ => Err(HarnessError::communication(
                name,
                format!("{program} exited with {}: {reason}", output.status),
            )),
        }
    }
}

/// How a failed tool run reads from its output
#[derive(Debug, PartialEq, Eq)]
enum ToolFailure {
    /// The channel never connected: unknown or unreachable endpoint
    NotConnected,
    /// Connected, but the put callback did not complete in time
    CallbackTimeout,
    Other,
}

fn classify_failure(output: &str) -> ToolFailure {
    let lower = output.to_ascii_lowercase();
    if lower.contains("channel connect timed out") || lower.contains("not found") {
        ToolFailure::NotConnected
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ToolFailure::CallbackTimeout
    } else {
        ToolFailure::Other
    }
}

fn seconds(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

#[async_trait]
impl EndpointClient for CaToolsClient {
    #[instrument(skip(self), level = "debug")]
    async fn read(&self, name: &str) -> HarnessResult<PvValue> {
        let args = self.read_args(name);
        let raw = self
            .run(&self.caget, &args, name, self.read_timeout, false)
            .await?;
        let value = PvValue::parse(&raw);
        debug!(%value, "caget");
        Ok(value)
    }

    #[instrument(skip(self), level = "debug")]
    async fn write(&self, name: &str, value: PvValue, ack: Acknowledge) -> HarnessResult<()> {
        let args = Self::write_args(name, &value, ack);
        let (bound, acknowledged) = match ack {
            Acknowledge::Wait(timeout) => (timeout, true),
            Acknowledge::NoWait => (self.read_timeout, false),
        };
        self.run(&self.caput, &args, name, bound, acknowledged)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lines() {
        let client = CaToolsClient::new(&TransportConfig::default());
        assert_eq!(
            client.read_args("BL99:Det:N1:DetectorState_RBV"),
            ["-t", "-w", "5.000", "BL99:Det:N1:DetectorState_RBV"]
        );
        assert_eq!(
            CaToolsClient::write_args(
                "BL99:Det:N1:Start",
                &PvValue::Int(1),
                Acknowledge::Wait(Duration::from_secs(10))
            ),
            ["-t", "-c", "-w", "10.000", "BL99:Det:N1:Start", "1"]
        );
        assert_eq!(
            CaToolsClient::write_args("BL99:Det:N1:Det1:XY:ROI:1:MinX", &PvValue::Int(32), Acknowledge::NoWait),
            ["-t", "BL99:Det:N1:Det1:XY:ROI:1:MinX", "32"]
        );
    }

    #[tokio::test]
    async fn test_missing_executable_is_communication_error() {
        let client = CaToolsClient::new(&TransportConfig {
            caget: "/nonexistent/caget".to_string(),
            ..TransportConfig::default()
        });
        let err = client.read("BL99:Det:N1:DetectorState_RBV").await.unwrap_err();
        assert!(matches!(err, HarnessError::Communication { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reads_tool_output() {
        // `echo` stands in for caget and prints its arguments back.
        let client = CaToolsClient::new(&TransportConfig {
            caget: "echo".to_string(),
            ..TransportConfig::default()
        });
        let value = client.read("X").await.unwrap();
        assert_eq!(value, PvValue::Text("-t -w 5.000 X".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_tool_is_communication_error() {
        let client = CaToolsClient::new(&TransportConfig {
            caput: "false".to_string(),
            ..TransportConfig::default()
        });
        let err = client
            .write("X", PvValue::Int(1), Acknowledge::NoWait)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Communication { .. }), "{err}");
    }

    #[test]
    fn test_classify_tool_failures() {
        assert_eq!(
            classify_failure("Channel connect timed out: 'BL42:Det:N9:Start' not found."),
            ToolFailure::NotConnected
        );
        assert_eq!(
            classify_failure("Write operation timed out: ca_pend_event"),
            ToolFailure::CallbackTimeout
        );
        assert_eq!(classify_failure("Error: bad value"), ToolFailure::Other);
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        /// Fake tool printing `message` to stderr and exiting 1.
        fn failing_tool(dir: &Path, name: &str, message: &str) -> String {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\necho \"{message}\" >&2\nexit 1\n"))
                .unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.display().to_string()
        }

        #[tokio::test]
        async fn test_unknown_channel_read_is_communication_error() {
            let dir = tempfile::tempdir().unwrap();
            let caget = failing_tool(
                dir.path(),
                "caget",
                "Channel connect timed out: 'BL42:Det:N9:DetectorState_RBV' not found.",
            );
            let client = CaToolsClient::new(&TransportConfig {
                caget,
                ..TransportConfig::default()
            });

            let err = client
                .read("BL42:Det:N9:DetectorState_RBV")
                .await
                .unwrap_err();
            assert!(matches!(err, HarnessError::Communication { .. }), "{err}");
            assert!(err.to_string().contains("not found"), "{err}");
        }

        #[tokio::test]
        async fn test_unknown_channel_write_is_communication_error() {
            let dir = tempfile::tempdir().unwrap();
            let caput = failing_tool(
                dir.path(),
                "caput",
                "Channel connect timed out: 'BL42:Det:N9:Start' not found.",
            );
            let client = CaToolsClient::new(&TransportConfig {
                caput,
                ..TransportConfig::default()
            });

            let err = client
                .write(
                    "BL42:Det:N9:Start",
                    PvValue::Int(1),
                    Acknowledge::Wait(Duration::from_secs(10)),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, HarnessError::Communication { .. }), "{err}");
        }

        #[tokio::test]
        async fn test_callback_timeout_on_acknowledged_write() {
            let dir = tempfile::tempdir().unwrap();
            let caput = failing_tool(dir.path(), "caput", "Write operation timed out");
            let client = CaToolsClient::new(&TransportConfig {
                caput,
                ..TransportConfig::default()
            });

            let err = client
                .write(
                    "BL99:Det:N1:Start",
                    PvValue::Int(1),
                    Acknowledge::Wait(Duration::from_secs(10)),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, HarnessError::Timeout { .. }), "{err}");

            // The same output on a fire-and-forget write is not an acknowledgement timeout.
            let err = client
                .write("BL99:Det:N1:Start", PvValue::Int(1), Acknowledge::NoWait)
                .await
                .unwrap_err();
            assert!(matches!(err, HarnessError::Communication { .. }), "{err}");
        }
    }
}
