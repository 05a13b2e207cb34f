//! Tracing initialisation.
//!
//! The configured level applies unless `RUST_LOG` is set, in which case the
//! environment filter wins:
//!
//! ```bash
//! RUST_LOG=daq_verify=debug daq-orchestrate run_tests.txt BL99:Det:N1
//! ```

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;

/// Install the global tracing subscriber described by `config`.
///
/// Returns `false` when a global subscriber was already installed (for
/// example by a test harness); the existing subscriber is kept.
pub fn init_from_config(config: &ApplicationConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if config.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    match installed {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(error = %err, "Tracing subscriber already installed");
            false
        }
    }
}
