//! Run every scenario listed in a manifest against one device, stopping at
//! the first failure.
//!
//! ```bash
//! # In process, scenarios from the built-in catalog (plus scenarios_file)
//! daq-orchestrate manifests/run_tests.txt BL99:Det:N1
//!
//! # One subprocess per entry: runs <DIR>/<id> <BASE>
//! daq-orchestrate --exec-dir ./tests.d manifests/run_tests.txt BL99:Det:N1
//! ```
//!
//! Exit code 0 when every scenario passed (or the manifest is empty), 1 on the
//! first failure.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use daq_verify::config::{HarnessConfig, TransportKind};
use daq_verify::endpoint::client_for;
use daq_verify::logging;
use daq_verify::orchestrator::{InProcessExecutor, Manifest, Orchestrator, SubprocessExecutor};
use daq_verify::scenario::ScenarioCatalog;

#[derive(Parser)]
#[command(author, version, about = "Run a manifest of verification scenarios")]
struct Cli {
    /// Run each entry as `<DIR>/<id> <BASE>` instead of in process
    #[arg(long, value_name = "DIR")]
    exec_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against the in-memory simulated device
    #[arg(long, conflicts_with = "exec_dir")]
    simulate: bool,

    /// Write a report: JSON for a .json path, markdown otherwise
    #[arg(long)]
    report: Option<PathBuf>,

    /// Manifest file, one scenario id per line
    manifest: PathBuf,

    /// Endpoint base of the device under test, e.g. BL99:Det:N1
    base: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config =
        HarnessConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.simulate {
        config.transport.kind = TransportKind::Simulated;
    }
    logging::init_from_config(&config.application);

    let manifest = Manifest::load(&cli.manifest)
        .with_context(|| format!("could not read manifest {}", cli.manifest.display()))?;

    let orchestrator = match &cli.exec_dir {
        Some(dir) => Orchestrator::new(SubprocessExecutor::new(dir.clone())),
        None => {
            let catalog = ScenarioCatalog::for_config(&config)?;
            let client = client_for(&config, &cli.base);
            Orchestrator::new(InProcessExecutor::new(client, Arc::new(config), catalog))
        }
    };

    println!(
        "Running {} scenarios from {} on {}",
        manifest.len(),
        cli.manifest.display(),
        cli.base
    );
    let report = orchestrator.run(&manifest, &cli.base).await;

    if let Some(path) = &cli.report {
        report
            .write_to(path)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
    }

    match report.first_failure() {
        None => println!("Success"),
        Some(failure) => {
            eprintln!("ERROR: Test {} failed.", failure.scenario);
            if let Some(reason) = &failure.reason {
                eprintln!("{reason}");
            }
        }
    }
    Ok(report.passed())
}
