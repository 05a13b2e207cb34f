//! Run a single verification scenario against a device.
//!
//! ```bash
//! daq-scenario --scenario start_stop BL99:Det:N1
//! ```
//!
//! Without `--scenario` the scenario id is taken from the name the program was
//! invoked under, so a symlink `start_stop -> daq-scenario` runs `start_stop`.
//! That makes a directory of such links usable with `daq-orchestrate --exec-dir`.
//!
//! Exit code 0 on success, 1 on failure.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use daq_verify::config::{HarnessConfig, TransportKind};
use daq_verify::endpoint::client_for;
use daq_verify::logging;
use daq_verify::orchestrator::RunReport;
use daq_verify::scenario::{ScenarioCatalog, ScenarioRunner};

const PROGRAM: &str = "daq-scenario";

#[derive(Parser)]
#[command(author, version, about = "Run one verification scenario against a device")]
struct Cli {
    /// Scenario id (defaults to the invoked program name)
    #[arg(long)]
    scenario: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against the in-memory simulated device
    #[arg(long)]
    simulate: bool,

    /// Write a report: JSON for a .json path, markdown otherwise
    #[arg(long)]
    report: Option<PathBuf>,

    /// List the known scenarios and exit
    #[arg(long)]
    list: bool,

    /// Endpoint base of the device under test, e.g. BL99:Det:N1
    #[arg(required_unless_present = "list")]
    base: Option<String>,
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

    let catalog = ScenarioCatalog::for_config(&config)?;
    if cli.list {
        for id in catalog.ids() {
            let description = catalog
                .get(id)
                .map(|definition| definition.description.as_str())
                .unwrap_or_default();
            println!("{id:<20} {description}");
        }
        return Ok(true);
    }

    let scenario = match cli.scenario {
        Some(id) => id,
        None => invoked_scenario()?,
    };
    let base = cli.base.context("missing endpoint base")?;
    let definition = catalog.require(&scenario)?;

    println!("Testing {scenario} on {base}");
    let client = client_for(&config, &base);
    let outcome = ScenarioRunner::new(client.as_ref(), &config)
        .run(definition, &base)
        .await;

    if let Some(path) = &cli.report {
        let mut report = RunReport::new(&base);
        report.add_outcome(outcome.clone());
        report
            .write_to(path)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
    }

    match &outcome.reason {
        None => println!(
            "{scenario}: SUCCESS ({} cycles)",
            outcome.cycles_completed
        ),
        Some(reason) => eprintln!("{scenario}: FAILURE: {reason}"),
    }
    Ok(outcome.is_success())
}

/// Scenario id from the invoked program name, unless that is the binary itself.
fn invoked_scenario() -> Result<String> {
    std::env::args_os()
        .next()
        .and_then(|arg0| {
            Path::new(&arg0)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .filter(|stem| stem != PROGRAM)
        .context("no --scenario given and the program was not invoked under a scenario id")
}
