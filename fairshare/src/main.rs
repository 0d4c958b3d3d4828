/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use fairshare::config::scenario::{Scenario, Simulation};
use fairshare::config::SimConfig;

// ── CLI argument definition ───────────────────────────────────────────────────

/// Flow-level resource sharing simulator.
///
/// Example:
///   fairshare run scenarios/two_hosts.yaml --config scenarios/solver.yaml
#[derive(Debug, Parser)]
#[command(
    name = "fairshare",
    about = "Max-min fair sharing of CPUs, links and disks",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a scenario and print when each activity ended.
    Run {
        /// Path to the YAML scenario file.
        scenario: PathBuf,

        /// Path to the YAML solver configuration file.
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,

        /// Stop the simulation at this date, in seconds.
        #[arg(short = 'm', long = "max-date")]
        max_date: Option<f64>,
    },
    /// Load a solver configuration and print the resulting model options.
    CheckConfig {
        /// Path to the YAML solver configuration file.
        config: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run {
            scenario,
            config,
            max_date,
        } => run(scenario, config, max_date),
        Command::CheckConfig { config } => check_config(config),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<SimConfig> {
    match path {
        Some(path) => SimConfig::load_from_file(&path),
        None => {
            warn!("No configuration file provided, using default solver settings");
            Ok(SimConfig::default())
        }
    }
}

fn run(scenario: PathBuf, config: Option<PathBuf>, max_date: Option<f64>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let scenario = Scenario::load_from_file(&scenario)?;
    let mut sim = Simulation::build(&config, &scenario)?;
    let reports = sim.run(max_date)?;

    info!("{} activit(ies) at date {:.6}:", reports.len(), sim.now());
    for r in reports {
        let finish = r
            .finish
            .map_or_else(|| "-".to_string(), |f| format!("{f:.6}"));
        println!(
            "{name:<24} {kind:<12} {state:<10} start={start:.6} finish={finish}",
            name = r.name,
            kind = r.kind,
            state = format!("{:?}", r.state),
            start = r.start,
        );
    }
    Ok(())
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = SimConfig::load_from_file(&path)?;
    for (family, options) in [
        ("cpu", config.cpu_options()?),
        ("network", config.network_options()?),
        ("disk", config.disk_options()?),
        ("host", config.host_options()?),
        ("sio", config.sio_options()?),
    ] {
        println!(
            "{family:<8} solver={:?} update={} selective_update={}",
            options.solver, options.update, options.selective_update
        );
    }
    Ok(())
}
