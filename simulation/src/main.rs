//! QBB fabric simulator
//!
//! Runs the built-in scenarios and prints their reports.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use qbb_core::DataRate;
use qbb_logging::{FileConfig, LogConfig, QbbSubscriberBuilder};
use qbb_simulation::{
    ScenarioConfig, ScenarioKind, SimulationFile, TopologyBuilder, default_config_toml,
    format_report, run_scenario,
};

#[derive(Parser)]
#[command(
    name = "qbb-sim",
    about = "Lossless Ethernet fabric simulation with PFC, DCQCN and go-back-N",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write JSONL logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log every device trace event to the JSONL file (requires --log-dir)
    #[arg(long, global = true, requires = "log_dir")]
    traces: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario and print its report
    Run {
        #[arg(value_enum)]
        scenario: ScenarioKind,

        /// TOML file overriding the scenario defaults
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stop time in microseconds
        #[arg(long)]
        stop_us: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the built-in scenarios
    List,

    /// Show a star topology
    Topology {
        /// Number of hosts
        #[arg(long, default_value = "4")]
        hosts: usize,
    },

    /// Print the default configuration of a scenario as TOML
    Config {
        #[arg(value_enum)]
        scenario: ScenarioKind,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            scenario,
            config,
            stop_us,
            json,
        } => {
            let file = match &config {
                Some(path) => SimulationFile::load(path)?,
                None => SimulationFile::default(),
            };
            let logging = match (&cli.log_dir, cli.traces) {
                (Some(dir), true) => LogConfig::device_traces(dir, scenario.name()),
                _ => file.logging.clone(),
            };
            let _guard = init_logging(logging, cli.verbose, cli.log_dir, scenario)?;

            let mut scenario_config: ScenarioConfig = file.scenario_config(scenario)?;
            if let Some(stop_us) = stop_us {
                scenario_config.stop_time_us = stop_us;
            }
            info!(scenario = %scenario, stop_us = scenario_config.stop_time_us, "Starting run");

            let report = run_scenario(scenario, &scenario_config)
                .with_context(|| format!("Scenario {scenario} failed"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", format_report(&report));
            }
        }
        Commands::List => {
            println!("Scenarios:");
            for kind in ScenarioKind::ALL {
                println!("  {:<10} {}", kind.name(), kind.description());
            }
        }
        Commands::Topology { hosts } => {
            let builder =
                TopologyBuilder::new(DataRate::from_gbps(40), Duration::from_micros(1));
            let topology = builder.star(hosts);
            topology.validate()?;
            println!("{}", topology.visualize());
        }
        Commands::Config { scenario } => {
            print!("{}", default_config_toml(scenario)?);
        }
    }

    Ok(())
}

/// Install the global subscriber; the guard must outlive the run
fn init_logging(
    mut config: LogConfig,
    verbose: bool,
    log_dir: Option<PathBuf>,
    scenario: ScenarioKind,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    if verbose {
        config.level = "debug".to_string();
    }
    if let (Some(dir), None) = (log_dir, &config.file) {
        config.file = Some(FileConfig::new(dir).with_prefix(scenario.name()));
    }
    QbbSubscriberBuilder::new()
        .with_config(config)
        .init()
        .context("Failed to initialize logging")
}
