//! CLI entry point for the morbidostat controller
//!
//! # Usage
//!
//! Run a time-accelerated simulated experiment, printing snapshots as JSON lines:
//! ```bash
//! morbidostat simulate --config config/morbidostat.toml --duration-secs 60 --acceleration 600
//! ```
//!
//! Print the effective configuration:
//! ```bash
//! morbidostat config --config config/morbidostat.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use morbidostat::logging::{self, OutputFormat, TracingConfig};
use morbidostat::simulation::SimulatedRig;
use morbidostat::{AppConfig, Experiment, ExperimentRunner, SimulationBuilder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "morbidostat")]
#[command(about = "Morbidostat continuous-culture controller", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment on the simulated bench
    Simulate {
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Wall-clock run time
        #[arg(long, default_value_t = 60)]
        duration_secs: u64,

        /// Simulated minutes per wall-clock minute; overrides the config file
        #[arg(long)]
        acceleration: Option<f64>,

        /// Save experiment state here when the run ends
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the status of every vial of a simulated bench
    Status {
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Simulate { config, .. }
        | Commands::Config { config }
        | Commands::Status { config } => config.clone(),
    };
    let config = load_config(config_path.as_deref())?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(config.application.log_level.as_str());
    let format: OutputFormat = cli.log_format.parse()?;
    logging::init(&TracingConfig::new(logging::parse_log_level(level)?).with_format(format))?;

    match cli.command {
        Commands::Simulate {
            duration_secs,
            acceleration,
            state,
            ..
        } => simulate(config, duration_secs, acceleration, state).await,
        Commands::Config { .. } => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Status { .. } => status(config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::load().context("Failed to load config")?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_rig(config: &AppConfig) -> Result<SimulatedRig> {
    SimulationBuilder::new(config.simulation.clone())
        .device_config(config.experiment.device.clone())
        .vial_volume_ml(config.experiment.culture.current_volume_ml)
        .build()
        .context("Failed to build simulated bench")
}

async fn simulate(
    mut config: AppConfig,
    duration_secs: u64,
    acceleration: Option<f64>,
    state: Option<PathBuf>,
) -> Result<()> {
    if let Some(factor) = acceleration {
        config.simulation.time_acceleration = factor;
        config.validate().context("Invalid acceleration")?;
    }

    let rig = build_rig(&config)?;
    let experiment = Experiment::builder(rig.device.clone())
        .config(config.experiment.clone())
        .protocol(config.protocol.build()?)
        .clock(rig.clock.clone())
        .build()
        .context("Failed to create experiment")?;
    info!(name = experiment.name(), run_id = %experiment.run_id(), "Simulation configured");

    let mut runner = ExperimentRunner::new(experiment, config.runner.clone())?
        .with_simulation(rig.bench.clone())
        .with_time_acceleration(config.simulation.time_acceleration);
    let mut snapshots = runner.subscribe();
    runner.start().await.context("Failed to start experiment")?;

    let deadline = tokio::time::sleep(Duration::from_secs(duration_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            received = snapshots.recv() => match received {
                Ok(snapshot) => {
                    println!("{}", serde_json::to_string(&snapshot)?);
                    if snapshot.status.is_terminal() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Snapshot consumer lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut deadline => {
                info!(duration_secs, "Run time elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    runner.stop().await;
    let final_snapshot = runner.snapshot().await;
    println!("{}", serde_json::to_string(&final_snapshot)?);

    if let Some(path) = state {
        runner
            .experiment()
            .lock()
            .await
            .save_state(&path)
            .with_context(|| format!("Failed to save state to {}", path.display()))?;
        info!(path = %path.display(), "Experiment state saved");
    }
    Ok(())
}

async fn status(mut config: AppConfig) -> Result<()> {
    config.simulation.realistic_timing = false;
    let rig = build_rig(&config)?;

    let report = serde_json::json!({
        "vials": rig.device.vial_status().await,
        "pumps": rig.device.pump_status(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
