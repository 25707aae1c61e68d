//! CLI entry point for the friction rig.
//!
//! Runs one operation per invocation against the configured rig:
//! - `run`: automatic start → end test with sampling and persistence
//! - `speed-test`: repeated back-and-forth cycles without sampling
//! - `reset-origin`, `home`, `status`
//!
//! # Usage
//!
//! ```bash
//! friction-rig run --start 0 --end 100 --velocity 50 --acceleration 10 --label pad_a
//! friction-rig --config config/rig.toml status
//! ```
//!
//! Ctrl-C during a test stops it through the normal teardown.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use friction_rig::config::{RigConfig, DEFAULT_CONFIG_PATH};
use friction_rig::hardware::SimulatedPort;
use friction_rig::logging::{self, LoggingConfig, OutputFormat};
use friction_rig::motion::OperatingMode;
use friction_rig::persistence::TestStore;
use friction_rig::rig::{self, Rig};
use friction_rig::test_run::TestParameters;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "friction-rig")]
#[command(about = "Single-axis test rig control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Automatic test: move to start, then sample the leg to end
    Run {
        /// Start position (units)
        #[arg(long)]
        start: f64,
        /// End position (units)
        #[arg(long)]
        end: f64,
        /// Velocity (units/s)
        #[arg(long)]
        velocity: f64,
        /// Acceleration (units/s²)
        #[arg(long)]
        acceleration: f64,
        /// Run label
        #[arg(long, default_value = "test")]
        label: String,
    },

    /// Back-and-forth cycles without sampling
    SpeedTest {
        /// Start position (units)
        #[arg(long)]
        start: f64,
        /// End position (units)
        #[arg(long)]
        end: f64,
        /// Velocity (units/s)
        #[arg(long)]
        velocity: f64,
        /// Acceleration (units/s²)
        #[arg(long)]
        acceleration: f64,
        /// Number of cycles
        #[arg(long, default_value = "1")]
        repetitions: u32,
    },

    /// Return to position zero at the home-return speed
    ResetOrigin,

    /// Run the card's homing sequence
    Home,

    /// Print axis and safety status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        RigConfig::load_from(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        RigConfig::load().context("loading configuration")?
    };
    config.validate()?;

    let logging_config = LoggingConfig::from_rig_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    logging::init(logging_config).map_err(anyhow::Error::msg)?;

    if !config.application.simulation {
        bail!("no motion card backend is linked into this build; set application.simulation = true");
    }

    let store = open_store(&config)?;
    let source = rig::sensor_source(&config).await?;
    let rig = Rig::assemble(config, Arc::new(SimulatedPort::new()), source, store);
    rig.initialize().await.context("rig bring-up failed")?;

    let result = execute(&rig, cli.command).await;
    rig.shutdown().await;
    result
}

fn open_store(config: &RigConfig) -> Result<Arc<dyn TestStore>> {
    #[cfg(feature = "storage_csv")]
    {
        let store = friction_rig::persistence::CsvTestStore::open(&config.storage.output_dir)?;
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "storage_csv"))]
    {
        warn!(dir = %config.storage.output_dir.display(), "CSV storage not built in; runs are kept in memory");
        Ok(Arc::new(friction_rig::persistence::MemoryTestStore::new()))
    }
}

async fn execute(rig: &Rig, command: Commands) -> Result<()> {
    let orchestrator = rig.orchestrator();
    match command {
        Commands::Run {
            start,
            end,
            velocity,
            acceleration,
            label,
        } => {
            let params = TestParameters::new(start, end, velocity, acceleration).with_label(label);
            let report = orchestrator
                .run_until_interrupted(orchestrator.start_automatic_test(params), ctrl_c())
                .await;
            match report {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(err) if err.is_cancellation() => info!("Test cancelled"),
                Err(err) => return Err(err.into()),
            }
        }
        Commands::SpeedTest {
            start,
            end,
            velocity,
            acceleration,
            repetitions,
        } => {
            let params = TestParameters::new(start, end, velocity, acceleration)
                .with_label("speed");
            let cycles = orchestrator
                .run_until_interrupted(orchestrator.speed_test(params, repetitions), ctrl_c())
                .await;
            match cycles {
                Ok(cycles) => println!("completed {cycles} of {repetitions} cycles"),
                Err(err) if err.is_cancellation() => info!("Speed test cancelled"),
                Err(err) => return Err(err.into()),
            }
        }
        Commands::ResetOrigin => orchestrator.reset_to_origin().await?,
        Commands::Home => home(rig).await?,
        Commands::Status => status(rig).await?,
    }
    Ok(())
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
}

async fn home(rig: &Rig) -> Result<()> {
    let controller = rig.controller();
    controller.home_axis().await?;

    let deadline = rig.config().motion.reset_timeout();
    let finished = tokio::time::timeout(deadline, async {
        while controller.mode() == OperatingMode::Homing {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if finished.is_err() {
        controller.stop().await?;
        bail!("homing did not finish within {deadline:?}");
    }
    println!("homed, position {:.3}", controller.get_current_position().await);
    Ok(())
}

async fn status(rig: &Rig) -> Result<()> {
    let controller = rig.controller();
    let status = serde_json::json!({
        "mode": controller.mode(),
        "axis": controller.status_text().await,
        "position": controller.get_current_position().await,
        "movement_done": controller.is_movement_done().await,
        "safety_latched": rig.monitor().state().is_latched(),
        "trip_reason": rig.monitor().state().reason(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
