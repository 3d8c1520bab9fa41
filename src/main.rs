//! CLI Entry Point for pact-daq
//!
//! Provides command-line access to the instrument protocol:
//! - discovering instruments on the multicast group
//! - running a timed test with live telemetry output and optional CSV export
//! - stopping a test
//! - running the device simulator
//! - opening the desktop window (feature `gui`)
//!
//! # Usage
//!
//! ```bash
//! pact-daq discover
//! pact-daq test --device 0 --duration 10 --csv run.csv
//! pact-daq simulate --model Acme-100
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pact_daq::config::PactConfig;
use pact_daq::plot::TracingSink;
use pact_daq::session::SessionState;
use pact_daq::simulator::run_simulator;
use pact_daq::{tracing_init, PactApp};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How often the CLI checks whether a running test has ended.
const SESSION_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "pact-daq")]
#[command(about = "Multicast instrument discovery and test control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = pact_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List instruments answering on the multicast group
    Discover,

    /// Run a test and print telemetry as it arrives
    Test {
        /// Index in the discovered device list
        #[arg(long)]
        device: usize,

        /// Test duration in seconds
        #[arg(long)]
        duration: String,

        /// Write the samples to this CSV file when the test ends
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Send stop to an instrument
    Stop {
        /// Index in the discovered device list
        #[arg(long)]
        device: usize,
    },

    /// Run a simulated instrument until Ctrl-C
    Simulate {
        /// Model reported in discovery replies
        #[arg(long)]
        model: Option<String>,
    },

    /// Open the desktop window
    #[cfg(feature = "gui")]
    Gui,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PactConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    config.validate()?;
    tracing_init::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Discover => discover(&config).await,
        Commands::Test {
            device,
            duration,
            csv,
        } => run_test(&config, device, &duration, csv.as_deref()).await,
        Commands::Stop { device } => stop(&config, device).await,
        Commands::Simulate { model } => simulate(config, model).await,
        #[cfg(feature = "gui")]
        Commands::Gui => {
            let runtime = tokio::runtime::Handle::current();
            tokio::task::block_in_place(|| pact_daq::gui::run(config, runtime))
        }
    }
}

async fn discover(config: &PactConfig) -> Result<()> {
    let mut app = PactApp::from_config(config, Arc::new(TracingSink))?;
    let devices = app.discover().await?;
    if devices.is_empty() {
        println!("No instruments answered");
    }
    for (index, device) in devices.iter().enumerate() {
        println!("[{index}] {device}");
    }
    app.close().await;
    Ok(())
}

async fn discover_and_select(config: &PactConfig, index: usize) -> Result<PactApp> {
    let mut app = PactApp::from_config(config, Arc::new(TracingSink))?;
    let devices = app.discover().await?;
    if devices.is_empty() {
        bail!("No instruments answered the discovery request");
    }
    let device = app.select_device(index)?;
    println!("Using [{index}] {device}");
    Ok(app)
}

async fn run_test(
    config: &PactConfig,
    index: usize,
    duration: &str,
    csv: Option<&Path>,
) -> Result<()> {
    let mut app = discover_and_select(config, index).await?;
    app.start_test(duration).await?;
    println!("Test running, Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(SESSION_POLL);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!(error = %e, "Ctrl-C handler failed");
                }
                app.stop_test().await?;
                println!("Stopped");
                break;
            }
            _ = poll.tick() => {
                if app.state() == SessionState::Idle {
                    break;
                }
            }
        }
    }

    if let Some(session) = app.session() {
        let end = session
            .end
            .map_or_else(|| "unknown".to_string(), |end| end.to_string());
        println!("Test ended ({end}), {} samples", session.samples.len());
        for warning in &session.warnings {
            println!("Device warning: {warning}");
        }
        if let Some(path) = csv {
            session.export_csv(path)?;
            println!("Samples written to {}", path.display());
        }
    }

    app.close().await;
    Ok(())
}

async fn stop(config: &PactConfig, index: usize) -> Result<()> {
    let mut app = discover_and_select(config, index).await?;
    app.stop_test().await?;
    println!("Stop sent");
    app.close().await;
    Ok(())
}

async fn simulate(config: PactConfig, model: Option<String>) -> Result<()> {
    let mut simulator = config.simulator_config();
    if let Some(model) = model {
        simulator.model = model;
    }
    info!(model = %simulator.model, "Starting simulator");
    run_simulator(&simulator, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler failed");
        }
    })
    .await?;
    Ok(())
}
