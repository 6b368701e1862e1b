//! CLI entry point for scan_daq.
//!
//! Runs scans headlessly against the simulated bench:
//!
//! ```bash
//! scan_daq run --scan line --runs 3
//! scan_daq list-scans
//! scan_daq check-config --config config/scan_daq.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use scan_daq::app::DaqApp;
use scan_daq::config::Settings;
use scan_daq::experiment::{ExperimentEvent, ExperimentMessage, LogUi};
use scan_daq::fsm::FsmActor;
use scan_daq::logging;
use scan_daq::mock::{self, Driver};

#[derive(Parser)]
#[command(name = "scan_daq")]
#[command(about = "Scan orchestration against simulated instruments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run queued scans and exit when the queue is empty
    Run {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Scan method to run
        #[arg(long, default_value = "line")]
        scan: String,

        /// Number of runs to queue
        #[arg(long, default_value_t = 1)]
        runs: usize,

        /// Drive stages through the timed-motion driver instead of instant mocks
        #[arg(long)]
        timed_motion: bool,
    },

    /// List available scans and their fields
    ListScans,

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_settings(config: Option<PathBuf>) -> Result<Settings> {
    let settings = match config {
        Some(path) => Settings::load_from(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Settings::load()?,
    };
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            scan,
            runs,
            timed_motion,
        } => run_scans(load_settings(config)?, scan, runs, timed_motion).await,
        Commands::ListScans => list_scans(),
        Commands::CheckConfig { config } => check_config(config),
    }
}

async fn run_scans(mut settings: Settings, scan: String, runs: usize, timed_motion: bool) -> Result<()> {
    logging::init_from_settings(&settings)?;
    settings.experiment.auto_start = true;
    settings.experiment.exit_after_finish = true;

    let driver = if timed_motion { Driver::Hardware } else { Driver::Mock };
    let instruments = Arc::new(mock::mock_registry(driver, &settings.axis)?);

    let mut experiment = mock::bench_experiment(&settings, Arc::clone(&instruments))
        .with_ui(Arc::new(LogUi));
    let config = experiment
        .scan_config(&scan)
        .cloned()
        .with_context(|| format!("unknown scan '{scan}'"))?;
    for _ in 0..runs {
        experiment.enqueue(&scan, config.clone())?;
    }

    let mut events = experiment.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExperimentEvent::RunSaved { run, directory } => {
                    println!("run {run} saved to {}", directory.display());
                }
                ExperimentEvent::SaveFailed { run, error } => {
                    eprintln!("run {run} was not saved: {error}");
                }
                _ => {}
            }
        }
    });

    let mut actor = FsmActor::new(experiment)?;
    scan_daq::actor::Actor::prepare(&mut actor).await?;
    let address = actor.address()?;
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            if let Err(e) = address.put(ExperimentMessage::RequestShutdown) {
                error!(error = %e, "Could not request shutdown");
            }
        }
    });

    info!(%scan, runs, ?driver, "Running scans");
    DaqApp::new(settings, instruments)
        .with_actor(actor)
        .run()
        .await?;
    Ok(())
}

fn list_scans() -> Result<()> {
    let settings = Settings::default();
    let instruments = Arc::new(mock::mock_registry(Driver::Mock, &settings.axis)?);
    let experiment = mock::bench_experiment(&settings, instruments);

    for name in experiment.methods() {
        println!("{name}");
        if let Some(method) = experiment.method(name) {
            for field in method.fields() {
                println!("  {:<12} {:?}", field.name, field.default);
            }
        }
    }
    Ok(())
}

fn check_config(config: Option<PathBuf>) -> Result<()> {
    let settings = load_settings(config)?;
    println!("{}", toml::to_string_pretty(&settings)?);
    println!("configuration ok");
    Ok(())
}
