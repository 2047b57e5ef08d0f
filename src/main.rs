//! CLI entry point for run_daq
//!
//! Drives one timed run, a multi-run batch or a free-running preview against
//! the simulated rig, writing raw files under `output.base_path`.
//!
//! # Usage
//!
//! Timed run with the lab defaults:
//! ```bash
//! run_daq --config rundaq.toml
//! ```
//!
//! Batch of three runs:
//! ```bash
//! run_daq --runs 3
//! ```
//!
//! Ten seconds of preview, nothing written:
//! ```bash
//! run_daq --free-run 10
//! ```
//!
//! Ctrl-C ends the current run and the batch.

use anyhow::{Context, Result};
use clap::Parser;
use run_daq::config::Settings;
use run_daq::controller::RunController;
use run_daq::hardware::mock::MockRig;
use run_daq::hardware::storage::RawFileStorage;
use run_daq::logging::init_logging;
use run_daq::messages::RunEvent;
use run_daq::timing::MultiRun;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "run_daq")]
#[command(about = "Triggered multi-channel acquisition run orchestrator", long_about = None)]
struct Cli {
    /// TOML settings file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long)]
    log_level: Option<String>,

    /// Free-run preview for this many seconds instead of a timed run
    #[arg(long, value_name = "SECONDS")]
    free_run: Option<f64>,

    /// Number of runs in the batch
    #[arg(long, value_name = "N")]
    runs: Option<u32>,

    /// Directory receiving the run files; overrides the config
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("loading settings from '{}'", path.display()))?,
        None => Settings::default(),
    };
    if let Some(level) = cli.log_level {
        settings.application.log_level = level;
    }
    if let Some(runs) = cli.runs {
        settings.run.multi_run = MultiRun {
            enabled: runs > 1,
            count: runs.max(1),
        };
    }
    if let Some(dir) = cli.output {
        settings.output.base_path = dir;
    }
    settings.validate().context("invalid settings")?;
    init_logging(Some(settings.application.log_level.as_str()))?;

    let rig = MockRig::new();
    let hardware = rig.hardware_with_storage(Arc::new(RawFileStorage::new()));
    let (controller, task) = RunController::spawn(settings, hardware);

    controller
        .initialize()
        .await
        .context("initializing devices")?;

    let outcome = match cli.free_run {
        Some(seconds) => free_run(&controller, seconds).await,
        None => timed_runs(&controller).await,
    };

    controller.shutdown().await?;
    task.await.context("controller task panicked")?;
    outcome
}

async fn free_run(controller: &RunController, seconds: f64) -> Result<()> {
    let duration = Duration::try_from_secs_f64(seconds)
        .context("--free-run needs a non-negative number of seconds")?;
    controller.start_free_run().await?;
    info!("Free run for {seconds} s");

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    controller.stop().await?;
    Ok(())
}

async fn timed_runs(controller: &RunController) -> Result<()> {
    let mut events = controller.subscribe();
    let multi_run = controller.status().await?.params.multi_run.enabled;
    controller.start().await?;

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RunEvent::RunFinalized { run_index, success, metadata_path }) => {
                    let label = run_index.map(|i| format!(" {}", i + 1)).unwrap_or_default();
                    let record = metadata_path
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "run{label}: {} ({record})",
                        if success { "complete" } else { "incomplete" }
                    );
                }
                Ok(RunEvent::Stopped) if !multi_run => break,
                Ok(RunEvent::BatchFinished { runs }) => {
                    println!("batch finished after {runs} run(s)");
                    break;
                }
                Ok(RunEvent::Error { message }) => anyhow::bail!(message),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Missed {skipped} run events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!("Interrupted, ending the batch");
                interrupted = true;
                controller.multi_run_stop().await?;
            }
        }
    }
    Ok(())
}
