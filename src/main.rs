//! CLI entry point for lsi-correlator
//!
//! Two modes:
//! - `run`: one acquisition from connect to completion, then exit
//! - `serve`: keep the driver up and answer `get`/`put` process-variable requests on stdin
//!
//! # Usage
//!
//! ```bash
//! lsi-correlator --simulate run --duration 10 --repetitions 2
//! lsi-correlator --config config/correlator.toml serve
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lsi_correlator::acquisition::AcquisitionMachine;
use lsi_correlator::config::{Settings, DEFAULT_CONFIG_PATH};
use lsi_correlator::logging;
use lsi_correlator::polling::{PollingHandle, PollingLoop};
use lsi_correlator::pv::{PvAdapter, PvName, PvValue, WriteAck};
use lsi_correlator::types::AcquisitionState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "lsi-correlator")]
#[command(about = "LSI photon-correlation spectrometer driver", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the built-in simulator instead of the instrument
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one acquisition to completion
    Run {
        /// Override the measurement duration (s)
        #[arg(long)]
        duration: Option<u32>,

        /// Override the number of repetitions
        #[arg(long)]
        repetitions: Option<u32>,
    },

    /// Serve process variables on stdin/stdout until Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.simulate {
        settings.instrument.simulate = true;
    }
    if let Commands::Run {
        duration,
        repetitions,
    } = &cli.command
    {
        if let Some(duration) = duration {
            settings.acquisition.measurement_duration_s = *duration;
        }
        if let Some(repetitions) = repetitions {
            settings.acquisition.repetitions = *repetitions;
        }
    }
    settings.validate().context("invalid configuration")?;
    logging::init_from_settings(&settings)?;

    tracing::info!(
        name = %settings.application.name,
        endpoint = %settings.instrument.endpoint(),
        simulate = settings.instrument.simulate,
        "Starting correlator driver"
    );

    let machine = Arc::new(AcquisitionMachine::from_settings(&settings));
    let polling = PollingLoop::new(
        Arc::clone(&machine),
        Duration::from_millis(settings.polling.interval_ms),
    )
    .spawn();

    let outcome = match cli.command {
        Commands::Run { .. } => run_once(&machine, &settings).await,
        Commands::Serve => serve(&machine).await,
    };

    shutdown(&machine, polling).await;
    outcome
}

async fn shutdown(machine: &AcquisitionMachine, polling: PollingHandle) {
    polling.shutdown().await;
    machine.disconnect().await;
    tracing::info!("Correlator driver stopped");
}

async fn run_once(machine: &Arc<AcquisitionMachine>, settings: &Settings) -> Result<()> {
    machine.connect().await.context("connecting to correlator")?;
    machine
        .configure(settings.acquisition.clone())
        .await
        .context("configuring correlator")?;

    let mut updates = machine.subscribe();
    machine.start().await.context("starting acquisition")?;
    println!(
        "Acquisition started: {} x {} s",
        settings.acquisition.repetitions, settings.acquisition.measurement_duration_s
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, stopping acquisition");
                machine.stop().await.context("stopping acquisition")?;
                break;
            }
            changed = updates.changed() => {
                changed.context("state machine dropped")?;
                let state = updates.borrow_and_update().state;
                match state {
                    AcquisitionState::Idle => break,
                    AcquisitionState::Error => {
                        let message = machine
                            .snapshot()
                            .last_error
                            .map(|e| e.message)
                            .unwrap_or_default();
                        anyhow::bail!("acquisition failed: {}", message);
                    }
                    _ => {}
                }
            }
        }
    }

    let snapshot = machine.snapshot();
    match snapshot.result {
        Some(result) => {
            println!(
                "Repetition {}: {} points, elapsed {:.1} s, count rates {:.1} / {:.1} kHz",
                result.repetition,
                result.len(),
                result.elapsed_s,
                result.mean_trace_a(),
                result.mean_trace_b()
            );
            if let Some((lag, value)) = result.pairs().next() {
                println!("First point: tau = {:.3e} s, g2-1 = {:.4}", lag, value);
            }
        }
        None => println!("No correlation data was collected"),
    }
    if let Some(path) = snapshot.output_file {
        println!("Data written to {}", path.display());
    }
    Ok(())
}

async fn serve(machine: &Arc<AcquisitionMachine>) -> Result<()> {
    if let Err(err) = machine.connect().await {
        tracing::error!(error = %err, "Initial connect failed; write RESET then CONNECT to retry");
    }
    let adapter = PvAdapter::current(Arc::clone(machine));
    println!("Ready. Commands: get NAME | put NAME VALUE | list | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if !handle_line(&adapter, line.trim()) {
                    break;
                }
            }
        }
    }
    adapter.settle().await;
    Ok(())
}

/// Returns `false` when the session should end.
fn handle_line(adapter: &PvAdapter, line: &str) -> bool {
    let mut parts = line.splitn(3, char::is_whitespace);
    match (parts.next(), parts.next(), parts.next()) {
        (Some("get"), Some(name), None) => match adapter.read(name) {
            Ok(value) => println!("{} = {}", name, value),
            Err(e) => println!("error: {}", e),
        },
        (Some("put"), Some(name), Some(raw)) => match adapter.write(name, parse_value(raw)) {
            WriteAck::Accepted => println!("{} accepted", name),
            WriteAck::Rejected(reason) => println!("rejected: {}", reason),
        },
        (Some("list"), None, None) => {
            for pv in PvName::ALL {
                println!("{:<26} {:?}", pv.as_str(), pv.access());
            }
        }
        (Some("quit"), None, None) => return false,
        (Some(""), None, None) | (None, _, _) => {}
        _ => println!("usage: get NAME | put NAME VALUE | list | quit"),
    }
    true
}

fn parse_value(raw: &str) -> PvValue {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<i64>() {
        PvValue::Int(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        PvValue::Float(v)
    } else {
        PvValue::Str(raw.trim_matches('"').to_string())
    }
}
