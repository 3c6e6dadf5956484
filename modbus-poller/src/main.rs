//! Modbus Poller - command-line entry point
//!
//! Modes:
//! - `run-once`: a single polling cycle, non-zero exit when nothing was read
//! - `schedule`: poll now, then on every trigger tick until Ctrl-C
//! - `check-config`: validate the fleet file and print what would be polled

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modbus_poller::{
    load_fleet, load_fleet_or_empty, CycleScheduler, DataType, DeviceSpec, HttpSink, PollContext,
    PollingEngine, ServiceSettings, TcpConnector, Trigger,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "modbus-poller", version, about = "Polls Modbus TCP devices and forwards readings")]
struct Cli {
    /// Fleet configuration file (env: MODBUS_CONFIG)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Collection endpoint URL (env: READINGS_API_URL or LARAVEL_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Minutes between scheduled cycles, aligned to the clock (env: POLL_INTERVAL_MINUTES)
    #[arg(long, global = true)]
    interval_minutes: Option<u32>,

    /// Timeout for each reading delivery (env: FORWARD_TIMEOUT_SECS)
    #[arg(long, global = true)]
    forward_timeout_secs: Option<u64>,

    /// Devices polled at the same time (env: POLL_CONCURRENCY)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a single polling cycle and exit
    RunOnce,
    /// Run now, then on every interval until interrupted
    Schedule,
    /// Validate the configuration file and print the fleet
    CheckConfig,
}

impl Cli {
    /// Environment first, then command-line overrides.
    fn settings(&self) -> ServiceSettings {
        let mut settings = ServiceSettings::from_env();
        if let Some(path) = &self.config {
            settings.config_path = path.clone();
        }
        if let Some(url) = &self.api_url {
            settings.api_url = url.clone();
        }
        if let Some(minutes) = self.interval_minutes {
            settings.interval_minutes = minutes.clamp(1, 60);
        }
        if let Some(secs) = self.forward_timeout_secs {
            settings.forward_timeout = Duration::from_secs(secs);
        }
        if let Some(concurrency) = self.concurrency {
            settings.concurrency = concurrency.max(1);
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modbus_poller=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();

    info!("Starting Modbus Polling Service");
    info!("Config file: {}", settings.config_path);
    info!("API URL: {}", settings.api_url);

    match cli.command.unwrap_or(Command::Schedule) {
        Command::RunOnce => run_once(&settings).await,
        Command::Schedule => schedule(&settings).await,
        Command::CheckConfig => check_config(&settings),
    }
}

fn build_engine(fleet: Vec<DeviceSpec>, settings: &ServiceSettings) -> Result<PollingEngine> {
    let sink = HttpSink::new(settings.api_url.clone(), settings.forward_timeout)
        .context("Failed to build HTTP client")?;
    let ctx = PollContext::default().with_concurrency(settings.concurrency);

    PollingEngine::new(fleet, Arc::new(TcpConnector::new()), Arc::new(sink), ctx)
        .context("Failed to initialize poller")
}

async fn run_once(settings: &ServiceSettings) -> Result<ExitCode> {
    let fleet = load_fleet_or_empty(&settings.config_path);
    if fleet.is_empty() {
        error!("No devices configured. Please check {}", settings.config_path);
        return Ok(ExitCode::FAILURE);
    }

    let engine = build_engine(fleet, settings)?;
    let summary = engine.run_cycle().await;

    if summary.is_success() {
        info!("Polling cycle completed successfully");
        Ok(ExitCode::SUCCESS)
    } else {
        error!("Polling cycle failed");
        Ok(ExitCode::FAILURE)
    }
}

async fn schedule(settings: &ServiceSettings) -> Result<ExitCode> {
    let fleet = load_fleet_or_empty(&settings.config_path);
    if fleet.is_empty() {
        error!("No devices configured. Please check {}", settings.config_path);
        return Ok(ExitCode::FAILURE);
    }

    let engine = Arc::new(build_engine(fleet, settings)?);
    info!("Initialized poller with {} devices", engine.fleet().len());

    let mut scheduler = CycleScheduler::new(engine, Trigger::aligned_minutes(settings.interval_minutes));
    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt signal")?;
    info!("Received interrupt signal");

    scheduler.stop().await;
    Ok(ExitCode::SUCCESS)
}

fn check_config(settings: &ServiceSettings) -> Result<ExitCode> {
    let fleet = match load_fleet(&settings.config_path) {
        Ok(fleet) => fleet,
        Err(e) => {
            error!("Configuration rejected: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    println!("{} devices in {}", fleet.len(), settings.config_path);
    for device in &fleet {
        println!(
            "device {} at {} (unit {}, timeout {}s): {} registers",
            device.device_id,
            device.endpoint(),
            device.unit_id,
            device.timeout,
            device.registers.len()
        );
        for register in &device.registers {
            let (data_type, recognized) = DataType::resolve(&register.data_type);
            let note = if recognized { "" } else { " (unknown type, read as uint16)" };
            println!(
                "  {:>5}  {:<24} {:<8} x{} {}{}",
                register.address, register.parameter, data_type, register.scale, register.unit, note
            );
        }
    }

    Ok(if fleet.is_empty() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
