//! CLI Entry Point for rust_thermo
//!
//! Provides command-line interface for:
//! - Running a ramp program against a simulated furnace (optionally over the framed wire protocol)
//! - Querying or setting a parameter on a real controller over a serial port
//! - Validating a configuration file
//!
//! # Usage
//!
//! Simulate two ramps:
//! ```bash
//! rust_thermo simulate --ramp 50:10:0 --ramp 20:5:0.1
//! ```
//!
//! Read the process value from the configured controller:
//! ```bash
//! rust_thermo query --config config/rust_thermo.toml PV
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_thermo::config::ThermoConfig;
use rust_thermo::controller::{ControllerSettings, InstrumentController, TemperatureHardware};
use rust_thermo::data::CsvDataSink;
use rust_thermo::hardware::{BisynchDeviceSim, BisynchFurnace, FurnaceModel, SimulatedFurnace};
use rust_thermo::logging;
use rust_thermo::protocol::{BisynchAddress, BisynchClient};
use rust_thermo::ramp::{RampDescriptor, RampProgram};
use rust_thermo::scheduler::{Scheduler, TokioScheduler};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust_thermo")]
#[command(about = "Serial temperature controller and ramp sequencer", long_about = None)]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a ramp program against a simulated furnace
    Simulate {
        /// Ramp as END:RATE:DWELL (degrees, degrees/minute, minutes); repeatable
        #[arg(long = "ramp", value_parser = parse_ramp)]
        ramps: Vec<(f64, f64, f64)>,

        /// TOML ramp program used when no --ramp is given
        #[arg(long)]
        program: Option<PathBuf>,

        /// Convergence tolerance in degrees
        #[arg(long, default_value_t = 0.1)]
        accuracy: f64,

        /// Initial furnace temperature
        #[arg(long, default_value_t = 20.0)]
        start: f64,

        /// Degrees the simulated furnace moves per poll
        #[arg(long, default_value_t = 2.0)]
        step: f64,

        /// Poll period while moving, in milliseconds
        #[arg(long, default_value_t = 100)]
        poll_ms: u64,

        /// Drive the simulator through the framed serial protocol
        #[arg(long)]
        wire: bool,

        /// Directory for a CSV log of every poll
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Query a parameter on the configured controller
    Query {
        /// Configuration file
        #[arg(long, default_value = "config/rust_thermo.toml")]
        config: PathBuf,

        /// Two-character parameter mnemonic (e.g. PV)
        mnemonic: String,
    },

    /// Set a parameter on the configured controller
    Set {
        /// Configuration file
        #[arg(long, default_value = "config/rust_thermo.toml")]
        config: PathBuf,

        /// Two-character parameter mnemonic (e.g. SL)
        mnemonic: String,

        /// New value
        value: f64,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file
        file: PathBuf,
    },
}

fn parse_ramp(text: &str) -> Result<(f64, f64, f64), String> {
    let fields: Vec<&str> = text.split(':').collect();
    let [end, rate, dwell] = fields.as_slice() else {
        return Err(format!("expected END:RATE:DWELL, got {text:?}"));
    };
    let number = |field: &str| {
        field
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("{field:?} is not a number"))
    };
    Ok((number(*end)?, number(*rate)?, number(*dwell)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            ramps,
            program,
            accuracy,
            start,
            step,
            poll_ms,
            wire,
            data_dir,
        } => {
            logging::init(&cli.log_level)?;
            let program = build_program(start, &ramps, program)?;
            let settings = ControllerSettings {
                accuracy,
                busy_poll: Duration::from_millis(poll_ms),
                idle_poll: Duration::from_millis(poll_ms.saturating_mul(5)),
                ..ControllerSettings::default()
            };
            let model = FurnaceModel::new(start).with_step(step);
            simulate(model, settings, program, wire, data_dir).await
        }
        Commands::Query { config, mnemonic } => {
            let client = connect(&config)?;
            let value = client.query(&mnemonic).await?;
            println!("{mnemonic} = {value}");
            Ok(())
        }
        Commands::Set {
            config,
            mnemonic,
            value,
        } => {
            let client = connect(&config)?;
            client.set(&mnemonic, value).await?;
            println!("{mnemonic} <- {value} (acknowledged)");
            Ok(())
        }
        Commands::CheckConfig { file } => check_config(file),
    }
}

fn build_program(
    start: f64,
    ramps: &[(f64, f64, f64)],
    program: Option<PathBuf>,
) -> Result<RampProgram> {
    if ramps.is_empty() {
        let path = program.context("give at least one --ramp or a --program file")?;
        return RampProgram::load_toml(&path)
            .with_context(|| format!("Failed to load ramp program from {}", path.display()));
    }

    let mut from = start;
    let descriptors = ramps
        .iter()
        .map(|&(end, rate, dwell)| {
            let ramp = RampDescriptor::new(from, end, rate, dwell);
            from = end;
            ramp
        })
        .collect::<Vec<_>>();
    let program = RampProgram::new(descriptors);
    program.validate()?;
    Ok(program)
}

async fn simulate(
    model: FurnaceModel,
    settings: ControllerSettings,
    program: RampProgram,
    wire: bool,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new()?);

    if wire {
        let (client_end, device_end) = tokio::io::duplex(256);
        let address = BisynchAddress::default();
        let _device = BisynchDeviceSim::new(address, Arc::new(RwLock::new(model))).spawn(device_end);
        let client = BisynchClient::connect(client_end, address, Duration::from_secs(1))?;
        info!("simulated controller attached over framed protocol");
        run_program(BisynchFurnace::new(client), scheduler, settings, program, data_dir).await
    } else {
        run_program(SimulatedFurnace::new(model), scheduler, settings, program, data_dir).await
    }
}

async fn run_program<H: TemperatureHardware>(
    hardware: H,
    scheduler: Arc<dyn Scheduler>,
    settings: ControllerSettings,
    program: RampProgram,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let controller = InstrumentController::new(hardware, scheduler, settings);
    if let Some(dir) = data_dir {
        controller.attach_sink(Box::new(CsvDataSink::new(dir))).await;
    }
    controller.set_ramps(program).await?;

    let mut events = controller.subscribe();
    controller.start().await.context("Failed to start ramp program")?;

    println!("{:<15} {:>4} {:>9}  sample", "state", "ramp", "temp");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(status) => {
                    let ramp = status
                        .current_ramp_index
                        .map_or_else(|| "-".to_string(), |i| i.to_string());
                    println!(
                        "{:<15} {:>4} {:>9.2}  {}",
                        status.state_label(),
                        ramp,
                        status.current_temperature,
                        status.free_text_sample
                    );
                    if !controller.is_running().await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "status events dropped"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping");
                controller.stop().await?;
                break;
            }
        }
    }

    controller.stop_poller().await;
    let samples = controller.take_samples().await;
    println!("Program finished after {} samples", samples.len());
    Ok(())
}

fn connect(config_path: &Path) -> Result<BisynchClient> {
    let config = ThermoConfig::load_from(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    logging::init_from_config(&config)?;
    open_client(&config)
}

#[cfg(feature = "tokio_serial")]
fn open_client(config: &ThermoConfig) -> Result<BisynchClient> {
    let port = rust_thermo::link::open_serial(&config.serial_link())?;
    Ok(BisynchClient::connect(
        port,
        config.bisynch_address(),
        config.reply_timeout(),
    )?)
}

#[cfg(not(feature = "tokio_serial"))]
fn open_client(_config: &ThermoConfig) -> Result<BisynchClient> {
    Err(rust_thermo::ThermoError::FeatureNotEnabled("tokio_serial".to_string()).into())
}

fn check_config(file: PathBuf) -> Result<()> {
    let config = ThermoConfig::load_from(&file)
        .with_context(|| format!("Invalid configuration in {}", file.display()))?;
    println!("Configuration OK: {}", config.application.name);
    println!(
        "  link:       {} @ {} baud, {} data bits, {} stop bits, {:?} parity",
        config.link.port,
        config.link.baud_rate,
        config.link.data_bits,
        config.link.stop_bits,
        config.link.parity
    );
    println!(
        "  controller: limits [{}, {}], accuracy {}",
        config.controller.lower_temp, config.controller.upper_temp, config.controller.accuracy
    );
    println!("  bisynch:    address {}", config.bisynch_address().to_wire());
    Ok(())
}
